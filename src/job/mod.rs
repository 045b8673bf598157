//! Job state machine (spec §4.G): drives a single scan through
//! `devcaps -> precheck -> scan -> load -> check/cleanup -> finish`,
//! retrying on transient device conditions and handling cancellation
//! and ADF partial success.

pub mod core;
pub mod machine;

pub use core::{Core, JobHandle};
pub use machine::{Job, JobEvent, State, StepOutcome};
