//! `netscan-core` drives the scan side of a driverless network scanner
//! backend: it discovers eSCL (AirScan) and WSD (WS-Scan) devices on the
//! LAN, negotiates their capabilities, and runs scan jobs through to a
//! decoded raster stream.
//!
//! The crate is organized around the seven components described in the
//! design: an HTTP client (`http`), a streaming XML reader/writer (`xml`),
//! an image decoder dispatch layer (`raster`), a deduplicating device
//! registry fed by discovery listeners (`discovery`), two protocol
//! handlers (`proto`), and the job state machine that ties them together
//! (`job`).

pub mod discovery;
pub mod error;
pub mod http;
pub mod job;
pub mod model;
pub mod proto;
pub mod raster;
pub mod xml;

pub use error::{ScanError, ScanStatus};
pub use job::Core;
pub use model::{Device, DeviceCapabilities, Endpoint, Protocol, ScanParams};
