//! Discovery listeners and the device registry they feed (spec §4.D,
//! §4.E). `dnssd` and `wsd` each run as an independent background task
//! emitting into a shared [`Registry`]; `netif` tracks interface
//! changes so WS-Discovery can keep its multicast memberships current.

pub mod dnssd;
pub mod netif;
pub mod registry;
pub mod wsd;

pub use registry::{Event, Override, Registry};
