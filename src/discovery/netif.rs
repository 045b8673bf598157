//! Interface-change tracking (spec §4.E "Interface tracking"). Rather
//! than a native netlink/IOKit/IP-Helper notifier — platform-specific
//! bindings out of reach of a single portable dependency — this polls
//! `network-interface` on an interval and diffs successive snapshots;
//! the resulting added/removed events drive multicast membership
//! updates the same way a push notifier would (see DESIGN.md).

use std::collections::HashSet;
use std::net::IpAddr;

use network_interface::{NetworkInterface, NetworkInterfaceConfig};
use tracing::warn;

use crate::error::{Result, ScanError};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct IfAddr {
    pub index: u32,
    pub addr: IpAddr,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NetifEvent {
    Added(IfAddr),
    Removed(IfAddr),
}

impl IfAddr {
    pub fn is_ipv6_link_local(&self) -> bool {
        matches!(self.addr, IpAddr::V6(v6) if v6.segments()[0] & 0xffc0 == 0xfe80)
    }
}

/// Snapshot-and-diff interface watcher; `poll` is cheap enough to call
/// on a short interval (spec's recommended default is 5 s).
#[derive(Default)]
pub struct NetifWatcher {
    known: HashSet<IfAddr>,
}

impl NetifWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes a fresh interface snapshot and returns the diff against the
    /// previous one. The first call after construction reports every
    /// currently-configured address as `Added`.
    pub fn poll(&mut self) -> Result<Vec<NetifEvent>> {
        let interfaces = NetworkInterface::show()
            .map_err(|e| ScanError::Transport(Box::new(std::io::Error::other(e.to_string()))))?;

        let mut current = HashSet::new();
        for iface in &interfaces {
            for addr in &iface.addr {
                let ip = match addr {
                    network_interface::Addr::V4(v4) => IpAddr::V4(v4.ip),
                    network_interface::Addr::V6(v6) => IpAddr::V6(v6.ip),
                };
                current.insert(IfAddr { index: iface.index, addr: ip });
            }
        }

        Ok(self.apply_snapshot(current))
    }

    /// Pure half of `poll`: diffs `current` against `known` and, if
    /// anything changed, adopts it as the new baseline. Split out so the
    /// diff logic is testable without a live interface enumeration.
    fn apply_snapshot(&mut self, current: HashSet<IfAddr>) -> Vec<NetifEvent> {
        let mut events = Vec::new();
        for added in current.difference(&self.known) {
            events.push(NetifEvent::Added(*added));
        }
        for removed in self.known.difference(&current) {
            events.push(NetifEvent::Removed(*removed));
        }
        if !events.is_empty() {
            self.known = current;
        }
        events
    }
}

impl std::fmt::Debug for NetifWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetifWatcher")
            .field("known_count", &self.known.len())
            .finish()
    }
}

pub fn log_unexpected(e: &ScanError) {
    warn!(error = %e, "interface enumeration failed");
}
