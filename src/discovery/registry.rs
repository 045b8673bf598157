//! Device registry (spec §4.D): deduplicates devices reported by the
//! parallel discovery listeners and decides when a device is ready to
//! be surfaced to (or withdrawn from) the caller.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::model::{Device, Endpoint};

/// A configuration-supplied override for a device name, exempting it
/// from discovery (spec §4.D "Static overrides").
#[derive(Clone, Debug)]
pub enum Override {
    /// Pre-populated endpoint list; discovery never touches this name.
    Endpoints(Vec<Endpoint>),
    /// The "disable" sentinel: suppress discovery for this name entirely.
    Disabled,
}

struct DeviceEntry {
    device: Device,
    pending: u32,
    sources: HashSet<String>,
}

/// Emitted by registry operations; the caller (the event loop) turns
/// these into host-visible add/remove notifications.
#[derive(Clone, Debug)]
pub enum Event {
    Found(Device),
    Removed(String),
}

#[derive(Default)]
pub struct Registry {
    devices: HashMap<String, DeviceEntry>,
    overrides: HashMap<String, Override>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_override(&mut self, name: impl Into<String>, over: Override) {
        let name = name.into();
        if let Override::Endpoints(endpoints) = &over {
            let mut device = Device::new(name.clone(), name.clone());
            device.endpoints = endpoints.clone();
            Endpoint::sort_and_dedup(&mut device.endpoints);
            device.reported = true;
            self.devices.insert(
                name.clone(),
                DeviceEntry {
                    device,
                    pending: 0,
                    sources: HashSet::new(),
                },
            );
        }
        self.overrides.insert(name, over);
    }

    /// A name with any override (including "disable") is blacklisted
    /// from discovery (spec §4.D).
    pub fn is_blacklisted(&self, name: &str) -> bool {
        self.overrides.contains_key(name)
    }

    /// Registers that one more resolver (one per address family /
    /// discovery source) is now pending for `name`.
    pub fn begin_resolve(&mut self, name: &str, id: &str, source: impl Into<String>) {
        if self.is_blacklisted(name) {
            return;
        }
        let source = source.into();
        let entry = self.devices.entry(name.to_string()).or_insert_with(|| DeviceEntry {
            device: Device::new(name, id),
            pending: 0,
            sources: HashSet::new(),
        });
        entry.pending += 1;
        entry.sources.insert(source);
    }

    /// A resolver for `name` completed, contributing zero or more new
    /// endpoints (prepended unchecked per spec §4.D). When this was the
    /// last pending resolver, the list is sorted and deduplicated and,
    /// if non-empty, the device is reported exactly once.
    pub fn resolver_done(&mut self, name: &str, endpoints: Vec<Endpoint>) -> Option<Event> {
        if self.is_blacklisted(name) {
            return None;
        }
        let entry = self.devices.get_mut(name)?;
        for ep in endpoints {
            entry.device.endpoints.insert(0, ep);
        }
        entry.pending = entry.pending.saturating_sub(1);

        if entry.pending == 0 {
            Endpoint::sort_and_dedup(&mut entry.device.endpoints);
            if !entry.device.reported && !entry.device.endpoints.is_empty() {
                entry.device.reported = true;
                debug!(name, "device reported");
                return Some(Event::Found(entry.device.clone()));
            }
        }
        None
    }

    /// A discovery source no longer sees `name` at all (mDNS remove,
    /// WS-Discovery Bye, or timeout). When the last active source
    /// withdraws, the device is dropped and, if it was previously
    /// reported, a single removal event fires.
    pub fn withdraw(&mut self, name: &str, source: &str) -> Option<Event> {
        if self.is_blacklisted(name) {
            return None;
        }
        let entry = self.devices.get_mut(name)?;
        entry.sources.remove(source);
        if entry.sources.is_empty() {
            let was_reported = entry.device.reported;
            self.devices.remove(name);
            if was_reported {
                debug!(name, "device removed");
                return Some(Event::Removed(name.to_string()));
            }
        }
        None
    }

    pub fn get(&self, name: &str) -> Option<&Device> {
        self.devices.get(name).map(|e| &e.device)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.devices.keys().map(|s| s.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Protocol;

    fn ep(uri: &str, ipv6: bool, ll: bool) -> Endpoint {
        Endpoint {
            protocol: Protocol::Escl,
            uri: uri.to_string(),
            is_ipv6: ipv6,
            is_link_local: ll,
            zone: None,
        }
    }

    #[test]
    fn reports_once_when_pending_resolvers_drain() {
        let mut reg = Registry::new();
        reg.begin_resolve("Printer1", "id1", "dnssd-v4");
        reg.begin_resolve("Printer1", "id1", "dnssd-v6");
        assert!(reg.resolver_done("Printer1", vec![ep("http://192.0.2.1/eSCL/", false, false)]).is_none());
        let event = reg.resolver_done("Printer1", vec![ep("http://[2001:db8::1]/eSCL/", true, false)]);
        assert!(matches!(event, Some(Event::Found(_))));
        // A further resolver completing for the same device does not re-report.
        reg.begin_resolve("Printer1", "id1", "dnssd-v4-2");
        assert!(reg.resolver_done("Printer1", vec![]).is_none());
    }

    #[test]
    fn empty_endpoint_list_never_reports() {
        let mut reg = Registry::new();
        reg.begin_resolve("Ghost", "idg", "dnssd-v4");
        assert!(reg.resolver_done("Ghost", vec![]).is_none());
    }

    #[test]
    fn withdraw_removes_once_last_source_leaves() {
        let mut reg = Registry::new();
        reg.begin_resolve("Printer1", "id1", "dnssd-v4");
        reg.begin_resolve("Printer1", "id1", "wsd");
        reg.resolver_done("Printer1", vec![ep("http://192.0.2.1/eSCL/", false, false)]);

        assert!(reg.withdraw("Printer1", "dnssd-v4").is_none());
        let event = reg.withdraw("Printer1", "wsd");
        assert!(matches!(event, Some(Event::Removed(name)) if name == "Printer1"));
        assert!(reg.get("Printer1").is_none());
    }

    #[test]
    fn disabled_override_blacklists_name_from_discovery() {
        let mut reg = Registry::new();
        reg.set_override("Blocked", Override::Disabled);
        reg.begin_resolve("Blocked", "id", "dnssd-v4");
        assert!(reg.get("Blocked").is_none());
    }

    #[test]
    fn static_endpoints_override_reports_immediately() {
        let mut reg = Registry::new();
        reg.set_override(
            "Manual",
            Override::Endpoints(vec![ep("http://192.0.2.9/eSCL/", false, false)]),
        );
        let device = reg.get("Manual").expect("manually configured device present");
        assert!(device.reported);
        assert_eq!(device.endpoints.len(), 1);
    }
}
