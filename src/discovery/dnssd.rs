//! DNS-SD/mDNS discovery listener (spec §4.E). Browses `_uscan._tcp`
//! for eSCL scanners and feeds resolved endpoints into the registry.
//! Built on `mdns-sd`, the teacher's own discovery dependency.

use std::net::IpAddr;

use mdns_sd::{ServiceDaemon, ServiceEvent};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{Result, ScanError};
use crate::model::{Endpoint, Protocol};

use super::registry::{Event, Registry};

const SERVICE_TYPE: &str = "_uscan._tcp.local.";
const SOURCE: &str = "dnssd";

/// One fully resolved eSCL endpoint, ready to hand to the registry.
fn build_endpoint(addr: IpAddr, port: u16, rs: &str) -> Endpoint {
    let is_ipv6 = addr.is_ipv6();
    let is_link_local = match addr {
        IpAddr::V4(v4) => v4.is_link_local(),
        IpAddr::V6(v6) => v6.segments()[0] & 0xffc0 == 0xfe80,
    };
    // mdns-sd does not surface the interface a resolved link-local
    // address arrived on, so the zone is left unset here; WS-Discovery
    // endpoints (which open one socket per interface) carry it instead.
    let host = match addr {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => format!("[{v6}]"),
    };
    let uri = format!("http://{host}:{port}/{rs}/");
    Endpoint {
        protocol: Protocol::Escl,
        uri,
        is_ipv6,
        is_link_local,
        zone: None,
    }
}

/// Renders a zoned IPv6 host per RFC 6874 (`[fe80::1%25eth0]`). `mdns-sd`
/// never surfaces the originating interface so `dnssd` has no zone to
/// render, but `discovery::wsd` does (via `SocketAddrV6::scope_id`) and
/// uses this to rewrite a link-local `XAddr`'s host.
pub fn zoned_ipv6_host(addr: std::net::Ipv6Addr, zone_name: &str) -> String {
    let escaped = utf8_percent_encode(zone_name, NON_ALPHANUMERIC);
    format!("[{addr}%25{escaped}]")
}

/// Spawns the DNS-SD browse loop on the current Tokio runtime. Found
/// and withdrawn devices are applied to `registry` directly; callers
/// that want to synchronise with other state (e.g. the job machine) do
/// so by wrapping `registry` in `Arc<tokio::sync::Mutex<_>>` and passing
/// the events out over `events` instead.
pub async fn run(
    registry: std::sync::Arc<tokio::sync::Mutex<Registry>>,
    events: mpsc::Sender<Event>,
) -> Result<()> {
    let daemon = ServiceDaemon::new()
        .map_err(|e| ScanError::Transport(Box::new(std::io::Error::other(e.to_string()))))?;
    let receiver = daemon
        .browse(SERVICE_TYPE)
        .map_err(|e| ScanError::Transport(Box::new(std::io::Error::other(e.to_string()))))?;

    loop {
        match receiver.recv_async().await {
            Ok(ServiceEvent::ServiceResolved(info)) => {
                let name = info.get_fullname().to_string();
                let port = info.get_port();
                let rs = info
                    .get_properties()
                    .get("rs")
                    .map(|v| v.val_str().to_string())
                    .unwrap_or_else(|| "eSCL".to_string());

                let mut reg = registry.lock().await;
                if reg.is_blacklisted(&name) {
                    continue;
                }
                for addr in info.get_addresses().iter() {
                    reg.begin_resolve(&name, &name, SOURCE);
                    let endpoint = build_endpoint(*addr, port, &rs);
                    debug!(name, uri = %endpoint.uri, "dnssd resolved");
                    if let Some(event) = reg.resolver_done(&name, vec![endpoint]) {
                        let _ = events.send(event).await;
                    }
                }
            }
            Ok(ServiceEvent::ServiceRemoved(_ty, fullname)) => {
                let mut reg = registry.lock().await;
                if let Some(event) = reg.withdraw(&fullname, SOURCE) {
                    let _ = events.send(event).await;
                }
            }
            Ok(_) => {}
            Err(_) => break,
        }
    }
    Ok(())
}

pub fn log_browse_error(e: &ScanError) {
    warn!(error = %e, "dns-sd browse failed");
}
