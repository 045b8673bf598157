//! WS-Discovery listener (spec §4.E): UDP multicast Probe/Resolve and
//! unsolicited Hello/Bye handling, plus the ONVIF WS-Discovery client's
//! SOAP probe template and response parsing. Hand-written: no pack repo
//! speaks WS-Discovery; `socket2` + `network-interface` are reused here
//! the same way the teacher's own dependency tree already reaches for
//! low-level socket and interface control elsewhere.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Result, ScanError};
use crate::model::{Endpoint, Protocol as WireProtocol};
use crate::xml::PathReader;

use super::dnssd::zoned_ipv6_host;
use super::netif::{log_unexpected, NetifEvent, NetifWatcher};
use super::registry::{Event, Registry};

pub const MULTICAST_V4: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);
pub const MULTICAST_V6: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0x000c);
pub const PORT: u16 = 3702;

const NS_D: (&str, &str) = ("http://schemas.xmlsoap.org/ws/2005/04/discovery", "d");
const NS_A: (&str, &str) = ("http://www.w3.org/2005/08/addressing", "a");

const PROBE_TEMPLATE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope" xmlns:a="http://www.w3.org/2005/08/addressing" xmlns:d="http://schemas.xmlsoap.org/ws/2005/04/discovery">
  <s:Header>
    <a:Action>http://schemas.xmlsoap.org/ws/2005/04/discovery/Probe</a:Action>
    <a:MessageID>urn:uuid:{message_id}</a:MessageID>
    <a:To>urn:schemas-xmlsoap-org:ws:2005:04:discovery</a:To>
    <a:ReplyTo><a:Address>http://www.w3.org/2005/08/addressing/anonymous</a:Address></a:ReplyTo>
  </s:Header>
  <s:Body>
    <d:Probe>
      <d:Types xmlns:sc="http://schemas.microsoft.com/windows/2006/08/wdp/scan">sc:ScanDeviceType</d:Types>
    </d:Probe>
  </s:Body>
</s:Envelope>"#;

pub fn build_probe() -> String {
    PROBE_TEMPLATE.replace("{message_id}", &Uuid::new_v4().to_string())
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
enum MessageKind {
    Hello,
    Bye,
    ProbeMatch,
}

struct ParsedMessage {
    kind: MessageKind,
    endpoint_ref: String,
    xaddrs: Vec<String>,
}

/// Parses a Hello/Bye/ProbeMatches body, extracting the endpoint
/// reference (the stable device identity) and any `XAddrs` (the
/// device's service URLs).
fn parse_message(xml: &[u8]) -> Option<ParsedMessage> {
    let ns = [NS_D, NS_A];
    let mut reader = PathReader::begin(xml, &ns).ok()?;
    let body = String::from_utf8_lossy(xml);

    let kind = if body.contains("ProbeMatches") || body.contains("ProbeMatch") {
        MessageKind::ProbeMatch
    } else if body.contains(":Hello") || body.contains("<Hello") {
        MessageKind::Hello
    } else if body.contains(":Bye") || body.contains("<Bye") {
        MessageKind::Bye
    } else {
        return None;
    };

    let endpoint_ref = reader.find_text("a:Address").unwrap_or_default();
    reader.reset();
    let xaddrs_raw = reader.find_text("d:XAddrs").unwrap_or_default();
    let xaddrs = xaddrs_raw
        .split_whitespace()
        .map(|s| s.to_string())
        .collect::<Vec<_>>();

    if endpoint_ref.is_empty() && xaddrs.is_empty() {
        return None;
    }

    Some(ParsedMessage { kind, endpoint_ref, xaddrs })
}

fn device_name(endpoint_ref: &str, addr: &SocketAddr) -> String {
    if endpoint_ref.is_empty() {
        addr.ip().to_string()
    } else {
        endpoint_ref.to_string()
    }
}

/// Builds an `Endpoint` from a raw `XAddrs` entry. `zone` is the
/// interface index the reply carrying this XAddr arrived on (spec §4.E
/// "a link-local IPv6 address always carries its `ifindex`"); for a
/// link-local host the URI's bracketed address is rewritten to the
/// RFC 6874 zoned form so later connections target the right NIC.
fn build_endpoint(xaddr: &str, zone: Option<u32>) -> Option<Endpoint> {
    let url: reqwest::Url = xaddr.parse().ok()?;
    let host_str = url.host_str()?;
    let (is_ipv6, is_link_local) = match host_str.parse::<IpAddr>() {
        Ok(IpAddr::V6(v6)) => (true, v6.segments()[0] & 0xffc0 == 0xfe80),
        Ok(IpAddr::V4(_)) | Err(_) => (false, false),
    };
    let zone = if is_link_local { zone } else { None };
    let uri = match (is_link_local, zone) {
        (true, Some(idx)) => {
            let v6: Ipv6Addr = host_str.parse().ok()?;
            let zoned = zoned_ipv6_host(v6, &idx.to_string());
            xaddr.replacen(&format!("[{host_str}]"), &zoned, 1)
        }
        _ => xaddr.to_string(),
    };
    Some(Endpoint {
        protocol: WireProtocol::Wsd,
        uri,
        is_ipv6,
        is_link_local,
        zone,
    })
}

fn open_v4_listener() -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| ScanError::Transport(Box::new(e)))?;
    socket.set_reuse_address(true).map_err(|e| ScanError::Transport(Box::new(e)))?;
    socket
        .bind(&SockAddr::from(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), PORT)))
        .map_err(|e| ScanError::Transport(Box::new(e)))?;
    socket
        .join_multicast_v4(&MULTICAST_V4, &Ipv4Addr::UNSPECIFIED)
        .map_err(|e| ScanError::Transport(Box::new(e)))?;
    socket.set_nonblocking(true).map_err(|e| ScanError::Transport(Box::new(e)))?;
    UdpSocket::from_std(socket.into()).map_err(|e| ScanError::Transport(Box::new(e)))
}

fn open_v6_listener(interfaces: &[u32]) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| ScanError::Transport(Box::new(e)))?;
    socket.set_reuse_address(true).map_err(|e| ScanError::Transport(Box::new(e)))?;
    socket
        .bind(&SockAddr::from(SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), PORT)))
        .map_err(|e| ScanError::Transport(Box::new(e)))?;
    for &idx in interfaces {
        if let Err(e) = socket.join_multicast_v6(&MULTICAST_V6, idx) {
            warn!(interface = idx, error = %e, "failed to join ipv6 multicast group");
        }
    }
    socket.set_nonblocking(true).map_err(|e| ScanError::Transport(Box::new(e)))?;
    UdpSocket::from_std(socket.into()).map_err(|e| ScanError::Transport(Box::new(e)))
}

/// Opens one sending socket per local address, as spec §4.E requires
/// ("for each interface address opens a per-interface sending
/// socket"). The zone an incoming reply should be tagged with comes
/// from the reply datagram's own source address (`SocketAddrV6::
/// scope_id`), not from this socket, so there's nothing to thread back
/// out of here.
fn open_sender(local: IpAddr) -> Result<UdpSocket> {
    let domain = if local.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket =
        Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).map_err(|e| ScanError::Transport(Box::new(e)))?;
    socket
        .bind(&SockAddr::from(SocketAddr::new(local, 0)))
        .map_err(|e| ScanError::Transport(Box::new(e)))?;
    socket.set_nonblocking(true).map_err(|e| ScanError::Transport(Box::new(e)))?;
    UdpSocket::from_std(socket.into()).map_err(|e| ScanError::Transport(Box::new(e)))
}

/// Opens a sender for `ifaddr`'s address, sends one probe from it, and
/// keeps the socket alive in `senders` (rather than letting it drop
/// once the send completes) so a later run can reuse it without
/// reopening a socket per tick.
async fn probe_from_interface(
    ifaddr: super::netif::IfAddr,
    probe: &str,
    senders: &mut std::collections::HashMap<IpAddr, UdpSocket>,
) {
    let sock = match open_sender(ifaddr.addr) {
        Ok(s) => s,
        Err(e) => {
            debug!(error = %e, addr = %ifaddr.addr, "ws-discovery per-interface sender open failed");
            return;
        }
    };
    let dest: SocketAddr = match ifaddr.addr {
        IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(MULTICAST_V4), PORT),
        IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(MULTICAST_V6), PORT),
    };
    if let Err(e) = sock.send_to(probe.as_bytes(), dest).await {
        debug!(error = %e, addr = %ifaddr.addr, "ws-discovery probe send failed");
    }
    senders.insert(ifaddr.addr, sock);
}

/// The link-local zone a reply should be tagged with: for an IPv6
/// source address in `fe80::/10`, the kernel fills `scope_id` with the
/// receiving interface's index, which is exactly the ifindex spec §4.E
/// asks endpoints to carry.
fn reply_zone(src: SocketAddr) -> Option<u32> {
    match src {
        SocketAddr::V6(v6) if v6.ip().segments()[0] & 0xffc0 == 0xfe80 => Some(v6.scope_id()),
        _ => None,
    }
}

async fn handle_datagram(data: &[u8], src: SocketAddr, registry: &Mutex<Registry>, events: &mpsc::Sender<Event>) {
    let Some(parsed) = parse_message(data) else {
        return;
    };
    let name = device_name(&parsed.endpoint_ref, &src);
    let mut reg = registry.lock().await;
    if reg.is_blacklisted(&name) {
        return;
    }

    match parsed.kind {
        MessageKind::Bye => {
            if let Some(event) = reg.withdraw(&name, "wsd") {
                let _ = events.send(event).await;
            }
        }
        MessageKind::Hello | MessageKind::ProbeMatch => {
            reg.begin_resolve(&name, &parsed.endpoint_ref, "wsd");
            let zone = reply_zone(src);
            let endpoints: Vec<Endpoint> = parsed
                .xaddrs
                .iter()
                .filter_map(|x| build_endpoint(x, zone))
                .collect();
            if let Some(event) = reg.resolver_done(&name, endpoints) {
                let _ = events.send(event).await;
            }
        }
    }
}

/// Applies one round of `NetifWatcher` diff results: joins/leaves the
/// IPv6 multicast group per added/removed interface and opens/closes
/// that interface's probe-sending socket, then re-probes from any
/// interface that just appeared (spec §4.E "on interface list change
/// it updates multicast group memberships").
async fn apply_netif_diff(
    diff: Vec<NetifEvent>,
    v6_listener: &UdpSocket,
    probe: &str,
    senders: &mut std::collections::HashMap<IpAddr, UdpSocket>,
) {
    for event in diff {
        match event {
            NetifEvent::Added(ifaddr) => {
                if ifaddr.addr.is_ipv6() {
                    if let Err(e) = v6_listener.join_multicast_v6(&MULTICAST_V6, ifaddr.index) {
                        warn!(interface = ifaddr.index, error = %e, "failed to join ipv6 multicast group for new interface");
                    }
                }
                probe_from_interface(ifaddr, probe, senders).await;
            }
            NetifEvent::Removed(ifaddr) => {
                senders.remove(&ifaddr.addr);
                if ifaddr.addr.is_ipv6() {
                    if let Err(e) = v6_listener.leave_multicast_v6(&MULTICAST_V6, ifaddr.index) {
                        warn!(interface = ifaddr.index, error = %e, "failed to leave ipv6 multicast group for removed interface");
                    }
                }
            }
        }
    }
}

/// Sends one Probe datagram from every local interface address and
/// processes unsolicited Hello/Bye/ProbeMatch traffic on the shared
/// listening sockets until cancelled. A periodic `NetifWatcher` poll
/// keeps multicast membership and per-interface senders current as
/// NICs come and go (spec §4.E "Interface tracking").
pub async fn run(registry: std::sync::Arc<Mutex<Registry>>, events: mpsc::Sender<Event>) -> Result<()> {
    let mut watcher = NetifWatcher::new();
    let mut senders: std::collections::HashMap<IpAddr, UdpSocket> = std::collections::HashMap::new();

    let initial = watcher.poll().unwrap_or_else(|e| {
        log_unexpected(&e);
        Vec::new()
    });
    let v6_indices: Vec<u32> = initial
        .iter()
        .filter_map(|ev| match ev {
            NetifEvent::Added(a) if a.addr.is_ipv6() => Some(a.index),
            _ => None,
        })
        .collect();

    let v4_listener = open_v4_listener()?;
    let v6_listener = open_v6_listener(&v6_indices)?;

    let probe = build_probe();
    for ev in initial {
        if let NetifEvent::Added(ifaddr) = ev {
            probe_from_interface(ifaddr, &probe, &mut senders).await;
        }
    }

    let mut netif_tick = tokio::time::interval(Duration::from_secs(5));
    netif_tick.tick().await;

    let mut buf4 = vec![0u8; 65536];
    let mut buf6 = vec![0u8; 65536];
    loop {
        tokio::select! {
            _ = netif_tick.tick() => {
                match watcher.poll() {
                    Ok(diff) => apply_netif_diff(diff, &v6_listener, &probe, &mut senders).await,
                    Err(e) => log_unexpected(&e),
                }
            }
            r = v4_listener.recv_from(&mut buf4) => {
                let (len, src) = r.map_err(|e| ScanError::Transport(Box::new(e)))?;
                handle_datagram(&buf4[..len], src, &registry, &events).await;
            }
            r = v6_listener.recv_from(&mut buf6) => {
                let (len, src) = r.map_err(|e| ScanError::Transport(Box::new(e)))?;
                handle_datagram(&buf6[..len], src, &registry, &events).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROBE_MATCH: &str = r#"<?xml version="1.0"?>
<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope" xmlns:a="http://www.w3.org/2005/08/addressing" xmlns:d="http://schemas.xmlsoap.org/ws/2005/04/discovery">
  <s:Body>
    <d:ProbeMatches>
      <d:ProbeMatch>
        <a:EndpointReference><a:Address>urn:uuid:1234</a:Address></a:EndpointReference>
        <d:XAddrs>http://192.0.2.5:5358/WSDScanner</d:XAddrs>
      </d:ProbeMatch>
    </d:ProbeMatches>
  </s:Body>
</s:Envelope>"#;

    #[test]
    fn parses_probe_match_xaddrs_and_endpoint_ref() {
        let parsed = parse_message(PROBE_MATCH.as_bytes()).unwrap();
        assert_eq!(parsed.kind, MessageKind::ProbeMatch);
        assert_eq!(parsed.endpoint_ref, "urn:uuid:1234");
        assert_eq!(parsed.xaddrs, vec!["http://192.0.2.5:5358/WSDScanner"]);
    }

    #[test]
    fn builds_endpoint_from_xaddr() {
        let ep = build_endpoint("http://192.0.2.5:5358/WSDScanner", None).unwrap();
        assert!(!ep.is_ipv6);
        assert_eq!(ep.protocol, WireProtocol::Wsd);
    }

    #[test]
    fn link_local_endpoint_carries_zone_and_rewrites_uri() {
        let ep = build_endpoint("http://[fe80::1]:5358/WSDScanner", Some(3)).unwrap();
        assert!(ep.is_ipv6);
        assert!(ep.is_link_local);
        assert_eq!(ep.zone, Some(3));
        assert!(ep.uri.contains("%253"), "uri should carry the zoned host: {}", ep.uri);
    }

    #[test]
    fn non_link_local_ipv6_endpoint_drops_zone() {
        let ep = build_endpoint("http://[2001:db8::1]:5358/WSDScanner", Some(3)).unwrap();
        assert!(ep.is_ipv6);
        assert!(!ep.is_link_local);
        assert_eq!(ep.zone, None);
        assert_eq!(ep.uri, "http://[2001:db8::1]:5358/WSDScanner");
    }

    #[test]
    fn probe_template_substitutes_message_id() {
        let probe = build_probe();
        assert!(!probe.contains("{message_id}"));
        assert!(probe.contains("urn:uuid:"));
    }
}
