//! SSDP M-SEARCH discovery.
//!
//! Sends the search on every usable IPv4 interface and collects unicast
//! replies on the same socket, since devices answer the sending port.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use local_ip_address::list_afinet_netifas;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::time::{timeout, Instant};

use super::types::{is_virtual_interface, normalize_uuid, DiscoveryError, SsdpResponse};
use crate::protocol_constants::SSDP_MULTICAST_ADDR;

// ─────────────────────────────────────────────────────────────────────────────
// ASCII Case-Insensitive Helpers
// ─────────────────────────────────────────────────────────────────────────────
//
// HTTP headers are ASCII, so byte-level comparison avoids to_lowercase()
// allocations while a discovery burst is being parsed.

#[inline]
fn starts_with_ignore_ascii_case(s: &str, prefix: &str) -> bool {
    s.len() >= prefix.len() && s.as_bytes()[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
}

#[inline]
fn find_ignore_ascii_case(haystack: &str, needle: &str) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    if needle.len() > haystack.len() {
        return None;
    }
    haystack
        .as_bytes()
        .windows(needle.len())
        .position(|window| window.eq_ignore_ascii_case(needle.as_bytes()))
}

/// Returns the trimmed value of the first header called `name`.
fn header_value<'a>(response: &'a str, name: &str) -> Option<&'a str> {
    response.lines().find_map(|line| {
        let colon = line.find(':')?;
        let (key, rest) = line.split_at(colon);
        if key.trim().eq_ignore_ascii_case(name) {
            Some(rest[1..].trim())
        } else {
            None
        }
    })
}

// ─────────────────────────────────────────────────────────────────────────────

/// Builds the M-SEARCH message for a search target.
fn build_msearch_message(mx: u64, search_target: &str) -> String {
    format!(
        "M-SEARCH * HTTP/1.1\r\n\
         HOST: {}\r\n\
         MAN: \"ssdp:discover\"\r\n\
         MX: {}\r\n\
         ST: {}\r\n\r\n",
        SSDP_MULTICAST_ADDR, mx, search_target
    )
}

/// Network interface used for a search.
#[derive(Debug, Clone)]
pub struct InterfaceInfo {
    pub name: String,
    pub ip: Ipv4Addr,
}

/// Gets all usable IPv4 interfaces, skipping loopback and virtual ones.
pub fn get_interfaces() -> Vec<InterfaceInfo> {
    list_afinet_netifas()
        .unwrap_or_else(|e| {
            log::warn!("[SSDP] Failed to list network interfaces: {}", e);
            Vec::new()
        })
        .into_iter()
        .filter_map(|(name, addr)| {
            if is_virtual_interface(&name) {
                log::trace!("[SSDP] Skipping virtual interface: {}", name);
                return None;
            }
            match addr {
                IpAddr::V4(ipv4) if !ipv4.is_loopback() => Some(InterfaceInfo { name, ip: ipv4 }),
                _ => None,
            }
        })
        .collect()
}

/// Creates a UDP socket bound to one interface.
///
/// - SO_REUSEADDR (and SO_REUSEPORT on Unix) for rapid restarts
/// - Multicast TTL of 4 per UPnP 1.0
fn create_socket(iface_ip: Ipv4Addr) -> Result<UdpSocket, DiscoveryError> {
    let bind_addr = SocketAddr::new(IpAddr::V4(iface_ip), 0);

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(DiscoveryError::SocketBind)?;

    if let Err(e) = socket.set_reuse_address(true) {
        log::warn!("[SSDP] Failed to set SO_REUSEADDR on {}: {}", iface_ip, e);
    }

    #[cfg(unix)]
    if let Err(e) = socket.set_reuse_port(true) {
        log::warn!("[SSDP] Failed to set SO_REUSEPORT on {}: {}", iface_ip, e);
    }

    if let Err(e) = socket.set_multicast_ttl_v4(4) {
        log::warn!("[SSDP] Failed to set multicast TTL on {}: {}", iface_ip, e);
    }

    socket
        .set_nonblocking(true)
        .map_err(DiscoveryError::SocketBind)?;
    socket
        .bind(&bind_addr.into())
        .map_err(DiscoveryError::SocketBind)?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket).map_err(DiscoveryError::SocketBind)
}

/// Parses an M-SEARCH reply.
///
/// Returns `None` unless the reply answers `search_target` and carries both
/// a USN uuid and a LOCATION.
fn parse_ssdp_response(response: &str, src_ip: IpAddr, search_target: &str) -> Option<SsdpResponse> {
    if !starts_with_ignore_ascii_case(response, "HTTP/1.1 200") {
        return None;
    }

    let st = header_value(response, "st")?;
    if !st.eq_ignore_ascii_case(search_target) {
        return None;
    }

    let location = header_value(response, "location").filter(|l| !l.is_empty())?;

    let usn = header_value(response, "usn")?;
    let uuid_start = find_ignore_ascii_case(usn, "uuid:")?;
    let uuid = usn[uuid_start..].split("::").next().map(normalize_uuid)?;
    if uuid.is_empty() {
        return None;
    }

    Some(SsdpResponse {
        uuid,
        location: location.to_string(),
        src_ip,
    })
}

/// Configuration for one search round.
#[derive(Debug, Clone)]
pub struct SsdpConfig {
    /// Number of M-SEARCH packets to send per interface.
    pub send_count: u64,
    /// Delay between M-SEARCH packets.
    pub retry_delay: Duration,
    /// Total time spent listening for replies.
    pub listen_timeout: Duration,
    /// MX value (max response delay in seconds).
    pub mx_value: u64,
}

impl Default for SsdpConfig {
    fn default() -> Self {
        Self {
            send_count: 2,
            retry_delay: Duration::from_millis(800),
            listen_timeout: Duration::from_secs(3),
            mx_value: 1,
        }
    }
}

/// Searches the local network for devices answering `search_target`.
///
/// Replies are deduplicated by uuid and sorted for stable ordering.
///
/// # Errors
/// Returns `NoInterfaces` when no interface could be bound.
pub async fn search(
    config: &SsdpConfig,
    search_target: &str,
) -> Result<Vec<SsdpResponse>, DiscoveryError> {
    let interfaces = get_interfaces();
    if interfaces.is_empty() {
        return Err(DiscoveryError::NoInterfaces);
    }

    let mut sockets: Vec<(InterfaceInfo, Arc<UdpSocket>)> = Vec::new();
    for iface in interfaces {
        match create_socket(iface.ip) {
            Ok(socket) => sockets.push((iface, Arc::new(socket))),
            Err(e) => log::warn!(
                "[SSDP] Failed to create socket for {} ({}): {}",
                iface.name,
                iface.ip,
                e
            ),
        }
    }
    if sockets.is_empty() {
        return Err(DiscoveryError::NoInterfaces);
    }

    log::debug!(
        "[SSDP] Searching for {} on {} interface(s)",
        search_target,
        sockets.len()
    );

    let msg = build_msearch_message(config.mx_value, search_target);
    let found: Arc<Mutex<Vec<SsdpResponse>>> = Arc::new(Mutex::new(Vec::new()));

    let send_futures: Vec<_> = sockets
        .iter()
        .map(|(iface, socket)| {
            let socket = Arc::clone(socket);
            let iface_name = iface.name.clone();
            let msg = msg.as_bytes().to_vec();
            let send_count = config.send_count;
            let retry_delay = config.retry_delay;

            async move {
                for i in 0..send_count {
                    if i > 0 {
                        tokio::time::sleep(retry_delay).await;
                    }
                    if let Err(e) = socket.send_to(&msg, SSDP_MULTICAST_ADDR).await {
                        log::warn!(
                            "[SSDP] Failed to send M-SEARCH on {} (attempt {}): {}",
                            iface_name,
                            i + 1,
                            e
                        );
                    }
                }
            }
        })
        .collect();

    let recv_futures: Vec<_> = sockets
        .iter()
        .map(|(iface, socket)| {
            let socket = Arc::clone(socket);
            let iface_name = iface.name.clone();
            let found = Arc::clone(&found);
            let listen_timeout = config.listen_timeout;

            async move {
                let mut buf = [0u8; 2048];
                let deadline = Instant::now() + listen_timeout;

                loop {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        break;
                    }
                    match timeout(remaining, socket.recv_from(&mut buf)).await {
                        Ok(Ok((amt, src))) => {
                            let response = String::from_utf8_lossy(&buf[..amt]);
                            if let Some(reply) =
                                parse_ssdp_response(&response, src.ip(), search_target)
                            {
                                log::trace!(
                                    "[SSDP] Reply from {} ({}) via {}",
                                    reply.src_ip,
                                    reply.uuid,
                                    iface_name
                                );
                                found.lock().push(reply);
                            }
                        }
                        Ok(Err(e)) => {
                            log::warn!("[SSDP] Socket recv error on {}: {}", iface_name, e);
                        }
                        Err(_) => break,
                    }
                }
            }
        })
        .collect();

    tokio::join!(
        futures::future::join_all(send_futures),
        futures::future::join_all(recv_futures)
    );

    let mut found = std::mem::take(&mut *found.lock());
    let mut seen = HashSet::new();
    found.retain(|r| seen.insert(r.uuid.clone()));
    found.sort_by(|a, b| a.uuid.cmp(&b.uuid));

    log::debug!(
        "[SSDP] Search for {} complete: {} device(s)",
        search_target,
        found.len()
    );
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol_constants::MEDIA_RENDERER_SEARCH_TARGET;

    fn src() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20))
    }

    #[test]
    fn msearch_message_carries_target() {
        let msg = build_msearch_message(1, MEDIA_RENDERER_SEARCH_TARGET);
        assert!(msg.starts_with("M-SEARCH * HTTP/1.1\r\n"));
        assert!(msg.contains("HOST: 239.255.255.250:1900"));
        assert!(msg.contains("MAN: \"ssdp:discover\""));
        assert!(msg.contains("MX: 1"));
        assert!(msg.contains(&format!("ST: {}", MEDIA_RENDERER_SEARCH_TARGET)));
        assert!(msg.ends_with("\r\n\r\n"));
    }

    #[test]
    fn parses_matching_reply() {
        let response = "HTTP/1.1 200 OK\r\n\
CACHE-CONTROL: max-age=1800\r\n\
LOCATION: http://192.168.1.20:49152/description.xml\r\n\
ST: urn:schemas-upnp-org:device:MediaRenderer:1\r\n\
USN: uuid:5f9ec1b3-ed59-4e9c-9ae5-0011d1a2b3c4::urn:schemas-upnp-org:device:MediaRenderer:1\r\n\r\n";
        let reply = parse_ssdp_response(response, src(), MEDIA_RENDERER_SEARCH_TARGET).unwrap();
        assert_eq!(reply.uuid, "5f9ec1b3-ed59-4e9c-9ae5-0011d1a2b3c4");
        assert_eq!(reply.location, "http://192.168.1.20:49152/description.xml");
        assert_eq!(reply.src_ip, src());
    }

    #[test]
    fn headers_are_case_insensitive() {
        let response = "HTTP/1.1 200 OK\r\n\
location: http://192.168.1.20/d.xml\r\n\
st: urn:schemas-upnp-org:device:mediarenderer:1\r\n\
usn: UUID:abc-123\r\n\r\n";
        let reply = parse_ssdp_response(response, src(), MEDIA_RENDERER_SEARCH_TARGET).unwrap();
        assert_eq!(reply.uuid, "abc-123");
    }

    #[test]
    fn rejects_other_targets_and_incomplete_replies() {
        let other = "HTTP/1.1 200 OK\r\nLOCATION: http://x/d.xml\r\nST: upnp:rootdevice\r\nUSN: uuid:abc\r\n\r\n";
        assert!(parse_ssdp_response(other, src(), MEDIA_RENDERER_SEARCH_TARGET).is_none());

        let no_location = "HTTP/1.1 200 OK\r\nST: urn:schemas-upnp-org:device:MediaRenderer:1\r\nUSN: uuid:abc\r\n\r\n";
        assert!(parse_ssdp_response(no_location, src(), MEDIA_RENDERER_SEARCH_TARGET).is_none());

        let notify = "NOTIFY * HTTP/1.1\r\nLOCATION: http://x/d.xml\r\nST: urn:schemas-upnp-org:device:MediaRenderer:1\r\nUSN: uuid:abc\r\n\r\n";
        assert!(parse_ssdp_response(notify, src(), MEDIA_RENDERER_SEARCH_TARGET).is_none());
    }

    #[test]
    fn find_ignore_ascii_case_works() {
        assert_eq!(find_ignore_ascii_case("USN: UUID:abc", "uuid:"), Some(5));
        assert_eq!(find_ignore_ascii_case("nothing", "uuid:"), None);
        assert_eq!(find_ignore_ascii_case("x", ""), Some(0));
    }
}
