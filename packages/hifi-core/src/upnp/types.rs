//! Shared types for SSDP discovery and device descriptions.

use std::net::IpAddr;

use serde::Serialize;
use thiserror::Error;

/// Errors that can occur during discovery.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// Failed to bind UDP socket for discovery.
    #[error("failed to bind UDP socket: {0}")]
    SocketBind(#[source] std::io::Error),

    /// No usable network interfaces found.
    #[error("no usable network interfaces found")]
    NoInterfaces,

    /// The device description could not be fetched.
    #[error("device description fetch failed: {0}")]
    Description(String),

    /// The device description was fetched but is unusable.
    #[error("invalid device description: {0}")]
    InvalidDescription(String),
}

/// Convenient Result alias for discovery operations.
pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

/// One unique device that answered an M-SEARCH.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SsdpResponse {
    /// Device UUID from the USN header, without the `uuid:` prefix.
    pub uuid: String,
    /// LOCATION header: URL of the device description.
    pub location: String,
    /// Address the response came from.
    pub src_ip: IpAddr,
}

/// A service advertised in a device description.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ServiceEndpoint {
    /// Full service type URN, e.g. `urn:schemas-upnp-org:service:AVTransport:1`.
    pub service_type: String,
    /// Absolute control URL.
    pub control_url: String,
}

/// The parts of a UPnP device description the core uses.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DeviceDescription {
    /// UUID without the `uuid:` prefix; the device's stable native id.
    pub uuid: String,
    pub friendly_name: String,
    pub manufacturer: Option<String>,
    pub model_name: Option<String>,
    /// Description URL the device was found at.
    pub location: String,
    pub services: Vec<ServiceEndpoint>,
}

impl DeviceDescription {
    /// Finds a service whose type contains `:service:{name}:`.
    ///
    /// Version suffixes are ignored so `Volume:1` and `Volume:4` both match.
    #[must_use]
    pub fn service(&self, name: &str) -> Option<&ServiceEndpoint> {
        let needle = format!(":service:{}:", name);
        self.services
            .iter()
            .find(|s| s.service_type.contains(&needle))
    }

    /// Returns true if any service belongs to the given URN domain
    /// (e.g. `av-openhome-org`).
    #[must_use]
    pub fn has_service_domain(&self, domain: &str) -> bool {
        let needle = format!("urn:{}:service:", domain);
        self.services
            .iter()
            .any(|s| s.service_type.starts_with(&needle))
    }
}

/// Strips a `uuid:` prefix (any case).
#[must_use]
pub fn normalize_uuid(raw: &str) -> String {
    let trimmed = raw.trim();
    match trimmed.get(..5) {
        Some(prefix) if prefix.eq_ignore_ascii_case("uuid:") => trimmed[5..].to_string(),
        _ => trimmed.to_string(),
    }
}

/// Interface name prefixes that are never worth searching on.
const VIRTUAL_INTERFACE_PREFIXES: &[&str] = &[
    "docker", "br-", "veth", "virbr", "vmnet", "vboxnet", "utun", "tun", "tap", "awdl", "llw",
    "zt", "tailscale", "wg",
];

/// Returns true for container, VPN and hypervisor interfaces.
#[must_use]
pub fn is_virtual_interface(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    VIRTUAL_INTERFACE_PREFIXES
        .iter()
        .any(|prefix| lower.starts_with(prefix))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn description(services: &[&str]) -> DeviceDescription {
        DeviceDescription {
            uuid: "abc".into(),
            friendly_name: "Den".into(),
            manufacturer: None,
            model_name: None,
            location: "http://10.0.0.2/desc.xml".into(),
            services: services
                .iter()
                .map(|t| ServiceEndpoint {
                    service_type: (*t).to_string(),
                    control_url: "http://10.0.0.2/ctl".into(),
                })
                .collect(),
        }
    }

    #[test]
    fn service_lookup_ignores_version() {
        let desc = description(&[
            "urn:schemas-upnp-org:service:AVTransport:1",
            "urn:av-openhome-org:service:Volume:4",
        ]);
        assert!(desc.service("AVTransport").is_some());
        assert!(desc.service("Volume").is_some());
        assert!(desc.service("RenderingControl").is_none());
        assert!(desc.has_service_domain("av-openhome-org"));
        assert!(!description(&[]).has_service_domain("av-openhome-org"));
    }

    #[test]
    fn normalize_uuid_strips_prefix() {
        assert_eq!(normalize_uuid("uuid:1234-abcd"), "1234-abcd");
        assert_eq!(normalize_uuid("UUID:1234-abcd"), "1234-abcd");
        assert_eq!(normalize_uuid("1234-abcd"), "1234-abcd");
    }

    #[test]
    fn virtual_interfaces_are_detected() {
        assert!(is_virtual_interface("docker0"));
        assert!(is_virtual_interface("veth12ab"));
        assert!(!is_virtual_interface("eth0"));
        assert!(!is_virtual_interface("en0"));
    }
}
