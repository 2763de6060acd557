//! Core configuration.
//!
//! Each backend has its own section. Sections holding a host (`roon`, `lms`,
//! `hqplayer`) enable their backend by being present; the discovery-based
//! backends carry an explicit `enabled` flag because they need no address.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol_constants::{
    ARTWORK_TIMEOUT_SECS, HQPLAYER_DEFAULT_PORT, LMS_DEFAULT_PORT, MAX_ARTWORK_BYTES,
    MAX_ARTWORK_DIMENSION, MAX_ARTWORK_REDIRECTS, ROON_DEFAULT_PORT, SOAP_TIMEOUT_SECS,
};

/// Configuration for the hi-fi control core.
///
/// All fields have sensible defaults.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct Config {
    /// Timeout applied to the shared HTTP client (seconds).
    pub http_timeout_secs: u64,

    /// Artwork fetch limits.
    pub artwork: ArtworkConfig,

    /// Roon core connection (subscription backend).
    pub roon: Option<RoonConfig>,

    /// Generic UPnP MediaRenderer discovery.
    pub upnp: DiscoveryConfig,

    /// OpenHome device discovery.
    pub openhome: DiscoveryConfig,

    /// Logitech Media Server connection.
    pub lms: Option<LmsConfig>,

    /// HQPlayer pipeline connection.
    pub hqplayer: Option<HqpConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_timeout_secs: SOAP_TIMEOUT_SECS,
            artwork: ArtworkConfig::default(),
            roon: None,
            upnp: DiscoveryConfig::default(),
            openhome: DiscoveryConfig::default(),
            lms: None,
            hqplayer: None,
        }
    }
}

impl Config {
    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.http_timeout_secs == 0 {
            return Err("http_timeout_secs must be >= 1".to_string());
        }
        self.artwork.validate()?;
        self.upnp.validate("upnp")?;
        self.openhome.validate("openhome")?;
        if let Some(roon) = &self.roon {
            if roon.host.trim().is_empty() {
                return Err("roon.host must not be empty".to_string());
            }
        }
        if let Some(lms) = &self.lms {
            if lms.host.trim().is_empty() {
                return Err("lms.host must not be empty".to_string());
            }
            if lms.poll_interval_ms == 0 {
                return Err("lms.poll_interval_ms must be >= 1".to_string());
            }
        }
        if let Some(hqp) = &self.hqplayer {
            if hqp.host.trim().is_empty() {
                return Err("hqplayer.host must not be empty".to_string());
            }
            if hqp.poll_interval_ms == 0 || hqp.timeout_ms == 0 {
                return Err("hqplayer intervals must be >= 1".to_string());
            }
        }
        Ok(())
    }
}

/// Limits for artwork fetches.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ArtworkConfig {
    /// Body size ceiling (bytes).
    pub max_bytes: usize,
    /// Redirect hops followed before failing.
    pub max_redirects: usize,
    /// Whole-request timeout (seconds).
    pub timeout_secs: u64,
    /// Largest requested width or height (pixels).
    pub max_dimension: u32,
}

impl Default for ArtworkConfig {
    fn default() -> Self {
        Self {
            max_bytes: MAX_ARTWORK_BYTES,
            max_redirects: MAX_ARTWORK_REDIRECTS,
            timeout_secs: ARTWORK_TIMEOUT_SECS,
            max_dimension: MAX_ARTWORK_DIMENSION,
        }
    }
}

impl ArtworkConfig {
    fn validate(&self) -> Result<(), String> {
        if self.max_bytes == 0 || self.max_bytes > MAX_ARTWORK_BYTES {
            return Err(format!(
                "artwork.max_bytes must be between 1 and {}",
                MAX_ARTWORK_BYTES
            ));
        }
        if self.max_redirects > MAX_ARTWORK_REDIRECTS {
            return Err(format!(
                "artwork.max_redirects must be <= {}",
                MAX_ARTWORK_REDIRECTS
            ));
        }
        if self.timeout_secs == 0 {
            return Err("artwork.timeout_secs must be >= 1".to_string());
        }
        if self.max_dimension == 0 || self.max_dimension > MAX_ARTWORK_DIMENSION {
            return Err(format!(
                "artwork.max_dimension must be between 1 and {}",
                MAX_ARTWORK_DIMENSION
            ));
        }
        Ok(())
    }
}

/// Roon core connection settings.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RoonConfig {
    /// Core address (no discovery; the core is configured explicitly).
    pub host: String,
    pub port: u16,
    /// File holding the pairing token between runs.
    pub token_path: Option<PathBuf>,
    /// Upper bound of the reconnect backoff (seconds).
    pub reconnect_max_secs: u64,
    /// Request timeout for MOO requests (milliseconds).
    pub request_timeout_ms: u64,
}

impl Default for RoonConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: ROON_DEFAULT_PORT,
            token_path: None,
            reconnect_max_secs: 30,
            request_timeout_ms: 5000,
        }
    }
}

/// Settings shared by the SSDP discovery/poll backends.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub enabled: bool,
    /// Interval between M-SEARCH rounds (seconds).
    pub discovery_interval_secs: u64,
    /// Poll scheduler tick (milliseconds).
    pub poll_tick_ms: u64,
    /// Minimum spacing of transport/volume polls per device (milliseconds).
    pub poll_min_interval_ms: u64,
    /// Minimum spacing of track metadata polls per device (milliseconds).
    pub track_poll_min_interval_ms: u64,
    /// Timeout of each poll sub-query (milliseconds).
    pub query_timeout_ms: u64,
    /// Number of M-SEARCH packets per round.
    pub ssdp_send_count: u64,
    /// How long each round listens for responses (milliseconds).
    pub ssdp_listen_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            discovery_interval_secs: 30,
            poll_tick_ms: 1000,
            poll_min_interval_ms: 2000,
            track_poll_min_interval_ms: 5000,
            query_timeout_ms: 3000,
            ssdp_send_count: 2,
            ssdp_listen_ms: 3000,
        }
    }
}

impl DiscoveryConfig {
    #[must_use]
    pub fn discovery_interval(&self) -> Duration {
        Duration::from_secs(self.discovery_interval_secs)
    }

    #[must_use]
    pub fn poll_tick(&self) -> Duration {
        Duration::from_millis(self.poll_tick_ms)
    }

    #[must_use]
    pub fn poll_min_interval(&self) -> Duration {
        Duration::from_millis(self.poll_min_interval_ms)
    }

    #[must_use]
    pub fn track_poll_min_interval(&self) -> Duration {
        Duration::from_millis(self.track_poll_min_interval_ms)
    }

    #[must_use]
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    fn validate(&self, section: &str) -> Result<(), String> {
        if self.discovery_interval_secs == 0 {
            return Err(format!("{}.discovery_interval_secs must be >= 1", section));
        }
        if self.poll_tick_ms == 0 {
            return Err(format!(
                "{}.poll_tick_ms must be >= 1 (interval panics on 0)",
                section
            ));
        }
        if self.query_timeout_ms == 0 {
            return Err(format!("{}.query_timeout_ms must be >= 1", section));
        }
        if self.ssdp_listen_ms >= self.discovery_interval_secs * 1000 {
            return Err(format!(
                "{}.ssdp_listen_ms must be shorter than the discovery interval",
                section
            ));
        }
        Ok(())
    }
}

/// Logitech Media Server connection settings.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LmsConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Interval between player polls (milliseconds).
    pub poll_interval_ms: u64,
}

impl Default for LmsConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: LMS_DEFAULT_PORT,
            username: None,
            password: None,
            poll_interval_ms: 2000,
        }
    }
}

/// HQPlayer connection settings.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HqpConfig {
    pub host: String,
    pub port: u16,
    /// Interval between pipeline polls (milliseconds).
    pub poll_interval_ms: u64,
    /// Timeout of one request/response exchange (milliseconds).
    pub timeout_ms: u64,
}

impl Default for HqpConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: HQPLAYER_DEFAULT_PORT,
            poll_interval_ms: 2000,
            timeout_ms: 3000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"lms": {"host": "10.0.0.5"}, "upnp": {"enabled": false}}"#)
                .unwrap();
        let lms = config.lms.unwrap();
        assert_eq!(lms.host, "10.0.0.5");
        assert_eq!(lms.port, LMS_DEFAULT_PORT);
        assert!(!config.upnp.enabled);
        assert!(config.openhome.enabled);
        assert!(config.roon.is_none());
    }

    #[test]
    fn artwork_limits_cannot_exceed_hard_ceiling() {
        let mut config = Config::default();
        config.artwork.max_bytes = MAX_ARTWORK_BYTES + 1;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.artwork.max_redirects = 6;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_poll_tick_is_rejected() {
        let mut config = Config::default();
        config.upnp.poll_tick_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn empty_hosts_are_rejected() {
        let config = Config {
            hqplayer: Some(HqpConfig::default()),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
