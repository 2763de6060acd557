//! Server configuration.
//!
//! Supports loading from YAML files with environment variable overrides.
//! The backend sections are hifi-core's own [`Config`], flattened into the
//! top level of the file:
//!
//! ```yaml
//! status_interval_secs: 300
//! roon:
//!   host: 192.168.1.20
//!   token_path: /var/lib/hifi/roon_tokens.json
//! lms:
//!   host: 192.168.1.21
//! hqplayer:
//!   host: 192.168.1.22
//! upnp:
//!   enabled: true
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use hifi_core::{Config, HqpConfig, LmsConfig, RoonConfig};
use serde::Deserialize;

/// Server configuration loaded from YAML with environment overrides.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Interval between backend status summaries in the log (0 disables).
    /// Override: `HIFI_STATUS_INTERVAL`
    pub status_interval_secs: u64,

    /// Backend sections.
    #[serde(flatten)]
    pub core: Config,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            status_interval_secs: 300,
            core: Config::default(),
        }
    }
}

impl ServerConfig {
    /// Loads configuration from a YAML file, then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            Self::parse(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn parse(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    /// Applies `HIFI_*` overrides. A host variable enables its backend.
    fn apply_env_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(interval) = var("HIFI_STATUS_INTERVAL").and_then(|v| v.parse().ok()) {
            self.status_interval_secs = interval;
        }

        if let Some(host) = var("HIFI_ROON_HOST") {
            self.core.roon.get_or_insert_with(RoonConfig::default).host = host;
        }
        if let Some(roon) = self.core.roon.as_mut() {
            if let Some(port) = var("HIFI_ROON_PORT").and_then(|v| v.parse().ok()) {
                roon.port = port;
            }
            if let Some(path) = var("HIFI_ROON_TOKEN_PATH") {
                roon.token_path = Some(PathBuf::from(path));
            }
        }

        if let Some(host) = var("HIFI_LMS_HOST") {
            self.core.lms.get_or_insert_with(LmsConfig::default).host = host;
        }
        if let Some(lms) = self.core.lms.as_mut() {
            if let Some(port) = var("HIFI_LMS_PORT").and_then(|v| v.parse().ok()) {
                lms.port = port;
            }
            if let Some(user) = var("HIFI_LMS_USERNAME") {
                lms.username = Some(user);
            }
            if let Some(password) = var("HIFI_LMS_PASSWORD") {
                lms.password = Some(password);
            }
        }

        if let Some(host) = var("HIFI_HQPLAYER_HOST") {
            self.core.hqplayer.get_or_insert_with(HqpConfig::default).host = host;
        }
        if let Some(hqp) = self.core.hqplayer.as_mut() {
            if let Some(port) = var("HIFI_HQPLAYER_PORT").and_then(|v| v.parse().ok()) {
                hqp.port = port;
            }
        }

        if let Some(enabled) = var("HIFI_UPNP_ENABLED").and_then(|v| parse_bool(&v)) {
            self.core.upnp.enabled = enabled;
        }
        if let Some(enabled) = var("HIFI_OPENHOME_ENABLED").and_then(|v| parse_bool(&v)) {
            self.core.openhome.enabled = enabled;
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
