//! Application bootstrap and dependency wiring.
//!
//! This module is the composition root: every protocol client is built here
//! from its config section, the shared HTTP client and a [`ZoneEvents`]
//! handle, wrapped in its adapter and registered on the [`Bus`].
//!
//! Nothing is started here; call [`Bus::start_all`] once wiring is done.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tokio_util::sync::CancellationToken;

use crate::adapters::{DiscoveryAdapter, HqpAdapter, LmsAdapter, RoonAdapter};
use crate::artwork::ArtworkFetcher;
use crate::bus::Bus;
use crate::config::Config;
use crate::error::{BridgeError, BridgeResult};
use crate::events::{BroadcastEventBridge, EventEmitter, ZoneEvents};
use crate::hqplayer::HqpClient;
use crate::lms::LmsClient;
use crate::protocol_constants::EVENT_CHANNEL_CAPACITY;
use crate::roon::RoonClient;
use crate::upnp::{DiscoveryClient, MediaRendererFamily, OpenHomeFamily};

/// Backend names, also the zone id prefixes.
pub const UPNP_BACKEND: &str = "upnp";
pub const OPENHOME_BACKEND: &str = "openhome";

/// Container for the wired services.
#[derive(Clone)]
pub struct BootstrappedServices {
    /// Registry and router over every enabled backend.
    pub bus: Arc<Bus>,
    /// Event bridge behind the bus; external emitters attach here.
    pub events: Arc<BroadcastEventBridge>,
    /// Shared HTTP client for connection pooling.
    http_client: Client,
    /// Cancelled by [`shutdown`](Self::shutdown).
    pub cancel_token: CancellationToken,
}

impl BootstrappedServices {
    /// Returns the shared HTTP client.
    pub fn http_client(&self) -> &Client {
        &self.http_client
    }

    /// Stops every backend and cancels the shared token.
    pub async fn shutdown(&self) {
        log::info!("[Bootstrap] Beginning graceful shutdown...");
        self.cancel_token.cancel();
        self.bus.stop_all().await;
        log::info!("[Bootstrap] Shutdown complete");
    }
}

/// Creates the shared HTTP client used for SOAP, descriptions and LMS.
///
/// # Errors
/// Returns `Internal` if the TLS backend cannot be initialized.
pub fn create_http_client(timeout: Duration) -> BridgeResult<Client> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| BridgeError::Internal(format!("Failed to create HTTP client: {}", e)))
}

/// Builds and registers every backend enabled in `config`.
///
/// Wiring order:
///
/// 1. Shared infrastructure (HTTP client, artwork fetcher, event bridge)
/// 2. Discovery backends (`upnp`, `openhome`)
/// 3. Addressed backends (`roon`, `lms`, `hqplayer`), present only when
///    their section is configured
///
/// # Errors
/// Invalid configuration, or a client that cannot be constructed.
pub fn bootstrap_services(config: &Config) -> BridgeResult<BootstrappedServices> {
    config.validate().map_err(BridgeError::InvalidRequest)?;

    let http_client = create_http_client(Duration::from_secs(config.http_timeout_secs))?;
    let artwork = ArtworkFetcher::new(&config.artwork)?;
    let events = Arc::new(BroadcastEventBridge::new(EVENT_CHANNEL_CAPACITY));
    let emitter = Arc::clone(&events) as Arc<dyn EventEmitter>;
    let zone_events = |backend: &str| ZoneEvents::new(backend, Arc::clone(&emitter));

    let bus = Arc::new(Bus::new(Arc::clone(&events)));

    if config.upnp.enabled {
        // Devices that also speak OpenHome are left to the OpenHome backend.
        let family = MediaRendererFamily::new(config.openhome.enabled);
        let client = DiscoveryClient::new(
            family,
            http_client.clone(),
            config.upnp.clone(),
            zone_events(UPNP_BACKEND),
        );
        bus.register_backend(
            UPNP_BACKEND,
            Arc::new(DiscoveryAdapter::new(UPNP_BACKEND, client, artwork.clone())),
        )?;
    }

    if config.openhome.enabled {
        let client = DiscoveryClient::new(
            OpenHomeFamily::new(),
            http_client.clone(),
            config.openhome.clone(),
            zone_events(OPENHOME_BACKEND),
        );
        bus.register_backend(
            OPENHOME_BACKEND,
            Arc::new(DiscoveryAdapter::new(
                OPENHOME_BACKEND,
                client,
                artwork.clone(),
            )),
        )?;
    }

    if let Some(roon) = &config.roon {
        let client = RoonClient::new(roon.clone(), zone_events(RoonAdapter::PREFIX));
        bus.register_backend(
            RoonAdapter::PREFIX,
            Arc::new(RoonAdapter::new(client, artwork.clone())),
        )?;
    }

    if let Some(lms) = &config.lms {
        let client = LmsClient::new(
            http_client.clone(),
            lms.clone(),
            zone_events(LmsAdapter::PREFIX),
        );
        bus.register_backend(
            LmsAdapter::PREFIX,
            Arc::new(LmsAdapter::new(client, artwork.clone())),
        )?;
    }

    if let Some(hqp) = &config.hqplayer {
        let client = HqpClient::new(hqp.clone(), zone_events(HqpAdapter::PREFIX));
        bus.register_backend(HqpAdapter::PREFIX, Arc::new(HqpAdapter::new(client)))?;
    }

    log::info!(
        "[Bootstrap] Registered backends: {}",
        bus.backends().join(", ")
    );

    Ok(BootstrappedServices {
        bus,
        events,
        http_client,
        cancel_token: CancellationToken::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HqpConfig, LmsConfig, RoonConfig};

    #[test]
    fn http_client_builds() {
        let client = create_http_client(Duration::from_secs(5)).unwrap();
        assert!(client.get("http://example.com").build().is_ok());
    }

    #[test]
    fn defaults_register_discovery_backends_only() {
        let services = bootstrap_services(&Config::default()).unwrap();
        assert_eq!(services.bus.backends(), vec!["upnp", "openhome"]);
    }

    #[test]
    fn configured_sections_enable_their_backends() {
        let mut config = Config::default();
        config.upnp.enabled = false;
        config.openhome.enabled = false;
        config.roon = Some(RoonConfig {
            host: "10.0.0.5".into(),
            ..RoonConfig::default()
        });
        config.lms = Some(LmsConfig {
            host: "10.0.0.6".into(),
            ..LmsConfig::default()
        });
        config.hqplayer = Some(HqpConfig {
            host: "10.0.0.7".into(),
            ..HqpConfig::default()
        });

        let services = bootstrap_services(&config).unwrap();
        assert_eq!(services.bus.backends(), vec!["roon", "lms", "hqplayer"]);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut config = Config::default();
        config.roon = Some(RoonConfig::default());
        assert!(matches!(
            bootstrap_services(&config),
            Err(BridgeError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn shutdown_with_nothing_started_is_clean() {
        let services = bootstrap_services(&Config::default()).unwrap();
        services.shutdown().await;
        assert!(services.cancel_token.is_cancelled());
    }
}
