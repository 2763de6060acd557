//! Adapter layer: one adapter per backend, each wrapping its protocol client.
//!
//! Adapters are the only place where native ids gain or lose their backend
//! prefix, where native errors become [`BridgeError`]s, and where actions a
//! backend cannot perform are refused.

mod discovery;
mod hqplayer;
mod lms;
mod roon;

use async_trait::async_trait;
use serde::Serialize;

pub use discovery::DiscoveryAdapter;
pub use hqplayer::HqpAdapter;
pub use lms::LmsAdapter;
pub use roon::RoonAdapter;

use crate::artwork::{ArtworkImage, ArtworkRequest};
use crate::error::{BridgeError, BridgeResult};
use crate::model::{BackendStatus, ControlAction, NowPlaying, Zone, ZoneId};

/// How an adapter learns about its zones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    /// Long-lived push connection delivering snapshots and deltas.
    Subscription,
    /// Devices found by discovery and refreshed by polling.
    DiscoveryPoll,
    /// A single synthesized zone representing a processing pipeline.
    PseudoZone,
}

/// Uniform contract every backend adapter fulfils.
///
/// Zone ids crossing this trait are always fully prefixed; the adapter strips
/// the prefix before talking to its client.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Backend name, also the zone id prefix.
    fn prefix(&self) -> &str;

    fn kind(&self) -> AdapterKind;

    /// Starts the client's background work (connect, discover, poll).
    async fn start(&self) -> BridgeResult<()>;

    /// Stops all background work and releases connections.
    async fn stop(&self);

    /// Current zones, projected from the client's cache.
    async fn zones(&self) -> BridgeResult<Vec<Zone>>;

    /// Now-playing for one zone, `None` if the backend does not know it.
    async fn now_playing(&self, zone_id: &ZoneId) -> BridgeResult<Option<NowPlaying>>;

    async fn control(&self, zone_id: &ZoneId, action: ControlAction) -> BridgeResult<()>;

    /// Artwork for a zone's current track or for an explicit image key.
    async fn artwork(
        &self,
        reference: &ZoneId,
        request: &ArtworkRequest,
    ) -> BridgeResult<ArtworkImage>;

    async fn status(&self) -> BackendStatus;
}

/// Strips and validates the prefix of an incoming zone id.
pub(crate) fn native_id<'a>(prefix: &str, zone_id: &'a ZoneId) -> BridgeResult<&'a str> {
    if zone_id.backend() != prefix {
        return Err(BridgeError::UnknownZone(zone_id.to_string()));
    }
    Ok(zone_id.native_id())
}

/// Standard refusal for an action the backend cannot perform.
pub(crate) fn unsupported(prefix: &str, action: ControlAction) -> BridgeError {
    BridgeError::UnsupportedAction(format!("{} does not support {}", prefix, action.as_str()))
}
