//! Adapter for a Roon core: every Roon zone becomes one bridge zone.

use async_trait::async_trait;
use serde_json::json;

use super::{native_id, unsupported, Adapter, AdapterKind};
use crate::artwork::{ArtworkFetcher, ArtworkImage, ArtworkRequest};
use crate::error::{BridgeError, BridgeResult};
use crate::model::{
    BackendStatus, Capabilities, ControlAction, NowPlaying, VolumeControl, VolumeInfo, Zone,
    ZoneId, ZoneState,
};
use crate::roon::{RoonClient, RoonOutput, RoonZone};

pub struct RoonAdapter {
    client: RoonClient,
    artwork: ArtworkFetcher,
}

impl RoonAdapter {
    pub const PREFIX: &'static str = "roon";

    pub fn new(client: RoonClient, artwork: ArtworkFetcher) -> Self {
        Self { client, artwork }
    }

    #[must_use]
    pub fn client(&self) -> &RoonClient {
        &self.client
    }

    fn zone(zone: &RoonZone) -> Zone {
        let volume_control = primary_volume(zone);
        Zone {
            zone_id: ZoneId::new(Self::PREFIX, &zone.zone_id),
            display_name: zone.display_name.clone(),
            state: zone_state(&zone.state),
            source: Self::PREFIX.to_string(),
            capabilities: Capabilities {
                transport: true,
                volume: zone.outputs.iter().any(|o| o.volume.is_some()),
                seek: zone.is_seek_allowed,
                grouping: true,
                dsp: false,
            },
            volume_control,
            extra: Some(json!({
                "outputs": zone
                    .outputs
                    .iter()
                    .map(|o| json!({ "output_id": o.output_id, "display_name": o.display_name }))
                    .collect::<Vec<_>>(),
            })),
        }
    }

    fn served_zone(&self, zone_id: &ZoneId) -> BridgeResult<RoonZone> {
        let native = native_id(Self::PREFIX, zone_id)?;
        self.client
            .zone(native)
            .ok_or_else(|| BridgeError::ZoneNotFound(zone_id.to_string()))
    }
}

fn zone_state(state: &str) -> ZoneState {
    match state {
        "playing" => ZoneState::Playing,
        "paused" => ZoneState::Paused,
        "loading" => ZoneState::Loading,
        "stopped" => ZoneState::Stopped,
        _ => ZoneState::Unknown,
    }
}

/// The first output with absolute volume speaks for the zone.
fn primary_volume(zone: &RoonZone) -> Option<VolumeControl> {
    zone.outputs
        .iter()
        .find_map(|o| o.volume.as_ref().and_then(|v| v.control()))
}

fn volume_outputs(zone: &RoonZone) -> impl Iterator<Item = &RoonOutput> {
    zone.outputs.iter().filter(|o| o.volume.is_some())
}

/// Roon image keys are opaque hex-like tokens.
fn is_image_key(key: &str) -> bool {
    !key.is_empty() && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[async_trait]
impl Adapter for RoonAdapter {
    fn prefix(&self) -> &str {
        Self::PREFIX
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::Subscription
    }

    async fn start(&self) -> BridgeResult<()> {
        self.client.start();
        Ok(())
    }

    async fn stop(&self) {
        self.client.stop().await;
    }

    async fn zones(&self) -> BridgeResult<Vec<Zone>> {
        Ok(self.client.zones().iter().map(Self::zone).collect())
    }

    async fn now_playing(&self, zone_id: &ZoneId) -> BridgeResult<Option<NowPlaying>> {
        let native = native_id(Self::PREFIX, zone_id)?;
        let Some(zone) = self.client.zone(native) else {
            return Ok(None);
        };

        let volume = zone.outputs.iter().find_map(|o| {
            let v = o.volume.as_ref()?;
            Some(VolumeInfo::from_control(&v.control()?, v.value?))
        });
        let np = zone.now_playing.clone().unwrap_or_default();
        let lines = np.three_line.unwrap_or_default();

        Ok(Some(NowPlaying {
            zone_id: Some(zone_id.clone()),
            line1: lines.line1,
            line2: lines.line2,
            line3: lines.line3,
            is_playing: zone_state(&zone.state).is_playing(),
            volume,
            seek_position: np.seek_position.or(zone.seek_position),
            length: np.length,
            image_key: np.image_key,
        }))
    }

    async fn control(&self, zone_id: &ZoneId, action: ControlAction) -> BridgeResult<()> {
        let zone = self.served_zone(zone_id)?;

        let control = match action {
            ControlAction::Play => "play",
            ControlAction::Pause => "pause",
            ControlAction::PlayPause => "playpause",
            ControlAction::Stop => "stop",
            ControlAction::Next => "next",
            ControlAction::Previous => "previous",
            ControlAction::Seek(seconds) => {
                if !zone.is_seek_allowed {
                    return Err(unsupported(Self::PREFIX, action));
                }
                self.client.seek(&zone.zone_id, seconds).await?;
                return Ok(());
            }
            ControlAction::VolumeAbsolute(value) => {
                let outputs: Vec<&RoonOutput> = zone
                    .outputs
                    .iter()
                    .filter(|o| o.volume.as_ref().and_then(|v| v.control()).is_some())
                    .collect();
                if outputs.is_empty() {
                    return Err(unsupported(Self::PREFIX, action));
                }
                for output in outputs {
                    let sent = self.client.set_volume(&output.output_id, value).await?;
                    log::debug!("[Roon] {} volume -> {}", output.display_name, sent);
                }
                return Ok(());
            }
            ControlAction::VolumeRelative(delta) => {
                let mut outputs = volume_outputs(&zone).peekable();
                if outputs.peek().is_none() {
                    return Err(unsupported(Self::PREFIX, action));
                }
                for output in outputs {
                    if !self.client.adjust_volume(&output.output_id, delta) {
                        return Err(BridgeError::BackendUnavailable(
                            "roon is not running".into(),
                        ));
                    }
                }
                return Ok(());
            }
        };

        self.client.control(&zone.zone_id, control).await?;
        Ok(())
    }

    async fn artwork(
        &self,
        reference: &ZoneId,
        request: &ArtworkRequest,
    ) -> BridgeResult<ArtworkImage> {
        let native = native_id(Self::PREFIX, reference)?;

        let key = match self.client.zone(native) {
            Some(zone) => zone
                .now_playing
                .and_then(|np| np.image_key)
                .ok_or_else(|| BridgeError::ZoneNotFound(format!("no artwork for {}", reference)))?,
            None if is_image_key(native) => native.to_string(),
            None => {
                return Err(BridgeError::InvalidRequest(format!(
                    "not a Roon image key: {}",
                    native
                )))
            }
        };

        let url = self.client.image_url(&key, request.width, request.height);
        self.artwork.fetch_and_render(&url, request).await
    }

    async fn status(&self) -> BackendStatus {
        BackendStatus {
            backend: Self::PREFIX.to_string(),
            kind: AdapterKind::Subscription,
            connected: self.client.is_paired(),
            zone_count: self.client.zone_count(),
            last_error: self.client.last_error(),
            detail: Some(json!({
                "core": self.client.core_name(),
                "address": self.client.address(),
            })),
        }
    }
}
