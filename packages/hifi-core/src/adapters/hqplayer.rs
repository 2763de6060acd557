//! Adapter exposing an HQPlayer pipeline as the single pseudo-zone
//! `hqplayer:pipeline`.
//!
//! The zone exists only while the pipeline answers. HQPlayer has no artwork,
//! so artwork requests are refused.

use async_trait::async_trait;
use serde_json::json;

use super::{native_id, unsupported, Adapter, AdapterKind};
use crate::artwork::{ArtworkImage, ArtworkRequest};
use crate::error::{BridgeError, BridgeResult};
use crate::hqplayer::{HqpClient, HqpCommand, HqpPlayback, PipelineSnapshot};
use crate::model::{
    BackendStatus, Capabilities, ControlAction, NowPlaying, VolumeControl, VolumeInfo, VolumeKind,
    Zone, ZoneId, ZoneState,
};
use crate::protocol_constants::HQPLAYER_ZONE_ID;

/// dB increment advertised for the pipeline volume.
const VOLUME_STEP_DB: f64 = 0.5;

pub struct HqpAdapter {
    client: HqpClient,
}

impl HqpAdapter {
    pub const PREFIX: &'static str = "hqplayer";

    pub fn new(client: HqpClient) -> Self {
        Self { client }
    }

    #[must_use]
    pub fn client(&self) -> &HqpClient {
        &self.client
    }

    /// Resolves the zone id to the live pipeline.
    fn pipeline(&self, zone_id: &ZoneId) -> BridgeResult<PipelineSnapshot> {
        let native = native_id(Self::PREFIX, zone_id)?;
        if native != HQPLAYER_ZONE_ID {
            return Err(BridgeError::ZoneNotFound(zone_id.to_string()));
        }
        self.client.snapshot().ok_or_else(|| {
            BridgeError::BackendUnavailable(format!(
                "HQPlayer at {} is not reachable",
                self.client.address()
            ))
        })
    }

    fn volume_control(snapshot: &PipelineSnapshot) -> Option<VolumeControl> {
        let range = snapshot.volume_range.filter(|r| r.enabled)?;
        Some(VolumeControl {
            kind: VolumeKind::Db,
            min: range.min,
            max: range.max,
            step: VOLUME_STEP_DB,
            is_muted: false,
        })
    }

    fn zone(snapshot: &PipelineSnapshot) -> Zone {
        let volume_control = Self::volume_control(snapshot);
        Zone {
            zone_id: ZoneId::new(Self::PREFIX, HQPLAYER_ZONE_ID),
            display_name: snapshot
                .info
                .name
                .clone()
                .unwrap_or_else(|| "HQPlayer".to_string()),
            state: match snapshot.state.playback {
                HqpPlayback::Playing => ZoneState::Playing,
                HqpPlayback::Paused => ZoneState::Paused,
                HqpPlayback::Stopped => ZoneState::Stopped,
                HqpPlayback::Unknown => ZoneState::Unknown,
            },
            source: Self::PREFIX.to_string(),
            capabilities: Capabilities {
                transport: true,
                volume: volume_control.is_some(),
                seek: true,
                grouping: false,
                dsp: true,
            },
            volume_control,
            extra: Some(json!({
                "product": snapshot.info.product,
                "version": snapshot.info.version,
                "filter": snapshot.state.filter,
                "shaper": snapshot.state.shaper,
            })),
        }
    }
}

#[async_trait]
impl Adapter for HqpAdapter {
    fn prefix(&self) -> &str {
        Self::PREFIX
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::PseudoZone
    }

    async fn start(&self) -> BridgeResult<()> {
        self.client.start();
        Ok(())
    }

    async fn stop(&self) {
        self.client.stop().await;
    }

    async fn zones(&self) -> BridgeResult<Vec<Zone>> {
        Ok(self.client.snapshot().iter().map(Self::zone).collect())
    }

    async fn now_playing(&self, zone_id: &ZoneId) -> BridgeResult<Option<NowPlaying>> {
        let snapshot = match self.pipeline(zone_id) {
            Ok(snapshot) => snapshot,
            Err(BridgeError::ZoneNotFound(_)) | Err(BridgeError::BackendUnavailable(_)) => {
                return Ok(None)
            }
            Err(e) => return Err(e),
        };

        let status = snapshot.status.clone().unwrap_or_default();
        let volume = match (Self::volume_control(&snapshot), snapshot.state.volume) {
            (Some(control), Some(value)) => Some(VolumeInfo::from_control(&control, value)),
            _ => None,
        };

        Ok(Some(NowPlaying {
            zone_id: Some(zone_id.clone()),
            line1: status.title,
            line2: status.artist,
            line3: status.album,
            is_playing: snapshot.is_playing(),
            volume,
            seek_position: status.position,
            length: status.length,
            image_key: None,
        }))
    }

    async fn control(&self, zone_id: &ZoneId, action: ControlAction) -> BridgeResult<()> {
        let snapshot = self.pipeline(zone_id)?;

        let command = match action {
            ControlAction::Play => HqpCommand::Play,
            ControlAction::Pause => HqpCommand::Pause,
            ControlAction::PlayPause if snapshot.is_playing() => HqpCommand::Pause,
            ControlAction::PlayPause => HqpCommand::Play,
            ControlAction::Stop => HqpCommand::Stop,
            ControlAction::Next => HqpCommand::Next,
            ControlAction::Previous => HqpCommand::Previous,
            ControlAction::Seek(seconds) => HqpCommand::Seek(seconds),
            ControlAction::VolumeAbsolute(db) => {
                if Self::volume_control(&snapshot).is_none() {
                    return Err(unsupported(Self::PREFIX, action));
                }
                let sent = self.client.set_volume(db).await?;
                log::debug!("[HQPlayer] volume -> {} dB", sent);
                return Ok(());
            }
            ControlAction::VolumeRelative(delta) => {
                if Self::volume_control(&snapshot).is_none() {
                    return Err(unsupported(Self::PREFIX, action));
                }
                if !self.client.adjust_volume(delta) {
                    return Err(BridgeError::BackendUnavailable(
                        "hqplayer is not running".into(),
                    ));
                }
                return Ok(());
            }
        };

        self.client.send(command).await?;
        Ok(())
    }

    async fn artwork(
        &self,
        reference: &ZoneId,
        _request: &ArtworkRequest,
    ) -> BridgeResult<ArtworkImage> {
        native_id(Self::PREFIX, reference)?;
        Err(BridgeError::UnsupportedAction(
            "hqplayer does not provide artwork".into(),
        ))
    }

    async fn status(&self) -> BackendStatus {
        let snapshot = self.client.snapshot();
        BackendStatus {
            backend: Self::PREFIX.to_string(),
            kind: AdapterKind::PseudoZone,
            connected: self.client.is_reachable(),
            zone_count: usize::from(snapshot.is_some()),
            last_error: self.client.last_error(),
            detail: Some(json!({
                "address": self.client.address(),
                "version": snapshot.and_then(|s| s.info.version),
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HqpConfig;
    use crate::events::ZoneEvents;
    use crate::hqplayer::{HqpInfo, HqpState, HqpVolumeRange};

    fn adapter() -> HqpAdapter {
        HqpAdapter::new(HqpClient::new(
            HqpConfig {
                host: "127.0.0.1".into(),
                ..HqpConfig::default()
            },
            ZoneEvents::noop("hqplayer"),
        ))
    }

    fn snapshot(enabled: bool) -> PipelineSnapshot {
        PipelineSnapshot {
            info: HqpInfo {
                name: Some("HQPlayer 5 Desktop".into()),
                ..HqpInfo::default()
            },
            state: HqpState {
                playback: HqpPlayback::Paused,
                volume: Some(-18.0),
                ..HqpState::default()
            },
            volume_range: Some(HqpVolumeRange {
                min: -60.0,
                max: 0.0,
                enabled,
            }),
            status: None,
        }
    }

    #[test]
    fn pipeline_zone_uses_db_range() {
        let zone = HqpAdapter::zone(&snapshot(true));
        assert_eq!(zone.zone_id.to_string(), "hqplayer:pipeline");
        assert_eq!(zone.state, ZoneState::Paused);
        assert!(zone.capabilities.dsp);
        let control = zone.volume_control.unwrap();
        assert_eq!(control.kind, VolumeKind::Db);
        assert_eq!((control.min, control.max), (-60.0, 0.0));
    }

    #[test]
    fn disabled_volume_hides_control() {
        let zone = HqpAdapter::zone(&snapshot(false));
        assert!(zone.volume_control.is_none());
        assert!(!zone.capabilities.volume);
    }

    #[tokio::test]
    async fn unreachable_pipeline_has_no_zone() {
        let adapter = adapter();
        assert!(adapter.zones().await.unwrap().is_empty());

        let zone = ZoneId::new("hqplayer", HQPLAYER_ZONE_ID);
        assert!(adapter.now_playing(&zone).await.unwrap().is_none());
        let err = adapter.control(&zone, ControlAction::Play).await.unwrap_err();
        assert!(matches!(err, BridgeError::BackendUnavailable(_)));
    }

    #[tokio::test]
    async fn other_native_ids_are_not_found() {
        let adapter = adapter();
        let err = adapter
            .control(&ZoneId::new("hqplayer", "other"), ControlAction::Stop)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::ZoneNotFound(_)));
    }

    #[tokio::test]
    async fn artwork_is_refused() {
        let err = adapter()
            .artwork(
                &ZoneId::new("hqplayer", HQPLAYER_ZONE_ID),
                &ArtworkRequest::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::UnsupportedAction(_)));
    }
}
