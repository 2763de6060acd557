//! Adapter for Logitech Media Server players.

use async_trait::async_trait;
use serde_json::json;

use super::{native_id, Adapter, AdapterKind};
use crate::artwork::{ArtworkFetcher, ArtworkImage, ArtworkRequest};
use crate::error::{BridgeError, BridgeResult};
use crate::lms::{LmsClient, LmsCommand, LmsPlayer, PlayMode};
use crate::model::{
    BackendStatus, Capabilities, ControlAction, NowPlaying, VolumeControl, VolumeInfo, Zone,
    ZoneId, ZoneState,
};

/// Exposes every LMS player as one zone.
pub struct LmsAdapter {
    client: LmsClient,
    artwork: ArtworkFetcher,
}

impl LmsAdapter {
    pub const PREFIX: &'static str = "lms";

    pub fn new(client: LmsClient, artwork: ArtworkFetcher) -> Self {
        Self { client, artwork }
    }

    #[must_use]
    pub fn client(&self) -> &LmsClient {
        &self.client
    }

    fn zone(player: &LmsPlayer) -> Zone {
        let muted = player.status.as_ref().is_some_and(|s| s.muted);
        Zone {
            zone_id: ZoneId::new(Self::PREFIX, &player.id),
            display_name: player.name.clone(),
            state: zone_state(player),
            source: Self::PREFIX.to_string(),
            volume_control: Some(VolumeControl::percent(muted)),
            capabilities: Capabilities {
                transport: true,
                volume: true,
                seek: true,
                ..Capabilities::default()
            },
            extra: Some(json!({
                "model": player.model,
                "connected": player.connected,
            })),
        }
    }
}

fn zone_state(player: &LmsPlayer) -> ZoneState {
    if !player.connected {
        return ZoneState::Idle;
    }
    match player.mode() {
        PlayMode::Play => ZoneState::Playing,
        PlayMode::Pause => ZoneState::Paused,
        PlayMode::Stop => ZoneState::Stopped,
        PlayMode::Unknown => ZoneState::Unknown,
    }
}

/// Cover ids are short alphanumeric tokens; anything else is not a key.
fn is_cover_id(key: &str) -> bool {
    !key.is_empty() && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[async_trait]
impl Adapter for LmsAdapter {
    fn prefix(&self) -> &str {
        Self::PREFIX
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::DiscoveryPoll
    }

    async fn start(&self) -> BridgeResult<()> {
        self.client.start();
        Ok(())
    }

    async fn stop(&self) {
        self.client.stop().await;
    }

    async fn zones(&self) -> BridgeResult<Vec<Zone>> {
        Ok(self.client.players().iter().map(Self::zone).collect())
    }

    async fn now_playing(&self, zone_id: &ZoneId) -> BridgeResult<Option<NowPlaying>> {
        let native = native_id(Self::PREFIX, zone_id)?;
        let Some(player) = self.client.player(native) else {
            return Ok(None);
        };
        let status = player.status.clone().unwrap_or_default();

        let control = VolumeControl::percent(status.muted);
        let image_key = status
            .coverid
            .clone()
            .filter(|_| !status.remote)
            .or_else(|| status.artwork_url.as_deref().map(|u| self.client.resolve_url(u)))
            .or_else(|| status.coverid.clone());

        Ok(Some(NowPlaying {
            zone_id: Some(zone_id.clone()),
            line1: status.title,
            line2: status.artist,
            line3: status.album,
            is_playing: status.mode == PlayMode::Play,
            volume: status.volume.map(|v| VolumeInfo::from_control(&control, v)),
            seek_position: status.time,
            length: status.duration,
            image_key,
        }))
    }

    async fn control(&self, zone_id: &ZoneId, action: ControlAction) -> BridgeResult<()> {
        let native = native_id(Self::PREFIX, zone_id)?;
        let player = self
            .client
            .player(native)
            .ok_or_else(|| BridgeError::ZoneNotFound(zone_id.to_string()))?;

        let command = match action {
            // `play` would restart a paused track from the top.
            ControlAction::Play if player.mode() == PlayMode::Pause => LmsCommand::Resume,
            ControlAction::Play => LmsCommand::Play,
            ControlAction::Pause => LmsCommand::Pause,
            ControlAction::PlayPause => LmsCommand::TogglePause,
            ControlAction::Stop => LmsCommand::Stop,
            ControlAction::Next => LmsCommand::Next,
            ControlAction::Previous => LmsCommand::Previous,
            ControlAction::Seek(seconds) => LmsCommand::Seek(seconds),
            ControlAction::VolumeAbsolute(value) => {
                let sent = self.client.set_volume(native, value).await?;
                log::debug!("[LMS] {} volume -> {}", player.name, sent);
                return Ok(());
            }
            ControlAction::VolumeRelative(delta) => {
                if !self.client.adjust_volume(native, delta) {
                    return Err(BridgeError::BackendUnavailable("lms is not running".into()));
                }
                return Ok(());
            }
        };

        self.client.send(native, command).await?;
        Ok(())
    }

    async fn artwork(
        &self,
        reference: &ZoneId,
        request: &ArtworkRequest,
    ) -> BridgeResult<ArtworkImage> {
        let native = native_id(Self::PREFIX, reference)?;

        let url = if let Some(player) = self.client.player(native) {
            player
                .status
                .as_ref()
                .and_then(|s| self.client.status_artwork(s, request.width, request.height))
                .ok_or_else(|| BridgeError::ZoneNotFound(format!("no artwork for {}", reference)))?
        } else if native.starts_with("http://") || native.starts_with("https://") {
            // Only a remote-stream URL some player is currently showing.
            let published = self.client.players().iter().any(|p| {
                p.status
                    .as_ref()
                    .and_then(|s| s.artwork_url.as_deref())
                    .map(|u| self.client.resolve_url(u))
                    .as_deref()
                    == Some(native)
            });
            if !published {
                return Err(BridgeError::ZoneNotFound(format!(
                    "no player shows artwork {}",
                    native
                )));
            }
            native.to_string()
        } else if is_cover_id(native) {
            self.client.cover_url(native, request.width, request.height)
        } else {
            return Err(BridgeError::InvalidRequest(format!(
                "not an LMS image key: {}",
                native
            )));
        };

        self.artwork.fetch_and_render(&url, request).await
    }

    async fn status(&self) -> BackendStatus {
        BackendStatus {
            backend: Self::PREFIX.to_string(),
            kind: AdapterKind::DiscoveryPoll,
            connected: self.client.is_connected(),
            zone_count: self.client.player_count(),
            last_error: self.client.last_error(),
            detail: Some(json!({ "server": self.client.base_url() })),
        }
    }
}
