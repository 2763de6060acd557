//! Adapter for the SSDP discovery/poll families (UPnP renderers, OpenHome).

use async_trait::async_trait;
use serde_json::json;

use super::{native_id, unsupported, Adapter, AdapterKind};
use crate::artwork::{ArtworkFetcher, ArtworkImage, ArtworkRequest};
use crate::error::{BridgeError, BridgeResult};
use crate::model::{
    BackendStatus, ControlAction, NowPlaying, VolumeControl, VolumeInfo, VolumeKind, Zone, ZoneId,
    ZoneState,
};
use crate::upnp::{DeviceFamily, DeviceSnapshot, DiscoveryClient, TransportCommand, TransportState};

/// Exposes every device a [`DiscoveryClient`] knows as one zone.
pub struct DiscoveryAdapter<F: DeviceFamily> {
    prefix: String,
    client: DiscoveryClient<F>,
    artwork: ArtworkFetcher,
}

impl<F: DeviceFamily> DiscoveryAdapter<F> {
    pub fn new(prefix: impl Into<String>, client: DiscoveryClient<F>, artwork: ArtworkFetcher) -> Self {
        Self {
            prefix: prefix.into(),
            client,
            artwork,
        }
    }

    #[must_use]
    pub fn client(&self) -> &DiscoveryClient<F> {
        &self.client
    }

    fn lookup(&self, zone_id: &ZoneId) -> BridgeResult<DeviceSnapshot> {
        let native = native_id(&self.prefix, zone_id)?;
        self.client
            .device(native)
            .ok_or_else(|| BridgeError::ZoneNotFound(zone_id.to_string()))
    }

    fn publishes_artwork(&self, url: &str) -> bool {
        self.client.devices().iter().any(|snapshot| {
            snapshot
                .state
                .track
                .as_ref()
                .and_then(|t| t.album_art_uri.as_deref())
                == Some(url)
        })
    }

    fn volume_control(&self, snapshot: &DeviceSnapshot) -> Option<VolumeControl> {
        if !self.client.capabilities(&snapshot.description).volume {
            return None;
        }
        let reading = snapshot.state.volume.as_ref();
        Some(VolumeControl {
            kind: VolumeKind::Number,
            min: 0.0,
            max: reading.map_or(100.0, |v| v.max),
            step: 1.0,
            is_muted: reading.is_some_and(|v| v.muted),
        })
    }

    fn zone(&self, snapshot: &DeviceSnapshot) -> Zone {
        let description = &snapshot.description;
        Zone {
            zone_id: ZoneId::new(&self.prefix, &description.uuid),
            display_name: description.friendly_name.clone(),
            state: zone_state(snapshot.state.transport_state()),
            source: self.prefix.clone(),
            volume_control: self.volume_control(snapshot),
            capabilities: self.client.capabilities(description),
            extra: Some(json!({
                "manufacturer": description.manufacturer,
                "model": description.model_name,
                "location": description.location,
            })),
        }
    }
}

fn zone_state(state: TransportState) -> ZoneState {
    match state {
        TransportState::Playing => ZoneState::Playing,
        TransportState::Paused => ZoneState::Paused,
        TransportState::Stopped => ZoneState::Stopped,
        TransportState::Transitioning => ZoneState::Loading,
        TransportState::NoMedia => ZoneState::Idle,
        TransportState::Unknown => ZoneState::Unknown,
    }
}

#[async_trait]
impl<F: DeviceFamily> Adapter for DiscoveryAdapter<F> {
    fn prefix(&self) -> &str {
        &self.prefix
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
        Ok(self.client.devices().iter().map(|d| self.zone(d)).collect())
    }

    async fn now_playing(&self, zone_id: &ZoneId) -> BridgeResult<Option<NowPlaying>> {
        let native = native_id(&self.prefix, zone_id)?;
        let Some(snapshot) = self.client.device(native) else {
            return Ok(None);
        };

        let state = &snapshot.state;
        let track = state.track.clone().unwrap_or_default();
        let volume = match (self.volume_control(&snapshot), state.volume.as_ref()) {
            (Some(control), Some(reading)) => Some(VolumeInfo::from_control(&control, reading.volume)),
            _ => None,
        };
        let transport = state.transport.as_ref();

        Ok(Some(NowPlaying {
            zone_id: Some(zone_id.clone()),
            line1: track.title,
            line2: track.artist,
            line3: track.album,
            is_playing: state.is_playing(),
            volume,
            seek_position: transport.and_then(|t| t.position),
            length: transport.and_then(|t| t.duration).or(track.duration),
            image_key: track.album_art_uri,
        }))
    }

    async fn control(&self, zone_id: &ZoneId, action: ControlAction) -> BridgeResult<()> {
        let snapshot = self.lookup(zone_id)?;
        let device = &snapshot.description;
        let caps = self.client.capabilities(device);

        let command = match action {
            ControlAction::Play => TransportCommand::Play,
            ControlAction::Pause => TransportCommand::Pause,
            ControlAction::PlayPause if snapshot.state.is_playing() => TransportCommand::Pause,
            ControlAction::PlayPause => TransportCommand::Play,
            ControlAction::Stop => TransportCommand::Stop,
            ControlAction::Next => TransportCommand::Next,
            ControlAction::Previous => TransportCommand::Previous,
            ControlAction::Seek(seconds) => {
                if !caps.seek {
                    return Err(unsupported(&self.prefix, action));
                }
                TransportCommand::Seek(seconds)
            }
            ControlAction::VolumeAbsolute(value) => {
                if !caps.volume {
                    return Err(unsupported(&self.prefix, action));
                }
                let sent = self.client.set_volume(device, value).await?;
                log::debug!(
                    "[{}] {} volume -> {}",
                    self.prefix,
                    device.friendly_name,
                    sent
                );
                return Ok(());
            }
            ControlAction::VolumeRelative(delta) => {
                if !caps.volume {
                    return Err(unsupported(&self.prefix, action));
                }
                if !self.client.adjust_volume(&device.uuid, delta) {
                    return Err(BridgeError::BackendUnavailable(format!(
                        "{} is not running",
                        self.prefix
                    )));
                }
                return Ok(());
            }
        };

        if !caps.transport {
            return Err(unsupported(&self.prefix, action));
        }
        self.client.send_transport(device, command).await?;
        Ok(())
    }

    async fn artwork(
        &self,
        reference: &ZoneId,
        request: &ArtworkRequest,
    ) -> BridgeResult<ArtworkImage> {
        let native = native_id(&self.prefix, reference)?;

        // Image keys of these families are the renderer's own absolute URLs.
        // Only a URL currently published by a known device is fetched.
        let url = if native.starts_with("http://") || native.starts_with("https://") {
            if !self.publishes_artwork(native) {
                return Err(BridgeError::ZoneNotFound(format!(
                    "no device publishes artwork {}",
                    native
                )));
            }
            native.to_string()
        } else {
            let snapshot = self.lookup(reference)?;
            snapshot
                .state
                .track
                .and_then(|t| t.album_art_uri)
                .ok_or_else(|| BridgeError::ZoneNotFound(format!("no artwork for {}", reference)))?
        };

        self.artwork.fetch_and_render(&url, request).await
    }

    async fn status(&self) -> BackendStatus {
        BackendStatus {
            backend: self.prefix.clone(),
            kind: AdapterKind::DiscoveryPoll,
            connected: self.client.is_running(),
            zone_count: self.client.device_count(),
            last_error: self.client.last_error(),
            detail: Some(json!({
                "search_target": self.client.family().search_target(),
            })),
        }
    }
}
