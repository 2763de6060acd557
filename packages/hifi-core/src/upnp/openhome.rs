//! OpenHome device family (Playlist, Volume, Info and Time services).
//!
//! The device range is `0..=VolumeMax` from `Characteristics`; devices that
//! fail that action fall back to 0..=100.

use async_trait::async_trait;
use reqwest::Client;

use super::didl::{parse_didl, TrackMetadata};
use super::discovery_client::{DeviceFamily, TransportCommand};
use super::registry::{TransportState, TransportStatus, VolumeStatus};
use super::soap::{required_field, SoapError, SoapRequestBuilder, SoapResult};
use super::types::{DeviceDescription, ServiceEndpoint};
use super::xml::extract_non_empty;
use crate::model::Capabilities;
use crate::protocol_constants::{DEFAULT_VOLUME_MAX, OPENHOME_SEARCH_TARGET};

const PLAYLIST: &str = "Playlist";
const VOLUME: &str = "Volume";
const INFO: &str = "Info";
const TIME: &str = "Time";

/// OpenHome renderers (Linn and compatibles).
#[derive(Default)]
pub struct OpenHomeFamily;

impl OpenHomeFamily {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

fn service<'a>(device: &'a DeviceDescription, name: &str) -> SoapResult<&'a ServiceEndpoint> {
    device
        .service(name)
        .ok_or_else(|| SoapError::missing_service(name))
}

fn parse_number(body: &str, field: &str) -> SoapResult<f64> {
    required_field(body, field)?
        .trim()
        .parse()
        .map_err(|_| SoapError::Parse)
}

#[async_trait]
impl DeviceFamily for OpenHomeFamily {
    fn name(&self) -> &'static str {
        "OpenHome"
    }

    fn search_target(&self) -> &'static str {
        OPENHOME_SEARCH_TARGET
    }

    fn accepts(&self, device: &DeviceDescription) -> bool {
        device.has_service_domain("av-openhome-org") && device.service(PLAYLIST).is_some()
    }

    fn capabilities(&self, device: &DeviceDescription) -> Capabilities {
        Capabilities {
            transport: device.service(PLAYLIST).is_some(),
            volume: device.service(VOLUME).is_some(),
            seek: device.service(PLAYLIST).is_some() && device.service(TIME).is_some(),
            grouping: false,
            dsp: false,
        }
    }

    async fn query_transport(
        &self,
        http: &Client,
        device: &DeviceDescription,
    ) -> SoapResult<TransportStatus> {
        let playlist = service(device, PLAYLIST)?;
        let body = SoapRequestBuilder::new(http, playlist)
            .action("TransportState")
            .send()
            .await?;
        let state = TransportState::parse(&required_field(&body, "Value")?);

        let (position, duration) = match device.service(TIME) {
            Some(time) => match SoapRequestBuilder::new(http, time).action("Time").send().await {
                Ok(body) => (
                    parse_number(&body, "Seconds").ok(),
                    parse_number(&body, "Duration").ok().filter(|d| *d > 0.0),
                ),
                Err(e) => {
                    log::trace!("[OpenHome] Time failed for {}: {}", device.uuid, e);
                    (None, None)
                }
            },
            None => (None, None),
        };

        Ok(TransportStatus {
            state,
            position,
            duration,
        })
    }

    async fn query_volume(
        &self,
        http: &Client,
        device: &DeviceDescription,
    ) -> SoapResult<Option<VolumeStatus>> {
        let Some(volume_service) = device.service(VOLUME) else {
            return Ok(None);
        };

        let (volume, mute, characteristics) = tokio::join!(
            SoapRequestBuilder::new(http, volume_service)
                .action("Volume")
                .send(),
            SoapRequestBuilder::new(http, volume_service)
                .action("Mute")
                .send(),
            SoapRequestBuilder::new(http, volume_service)
                .action("Characteristics")
                .send(),
        );

        let volume = parse_number(&volume?, "Value")?;
        let muted = mute
            .ok()
            .and_then(|body| extract_non_empty(&body, "Value"))
            .is_some_and(|m| m == "1" || m.eq_ignore_ascii_case("true"));
        let max = characteristics
            .ok()
            .and_then(|body| parse_number(&body, "VolumeMax").ok())
            .filter(|m| *m > 0.0)
            .unwrap_or(DEFAULT_VOLUME_MAX);

        Ok(Some(VolumeStatus { volume, max, muted }))
    }

    async fn query_track(
        &self,
        http: &Client,
        device: &DeviceDescription,
    ) -> SoapResult<Option<TrackMetadata>> {
        let info = service(device, INFO)?;
        let body = SoapRequestBuilder::new(http, info)
            .action("Track")
            .send()
            .await?;
        Ok(extract_non_empty(&body, "Metadata").and_then(|didl| parse_didl(&didl)))
    }

    async fn transport(
        &self,
        http: &Client,
        device: &DeviceDescription,
        command: TransportCommand,
    ) -> SoapResult<()> {
        let playlist = service(device, PLAYLIST)?;
        let request = SoapRequestBuilder::new(http, playlist);
        let request = match command {
            TransportCommand::Play => request.action("Play"),
            TransportCommand::Pause => request.action("Pause"),
            TransportCommand::Stop => request.action("Stop"),
            TransportCommand::Next => request.action("Next"),
            TransportCommand::Previous => request.action("Previous"),
            TransportCommand::Seek(seconds) => request
                .action("SeekSecondAbsolute")
                .arg("Value", format!("{}", seconds.max(0.0).round() as u64)),
        };
        request.send().await.map(|_| ())
    }

    async fn set_volume(
        &self,
        http: &Client,
        device: &DeviceDescription,
        volume: f64,
    ) -> SoapResult<()> {
        let volume_service = service(device, VOLUME)?;
        SoapRequestBuilder::new(http, volume_service)
            .action("SetVolume")
            .arg("Value", format!("{}", volume.max(0.0).round() as u64))
            .send()
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(services: &[&str]) -> DeviceDescription {
        DeviceDescription {
            uuid: "oh1".into(),
            friendly_name: "Klimax".into(),
            manufacturer: Some("Linn".into()),
            model_name: None,
            location: "http://10.0.0.4/d.xml".into(),
            services: services
                .iter()
                .map(|t| ServiceEndpoint {
                    service_type: (*t).to_string(),
                    control_url: "http://10.0.0.4/ctl".into(),
                })
                .collect(),
        }
    }

    const PRODUCT: &str = "urn:av-openhome-org:service:Product:1";
    const PL: &str = "urn:av-openhome-org:service:Playlist:1";
    const VOL: &str = "urn:av-openhome-org:service:Volume:2";
    const TM: &str = "urn:av-openhome-org:service:Time:1";

    #[test]
    fn accepts_openhome_with_playlist() {
        let family = OpenHomeFamily::new();
        assert!(family.accepts(&device(&[PRODUCT, PL])));
        assert!(!family.accepts(&device(&[PRODUCT])));
        assert!(!family.accepts(&device(&[
            "urn:schemas-upnp-org:service:AVTransport:1"
        ])));
    }

    #[test]
    fn seek_needs_time_service() {
        let family = OpenHomeFamily::new();
        assert!(!family.capabilities(&device(&[PRODUCT, PL])).seek);
        let caps = family.capabilities(&device(&[PRODUCT, PL, VOL, TM]));
        assert!(caps.seek);
        assert!(caps.volume);
        assert!(caps.transport);
    }

    #[tokio::test]
    async fn preamp_less_device_has_no_volume() {
        let family = OpenHomeFamily::new();
        let volume = family
            .query_volume(&Client::new(), &device(&[PRODUCT, PL]))
            .await
            .unwrap();
        assert!(volume.is_none());
    }
}
