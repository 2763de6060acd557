//! Generic UPnP MediaRenderer family (AVTransport + RenderingControl).

use async_trait::async_trait;
use reqwest::Client;

use super::didl::{parse_didl, TrackMetadata};
use super::discovery_client::{DeviceFamily, TransportCommand};
use super::registry::{TransportState, TransportStatus, VolumeStatus};
use super::soap::{required_field, SoapError, SoapRequestBuilder, SoapResult};
use super::types::{DeviceDescription, ServiceEndpoint};
use super::xml::extract_xml_text;
use crate::model::Capabilities;
use crate::protocol_constants::MEDIA_RENDERER_SEARCH_TARGET;
use crate::utils::{format_hms, parse_hms};

const AV_TRANSPORT: &str = "AVTransport";
const RENDERING_CONTROL: &str = "RenderingControl";

/// Plain UPnP AV renderers.
pub struct MediaRendererFamily {
    /// Leave devices that also speak OpenHome to the OpenHome family.
    defer_to_openhome: bool,
}

impl MediaRendererFamily {
    #[must_use]
    pub fn new(defer_to_openhome: bool) -> Self {
        Self { defer_to_openhome }
    }
}

fn service<'a>(device: &'a DeviceDescription, name: &str) -> SoapResult<&'a ServiceEndpoint> {
    device
        .service(name)
        .ok_or_else(|| SoapError::missing_service(name))
}

#[async_trait]
impl DeviceFamily for MediaRendererFamily {
    fn name(&self) -> &'static str {
        "UPnP"
    }

    fn search_target(&self) -> &'static str {
        MEDIA_RENDERER_SEARCH_TARGET
    }

    fn accepts(&self, device: &DeviceDescription) -> bool {
        if device.service(AV_TRANSPORT).is_none() {
            return false;
        }
        !(self.defer_to_openhome && device.has_service_domain("av-openhome-org"))
    }

    fn capabilities(&self, device: &DeviceDescription) -> Capabilities {
        let transport = device.service(AV_TRANSPORT).is_some();
        Capabilities {
            transport,
            volume: device.service(RENDERING_CONTROL).is_some(),
            seek: transport,
            grouping: false,
            dsp: false,
        }
    }

    async fn query_transport(
        &self,
        http: &Client,
        device: &DeviceDescription,
    ) -> SoapResult<TransportStatus> {
        let avt = service(device, AV_TRANSPORT)?;

        let info = SoapRequestBuilder::new(http, avt)
            .action("GetTransportInfo")
            .instance_id()
            .send()
            .await?;
        let state = TransportState::parse(&required_field(&info, "CurrentTransportState")?);

        // Position is best effort: some renderers fault when idle.
        let (position, duration) = match SoapRequestBuilder::new(http, avt)
            .action("GetPositionInfo")
            .instance_id()
            .send()
            .await
        {
            Ok(body) => (
                extract_xml_text(&body, "RelTime").and_then(|t| parse_hms(&t)),
                extract_xml_text(&body, "TrackDuration").and_then(|t| parse_hms(&t)),
            ),
            Err(e) => {
                log::trace!("[UPnP] GetPositionInfo failed for {}: {}", device.uuid, e);
                (None, None)
            }
        };

        Ok(TransportStatus {
            state,
            position,
            duration: duration.filter(|d| *d > 0.0),
        })
    }

    async fn query_volume(
        &self,
        http: &Client,
        device: &DeviceDescription,
    ) -> SoapResult<Option<VolumeStatus>> {
        let Some(rc) = device.service(RENDERING_CONTROL) else {
            return Ok(None);
        };

        let (volume, mute) = tokio::join!(
            SoapRequestBuilder::new(http, rc)
                .action("GetVolume")
                .instance_id()
                .arg("Channel", "Master")
                .send(),
            SoapRequestBuilder::new(http, rc)
                .action("GetMute")
                .instance_id()
                .arg("Channel", "Master")
                .send(),
        );

        let volume: f64 = required_field(&volume?, "CurrentVolume")?
            .trim()
            .parse()
            .map_err(|_| SoapError::Parse)?;
        let muted = mute
            .ok()
            .and_then(|body| extract_xml_text(&body, "CurrentMute"))
            .is_some_and(|m| m.trim() == "1" || m.trim().eq_ignore_ascii_case("true"));

        Ok(Some(VolumeStatus {
            volume,
            max: 100.0,
            muted,
        }))
    }

    async fn query_track(
        &self,
        http: &Client,
        device: &DeviceDescription,
    ) -> SoapResult<Option<TrackMetadata>> {
        let avt = service(device, AV_TRANSPORT)?;
        let body = SoapRequestBuilder::new(http, avt)
            .action("GetPositionInfo")
            .instance_id()
            .send()
            .await?;
        Ok(extract_xml_text(&body, "TrackMetaData").and_then(|didl| parse_didl(&didl)))
    }

    async fn transport(
        &self,
        http: &Client,
        device: &DeviceDescription,
        command: TransportCommand,
    ) -> SoapResult<()> {
        let avt = service(device, AV_TRANSPORT)?;
        let request = SoapRequestBuilder::new(http, avt).instance_id();
        let request = match command {
            TransportCommand::Play => request.action("Play").arg("Speed", "1"),
            TransportCommand::Pause => request.action("Pause"),
            TransportCommand::Stop => request.action("Stop"),
            TransportCommand::Next => request.action("Next"),
            TransportCommand::Previous => request.action("Previous"),
            TransportCommand::Seek(seconds) => request
                .action("Seek")
                .arg("Unit", "REL_TIME")
                .arg("Target", format_hms(seconds)),
        };
        request.send().await.map(|_| ())
    }

    async fn set_volume(
        &self,
        http: &Client,
        device: &DeviceDescription,
        volume: f64,
    ) -> SoapResult<()> {
        let rc = service(device, RENDERING_CONTROL)?;
        SoapRequestBuilder::new(http, rc)
            .action("SetVolume")
            .instance_id()
            .arg("Channel", "Master")
            .arg("DesiredVolume", format!("{}", volume.round() as i64))
            .send()
            .await
            .map(|_| ())
    }
}
