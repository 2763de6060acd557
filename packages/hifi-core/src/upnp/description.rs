//! Device description fetch and parsing.

use std::time::Duration;

use quick_xml::events::Event;
use quick_xml::reader::Reader;
use reqwest::Client;
use url::Url;

use super::types::{
    normalize_uuid, DeviceDescription, DiscoveryError, DiscoveryResult, ServiceEndpoint,
};

/// Fetches and parses the description document at `location`.
///
/// # Errors
/// `Description` for transport failures, `InvalidDescription` when the
/// document lacks a UDN or cannot be parsed.
pub async fn fetch_description(
    client: &Client,
    location: &str,
    timeout: Duration,
) -> DiscoveryResult<DeviceDescription> {
    let response = client
        .get(location)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| DiscoveryError::Description(format!("{}: {}", location, e)))?;

    let status = response.status();
    if !status.is_success() {
        return Err(DiscoveryError::Description(format!(
            "{}: HTTP {}",
            location,
            status.as_u16()
        )));
    }

    let body = response
        .text()
        .await
        .map_err(|e| DiscoveryError::Description(format!("{}: {}", location, e)))?;

    parse_description(&body, location)
}

/// Parses a description document.
///
/// Identity fields come from the first (root) device; services are collected
/// from the root and all embedded devices. Control URLs are resolved against
/// `URLBase` when present, otherwise against `location`.
pub fn parse_description(xml: &str, location: &str) -> DiscoveryResult<DeviceDescription> {
    let mut reader = Reader::from_str(xml);
    let mut buf = Vec::new();

    let mut udn: Option<String> = None;
    let mut friendly_name: Option<String> = None;
    let mut manufacturer: Option<String> = None;
    let mut model_name: Option<String> = None;
    let mut url_base: Option<String> = None;
    let mut raw_services: Vec<(String, String)> = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                let name = e.local_name();
                let slot = match name.as_ref() {
                    b"service" => {
                        raw_services.push((String::new(), String::new()));
                        None
                    }
                    b"UDN" => Some(Field::Udn),
                    b"friendlyName" => Some(Field::FriendlyName),
                    b"manufacturer" => Some(Field::Manufacturer),
                    b"modelName" => Some(Field::ModelName),
                    b"URLBase" => Some(Field::UrlBase),
                    b"serviceType" => Some(Field::ServiceType),
                    b"controlURL" => Some(Field::ControlUrl),
                    _ => None,
                };
                if let Some(field) = slot {
                    let text = reader
                        .read_text(e.name())
                        .map_err(|err| DiscoveryError::InvalidDescription(err.to_string()))?;
                    let text = html_escape::decode_html_entities(&text).trim().to_string();

                    match field {
                        Field::Udn => set_once(&mut udn, text),
                        Field::FriendlyName => set_once(&mut friendly_name, text),
                        Field::Manufacturer => set_once(&mut manufacturer, text),
                        Field::ModelName => set_once(&mut model_name, text),
                        Field::UrlBase => set_once(&mut url_base, text),
                        Field::ServiceType => {
                            if let Some(last) = raw_services.last_mut() {
                                last.0 = text;
                            }
                        }
                        Field::ControlUrl => {
                            if let Some(last) = raw_services.last_mut() {
                                last.1 = text;
                            }
                        }
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(DiscoveryError::InvalidDescription(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    let uuid = udn
        .map(|u| normalize_uuid(&u))
        .filter(|u| !u.is_empty())
        .ok_or_else(|| DiscoveryError::InvalidDescription(format!("{}: missing UDN", location)))?;

    let base_str = url_base.as_deref().unwrap_or(location);
    let base = Url::parse(base_str)
        .map_err(|e| DiscoveryError::InvalidDescription(format!("{}: {}", base_str, e)))?;

    let services = raw_services
        .into_iter()
        .filter(|(service_type, control)| !service_type.is_empty() && !control.is_empty())
        .filter_map(|(service_type, control)| match base.join(&control) {
            Ok(url) => Some(ServiceEndpoint {
                service_type,
                control_url: url.to_string(),
            }),
            Err(e) => {
                log::debug!(
                    "[UPnP] Skipping service {} with bad control URL {}: {}",
                    service_type,
                    control,
                    e
                );
                None
            }
        })
        .collect();

    Ok(DeviceDescription {
        friendly_name: friendly_name.unwrap_or_else(|| uuid.clone()),
        uuid,
        manufacturer,
        model_name,
        location: location.to_string(),
        services,
    })
}

enum Field {
    Udn,
    FriendlyName,
    Manufacturer,
    ModelName,
    UrlBase,
    ServiceType,
    ControlUrl,
}

fn set_once(slot: &mut Option<String>, value: String) {
    if slot.is_none() && !value.is_empty() {
        *slot = Some(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RENDERER: &str = r#"<?xml version="1.0"?>
<root xmlns="urn:schemas-upnp-org:device-1-0">
  <specVersion><major>1</major><minor>0</minor></specVersion>
  <device>
    <deviceType>urn:schemas-upnp-org:device:MediaRenderer:1</deviceType>
    <friendlyName>Living Room &amp; Kitchen</friendlyName>
    <manufacturer>Acme</manufacturer>
    <modelName>Streamer 2</modelName>
    <UDN>uuid:5f9ec1b3-ed59-4e9c-9ae5-0011d1a2b3c4</UDN>
    <serviceList>
      <service>
        <serviceType>urn:schemas-upnp-org:service:AVTransport:1</serviceType>
        <serviceId>urn:upnp-org:serviceId:AVTransport</serviceId>
        <controlURL>/upnp/control/avt</controlURL>
      </service>
      <service>
        <serviceType>urn:schemas-upnp-org:service:RenderingControl:1</serviceType>
        <controlURL>upnp/control/rc</controlURL>
      </service>
    </serviceList>
    <deviceList>
      <device>
        <friendlyName>Embedded</friendlyName>
        <UDN>uuid:embedded</UDN>
        <serviceList>
          <service>
            <serviceType>urn:av-openhome-org:service:Volume:2</serviceType>
            <controlURL>http://192.168.1.20:8080/oh/volume</controlURL>
          </service>
        </serviceList>
      </device>
    </deviceList>
  </device>
</root>"#;

    #[test]
    fn parses_root_identity_and_all_services() {
        let desc = parse_description(RENDERER, "http://192.168.1.20:49152/desc/root.xml").unwrap();
        assert_eq!(desc.uuid, "5f9ec1b3-ed59-4e9c-9ae5-0011d1a2b3c4");
        assert_eq!(desc.friendly_name, "Living Room & Kitchen");
        assert_eq!(desc.manufacturer.as_deref(), Some("Acme"));
        assert_eq!(desc.model_name.as_deref(), Some("Streamer 2"));
        assert_eq!(desc.services.len(), 3);

        let avt = desc.service("AVTransport").unwrap();
        assert_eq!(avt.control_url, "http://192.168.1.20:49152/upnp/control/avt");
        let rc = desc.service("RenderingControl").unwrap();
        assert_eq!(rc.control_url, "http://192.168.1.20:49152/desc/upnp/control/rc");
        let vol = desc.service("Volume").unwrap();
        assert_eq!(vol.control_url, "http://192.168.1.20:8080/oh/volume");
    }

    #[test]
    fn url_base_takes_precedence() {
        let xml = r#"<root><URLBase>http://10.0.0.9:1234/</URLBase><device>
            <UDN>uuid:x</UDN>
            <serviceList><service><serviceType>urn:schemas-upnp-org:service:AVTransport:1</serviceType><controlURL>ctl</controlURL></service></serviceList>
            </device></root>"#;
        let desc = parse_description(xml, "http://10.0.0.9:5555/desc.xml").unwrap();
        assert_eq!(desc.services[0].control_url, "http://10.0.0.9:1234/ctl");
        // No friendlyName falls back to the uuid.
        assert_eq!(desc.friendly_name, "x");
    }

    #[test]
    fn missing_udn_is_invalid() {
        let xml = "<root><device><friendlyName>Nameless</friendlyName></device></root>";
        let err = parse_description(xml, "http://10.0.0.9/desc.xml").unwrap_err();
        assert!(matches!(err, DiscoveryError::InvalidDescription(_)));
    }
}
