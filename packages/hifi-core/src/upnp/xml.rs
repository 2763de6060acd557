//! XML helpers shared by SOAP, device description and DIDL parsing.

use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;

/// Extracts text content from the first occurrence of an XML element.
///
/// Matches on the local name, so namespace prefixes are ignored. Entities in
/// the text are decoded, which also unwraps DIDL-Lite documents embedded in
/// SOAP responses.
///
/// # Example
/// ```ignore
/// let xml = r#"<u:CurrentVolume>42</u:CurrentVolume>"#;
/// assert_eq!(extract_xml_text(xml, "CurrentVolume"), Some("42".to_string()));
/// ```
pub fn extract_xml_text(xml: &str, element_name: &str) -> Option<String> {
    let mut reader = Reader::from_str(xml);
    let mut buf = Vec::new();
    let target_bytes = element_name.as_bytes();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) if e.local_name().as_ref() == target_bytes => {
                if let Ok(text) = reader.read_text(e.name()) {
                    let decoded = html_escape::decode_html_entities(&text);
                    return Some(decoded.to_string());
                }
            }
            Ok(Event::Empty(ref e)) if e.local_name().as_ref() == target_bytes => {
                return Some(String::new());
            }
            Ok(Event::Eof) => break,
            Err(_) => break,
            _ => {}
        }
        buf.clear();
    }
    None
}

/// Like [`extract_xml_text`] but treats empty text as absent.
pub fn extract_non_empty(xml: &str, element_name: &str) -> Option<String> {
    extract_xml_text(xml, element_name)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Finds an attribute on the first element with the given local name.
pub fn extract_xml_attr(xml: &str, element_name: &str, attr_name: &[u8]) -> Option<String> {
    let mut reader = Reader::from_str(xml);
    let mut buf = Vec::new();
    let target_bytes = element_name.as_bytes();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e))
                if e.local_name().as_ref() == target_bytes =>
            {
                return get_xml_attr(e, attr_name);
            }
            Ok(Event::Eof) | Err(_) => return None,
            _ => {}
        }
        buf.clear();
    }
}

/// Gets an attribute value from an XML element.
pub fn get_xml_attr(elem: &BytesStart, attr_name: &[u8]) -> Option<String> {
    elem.attributes()
        .flatten()
        .find(|a| a.key.as_ref() == attr_name)
        .map(|a| {
            let raw = String::from_utf8_lossy(&a.value);
            html_escape::decode_html_entities(&raw).to_string()
        })
}

/// Escapes the five XML special characters for embedding in element content.
pub fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_namespaced_text() {
        let xml = r#"<s:Body><u:GetVolumeResponse><CurrentVolume>42</CurrentVolume></u:GetVolumeResponse></s:Body>"#;
        assert_eq!(extract_xml_text(xml, "CurrentVolume"), Some("42".into()));
        assert_eq!(extract_xml_text(xml, "Missing"), None);
    }

    #[test]
    fn decodes_embedded_documents() {
        let xml = "<TrackMetaData>&lt;DIDL-Lite&gt;&lt;dc:title&gt;A &amp;amp; B&lt;/dc:title&gt;&lt;/DIDL-Lite&gt;</TrackMetaData>";
        let inner = extract_xml_text(xml, "TrackMetaData").unwrap();
        assert_eq!(inner, "<DIDL-Lite><dc:title>A &amp; B</dc:title></DIDL-Lite>");
        assert_eq!(extract_xml_text(&inner, "title"), Some("A & B".into()));
    }

    #[test]
    fn empty_elements_yield_empty_text() {
        assert_eq!(extract_xml_text("<a><b/></a>", "b"), Some(String::new()));
        assert_eq!(extract_non_empty("<a><b/></a>", "b"), None);
        assert_eq!(extract_non_empty("<a><b>  x </b></a>", "b"), Some("x".into()));
    }

    #[test]
    fn extracts_attributes() {
        let xml = r#"<DIDL-Lite><item><res duration="0:03:25.000" protocolInfo="http-get:*:audio/flac:*">u</res></item></DIDL-Lite>"#;
        assert_eq!(
            extract_xml_attr(xml, "res", b"duration"),
            Some("0:03:25.000".into())
        );
        assert_eq!(extract_xml_attr(xml, "res", b"size"), None);
    }

    #[test]
    fn escape_xml_covers_all_specials() {
        assert_eq!(escape_xml("Tom & Jerry"), "Tom &amp; Jerry");
        assert_eq!(escape_xml("<a href=\"x\">'"), "&lt;a href=&quot;x&quot;&gt;&apos;");
    }
}
