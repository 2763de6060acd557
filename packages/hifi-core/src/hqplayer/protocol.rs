//! Request builders and reply parsers for the HQPlayer XML protocol.

use std::collections::HashMap;

use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use serde::Serialize;

use super::{HqpError, HqpResult};

const XML_DECL: &str = r#"<?xml version="1.0" encoding="UTF-8"?>"#;

// ─────────────────────────────────────────────────────────────────────────────
// Requests
// ─────────────────────────────────────────────────────────────────────────────

/// One request element.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HqpCommand {
    GetInfo,
    State,
    /// Playback position and track metadata (not subscribed).
    Status,
    VolumeRange,
    Play,
    Pause,
    Stop,
    Next,
    Previous,
    /// Absolute volume in dB.
    Volume(f64),
    /// Absolute position in seconds.
    Seek(f64),
}

impl HqpCommand {
    /// Element name of the request, echoed by the reply.
    #[must_use]
    pub fn element(&self) -> &'static str {
        match self {
            Self::GetInfo => "GetInfo",
            Self::State => "State",
            Self::Status => "Status",
            Self::VolumeRange => "VolumeRange",
            Self::Play => "Play",
            Self::Pause => "Pause",
            Self::Stop => "Stop",
            Self::Next => "Next",
            Self::Previous => "Previous",
            Self::Volume(_) => "Volume",
            Self::Seek(_) => "Seek",
        }
    }

    /// Serialized request line, newline terminated.
    #[must_use]
    pub fn to_xml(&self) -> String {
        let body = match self {
            Self::Status => r#"<Status subscribe="0"/>"#.to_string(),
            Self::Volume(db) => format!(r#"<Volume value="{}"/>"#, db),
            Self::Seek(seconds) => {
                format!(r#"<Seek position="{}"/>"#, seconds.max(0.0).round() as u64)
            }
            other => format!("<{}/>", other.element()),
        };
        format!("{}{}\n", XML_DECL, body)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Replies
// ─────────────────────────────────────────────────────────────────────────────

/// An element with its attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct HqpElement {
    pub name: String,
    pub attrs: HashMap<String, String>,
}

impl HqpElement {
    fn from_start(e: &BytesStart) -> Self {
        let attrs = e
            .attributes()
            .flatten()
            .map(|a| {
                let key = String::from_utf8_lossy(a.key.as_ref()).into_owned();
                let raw = String::from_utf8_lossy(&a.value);
                (key, html_escape::decode_html_entities(&raw).into_owned())
            })
            .collect();
        Self {
            name: String::from_utf8_lossy(e.local_name().as_ref()).into_owned(),
            attrs,
        }
    }

    #[must_use]
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).map(String::as_str)
    }

    /// Non-empty attribute as an owned string.
    #[must_use]
    pub fn text(&self, key: &str) -> Option<String> {
        self.attr(key)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }

    #[must_use]
    pub fn number(&self, key: &str) -> Option<f64> {
        self.attr(key)
            .and_then(|v| v.trim().parse::<f64>().ok())
            .filter(|n| n.is_finite())
    }
}

/// A parsed reply line: the root element plus any nested elements.
#[derive(Debug, Clone, PartialEq)]
pub struct HqpReply {
    pub root: HqpElement,
    pub children: Vec<HqpElement>,
}

impl HqpReply {
    /// Parses one reply line.
    ///
    /// # Errors
    /// `Parse` for malformed XML or a reply without any element.
    pub fn parse(xml: &str) -> HqpResult<Self> {
        let mut reader = Reader::from_str(xml);
        let mut buf = Vec::new();
        let mut reply: Option<HqpReply> = None;

        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => {
                    let element = HqpElement::from_start(e);
                    match reply.as_mut() {
                        Some(r) => r.children.push(element),
                        None => {
                            reply = Some(HqpReply {
                                root: element,
                                children: Vec::new(),
                            })
                        }
                    }
                }
                Ok(Event::Eof) => break,
                Err(e) => return Err(HqpError::Parse(e.to_string())),
                _ => {}
            }
            buf.clear();
        }

        reply.ok_or_else(|| HqpError::Parse("reply contains no element".to_string()))
    }

    /// First nested element with the given name.
    #[must_use]
    pub fn child(&self, name: &str) -> Option<&HqpElement> {
        self.children.iter().find(|c| c.name == name)
    }

    /// Fails with `Rejected` when the reply carries a non-OK `result`.
    ///
    /// # Errors
    /// `Rejected` with the element name and result text.
    pub fn check(&self) -> HqpResult<()> {
        match self.root.attr("result") {
            Some(result) if !result.eq_ignore_ascii_case("ok") => Err(HqpError::Rejected(
                format!("{}: {}", self.root.name, result),
            )),
            _ => Ok(()),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Typed Views
// ─────────────────────────────────────────────────────────────────────────────

/// Pipeline transport state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HqpPlayback {
    Stopped,
    Paused,
    Playing,
    #[default]
    Unknown,
}

impl HqpPlayback {
    /// Maps the numeric `state` attribute (0 stopped, 1 paused, 2 playing).
    #[must_use]
    pub fn from_code(code: Option<f64>) -> Self {
        match code.map(|c| c as i64) {
            Some(0) => Self::Stopped,
            Some(1) => Self::Paused,
            Some(2) => Self::Playing,
            _ => Self::Unknown,
        }
    }
}

/// `<GetInfo>` reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HqpInfo {
    pub name: Option<String>,
    pub product: Option<String>,
    pub version: Option<String>,
    pub platform: Option<String>,
}

impl HqpInfo {
    #[must_use]
    pub fn from_reply(reply: &HqpReply) -> Self {
        let root = &reply.root;
        Self {
            name: root.text("name"),
            product: root.text("product"),
            version: root.text("version"),
            platform: root.text("platform"),
        }
    }
}

/// `<State>` reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HqpState {
    pub playback: HqpPlayback,
    /// Current volume in dB.
    pub volume: Option<f64>,
    /// Index of the active filter.
    pub filter: Option<String>,
    /// Index of the active shaper/modulator.
    pub shaper: Option<String>,
}

impl HqpState {
    #[must_use]
    pub fn from_reply(reply: &HqpReply) -> Self {
        let root = &reply.root;
        Self {
            playback: HqpPlayback::from_code(root.number("state")),
            volume: root.number("volume"),
            filter: root.text("filter"),
            shaper: root.text("shaper"),
        }
    }
}

/// `<VolumeRange>` reply.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HqpVolumeRange {
    pub min: f64,
    pub max: f64,
    /// False when volume control is disabled in HQPlayer.
    pub enabled: bool,
}

impl HqpVolumeRange {
    /// # Errors
    /// `Parse` when `min`/`max` are missing or inverted.
    pub fn from_reply(reply: &HqpReply) -> HqpResult<Self> {
        let root = &reply.root;
        match (root.number("min"), root.number("max")) {
            (Some(min), Some(max)) if min <= max => Ok(Self {
                min,
                max,
                enabled: root.attr("enabled").map_or(true, |v| v != "0"),
            }),
            _ => Err(HqpError::Parse(format!(
                "unusable volume range {:?}..{:?}",
                root.attr("min"),
                root.attr("max")
            ))),
        }
    }
}

/// `<Status>` reply: position plus the current track's metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HqpStatus {
    pub position: Option<f64>,
    pub length: Option<f64>,
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
}

impl HqpStatus {
    #[must_use]
    pub fn from_reply(reply: &HqpReply) -> Self {
        let root = &reply.root;
        let meta = reply.child("metadata");
        Self {
            position: root.number("position"),
            length: root.number("length").filter(|l| *l > 0.0),
            title: meta.and_then(|m| m.text("title")),
            artist: meta.and_then(|m| m.text("artist")),
            album: meta.and_then(|m| m.text("album")),
        }
    }
}
