//! Unified zone model shared by every backend.
//!
//! Adapters project their client's native cache into these types at request
//! time. Nothing here is cached by the bus.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::adapters::AdapterKind;
use crate::error::{BridgeError, BridgeResult};

// ─────────────────────────────────────────────────────────────────────────────
// Zone Identity
// ─────────────────────────────────────────────────────────────────────────────

/// Globally unique zone identifier: `{backend}:{native_id}`.
///
/// The backend prefix is assigned by the adapter that owns the zone. Native ids
/// may themselves contain `:` (UPnP `uuid:...`), so parsing splits on the first
/// colon only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ZoneId {
    backend: String,
    native_id: String,
}

impl ZoneId {
    /// Builds a zone id from a backend prefix and a native id.
    #[must_use]
    pub fn new(backend: impl Into<String>, native_id: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            native_id: native_id.into(),
        }
    }

    /// Parses `{backend}:{native_id}`, splitting on the first `:`.
    ///
    /// # Errors
    /// Returns `InvalidRequest` when the separator is missing or either half
    /// is empty.
    pub fn parse(raw: &str) -> BridgeResult<Self> {
        match raw.split_once(':') {
            Some((backend, native)) if !backend.is_empty() && !native.is_empty() => {
                Ok(Self::new(backend, native))
            }
            _ => Err(BridgeError::InvalidRequest(format!(
                "zone id must look like backend:native_id, got {:?}",
                raw
            ))),
        }
    }

    /// The routing prefix (backend name).
    #[must_use]
    pub fn backend(&self) -> &str {
        &self.backend
    }

    /// The backend-native part of the id.
    #[must_use]
    pub fn native_id(&self) -> &str {
        &self.native_id
    }
}

impl fmt::Display for ZoneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.backend, self.native_id)
    }
}

impl TryFrom<String> for ZoneId {
    type Error = BridgeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ZoneId> for String {
    fn from(id: ZoneId) -> Self {
        id.to_string()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Zone
// ─────────────────────────────────────────────────────────────────────────────

/// Normalized playback state of a zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ZoneState {
    Playing,
    Paused,
    Stopped,
    Loading,
    Idle,
    #[default]
    Unknown,
}

impl ZoneState {
    #[must_use]
    pub fn is_playing(self) -> bool {
        matches!(self, Self::Playing)
    }
}

/// Scale a zone's volume is expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeKind {
    #[default]
    Number,
    Db,
}

/// Volume descriptor advertised by a zone.
///
/// `min`/`max` are the device's own legal range; every absolute volume sent to
/// the device is clamped against them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeControl {
    #[serde(rename = "type")]
    pub kind: VolumeKind,
    pub min: f64,
    pub max: f64,
    pub step: f64,
    pub is_muted: bool,
}

impl VolumeControl {
    /// Plain 0..=100 percentage control.
    #[must_use]
    pub fn percent(is_muted: bool) -> Self {
        Self {
            kind: VolumeKind::Number,
            min: 0.0,
            max: 100.0,
            step: 1.0,
            is_muted,
        }
    }
}

/// Feature flags a zone supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Capabilities {
    pub transport: bool,
    pub volume: bool,
    pub seek: bool,
    pub grouping: bool,
    pub dsp: bool,
}

/// A controllable playback endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    pub zone_id: ZoneId,
    pub display_name: String,
    pub state: ZoneState,
    /// Backend tag (same as the zone id prefix).
    pub source: String,
    pub volume_control: Option<VolumeControl>,
    pub capabilities: Capabilities,
    /// Backend-specific extras (device model, output id, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Now Playing
// ─────────────────────────────────────────────────────────────────────────────

/// Current volume reading with its range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeInfo {
    pub value: f64,
    pub min: f64,
    pub max: f64,
    pub step: f64,
    #[serde(rename = "type")]
    pub kind: VolumeKind,
    pub is_muted: bool,
}

impl VolumeInfo {
    /// Combines a descriptor with a current value.
    #[must_use]
    pub fn from_control(control: &VolumeControl, value: f64) -> Self {
        Self {
            value,
            min: control.min,
            max: control.max,
            step: control.step,
            kind: control.kind,
            is_muted: control.is_muted,
        }
    }
}

/// Now-playing snapshot for a single zone.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NowPlaying {
    pub zone_id: Option<ZoneId>,
    /// Title.
    pub line1: Option<String>,
    /// Artist.
    pub line2: Option<String>,
    /// Album.
    pub line3: Option<String>,
    pub is_playing: bool,
    pub volume: Option<VolumeInfo>,
    /// Seconds.
    pub seek_position: Option<f64>,
    /// Seconds.
    pub length: Option<f64>,
    /// Opaque artwork reference: a content id or a direct URL.
    pub image_key: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Control Vocabulary
// ─────────────────────────────────────────────────────────────────────────────

/// A command addressed to a zone.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControlAction {
    Play,
    Pause,
    PlayPause,
    Stop,
    Next,
    Previous,
    /// Absolute volume in the zone's native scale.
    VolumeAbsolute(f64),
    /// Signed volume delta in the zone's native scale.
    VolumeRelative(f64),
    /// Absolute position in seconds.
    Seek(f64),
}

impl ControlAction {
    /// Decodes the wire vocabulary (`play`, `vol_abs`, ...).
    ///
    /// # Errors
    /// Returns `InvalidRequest` for an unknown action or a missing/invalid value.
    pub fn parse(action: &str, value: Option<f64>) -> BridgeResult<Self> {
        let need_value = |name: &str| {
            value.ok_or_else(|| BridgeError::InvalidRequest(format!("{} requires a value", name)))
        };

        Ok(match action {
            "play" => Self::Play,
            "pause" => Self::Pause,
            "play_pause" | "playpause" => Self::PlayPause,
            "stop" => Self::Stop,
            "next" => Self::Next,
            "previous" | "prev" => Self::Previous,
            "vol_abs" => Self::VolumeAbsolute(need_value(action)?),
            "vol_rel" => {
                let delta = need_value(action)?;
                if !delta.is_finite() {
                    return Err(BridgeError::InvalidRequest(
                        "vol_rel delta must be finite".into(),
                    ));
                }
                Self::VolumeRelative(delta)
            }
            "seek" => {
                let seconds = need_value(action)?;
                if !seconds.is_finite() || seconds < 0.0 {
                    return Err(BridgeError::InvalidRequest(format!(
                        "seek position must be a non-negative number, got {}",
                        seconds
                    )));
                }
                Self::Seek(seconds)
            }
            other => {
                return Err(BridgeError::InvalidRequest(format!(
                    "unknown action: {}",
                    other
                )))
            }
        })
    }

    /// Wire name of the action.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Play => "play",
            Self::Pause => "pause",
            Self::PlayPause => "play_pause",
            Self::Stop => "stop",
            Self::Next => "next",
            Self::Previous => "previous",
            Self::VolumeAbsolute(_) => "vol_abs",
            Self::VolumeRelative(_) => "vol_rel",
            Self::Seek(_) => "seek",
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Backend Status
// ─────────────────────────────────────────────────────────────────────────────

/// Health summary for one backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackendStatus {
    pub backend: String,
    pub kind: AdapterKind,
    pub connected: bool,
    pub zone_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Backend-specific details (core name, device count, ...).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}
