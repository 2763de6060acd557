//! Roon transport-service data and the events derived from it.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::moo::MooMessage;
use super::MooResult;
use crate::model::{VolumeControl, VolumeKind};

/// A Roon zone as delivered by `subscribe_zones`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoonZone {
    pub zone_id: String,
    pub display_name: String,
    /// `playing`, `paused`, `loading` or `stopped`.
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub outputs: Vec<RoonOutput>,
    #[serde(default)]
    pub now_playing: Option<RoonNowPlaying>,
    #[serde(default)]
    pub seek_position: Option<f64>,
    #[serde(default)]
    pub is_seek_allowed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoonOutput {
    pub output_id: String,
    pub display_name: String,
    #[serde(default)]
    pub volume: Option<RoonVolume>,
}

/// Output volume; `incremental` outputs have no value or range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoonVolume {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub step: Option<f64>,
    #[serde(default)]
    pub is_muted: bool,
}

impl RoonVolume {
    /// Descriptor for outputs that accept absolute volume.
    #[must_use]
    pub fn control(&self) -> Option<VolumeControl> {
        let kind = match self.kind.as_str() {
            "db" => VolumeKind::Db,
            "number" => VolumeKind::Number,
            _ => return None,
        };
        Some(VolumeControl {
            kind,
            min: self.min?,
            max: self.max?,
            step: self.step.unwrap_or(1.0),
            is_muted: self.is_muted,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoonNowPlaying {
    #[serde(default)]
    pub seek_position: Option<f64>,
    #[serde(default)]
    pub length: Option<f64>,
    #[serde(default)]
    pub image_key: Option<String>,
    #[serde(default)]
    pub three_line: Option<ThreeLine>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThreeLine {
    #[serde(default)]
    pub line1: Option<String>,
    #[serde(default)]
    pub line2: Option<String>,
    #[serde(default)]
    pub line3: Option<String>,
}

/// Seek-only update from `zones_seek_changed`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SeekUpdate {
    pub zone_id: String,
    #[serde(default)]
    pub seek_position: Option<f64>,
}

/// Registry `info` reply.
#[derive(Debug, Clone, Deserialize)]
pub struct CoreInfo {
    pub core_id: String,
    pub display_name: String,
    #[serde(default)]
    pub display_version: Option<String>,
}

/// Registry `register` reply.
#[derive(Debug, Clone, Deserialize)]
pub struct Registration {
    pub core_id: String,
    pub display_name: String,
    #[serde(default)]
    pub token: Option<String>,
}

/// Input of the client's connectivity state machine, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum CoreEvent {
    Paired {
        core_id: String,
        display_name: String,
    },
    Unpaired,
    /// Replaces the whole cache.
    ZonesSnapshot(Vec<RoonZone>),
    /// Upserts `changed`, deletes `removed`.
    ZonesChanged {
        changed: Vec<RoonZone>,
        removed: Vec<String>,
    },
    /// Patches seek positions only.
    SeekChanged(Vec<SeekUpdate>),
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct ZonesBody {
    zones: Option<Vec<RoonZone>>,
    zones_added: Vec<RoonZone>,
    zones_changed: Vec<RoonZone>,
    zones_removed: Vec<String>,
    zones_seek_changed: Vec<SeekUpdate>,
}

/// Translates one `subscribe_zones` response into state machine events.
///
/// # Errors
/// `Json` if the body does not have the expected shape.
pub fn zone_events(message: &MooMessage) -> MooResult<Vec<CoreEvent>> {
    if message.body.as_ref().map_or(true, Value::is_null) {
        return Ok(Vec::new());
    }
    let body: ZonesBody = message.json()?;

    let mut events = Vec::new();
    if message.name == "Subscribed" {
        events.push(CoreEvent::ZonesSnapshot(body.zones.unwrap_or_default()));
        return Ok(events);
    }

    let mut changed = body.zones_added;
    changed.extend(body.zones_changed);
    if !changed.is_empty() || !body.zones_removed.is_empty() {
        events.push(CoreEvent::ZonesChanged {
            changed,
            removed: body.zones_removed,
        });
    }
    if !body.zones_seek_changed.is_empty() {
        events.push(CoreEvent::SeekChanged(body.zones_seek_changed));
    }
    Ok(events)
}
