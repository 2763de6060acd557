//! Registry of discovered devices and their last polled state.
//!
//! Tracks when each device was last seen by discovery and last polled, so
//! the discovery client can evict stale devices and rate-limit polls.

use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;

use super::didl::TrackMetadata;
use super::types::DeviceDescription;
use crate::protocol_constants::DEVICE_ERROR_LOG_INTERVAL;
use crate::utils::LogThrottle;

/// Transport state as reported by AVTransport or OpenHome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportState {
    Playing,
    Paused,
    Stopped,
    Transitioning,
    NoMedia,
    Unknown,
}

impl TransportState {
    /// Parses AVTransport (`PAUSED_PLAYBACK`) and OpenHome (`Paused`) values.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "PLAYING" => Self::Playing,
            "PAUSED_PLAYBACK" | "PAUSED_RECORDING" | "PAUSED" => Self::Paused,
            "STOPPED" => Self::Stopped,
            "TRANSITIONING" | "BUFFERING" | "WAITING" => Self::Transitioning,
            "NO_MEDIA_PRESENT" => Self::NoMedia,
            _ => Self::Unknown,
        }
    }
}

/// Result of a transport sub-query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransportStatus {
    pub state: TransportState,
    /// Seconds into the current track.
    pub position: Option<f64>,
    /// Seconds.
    pub duration: Option<f64>,
}

/// Result of a volume sub-query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VolumeStatus {
    pub volume: f64,
    /// Device maximum; the minimum is always 0.
    pub max: f64,
    pub muted: bool,
}

/// Last known state of a device; each part is refreshed independently.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeviceState {
    pub transport: Option<TransportStatus>,
    pub volume: Option<VolumeStatus>,
    pub track: Option<TrackMetadata>,
}

impl DeviceState {
    #[must_use]
    pub fn transport_state(&self) -> TransportState {
        self.transport
            .as_ref()
            .map_or(TransportState::Unknown, |t| t.state)
    }

    #[must_use]
    pub fn is_playing(&self) -> bool {
        self.transport_state() == TransportState::Playing
    }
}

/// A device as exposed to adapters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceSnapshot {
    pub description: DeviceDescription,
    pub state: DeviceState,
}

struct DeviceRecord {
    description: DeviceDescription,
    state: DeviceState,
    last_seen: Instant,
    last_poll: Option<Instant>,
    last_track_poll: Option<Instant>,
}

/// A device selected for polling in this tick.
#[derive(Debug, Clone)]
pub struct PollPlan {
    pub description: DeviceDescription,
    /// Whether track metadata is also due.
    pub track_due: bool,
}

/// Concurrent device registry keyed by uuid.
pub struct DeviceRegistry {
    devices: DashMap<String, DeviceRecord>,
    error_log: LogThrottle,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            devices: DashMap::new(),
            error_log: LogThrottle::new(DEVICE_ERROR_LOG_INTERVAL),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    #[must_use]
    pub fn contains(&self, uuid: &str) -> bool {
        self.devices.contains_key(uuid)
    }

    /// Inserts a newly described device, or refreshes an existing one.
    ///
    /// Returns true if the device was not known before.
    pub fn insert(&self, description: DeviceDescription) -> bool {
        let now = Instant::now();
        match self.devices.get_mut(&description.uuid) {
            Some(mut record) => {
                record.description = description;
                record.last_seen = now;
                false
            }
            None => {
                self.devices.insert(
                    description.uuid.clone(),
                    DeviceRecord {
                        description,
                        state: DeviceState::default(),
                        last_seen: now,
                        last_poll: None,
                        last_track_poll: None,
                    },
                );
                true
            }
        }
    }

    /// Marks a known device as seen. Returns false if it is unknown.
    pub fn touch(&self, uuid: &str) -> bool {
        match self.devices.get_mut(uuid) {
            Some(mut record) => {
                record.last_seen = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Removes devices not seen within `max_age`, returning their uuids.
    pub fn evict_stale(&self, max_age: Duration) -> Vec<String> {
        let now = Instant::now();
        let stale: Vec<String> = self
            .devices
            .iter()
            .filter(|r| now.saturating_duration_since(r.last_seen) > max_age)
            .map(|r| r.key().clone())
            .collect();
        for uuid in &stale {
            self.devices.remove(uuid);
            self.error_log.reset(uuid);
        }
        stale
    }

    /// Selects devices whose last poll is at least `min_interval` old and
    /// stamps them as polled now.
    ///
    /// Track metadata is flagged separately using `track_interval`.
    pub fn due_for_poll(&self, min_interval: Duration, track_interval: Duration) -> Vec<PollPlan> {
        let now = Instant::now();
        let due = |last: Option<Instant>, interval: Duration| {
            last.map_or(true, |t| now.saturating_duration_since(t) >= interval)
        };

        let mut plans = Vec::new();
        for mut record in self.devices.iter_mut() {
            if !due(record.last_poll, min_interval) {
                continue;
            }
            record.last_poll = Some(now);
            let track_due = due(record.last_track_poll, track_interval);
            if track_due {
                record.last_track_poll = Some(now);
            }
            plans.push(PollPlan {
                description: record.description.clone(),
                track_due,
            });
        }
        plans
    }

    /// Makes a device due on the next poll tick.
    pub fn request_poll(&self, uuid: &str) {
        if let Some(mut record) = self.devices.get_mut(uuid) {
            record.last_poll = None;
        }
    }

    /// Applies `update` to a device's state.
    ///
    /// Returns `Some(true)` if the transport state changed, `None` if the
    /// device is gone (evicted while the poll was in flight).
    pub fn update_state<F>(&self, uuid: &str, update: F) -> Option<bool>
    where
        F: FnOnce(&mut DeviceState),
    {
        let mut record = self.devices.get_mut(uuid)?;
        let before = record.state.transport_state();
        update(&mut record.state);
        Some(record.state.transport_state() != before)
    }

    #[must_use]
    pub fn snapshot(&self, uuid: &str) -> Option<DeviceSnapshot> {
        self.devices.get(uuid).map(|r| DeviceSnapshot {
            description: r.description.clone(),
            state: r.state.clone(),
        })
    }

    /// All devices, sorted by display name then uuid.
    #[must_use]
    pub fn snapshots(&self) -> Vec<DeviceSnapshot> {
        let mut all: Vec<DeviceSnapshot> = self
            .devices
            .iter()
            .map(|r| DeviceSnapshot {
                description: r.description.clone(),
                state: r.state.clone(),
            })
            .collect();
        all.sort_by(|a, b| {
            a.description
                .friendly_name
                .cmp(&b.description.friendly_name)
                .then_with(|| a.description.uuid.cmp(&b.description.uuid))
        });
        all
    }

    /// Rate-limits poll failure logs per device.
    #[must_use]
    pub fn should_log_error(&self, uuid: &str) -> bool {
        self.error_log.should_log(uuid)
    }

    /// Clears the error throttle after a fully successful poll.
    pub fn clear_error(&self, uuid: &str) {
        self.error_log.reset(uuid);
    }

    pub fn clear(&self) {
        self.devices.clear();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::upnp::types::ServiceEndpoint;

    pub(crate) fn device(uuid: &str, name: &str) -> DeviceDescription {
        DeviceDescription {
            uuid: uuid.to_string(),
            friendly_name: name.to_string(),
            manufacturer: Some("Acme".into()),
            model_name: None,
            location: format!("http://10.0.0.2/{}.xml", uuid),
            services: vec![ServiceEndpoint {
                service_type: "urn:schemas-upnp-org:service:AVTransport:1".into(),
                control_url: "http://10.0.0.2/avt".into(),
            }],
        }
    }

    #[test]
    fn transport_state_parses_both_vocabularies() {
        assert_eq!(TransportState::parse("PLAYING"), TransportState::Playing);
        assert_eq!(TransportState::parse("PAUSED_PLAYBACK"), TransportState::Paused);
        assert_eq!(TransportState::parse("Paused"), TransportState::Paused);
        assert_eq!(TransportState::parse("Buffering"), TransportState::Transitioning);
        assert_eq!(TransportState::parse("NO_MEDIA_PRESENT"), TransportState::NoMedia);
        assert_eq!(TransportState::parse("weird"), TransportState::Unknown);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_devices_are_evicted_and_touched_ones_kept() {
        let registry = DeviceRegistry::new();
        assert!(registry.insert(device("a", "A")));
        assert!(registry.insert(device("b", "B")));
        assert!(!registry.insert(device("a", "A renamed")));

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(registry.touch("a"));
        assert!(!registry.touch("zzz"));

        tokio::time::advance(Duration::from_secs(31)).await;
        let evicted = registry.evict_stale(Duration::from_secs(90));
        assert_eq!(evicted, vec!["b".to_string()]);
        assert!(registry.contains("a"));
        assert_eq!(
            registry.snapshot("a").unwrap().description.friendly_name,
            "A renamed"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn polls_are_rate_limited_per_device() {
        let registry = DeviceRegistry::new();
        registry.insert(device("a", "A"));

        let first = registry.due_for_poll(Duration::from_secs(2), Duration::from_secs(5));
        assert_eq!(first.len(), 1);
        assert!(first[0].track_due);

        assert!(registry
            .due_for_poll(Duration::from_secs(2), Duration::from_secs(5))
            .is_empty());

        tokio::time::advance(Duration::from_secs(2)).await;
        let second = registry.due_for_poll(Duration::from_secs(2), Duration::from_secs(5));
        assert_eq!(second.len(), 1);
        assert!(!second[0].track_due);

        tokio::time::advance(Duration::from_secs(3)).await;
        let third = registry.due_for_poll(Duration::from_secs(2), Duration::from_secs(5));
        assert!(third[0].track_due);
    }

    #[test]
    fn update_reports_transport_transitions() {
        let registry = DeviceRegistry::new();
        registry.insert(device("a", "A"));

        let playing = TransportStatus {
            state: TransportState::Playing,
            position: Some(1.0),
            duration: None,
        };
        assert_eq!(
            registry.update_state("a", |s| s.transport = Some(playing.clone())),
            Some(true)
        );
        assert_eq!(
            registry.update_state("a", |s| s.transport = Some(playing.clone())),
            Some(false)
        );
        assert_eq!(registry.update_state("gone", |_| {}), None);
        assert!(registry.snapshot("a").unwrap().state.is_playing());
    }

    #[test]
    fn snapshots_are_sorted_by_name() {
        let registry = DeviceRegistry::new();
        registry.insert(device("2", "Study"));
        registry.insert(device("1", "Kitchen"));
        let names: Vec<_> = registry
            .snapshots()
            .into_iter()
            .map(|s| s.description.friendly_name)
            .collect();
        assert_eq!(names, vec!["Kitchen", "Study"]);
    }
}
