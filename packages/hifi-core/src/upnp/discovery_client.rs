//! Generic discover-then-poll engine for UPnP device families.
//!
//! A [`DeviceFamily`] knows one family's search target and SOAP vocabulary;
//! [`DiscoveryClient`] owns everything else: the periodic M-SEARCH, device
//! description fetches, stale-device eviction, rate-limited polling with
//! independent sub-queries, and relative volume batching.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use reqwest::Client;
use tokio::time::MissedTickBehavior;

use super::description::fetch_description;
use super::didl::TrackMetadata;
use super::registry::{DeviceRegistry, DeviceSnapshot, PollPlan, TransportStatus, VolumeStatus};
use super::retry::with_retry;
use super::soap::SoapResult;
use super::ssdp::{self, SsdpConfig};
use super::types::{DeviceDescription, SsdpResponse};
use crate::config::DiscoveryConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::events::ZoneEvents;
use crate::model::Capabilities;
use crate::protocol_constants::DEVICE_STALE_INTERVALS;
use crate::runtime::BackgroundTasks;
use crate::volume::{clamp, RelativeVolumeBatcher, VolumeSink};

/// Transport commands every family understands.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TransportCommand {
    Play,
    Pause,
    Stop,
    Next,
    Previous,
    /// Absolute position in seconds.
    Seek(f64),
}

impl TransportCommand {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Play => "play",
            Self::Pause => "pause",
            Self::Stop => "stop",
            Self::Next => "next",
            Self::Previous => "previous",
            Self::Seek(_) => "seek",
        }
    }
}

/// One UPnP device family's protocol vocabulary.
#[async_trait]
pub trait DeviceFamily: Send + Sync + 'static {
    /// Log component, e.g. "UPnP".
    fn name(&self) -> &'static str;

    /// SSDP search target for this family.
    fn search_target(&self) -> &'static str;

    /// Whether a described device belongs to this family.
    fn accepts(&self, device: &DeviceDescription) -> bool;

    /// What the device can do, derived from its service list.
    fn capabilities(&self, device: &DeviceDescription) -> Capabilities;

    async fn query_transport(
        &self,
        http: &Client,
        device: &DeviceDescription,
    ) -> SoapResult<TransportStatus>;

    /// `None` when the device has no volume service.
    async fn query_volume(
        &self,
        http: &Client,
        device: &DeviceDescription,
    ) -> SoapResult<Option<VolumeStatus>>;

    /// `None` when nothing is loaded.
    async fn query_track(
        &self,
        http: &Client,
        device: &DeviceDescription,
    ) -> SoapResult<Option<TrackMetadata>>;

    async fn transport(
        &self,
        http: &Client,
        device: &DeviceDescription,
        command: TransportCommand,
    ) -> SoapResult<()>;

    /// Sends an already-clamped absolute volume.
    async fn set_volume(&self, http: &Client, device: &DeviceDescription, volume: f64)
        -> SoapResult<()>;
}

/// Discovery-and-poll client for one device family.
pub struct DiscoveryClient<F: DeviceFamily> {
    inner: Arc<ClientInner<F>>,
    tasks: BackgroundTasks,
    batcher: Mutex<Option<RelativeVolumeBatcher>>,
}

struct ClientInner<F: DeviceFamily> {
    family: F,
    http: Client,
    config: DiscoveryConfig,
    registry: DeviceRegistry,
    events: ZoneEvents,
    /// Devices whose description was fetched but that belong to another family.
    ignored: Mutex<HashSet<String>>,
    last_error: Mutex<Option<String>>,
}

impl<F: DeviceFamily> DiscoveryClient<F> {
    /// Creates a stopped client.
    ///
    /// # Arguments
    /// * `family` - Protocol vocabulary
    /// * `http` - Shared HTTP client
    /// * `config` - Discovery and poll timing
    /// * `events` - Publisher for zone changes
    pub fn new(family: F, http: Client, config: DiscoveryConfig, events: ZoneEvents) -> Self {
        let name = family.name();
        Self {
            inner: Arc::new(ClientInner {
                family,
                http,
                config,
                registry: DeviceRegistry::new(),
                events,
                ignored: Mutex::new(HashSet::new()),
                last_error: Mutex::new(None),
            }),
            tasks: BackgroundTasks::new(name),
            batcher: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn family(&self) -> &F {
        &self.inner.family
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.tasks.is_running()
    }

    /// Starts the discovery and poll loops. Does nothing if already running.
    pub fn start(&self) {
        if self.tasks.is_running() {
            return;
        }
        let name = self.inner.family.name();
        log::info!(
            "[{}] Starting discovery for {} (every {}s)",
            name,
            self.inner.family.search_target(),
            self.inner.config.discovery_interval_secs
        );

        *self.batcher.lock() = Some(RelativeVolumeBatcher::new(
            name,
            Arc::clone(&self.inner) as Arc<dyn VolumeSink>,
            self.tasks.token(),
        ));

        let inner = Arc::clone(&self.inner);
        self.tasks.spawn(move |cancel| async move {
            let mut interval = tokio::time::interval(inner.config.discovery_interval());
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = inner.discovery_round() => {}
                        }
                    }
                }
            }
            log::debug!("[{}] Discovery loop stopped", inner.family.name());
        });

        let inner = Arc::clone(&self.inner);
        self.tasks.spawn(move |cancel| async move {
            let mut interval = tokio::time::interval(inner.config.poll_tick());
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = inner.poll_round() => {}
                        }
                    }
                }
            }
            log::debug!("[{}] Poll loop stopped", inner.family.name());
        });

        self.inner.events.connection_changed(true);
    }

    /// Stops every loop and pending volume flush, then forgets all devices.
    pub async fn stop(&self) {
        if let Some(batcher) = self.batcher.lock().take() {
            batcher.stop();
        }
        self.tasks.shutdown().await;

        let had_devices = !self.inner.registry.is_empty();
        self.inner.registry.clear();
        self.inner.ignored.lock().clear();
        if had_devices {
            self.inner.events.zones_changed();
        }
        self.inner.events.connection_changed(false);
        log::info!("[{}] Stopped", self.inner.family.name());
    }

    #[must_use]
    pub fn devices(&self) -> Vec<DeviceSnapshot> {
        self.inner.registry.snapshots()
    }

    #[must_use]
    pub fn device(&self, uuid: &str) -> Option<DeviceSnapshot> {
        self.inner.registry.snapshot(uuid)
    }

    #[must_use]
    pub fn device_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Most recent discovery or poll failure, cleared by a clean round.
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.inner.last_error.lock().clone()
    }

    /// Inserts a device with a known state, bypassing discovery.
    #[cfg(test)]
    pub(crate) fn seed(&self, description: DeviceDescription, state: super::registry::DeviceState) {
        let uuid = description.uuid.clone();
        self.inner.registry.insert(description);
        self.inner.registry.update_state(&uuid, |s| *s = state);
    }

    #[must_use]
    pub fn capabilities(&self, device: &DeviceDescription) -> Capabilities {
        self.inner.family.capabilities(device)
    }

    /// Sends a transport command, retrying transient faults.
    ///
    /// The device is re-polled on the next tick so the change shows quickly.
    ///
    /// # Errors
    /// Whatever the device's SOAP endpoint returns.
    pub async fn send_transport(
        &self,
        device: &DeviceDescription,
        command: TransportCommand,
    ) -> SoapResult<()> {
        let inner = &self.inner;
        with_retry(command.as_str(), || {
            inner.family.transport(&inner.http, device, command)
        })
        .await?;
        inner.registry.request_poll(&device.uuid);
        Ok(())
    }

    /// Sets an absolute volume, clamped to the device's range.
    ///
    /// Returns the value actually sent.
    ///
    /// # Errors
    /// Whatever the device's SOAP endpoint returns.
    pub async fn set_volume(&self, device: &DeviceDescription, value: f64) -> SoapResult<f64> {
        self.inner.set_volume_clamped(device, value).await
    }

    /// Queues a relative volume change.
    ///
    /// Returns false if the client is not running.
    pub fn adjust_volume(&self, uuid: &str, delta: f64) -> bool {
        match self.batcher.lock().as_ref() {
            Some(batcher) => {
                batcher.request(uuid, delta);
                true
            }
            None => false,
        }
    }
}

impl<F: DeviceFamily> ClientInner<F> {
    fn stale_after(&self) -> Duration {
        self.config.discovery_interval() * DEVICE_STALE_INTERVALS
    }

    /// One M-SEARCH round: refresh known devices, describe new ones, evict
    /// the stale.
    async fn discovery_round(&self) {
        let ssdp_config = SsdpConfig {
            send_count: self.config.ssdp_send_count.max(1),
            listen_timeout: Duration::from_millis(self.config.ssdp_listen_ms),
            ..SsdpConfig::default()
        };

        match ssdp::search(&ssdp_config, self.family.search_target()).await {
            Ok(replies) => {
                let unknown: Vec<SsdpResponse> = {
                    let ignored = self.ignored.lock();
                    replies
                        .into_iter()
                        .filter(|r| !ignored.contains(&r.uuid))
                        .filter(|r| !self.registry.touch(&r.uuid))
                        .collect()
                };

                let described = join_all(unknown.iter().map(|r| self.describe(r))).await;
                let added = described
                    .into_iter()
                    .flatten()
                    .filter(|d| {
                        log::info!(
                            "[{}] Found {} ({}) at {}",
                            self.family.name(),
                            d.friendly_name,
                            d.uuid,
                            d.location
                        );
                        self.registry.insert(d.clone())
                    })
                    .count();
                if added > 0 {
                    self.events.zones_changed();
                }
                *self.last_error.lock() = None;
            }
            Err(e) => {
                log::warn!("[{}] Discovery round failed: {}", self.family.name(), e);
                *self.last_error.lock() = Some(e.to_string());
            }
        }

        self.evict_stale_devices();
    }

    async fn describe(&self, reply: &SsdpResponse) -> Option<DeviceDescription> {
        match fetch_description(&self.http, &reply.location, self.config.query_timeout()).await {
            Ok(description) if self.family.accepts(&description) => Some(description),
            Ok(description) => {
                log::debug!(
                    "[{}] Ignoring {} ({}): handled by another family",
                    self.family.name(),
                    description.friendly_name,
                    reply.uuid
                );
                self.ignored.lock().insert(reply.uuid.clone());
                None
            }
            Err(e) => {
                if self.registry.should_log_error(&reply.uuid) {
                    log::warn!("[{}] {}", self.family.name(), e);
                }
                None
            }
        }
    }

    /// Drops devices silent for too long; emits one change for the batch.
    fn evict_stale_devices(&self) -> usize {
        let removed = self.registry.evict_stale(self.stale_after());
        if !removed.is_empty() {
            log::info!(
                "[{}] Removed {} stale device(s): {:?}",
                self.family.name(),
                removed.len(),
                removed
            );
            self.events.zones_changed();
        }
        removed.len()
    }

    /// Polls every device that is due, concurrently.
    async fn poll_round(&self) {
        let plans = self
            .registry
            .due_for_poll(self.config.poll_min_interval(), self.config.track_poll_min_interval());
        if plans.is_empty() {
            return;
        }

        let changed = join_all(plans.into_iter().map(|plan| self.poll_device(plan))).await;
        if changed.into_iter().any(|c| c) {
            self.events.zones_changed();
        }
    }

    /// Runs the sub-queries for one device in sequence; each is bounded and
    /// failures are independent. Returns true if the transport state changed.
    async fn poll_device(&self, plan: PollPlan) -> bool {
        let device = &plan.description;
        let limit = self.config.query_timeout();

        let transport = bounded(limit, self.family.query_transport(&self.http, device)).await;
        let volume = bounded(limit, self.family.query_volume(&self.http, device)).await;
        let track = if plan.track_due {
            Some(bounded(limit, self.family.query_track(&self.http, device)).await)
        } else {
            None
        };

        let mut errors = Vec::new();
        let changed = self.registry.update_state(&device.uuid, |state| {
            match transport {
                Ok(t) => state.transport = Some(t),
                Err(e) => errors.push(format!("transport: {}", e)),
            }
            match volume {
                Ok(v) => state.volume = v,
                Err(e) => errors.push(format!("volume: {}", e)),
            }
            match track {
                Some(Ok(t)) => state.track = t,
                Some(Err(e)) => errors.push(format!("track: {}", e)),
                None => {}
            }
        });

        if errors.is_empty() {
            self.registry.clear_error(&device.uuid);
        } else {
            let message = format!("{}: {}", device.friendly_name, errors.join("; "));
            if self.registry.should_log_error(&device.uuid) {
                log::warn!("[{}] Poll failed for {}", self.family.name(), message);
            } else {
                log::trace!("[{}] Poll failed for {}", self.family.name(), message);
            }
            *self.last_error.lock() = Some(message);
        }

        changed.unwrap_or(false)
    }

    async fn set_volume_clamped(&self, device: &DeviceDescription, value: f64) -> SoapResult<f64> {
        let max = self
            .registry
            .snapshot(&device.uuid)
            .and_then(|s| s.state.volume.map(|v| v.max))
            .unwrap_or(100.0);
        let target = clamp(value, 0.0, max).round();

        self.family.set_volume(&self.http, device, target).await?;
        self.registry.update_state(&device.uuid, |state| {
            if let Some(volume) = state.volume.as_mut() {
                volume.volume = target;
            }
        });
        Ok(target)
    }
}

#[async_trait]
impl<F: DeviceFamily> VolumeSink for ClientInner<F> {
    async fn apply_step(&self, output_id: &str, step: f64) -> BridgeResult<()> {
        let snapshot = self
            .registry
            .snapshot(output_id)
            .ok_or_else(|| BridgeError::ZoneNotFound(output_id.to_string()))?;
        let current = snapshot.state.volume.as_ref().ok_or_else(|| {
            BridgeError::BackendUnavailable(format!("volume of {} not known yet", output_id))
        })?;

        let target = current.volume + step;
        self.set_volume_clamped(&snapshot.description, target).await?;
        Ok(())
    }
}

/// Applies a deadline to one poll sub-query.
async fn bounded<T>(
    limit: Duration,
    query: impl Future<Output = SoapResult<T>>,
) -> Result<T, String> {
    match tokio::time::timeout(limit, query).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err(format!("timed out after {}ms", limit.as_millis())),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::events::CountingEventEmitter;
    use crate::upnp::registry::tests::device;
    use crate::upnp::registry::TransportState;
    use crate::upnp::soap::SoapError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    pub(crate) struct FakeFamily {
        pub(crate) transport_calls: AtomicUsize,
        pub(crate) track_calls: AtomicUsize,
        pub(crate) fail_volume: bool,
        pub(crate) hang_track: bool,
        pub(crate) playing: std::sync::atomic::AtomicBool,
        pub(crate) sent_volumes: Mutex<Vec<f64>>,
        pub(crate) commands: Mutex<Vec<TransportCommand>>,
        pub(crate) queries: Mutex<Vec<&'static str>>,
        pub(crate) in_flight: AtomicUsize,
        pub(crate) max_in_flight: AtomicUsize,
    }

    impl FakeFamily {
        /// Records the query and holds it open briefly so overlap shows up.
        async fn enter(&self, query: &'static str) {
            self.queries.lock().push(query);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl DeviceFamily for FakeFamily {
        fn name(&self) -> &'static str {
            "Fake"
        }

        fn search_target(&self) -> &'static str {
            "urn:test:device:Fake:1"
        }

        fn accepts(&self, _device: &DeviceDescription) -> bool {
            true
        }

        fn capabilities(&self, _device: &DeviceDescription) -> Capabilities {
            Capabilities {
                transport: true,
                volume: true,
                ..Capabilities::default()
            }
        }

        async fn query_transport(
            &self,
            _http: &Client,
            _device: &DeviceDescription,
        ) -> SoapResult<TransportStatus> {
            self.transport_calls.fetch_add(1, Ordering::SeqCst);
            self.enter("transport").await;
            let state = if self.playing.load(Ordering::SeqCst) {
                TransportState::Playing
            } else {
                TransportState::Stopped
            };
            Ok(TransportStatus {
                state,
                position: Some(12.0),
                duration: Some(200.0),
            })
        }

        async fn query_volume(
            &self,
            _http: &Client,
            _device: &DeviceDescription,
        ) -> SoapResult<Option<VolumeStatus>> {
            self.enter("volume").await;
            if self.fail_volume {
                return Err(SoapError::Parse);
            }
            Ok(Some(VolumeStatus {
                volume: 95.0,
                max: 100.0,
                muted: false,
            }))
        }

        async fn query_track(
            &self,
            _http: &Client,
            _device: &DeviceDescription,
        ) -> SoapResult<Option<TrackMetadata>> {
            self.track_calls.fetch_add(1, Ordering::SeqCst);
            self.enter("track").await;
            if self.hang_track {
                std::future::pending::<()>().await;
            }
            Ok(Some(TrackMetadata {
                title: Some("Blue in Green".into()),
                ..TrackMetadata::default()
            }))
        }

        async fn transport(
            &self,
            _http: &Client,
            _device: &DeviceDescription,
            command: TransportCommand,
        ) -> SoapResult<()> {
            self.commands.lock().push(command);
            Ok(())
        }

        async fn set_volume(
            &self,
            _http: &Client,
            _device: &DeviceDescription,
            volume: f64,
        ) -> SoapResult<()> {
            self.sent_volumes.lock().push(volume);
            Ok(())
        }
    }

    fn client(family: FakeFamily) -> (DiscoveryClient<FakeFamily>, Arc<CountingEventEmitter>) {
        let emitter = Arc::new(CountingEventEmitter::default());
        let events = ZoneEvents::new("fake", emitter.clone());
        let client = DiscoveryClient::new(family, Client::new(), DiscoveryConfig::default(), events);
        (client, emitter)
    }

    #[tokio::test(start_paused = true)]
    async fn failing_sub_query_does_not_block_the_others() {
        let (client, _) = client(FakeFamily {
            fail_volume: true,
            ..FakeFamily::default()
        });
        client.inner.registry.insert(device("a", "Den"));

        client.inner.poll_round().await;

        let snapshot = client.device("a").unwrap();
        assert_eq!(snapshot.state.transport_state(), TransportState::Stopped);
        assert!(snapshot.state.volume.is_none());
        assert_eq!(
            snapshot.state.track.unwrap().title.as_deref(),
            Some("Blue in Green")
        );
        assert!(client.last_error().unwrap().contains("volume"));
    }

    #[tokio::test(start_paused = true)]
    async fn sub_queries_run_one_after_another() {
        let (client, _) = client(FakeFamily::default());
        client.inner.registry.insert(device("a", "Den"));

        client.inner.poll_round().await;

        let family = client.family();
        assert_eq!(*family.queries.lock(), vec!["transport", "volume", "track"]);
        assert_eq!(family.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_sub_query_is_bounded_by_timeout() {
        let (client, _) = client(FakeFamily {
            hang_track: true,
            ..FakeFamily::default()
        });
        client.inner.registry.insert(device("a", "Den"));

        client.inner.poll_round().await;

        let snapshot = client.device("a").unwrap();
        assert!(snapshot.state.transport.is_some());
        assert!(snapshot.state.volume.is_some());
        assert!(snapshot.state.track.is_none());
        assert!(client.last_error().unwrap().contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn polls_respect_minimum_interval() {
        let (client, _) = client(FakeFamily::default());
        client.inner.registry.insert(device("a", "Den"));

        client.inner.poll_round().await;
        client.inner.poll_round().await;
        assert_eq!(client.family().transport_calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        client.inner.poll_round().await;
        assert_eq!(client.family().transport_calls.load(Ordering::SeqCst), 2);
        // Track metadata is on its own, slower schedule.
        assert_eq!(client.family().track_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transport_transition_emits_one_change() {
        let (client, emitter) = client(FakeFamily::default());
        client.inner.registry.insert(device("a", "Den"));
        client.inner.registry.insert(device("b", "Study"));

        client.inner.poll_round().await;
        assert_eq!(emitter.zones(), 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        client.inner.poll_round().await;
        assert_eq!(emitter.zones(), 1, "no transition, no event");

        client.family().playing.store(true, Ordering::SeqCst);
        tokio::time::advance(Duration::from_secs(2)).await;
        client.inner.poll_round().await;
        assert_eq!(emitter.zones(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_devices_are_evicted_with_single_notification() {
        let (client, emitter) = client(FakeFamily::default());
        client.inner.registry.insert(device("a", "Den"));
        client.inner.registry.insert(device("b", "Study"));
        client.inner.registry.insert(device("c", "Kitchen"));

        tokio::time::advance(Duration::from_secs(89)).await;
        assert_eq!(client.inner.evict_stale_devices(), 0);
        client.inner.registry.touch("c");

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(client.inner.evict_stale_devices(), 2);
        assert_eq!(emitter.zones(), 1);
        assert_eq!(client.device_count(), 1);
        assert!(client.device("c").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn relative_step_is_clamped_to_device_max() {
        let (client, _) = client(FakeFamily::default());
        client.inner.registry.insert(device("a", "Den"));
        client.inner.poll_round().await;

        client.inner.apply_step("a", 25.0).await.unwrap();

        assert_eq!(*client.family().sent_volumes.lock(), vec![100.0]);
        let volume = client.device("a").unwrap().state.volume.unwrap();
        assert_eq!(volume.volume, 100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn step_for_unknown_device_is_zone_not_found() {
        let (client, _) = client(FakeFamily::default());
        let err = client.inner.apply_step("ghost", 5.0).await.unwrap_err();
        assert!(matches!(err, BridgeError::ZoneNotFound(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn adjust_volume_requires_running_client() {
        let (client, _) = client(FakeFamily::default());
        assert!(!client.adjust_volume("a", 5.0));
    }

    #[tokio::test(start_paused = true)]
    async fn transport_command_requests_fresh_poll() {
        let (client, _) = client(FakeFamily::default());
        let den = device("a", "Den");
        client.inner.registry.insert(den.clone());
        client.inner.poll_round().await;

        client
            .send_transport(&den, TransportCommand::Play)
            .await
            .unwrap();
        assert_eq!(*client.family().commands.lock(), vec![TransportCommand::Play]);

        client.inner.poll_round().await;
        assert_eq!(client.family().transport_calls.load(Ordering::SeqCst), 2);
    }
}
