//! Zone registry and router.
//!
//! The bus owns the registered adapters and dispatches every unified call to
//! the adapter whose name matches the zone id prefix. It never caches zone
//! state: each read is a request-time projection from the owning client.
//!
//! Reads that span backends (`zones`, `status`) fan out concurrently, so a
//! slow or dead backend never delays the others.

use std::sync::Arc;

use futures::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::adapters::Adapter;
use crate::artwork::{ArtworkImage, ArtworkRequest};
use crate::error::{BridgeError, BridgeResult};
use crate::events::{BroadcastEventBridge, BusEvent};
use crate::model::{BackendStatus, ControlAction, NowPlaying, Zone, ZoneId};

/// Filter for [`Bus::zones`].
#[derive(Debug, Clone, Default)]
pub struct ZoneQuery {
    /// Restrict to one backend.
    pub backend: Option<String>,
}

/// Aggregated backend health.
#[derive(Debug, Clone, Serialize)]
pub struct BusStatus {
    pub backends: Vec<BackendStatus>,
}

struct Registration {
    name: String,
    adapter: Arc<dyn Adapter>,
}

/// Registry and router over all backend adapters.
pub struct Bus {
    adapters: RwLock<Vec<Registration>>,
    events: Arc<BroadcastEventBridge>,
}

impl Bus {
    /// Creates an empty bus publishing on `events`.
    pub fn new(events: Arc<BroadcastEventBridge>) -> Self {
        Self {
            adapters: RwLock::new(Vec::new()),
            events,
        }
    }

    /// Registers `adapter` under `name`.
    ///
    /// # Errors
    /// `DuplicateBackend` if the name is taken; `InvalidRequest` if the
    /// adapter's own prefix differs from `name` or contains `:`.
    pub fn register_backend(&self, name: &str, adapter: Arc<dyn Adapter>) -> BridgeResult<()> {
        if name.is_empty() || name.contains(':') {
            return Err(BridgeError::InvalidRequest(format!(
                "backend name {:?} must be non-empty and contain no ':'",
                name
            )));
        }
        if adapter.prefix() != name {
            return Err(BridgeError::InvalidRequest(format!(
                "adapter prefix {:?} does not match backend name {:?}",
                adapter.prefix(),
                name
            )));
        }

        let mut adapters = self.adapters.write();
        if adapters.iter().any(|r| r.name == name) {
            return Err(BridgeError::DuplicateBackend(name.to_string()));
        }
        log::info!("[Bus] Registered backend {} ({:?})", name, adapter.kind());
        adapters.push(Registration {
            name: name.to_string(),
            adapter,
        });
        Ok(())
    }

    /// Names of registered backends in registration order.
    #[must_use]
    pub fn backends(&self) -> Vec<String> {
        self.adapters.read().iter().map(|r| r.name.clone()).collect()
    }

    /// Receiver for zone and status change events.
    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.events.subscribe()
    }

    fn snapshot(&self) -> Vec<(String, Arc<dyn Adapter>)> {
        self.adapters
            .read()
            .iter()
            .map(|r| (r.name.clone(), Arc::clone(&r.adapter)))
            .collect()
    }

    fn route(&self, zone_id: &ZoneId) -> BridgeResult<Arc<dyn Adapter>> {
        self.adapters
            .read()
            .iter()
            .find(|r| r.name == zone_id.backend())
            .map(|r| Arc::clone(&r.adapter))
            .ok_or_else(|| BridgeError::UnknownZone(zone_id.to_string()))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Starts every adapter concurrently; failures are logged, not fatal.
    pub async fn start_all(&self) {
        let adapters = self.snapshot();
        let results = join_all(adapters.iter().map(|(_, a)| a.start())).await;
        for ((name, _), result) in adapters.iter().zip(results) {
            match result {
                Ok(()) => log::info!("[Bus] Backend {} started", name),
                Err(e) => log::error!("[Bus] Backend {} failed to start: {}", name, e),
            }
        }
    }

    /// Stops every adapter concurrently.
    pub async fn stop_all(&self) {
        let adapters = self.snapshot();
        join_all(adapters.iter().map(|(_, a)| a.stop())).await;
        log::info!("[Bus] Stopped {} backend(s)", adapters.len());
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Unified Contract
    // ─────────────────────────────────────────────────────────────────────────

    /// Merged zone list in registration order.
    ///
    /// A failing adapter is logged and omitted; it never fails the whole call.
    pub async fn zones(&self, query: &ZoneQuery) -> Vec<Zone> {
        let adapters: Vec<_> = self
            .snapshot()
            .into_iter()
            .filter(|(name, _)| query.backend.as_deref().map_or(true, |b| b == name))
            .collect();

        let results = join_all(adapters.iter().map(|(_, a)| a.zones())).await;

        let mut zones = Vec::new();
        for ((name, _), result) in adapters.iter().zip(results) {
            match result {
                Ok(mut z) => zones.append(&mut z),
                Err(e) => log::warn!("[Bus] Omitting zones of {}: {}", name, e),
            }
        }
        zones
    }

    /// Now-playing for `zone_id`; `None` when the owning backend does not know it.
    ///
    /// # Errors
    /// `InvalidRequest` for a malformed id, `UnknownZone` when no backend
    /// claims the prefix.
    pub async fn now_playing(&self, zone_id: &str) -> BridgeResult<Option<NowPlaying>> {
        let zone_id = ZoneId::parse(zone_id)?;
        let adapter = self.route(&zone_id)?;
        match adapter.now_playing(&zone_id).await {
            Err(BridgeError::ZoneNotFound(_)) => Ok(None),
            other => other,
        }
    }

    /// Sends `action` to the zone's backend; adapter failures propagate unchanged.
    pub async fn control(&self, zone_id: &str, action: ControlAction) -> BridgeResult<()> {
        let zone_id = ZoneId::parse(zone_id)?;
        let adapter = self.route(&zone_id)?;
        log::debug!("[Bus] {} -> {}", action.as_str(), zone_id);
        adapter.control(&zone_id, action).await
    }

    /// Artwork for a zone (its current track) or for `{backend}:{image_key}`.
    pub async fn artwork(
        &self,
        reference: &str,
        request: &ArtworkRequest,
    ) -> BridgeResult<ArtworkImage> {
        let reference = ZoneId::parse(reference)?;
        let adapter = self.route(&reference)?;
        adapter.artwork(&reference, request).await
    }

    /// Status of every backend, collected concurrently.
    pub async fn status(&self) -> BusStatus {
        let adapters = self.snapshot();
        let backends = join_all(adapters.iter().map(|(_, a)| a.status())).await;
        BusStatus { backends }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::Bytes;

    use crate::adapters::{native_id, unsupported, AdapterKind};
    use crate::model::{Capabilities, ZoneState};

    /// Minimal adapter backed by a fixed zone list.
    struct MockAdapter {
        prefix: &'static str,
        zones: Vec<&'static str>,
        fail_zones: bool,
        delay: Option<Duration>,
        controls: AtomicUsize,
        starts: AtomicUsize,
    }

    impl MockAdapter {
        fn new(prefix: &'static str, zones: Vec<&'static str>) -> Self {
            Self {
                prefix,
                zones,
                fail_zones: false,
                delay: None,
                controls: AtomicUsize::new(0),
                starts: AtomicUsize::new(0),
            }
        }

        fn zone(&self, native: &str) -> Zone {
            Zone {
                zone_id: ZoneId::new(self.prefix, native),
                display_name: native.to_uppercase(),
                state: ZoneState::Stopped,
                source: self.prefix.to_string(),
                volume_control: None,
                capabilities: Capabilities {
                    transport: true,
                    ..Default::default()
                },
                extra: None,
            }
        }
    }

    #[async_trait]
    impl Adapter for MockAdapter {
        fn prefix(&self) -> &str {
            self.prefix
        }

        fn kind(&self) -> AdapterKind {
            AdapterKind::DiscoveryPoll
        }

        async fn start(&self) -> BridgeResult<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            if self.fail_zones {
                return Err(BridgeError::BackendUnavailable("down".into()));
            }
            Ok(())
        }

        async fn stop(&self) {}

        async fn zones(&self) -> BridgeResult<Vec<Zone>> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail_zones {
                return Err(BridgeError::BackendUnavailable("down".into()));
            }
            Ok(self.zones.iter().map(|z| self.zone(z)).collect())
        }

        async fn now_playing(&self, zone_id: &ZoneId) -> BridgeResult<Option<NowPlaying>> {
            let native = native_id(self.prefix, zone_id)?;
            if !self.zones.iter().any(|z| *z == native) {
                return Err(BridgeError::ZoneNotFound(zone_id.to_string()));
            }
            Ok(Some(NowPlaying {
                zone_id: Some(zone_id.clone()),
                line1: Some("Track".into()),
                ..Default::default()
            }))
        }

        async fn control(&self, zone_id: &ZoneId, action: ControlAction) -> BridgeResult<()> {
            let native = native_id(self.prefix, zone_id)?;
            if !self.zones.iter().any(|z| *z == native) {
                return Err(BridgeError::ZoneNotFound(zone_id.to_string()));
            }
            if matches!(action, ControlAction::Seek(_)) {
                return Err(unsupported(self.prefix, action));
            }
            self.controls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn artwork(
            &self,
            reference: &ZoneId,
            _request: &ArtworkRequest,
        ) -> BridgeResult<ArtworkImage> {
            Ok(ArtworkImage {
                content_type: "image/jpeg".into(),
                width: None,
                height: None,
                bytes: Bytes::from(reference.native_id().to_string()),
            })
        }

        async fn status(&self) -> BackendStatus {
            BackendStatus {
                backend: self.prefix.to_string(),
                kind: AdapterKind::DiscoveryPoll,
                connected: !self.fail_zones,
                zone_count: self.zones.len(),
                last_error: None,
                detail: None,
            }
        }
    }

    fn bus() -> Bus {
        Bus::new(Arc::new(BroadcastEventBridge::new(16)))
    }

    #[test]
    fn duplicate_backend_is_rejected() {
        let bus = bus();
        bus.register_backend("lms", Arc::new(MockAdapter::new("lms", vec![])))
            .unwrap();
        let err = bus
            .register_backend("lms", Arc::new(MockAdapter::new("lms", vec![])))
            .unwrap_err();
        assert!(matches!(err, BridgeError::DuplicateBackend(_)));
    }

    #[test]
    fn prefix_must_match_name() {
        let bus = bus();
        let err = bus
            .register_backend("upnp", Arc::new(MockAdapter::new("lms", vec![])))
            .unwrap_err();
        assert!(matches!(err, BridgeError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn zones_are_concatenated_in_registration_order() {
        let bus = bus();
        bus.register_backend("roon", Arc::new(MockAdapter::new("roon", vec!["a", "b"])))
            .unwrap();
        bus.register_backend("lms", Arc::new(MockAdapter::new("lms", vec!["a"])))
            .unwrap();

        let ids: Vec<String> = bus
            .zones(&ZoneQuery::default())
            .await
            .into_iter()
            .map(|z| z.zone_id.to_string())
            .collect();
        assert_eq!(ids, vec!["roon:a", "roon:b", "lms:a"]);
    }

    #[tokio::test]
    async fn failing_backend_is_omitted() {
        let bus = bus();
        let mut broken = MockAdapter::new("upnp", vec!["x"]);
        broken.fail_zones = true;
        bus.register_backend("upnp", Arc::new(broken)).unwrap();
        bus.register_backend("lms", Arc::new(MockAdapter::new("lms", vec!["p1"])))
            .unwrap();

        let zones = bus.zones(&ZoneQuery::default()).await;
        assert_eq!(zones.len(), 1);
        assert_eq!(zones[0].zone_id.to_string(), "lms:p1");

        // start_all survives the failing backend too
        bus.start_all().await;
    }

    #[tokio::test]
    async fn zone_query_filters_by_backend() {
        let bus = bus();
        bus.register_backend("roon", Arc::new(MockAdapter::new("roon", vec!["a"])))
            .unwrap();
        bus.register_backend("lms", Arc::new(MockAdapter::new("lms", vec!["b"])))
            .unwrap();

        let zones = bus
            .zones(&ZoneQuery {
                backend: Some("lms".into()),
            })
            .await;
        assert_eq!(zones.len(), 1);
        assert_eq!(zones[0].source, "lms");
    }

    #[tokio::test(start_paused = true)]
    async fn slow_backend_does_not_serialize_fan_out() {
        let bus = bus();
        let mut slow_a = MockAdapter::new("roon", vec!["a"]);
        slow_a.delay = Some(Duration::from_secs(2));
        let mut slow_b = MockAdapter::new("lms", vec!["b"]);
        slow_b.delay = Some(Duration::from_secs(2));
        bus.register_backend("roon", Arc::new(slow_a)).unwrap();
        bus.register_backend("lms", Arc::new(slow_b)).unwrap();

        let started = tokio::time::Instant::now();
        let zones = bus.zones(&ZoneQuery::default()).await;
        assert_eq!(zones.len(), 2);
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn now_playing_unknown_zone_is_none() {
        let bus = bus();
        bus.register_backend("lms", Arc::new(MockAdapter::new("lms", vec!["p1"])))
            .unwrap();

        assert!(bus.now_playing("lms:p1").await.unwrap().is_some());
        assert!(bus.now_playing("lms:nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unknown_prefix_is_unknown_zone() {
        let bus = bus();
        bus.register_backend("lms", Arc::new(MockAdapter::new("lms", vec!["p1"])))
            .unwrap();

        let err = bus.control("roon:z", ControlAction::Play).await.unwrap_err();
        assert!(matches!(err, BridgeError::UnknownZone(_)));

        let err = bus.now_playing("hqplayer:pipeline").await.unwrap_err();
        assert!(matches!(err, BridgeError::UnknownZone(_)));
    }

    #[tokio::test]
    async fn control_routes_and_propagates_adapter_errors() {
        let bus = bus();
        let adapter = Arc::new(MockAdapter::new("lms", vec!["p1"]));
        bus.register_backend("lms", adapter.clone()).unwrap();

        bus.control("lms:p1", ControlAction::Play).await.unwrap();
        assert_eq!(adapter.controls.load(Ordering::SeqCst), 1);

        let err = bus
            .control("lms:p1", ControlAction::Seek(10.0))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::UnsupportedAction(_)));

        let err = bus.control("lms:p2", ControlAction::Play).await.unwrap_err();
        assert!(matches!(err, BridgeError::ZoneNotFound(_)));
    }

    #[tokio::test]
    async fn artwork_reference_is_routed_by_prefix() {
        let bus = bus();
        bus.register_backend("roon", Arc::new(MockAdapter::new("roon", vec![])))
            .unwrap();

        let image = bus
            .artwork("roon:abc123", &ArtworkRequest::default())
            .await
            .unwrap();
        assert_eq!(image.bytes, Bytes::from_static(b"abc123"));
    }

    #[tokio::test]
    async fn status_reports_each_backend() {
        let bus = bus();
        bus.register_backend("roon", Arc::new(MockAdapter::new("roon", vec!["a"])))
            .unwrap();
        bus.register_backend("lms", Arc::new(MockAdapter::new("lms", vec![])))
            .unwrap();

        let status = bus.status().await;
        let names: Vec<_> = status.backends.iter().map(|b| b.backend.as_str()).collect();
        assert_eq!(names, vec!["roon", "lms"]);
        assert_eq!(status.backends[0].zone_count, 1);
    }
}
