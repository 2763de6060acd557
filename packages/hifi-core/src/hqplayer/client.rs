//! Connection-per-request client and poll loop for one HQPlayer instance.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::MissedTickBehavior;

use super::protocol::{
    HqpCommand, HqpInfo, HqpPlayback, HqpReply, HqpState, HqpStatus, HqpVolumeRange,
};
use super::{HqpError, HqpResult};
use crate::config::HqpConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::events::ZoneEvents;
use crate::protocol_constants::{DEVICE_ERROR_LOG_INTERVAL, HQPLAYER_ZONE_ID};
use crate::runtime::BackgroundTasks;
use crate::utils::LogThrottle;
use crate::volume::{clamp, RelativeVolumeBatcher, VolumeSink};

/// Upper bound on one reply line.
const MAX_REPLY_BYTES: u64 = 64 * 1024;

/// Everything known about the pipeline after the last successful poll.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineSnapshot {
    pub info: HqpInfo,
    pub state: HqpState,
    pub volume_range: Option<HqpVolumeRange>,
    pub status: Option<HqpStatus>,
}

/// HQPlayer client.
pub struct HqpClient {
    inner: Arc<HqpInner>,
    tasks: BackgroundTasks,
    batcher: Mutex<Option<RelativeVolumeBatcher>>,
}

struct HqpInner {
    config: HqpConfig,
    events: ZoneEvents,
    /// `None` while the pipeline is unreachable.
    snapshot: RwLock<Option<PipelineSnapshot>>,
    reachable: AtomicBool,
    last_error: Mutex<Option<String>>,
    throttle: LogThrottle,
}

impl HqpClient {
    /// Creates a stopped client for the instance in `config`.
    pub fn new(config: HqpConfig, events: ZoneEvents) -> Self {
        Self {
            inner: Arc::new(HqpInner {
                config,
                events,
                snapshot: RwLock::new(None),
                reachable: AtomicBool::new(false),
                last_error: Mutex::new(None),
                throttle: LogThrottle::new(DEVICE_ERROR_LOG_INTERVAL),
            }),
            tasks: BackgroundTasks::new("HQPlayer"),
            batcher: Mutex::new(None),
        }
    }

    /// `host:port` of the instance.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.inner.config.host, self.inner.config.port)
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.tasks.is_running()
    }

    #[must_use]
    pub fn is_reachable(&self) -> bool {
        self.inner.reachable.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.inner.last_error.lock().clone()
    }

    /// Cached pipeline state, `None` while unreachable.
    #[must_use]
    pub fn snapshot(&self) -> Option<PipelineSnapshot> {
        self.inner.snapshot.read().clone()
    }

    /// Starts the poll loop. Does nothing if already running.
    pub fn start(&self) {
        if self.tasks.is_running() {
            return;
        }
        log::info!(
            "[HQPlayer] Polling {} every {}ms",
            self.address(),
            self.inner.config.poll_interval_ms
        );

        *self.batcher.lock() = Some(RelativeVolumeBatcher::new(
            "HQPlayer",
            Arc::clone(&self.inner) as Arc<dyn VolumeSink>,
            self.tasks.token(),
        ));

        let inner = Arc::clone(&self.inner);
        self.tasks.spawn(move |cancel| async move {
            let mut interval =
                tokio::time::interval(Duration::from_millis(inner.config.poll_interval_ms));
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = inner.poll() => {}
                        }
                    }
                }
            }
            log::debug!("[HQPlayer] Poll loop stopped");
        });
    }

    /// Stops polling and drops the pseudo-zone.
    pub async fn stop(&self) {
        if let Some(batcher) = self.batcher.lock().take() {
            batcher.stop();
        }
        self.tasks.shutdown().await;
        self.inner.mark_unreachable();
        log::info!("[HQPlayer] Stopped");
    }

    /// Runs one poll immediately.
    pub async fn poll_now(&self) {
        self.inner.poll().await;
    }

    /// Sends a transport command.
    ///
    /// # Errors
    /// Connection failures, timeouts, or a rejected request.
    pub async fn send(&self, command: HqpCommand) -> HqpResult<()> {
        log::debug!("[HQPlayer] -> {}", command.element());
        self.inner.request(command).await?;
        Ok(())
    }

    /// Sets the volume in dB, clamped to the pipeline's range. Returns the
    /// value sent.
    ///
    /// # Errors
    /// `Rejected` when volume control is disabled in HQPlayer, otherwise
    /// whatever the exchange returns.
    pub async fn set_volume(&self, db: f64) -> HqpResult<f64> {
        self.inner.set_volume(db).await
    }

    /// Queues a relative volume change in dB. Returns false if not running.
    pub fn adjust_volume(&self, delta: f64) -> bool {
        match self.batcher.lock().as_ref() {
            Some(batcher) => {
                batcher.request(HQPLAYER_ZONE_ID, delta);
                true
            }
            None => false,
        }
    }
}

impl HqpInner {
    fn timeout(&self) -> Duration {
        Duration::from_millis(self.config.timeout_ms)
    }

    /// One request/response exchange on a fresh connection.
    async fn request(&self, command: HqpCommand) -> HqpResult<HqpReply> {
        let exchange = async {
            let mut stream =
                TcpStream::connect((self.config.host.as_str(), self.config.port)).await?;
            stream.write_all(command.to_xml().as_bytes()).await?;

            let mut reader = BufReader::new(stream).take(MAX_REPLY_BYTES);
            let mut line = String::new();
            reader.read_line(&mut line).await?;
            Ok::<_, HqpError>(line)
        };

        let line = tokio::time::timeout(self.timeout(), exchange)
            .await
            .map_err(|_| HqpError::Timeout)??;

        let reply = HqpReply::parse(line.trim())?;
        if reply.root.name != command.element() {
            return Err(HqpError::Parse(format!(
                "expected <{}> reply, got <{}>",
                command.element(),
                reply.root.name
            )));
        }
        reply.check()?;
        Ok(reply)
    }

    /// Queries the pipeline. `State` decides reachability; the other
    /// queries are best effort.
    async fn fetch(&self) -> HqpResult<PipelineSnapshot> {
        let state = HqpState::from_reply(&self.request(HqpCommand::State).await?);

        let previous = self.snapshot.read().clone();
        let info = match self.request(HqpCommand::GetInfo).await {
            Ok(reply) => HqpInfo::from_reply(&reply),
            Err(e) => {
                log::debug!("[HQPlayer] GetInfo failed: {}", e);
                previous.as_ref().map(|p| p.info.clone()).unwrap_or_default()
            }
        };
        let volume_range = match self.request(HqpCommand::VolumeRange).await {
            Ok(reply) => HqpVolumeRange::from_reply(&reply).ok(),
            Err(e) => {
                log::debug!("[HQPlayer] VolumeRange failed: {}", e);
                previous.as_ref().and_then(|p| p.volume_range)
            }
        };
        let status = match self.request(HqpCommand::Status).await {
            Ok(reply) => Some(HqpStatus::from_reply(&reply)),
            Err(e) => {
                log::debug!("[HQPlayer] Status failed: {}", e);
                None
            }
        };

        Ok(PipelineSnapshot {
            info,
            state,
            volume_range,
            status,
        })
    }

    async fn poll(&self) {
        match self.fetch().await {
            Ok(snapshot) => {
                *self.last_error.lock() = None;
                self.throttle.reset("pipeline");

                let changed = {
                    let mut cache = self.snapshot.write();
                    let changed = cache.as_ref().map(|c| c.state.playback)
                        != Some(snapshot.state.playback);
                    *cache = Some(snapshot);
                    changed
                };
                if !self.reachable.swap(true, Ordering::SeqCst) {
                    log::info!(
                        "[HQPlayer] Pipeline reachable at {}:{}",
                        self.config.host,
                        self.config.port
                    );
                    self.events.connection_changed(true);
                }
                if changed {
                    self.events.zones_changed();
                }
            }
            Err(e) => {
                *self.last_error.lock() = Some(e.to_string());
                if self.throttle.should_log("pipeline") {
                    log::warn!("[HQPlayer] Poll failed: {}", e);
                }
                self.mark_unreachable();
            }
        }
    }

    /// Drops the cached state; the pseudo-zone disappears.
    fn mark_unreachable(&self) {
        self.snapshot.write().take();
        if self.reachable.swap(false, Ordering::SeqCst) {
            self.events.connection_changed(false);
            self.events.zones_changed();
        }
    }

    async fn volume_range(&self) -> HqpResult<HqpVolumeRange> {
        let cached = self
            .snapshot
            .read()
            .as_ref()
            .and_then(|s| s.volume_range);
        match cached {
            Some(range) => Ok(range),
            None => HqpVolumeRange::from_reply(&self.request(HqpCommand::VolumeRange).await?),
        }
    }

    async fn set_volume(&self, db: f64) -> HqpResult<f64> {
        let range = self.volume_range().await?;
        if !range.enabled {
            return Err(HqpError::Rejected("volume control is disabled".to_string()));
        }
        let target = clamp(db, range.min, range.max);
        self.request(HqpCommand::Volume(target)).await?;

        if let Some(snapshot) = self.snapshot.write().as_mut() {
            snapshot.state.volume = Some(target);
        }
        Ok(target)
    }
}

#[async_trait]
impl VolumeSink for HqpInner {
    async fn apply_step(&self, _output_id: &str, step: f64) -> BridgeResult<()> {
        let current = self
            .snapshot
            .read()
            .as_ref()
            .and_then(|s| s.state.volume)
            .ok_or_else(|| {
                BridgeError::BackendUnavailable("HQPlayer volume is unknown".to_string())
            })?;
        self.set_volume(current + step).await?;
        Ok(())
    }
}

impl PipelineSnapshot {
    #[must_use]
    pub fn is_playing(&self) -> bool {
        self.state.playback == HqpPlayback::Playing
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CountingEventEmitter;
    use tokio::net::TcpListener;

    /// Scripted HQPlayer: answers by request element and logs every line.
    struct MockHqp {
        volume: Mutex<f64>,
        volume_enabled: bool,
        silent: bool,
        received: Mutex<Vec<String>>,
    }

    impl MockHqp {
        fn new() -> Arc<Self> {
            Self::build(true, false)
        }

        fn build(volume_enabled: bool, silent: bool) -> Arc<Self> {
            Arc::new(Self {
                volume: Mutex::new(-20.0),
                volume_enabled,
                silent,
                received: Mutex::new(Vec::new()),
            })
        }

        fn answer(&self, request: &HqpReply) -> String {
            let root = &request.root;
            match root.name.as_str() {
                "State" => format!(
                    r#"<State state="2" mode="1" filter="3" shaper="1" volume="{}"/>"#,
                    *self.volume.lock()
                ),
                "GetInfo" => r#"<GetInfo name="HQPlayer 5 Desktop" product="Signalyst HQPlayer Desktop" version="5.3.1" platform="Linux"/>"#.to_string(),
                "VolumeRange" => format!(
                    r#"<VolumeRange min="-60" max="0" enabled="{}"/>"#,
                    u8::from(self.volume_enabled)
                ),
                "Status" => r#"<Status state="2" position="12" length="300"><metadata title="Peace Piece" artist="Bill Evans" album="Everybody Digs"/></Status>"#.to_string(),
                "Volume" => {
                    if let Some(v) = root.number("value") {
                        *self.volume.lock() = v;
                    }
                    r#"<Volume result="OK"/>"#.to_string()
                }
                other => format!(r#"<{} result="OK"/>"#, other),
            }
        }
    }

    async fn spawn_server(mock: Arc<MockHqp>) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    return;
                };
                let mock = mock.clone();
                tokio::spawn(async move {
                    let mut reader = BufReader::new(socket);
                    let mut line = String::new();
                    if reader.read_line(&mut line).await.is_err() {
                        return;
                    }
                    mock.received.lock().push(line.clone());
                    if mock.silent {
                        tokio::time::sleep(Duration::from_secs(30)).await;
                        return;
                    }
                    let request = HqpReply::parse(line.trim()).unwrap();
                    let reply = format!(
                        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>{}\n",
                        mock.answer(&request)
                    );
                    let _ = reader.get_mut().write_all(reply.as_bytes()).await;
                });
            }
        });

        port
    }

    async fn client_for(mock: Arc<MockHqp>) -> (HqpClient, Arc<CountingEventEmitter>) {
        let port = spawn_server(mock).await;
        let emitter = Arc::new(CountingEventEmitter::default());
        let client = HqpClient::new(
            HqpConfig {
                host: "127.0.0.1".into(),
                port,
                timeout_ms: 500,
                ..HqpConfig::default()
            },
            ZoneEvents::new("hqplayer", emitter.clone()),
        );
        (client, emitter)
    }

    #[tokio::test]
    async fn poll_builds_snapshot_and_reports_reachable() {
        let (client, emitter) = client_for(MockHqp::new()).await;

        client.poll_now().await;
        assert!(client.is_reachable());
        assert_eq!(emitter.status(), 1);
        assert_eq!(emitter.zones(), 1);

        let snapshot = client.snapshot().unwrap();
        assert!(snapshot.is_playing());
        assert_eq!(snapshot.state.volume, Some(-20.0));
        assert_eq!(snapshot.info.name.as_deref(), Some("HQPlayer 5 Desktop"));
        assert_eq!(snapshot.volume_range.unwrap().min, -60.0);
        assert_eq!(
            snapshot.status.unwrap().title.as_deref(),
            Some("Peace Piece")
        );

        client.poll_now().await;
        assert_eq!(emitter.zones(), 1, "unchanged state must not notify");
    }

    #[tokio::test]
    async fn volume_is_clamped_to_reported_range() {
        let mock = MockHqp::new();
        let (client, _) = client_for(mock.clone()).await;
        client.poll_now().await;

        assert_eq!(client.set_volume(6.0).await.unwrap(), 0.0);
        assert_eq!(client.set_volume(-100.0).await.unwrap(), -60.0);
        assert_eq!(client.set_volume(-12.0).await.unwrap(), -12.0);
        assert_eq!(*mock.volume.lock(), -12.0);
        assert!(mock
            .received
            .lock()
            .iter()
            .any(|l| l.contains(r#"<Volume value="-60"/>"#)));
    }

    #[tokio::test]
    async fn disabled_volume_is_rejected() {
        let (client, _) = client_for(MockHqp::build(false, false)).await;

        let err = client.set_volume(-10.0).await.unwrap_err();
        assert!(matches!(err, HqpError::Rejected(_)));
    }

    #[tokio::test]
    async fn volume_step_resolves_against_cached_level() {
        let mock = MockHqp::new();
        let (client, _) = client_for(mock.clone()).await;
        client.poll_now().await;

        client.inner.apply_step(HQPLAYER_ZONE_ID, 25.0).await.unwrap();
        assert_eq!(*mock.volume.lock(), 0.0);
    }

    #[tokio::test]
    async fn silent_pipeline_times_out() {
        let (client, emitter) = client_for(MockHqp::build(true, true)).await;

        let err = client.send(HqpCommand::Play).await.unwrap_err();
        assert!(matches!(err, HqpError::Timeout));

        client.poll_now().await;
        assert!(!client.is_reachable());
        assert!(client.snapshot().is_none());
        assert!(client.last_error().is_some());
        assert_eq!(emitter.status(), 0);
    }

    #[tokio::test]
    async fn losing_the_pipeline_removes_the_zone() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let emitter = Arc::new(CountingEventEmitter::default());
        let client = HqpClient::new(
            HqpConfig {
                host: "127.0.0.1".into(),
                port,
                ..HqpConfig::default()
            },
            ZoneEvents::new("hqplayer", emitter.clone()),
        );
        client.inner.reachable.store(true, Ordering::SeqCst);
        *client.inner.snapshot.write() = Some(PipelineSnapshot::default());

        client.poll_now().await;
        assert!(client.snapshot().is_none());
        assert_eq!(emitter.status(), 1);
        assert_eq!(emitter.zones(), 1);
    }
}
