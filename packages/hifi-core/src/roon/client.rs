//! Roon core connection, pairing state machine and zone cache.
//!
//! The connection task turns everything it hears into [`CoreEvent`]s and
//! sends them over an `mpsc` channel; a single consumer task applies them in
//! arrival order. Reads check the pairing state on every call: after a
//! disconnect the cached zones are still served for [`UNPAIRED_GRACE`], and
//! purged entirely after [`UNPAIRED_PURGE`]. Both deadlines are announced as
//! zone changes.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::transport::{self, MooLink};
use super::types::{zone_events, CoreEvent, CoreInfo, Registration, RoonZone};
use super::{MooError, MooResult};
use crate::config::RoonConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::events::ZoneEvents;
use crate::protocol_constants::{
    APP_NAME, DEVICE_ERROR_LOG_INTERVAL, EXTENSION_ID, ROON_PING_SERVICE, ROON_REGISTRY_SERVICE,
    ROON_TRANSPORT_SERVICE, UNPAIRED_GRACE, UNPAIRED_PURGE,
};
use crate::runtime::BackgroundTasks;
use crate::utils::LogThrottle;
use crate::volume::{RelativeVolumeBatcher, VolumeRange, VolumeSink};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

// ─────────────────────────────────────────────────────────────────────────────
// Pairing State
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Pairing {
    /// `since` is the disconnect instant; `None` if never paired.
    Unpaired { since: Option<Instant> },
    Paired { display_name: String },
}

#[derive(Debug)]
struct CoreState {
    pairing: Pairing,
    /// Core the cached zones belong to.
    core_id: Option<String>,
    zones: HashMap<String, RoonZone>,
    /// Set once the end of the grace window has been notified.
    grace_expired: bool,
}

impl CoreState {
    fn new() -> Self {
        Self {
            pairing: Pairing::Unpaired { since: None },
            core_id: None,
            zones: HashMap::new(),
            grace_expired: false,
        }
    }

    /// Paired, or unpaired for less than the grace window.
    fn is_serving(&self, now: Instant) -> bool {
        match self.pairing {
            Pairing::Paired { .. } => true,
            Pairing::Unpaired { since: Some(since) } => {
                now.saturating_duration_since(since) < UNPAIRED_GRACE
            }
            Pairing::Unpaired { since: None } => false,
        }
    }

    /// End of the grace window, while cached zones are still visible.
    fn grace_deadline(&self) -> Option<Instant> {
        match self.pairing {
            Pairing::Unpaired { since: Some(since) }
                if !self.grace_expired && !self.zones.is_empty() =>
            {
                Some(since + UNPAIRED_GRACE)
            }
            _ => None,
        }
    }

    fn purge_deadline(&self) -> Option<Instant> {
        match self.pairing {
            Pairing::Unpaired { since: Some(since) } if !self.zones.is_empty() => {
                Some(since + UNPAIRED_PURGE)
            }
            _ => None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Token Store
// ─────────────────────────────────────────────────────────────────────────────

/// Pairing tokens per core id, optionally persisted as a JSON map.
struct TokenStore {
    path: Option<PathBuf>,
    tokens: Mutex<HashMap<String, String>>,
}

impl TokenStore {
    fn load(path: Option<PathBuf>) -> Self {
        let tokens = path
            .as_ref()
            .and_then(|p| match std::fs::read_to_string(p) {
                Ok(raw) => match serde_json::from_str(&raw) {
                    Ok(tokens) => Some(tokens),
                    Err(e) => {
                        log::warn!("[Roon] Ignoring unreadable token file {:?}: {}", p, e);
                        None
                    }
                },
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
                Err(e) => {
                    log::warn!("[Roon] Cannot read token file {:?}: {}", p, e);
                    None
                }
            })
            .unwrap_or_default();
        Self {
            path,
            tokens: Mutex::new(tokens),
        }
    }

    fn get(&self, core_id: &str) -> Option<String> {
        self.tokens.lock().get(core_id).cloned()
    }

    fn save(&self, core_id: &str, token: &str) {
        let snapshot = {
            let mut tokens = self.tokens.lock();
            if tokens.get(core_id).map(String::as_str) == Some(token) {
                return;
            }
            tokens.insert(core_id.to_string(), token.to_string());
            tokens.clone()
        };
        let Some(path) = &self.path else {
            return;
        };
        let written = serde_json::to_string_pretty(&snapshot)
            .map_err(|e| e.to_string())
            .and_then(|json| std::fs::write(path, json).map_err(|e| e.to_string()));
        if let Err(e) = written {
            log::warn!("[Roon] Failed to persist pairing token to {:?}: {}", path, e);
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Client
// ─────────────────────────────────────────────────────────────────────────────

/// How a volume change is expressed on the wire.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VolumeChange {
    Absolute(f64),
    Relative(f64),
}

/// Client for one configured Roon core.
pub struct RoonClient {
    inner: Arc<RoonInner>,
    tasks: BackgroundTasks,
    batcher: Mutex<Option<RelativeVolumeBatcher>>,
}

struct RoonInner {
    config: RoonConfig,
    events: ZoneEvents,
    state: RwLock<CoreState>,
    link: RwLock<Option<MooLink>>,
    tokens: TokenStore,
    last_error: Mutex<Option<String>>,
    throttle: LogThrottle,
}

impl RoonClient {
    /// Creates a stopped client; loads pairing tokens from `token_path`.
    pub fn new(config: RoonConfig, events: ZoneEvents) -> Self {
        let tokens = TokenStore::load(config.token_path.clone());
        Self {
            inner: Arc::new(RoonInner {
                config,
                events,
                state: RwLock::new(CoreState::new()),
                link: RwLock::new(None),
                tokens,
                last_error: Mutex::new(None),
                throttle: LogThrottle::new(DEVICE_ERROR_LOG_INTERVAL),
            }),
            tasks: BackgroundTasks::new("Roon"),
            batcher: Mutex::new(None),
        }
    }

    /// `host:port` of the core.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.inner.config.host, self.inner.config.port)
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.tasks.is_running()
    }

    #[must_use]
    pub fn is_paired(&self) -> bool {
        matches!(self.inner.state.read().pairing, Pairing::Paired { .. })
    }

    /// Display name of the paired core.
    #[must_use]
    pub fn core_name(&self) -> Option<String> {
        match &self.inner.state.read().pairing {
            Pairing::Paired { display_name } => Some(display_name.clone()),
            Pairing::Unpaired { .. } => None,
        }
    }

    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.inner.last_error.lock().clone()
    }

    /// Starts the connection and event loops. Does nothing if running.
    pub fn start(&self) {
        if self.tasks.is_running() {
            return;
        }
        log::info!("[Roon] Connecting to core at {}", self.address());

        *self.batcher.lock() = Some(RelativeVolumeBatcher::new(
            "Roon",
            Arc::clone(&self.inner) as Arc<dyn VolumeSink>,
            self.tasks.token(),
        ));

        let (tx, rx) = mpsc::unbounded_channel::<CoreEvent>();

        let inner = Arc::clone(&self.inner);
        self.tasks
            .spawn(move |cancel| async move { inner.run_events(rx, cancel).await });

        let inner = Arc::clone(&self.inner);
        self.tasks.spawn(move |cancel| async move {
            let max_backoff = Duration::from_secs(inner.config.reconnect_max_secs.max(1));
            let mut backoff = INITIAL_BACKOFF;
            loop {
                let mut paired = false;
                let error = tokio::select! {
                    _ = cancel.cancelled() => break,
                    error = inner.run_session(&tx, &mut paired) => error,
                };
                inner.link.write().take();
                if paired {
                    let _ = tx.send(CoreEvent::Unpaired);
                    backoff = INITIAL_BACKOFF;
                }

                *inner.last_error.lock() = Some(error.to_string());
                if paired || inner.throttle.should_log("core") {
                    log::warn!(
                        "[Roon] Connection to {}:{} ended: {}; retrying in {}s",
                        inner.config.host,
                        inner.config.port,
                        error,
                        backoff.as_secs()
                    );
                }

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(max_backoff);
            }
            log::debug!("[Roon] Connection loop stopped");
        });
    }

    /// Disconnects, stops reconnecting and forgets all zones.
    pub async fn stop(&self) {
        if let Some(batcher) = self.batcher.lock().take() {
            batcher.stop();
        }
        self.tasks.shutdown().await;
        self.inner.link.write().take();

        let (was_paired, had_zones) = {
            let mut state = self.inner.state.write();
            let was_paired = matches!(state.pairing, Pairing::Paired { .. });
            let had_zones = !state.zones.is_empty();
            *state = CoreState::new();
            (was_paired, had_zones)
        };
        if was_paired {
            self.inner.events.connection_changed(false);
        }
        if had_zones {
            self.inner.events.zones_changed();
        }
        log::info!("[Roon] Stopped");
    }

    /// Zones currently served (empty once the grace window has passed).
    #[must_use]
    pub fn zones(&self) -> Vec<RoonZone> {
        let state = self.inner.state.read();
        if !state.is_serving(Instant::now()) {
            return Vec::new();
        }
        let mut zones: Vec<RoonZone> = state.zones.values().cloned().collect();
        zones.sort_by(|a, b| a.display_name.cmp(&b.display_name));
        zones
    }

    /// One served zone by native id.
    #[must_use]
    pub fn zone(&self, zone_id: &str) -> Option<RoonZone> {
        let state = self.inner.state.read();
        if !state.is_serving(Instant::now()) {
            return None;
        }
        state.zones.get(zone_id).cloned()
    }

    #[must_use]
    pub fn zone_count(&self) -> usize {
        self.zones().len()
    }

    /// Sends a transport control (`play`, `pause`, `playpause`, `stop`,
    /// `next`, `previous`).
    ///
    /// # Errors
    /// `Disconnected` when no core is paired, or the core's refusal.
    pub async fn control(&self, zone_or_output_id: &str, control: &str) -> MooResult<()> {
        log::debug!("[Roon] {} -> {}", zone_or_output_id, control);
        self.inner
            .transport(
                "control",
                json!({ "zone_or_output_id": zone_or_output_id, "control": control }),
            )
            .await
    }

    /// Seeks to an absolute position in seconds.
    pub async fn seek(&self, zone_or_output_id: &str, seconds: f64) -> MooResult<()> {
        self.inner
            .transport(
                "seek",
                json!({
                    "zone_or_output_id": zone_or_output_id,
                    "how": "absolute",
                    "seconds": seconds.round() as i64,
                }),
            )
            .await
    }

    /// Sends a raw volume change for one output.
    pub async fn change_volume(&self, output_id: &str, change: VolumeChange) -> MooResult<()> {
        self.inner.change_volume(output_id, change).await
    }

    /// Sets an output's absolute volume, clamped to the output's own range.
    /// Returns the value sent.
    pub async fn set_volume(&self, output_id: &str, value: f64) -> MooResult<f64> {
        let control = self
            .inner
            .output_volume(output_id)
            .and_then(|v| v.control());
        let target = VolumeRange::from_descriptor(control.as_ref()).clamp(value);
        self.inner
            .change_volume(output_id, VolumeChange::Absolute(target))
            .await?;
        Ok(target)
    }

    /// Queues a relative volume change. Returns false if not running.
    pub fn adjust_volume(&self, output_id: &str, delta: f64) -> bool {
        match self.batcher.lock().as_ref() {
            Some(batcher) => {
                batcher.request(output_id, delta);
                true
            }
            None => false,
        }
    }

    /// Feeds an event straight into the state machine.
    #[cfg(test)]
    pub(crate) fn inject(&self, event: CoreEvent) {
        self.inner.apply(event);
    }

    /// Image URL for `image_key` on the core's HTTP endpoint.
    #[must_use]
    pub fn image_url(&self, image_key: &str, width: Option<u32>, height: Option<u32>) -> String {
        let base = format!(
            "http://{}:{}/api/image/{}",
            self.inner.config.host, self.inner.config.port, image_key
        );
        match (width, height) {
            (None, None) => base,
            (w, h) => {
                let mut url = format!("{}?scale=fit", base);
                if let Some(w) = w.or(h) {
                    url.push_str(&format!("&width={}", w));
                }
                if let Some(h) = h.or(w) {
                    url.push_str(&format!("&height={}", h));
                }
                url
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl RoonInner {
    fn timeout(&self) -> Duration {
        Duration::from_millis(self.config.request_timeout_ms)
    }

    fn ws_url(&self) -> String {
        format!("ws://{}:{}/api", self.config.host, self.config.port)
    }

    fn link(&self) -> MooResult<MooLink> {
        self.link.read().clone().ok_or(MooError::Disconnected)
    }

    // ── Event application ───────────────────────────────────────────────────

    /// Single consumer of core events; also wakes for the grace and purge
    /// deadlines.
    async fn run_events(
        &self,
        mut rx: mpsc::UnboundedReceiver<CoreEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            let (grace_at, purge_at) = {
                let state = self.state.read();
                (state.grace_deadline(), state.purge_deadline())
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => self.apply(event),
                    None => break,
                },
                _ = sleep_until(grace_at) => self.expire_grace_if_due(),
                _ = sleep_until(purge_at) => self.purge_if_due(),
            }
        }
        log::debug!("[Roon] Event loop stopped");
    }

    fn apply(&self, event: CoreEvent) {
        match event {
            CoreEvent::Paired {
                core_id,
                display_name,
            } => {
                {
                    let mut state = self.state.write();
                    if state.core_id.as_deref() != Some(core_id.as_str()) {
                        state.zones.clear();
                    }
                    state.core_id = Some(core_id);
                    state.pairing = Pairing::Paired {
                        display_name: display_name.clone(),
                    };
                }
                *self.last_error.lock() = None;
                self.throttle.reset("core");
                log::info!("[Roon] Paired with core {}", display_name);
                self.events.connection_changed(true);
            }
            CoreEvent::Unpaired => {
                {
                    let mut state = self.state.write();
                    state.pairing = Pairing::Unpaired {
                        since: Some(Instant::now()),
                    };
                    state.grace_expired = false;
                }
                log::info!("[Roon] Core unpaired, serving cached zones for {:?}", UNPAIRED_GRACE);
                self.events.connection_changed(false);
            }
            CoreEvent::ZonesSnapshot(zones) => {
                log::debug!("[Roon] Zone snapshot: {} zone(s)", zones.len());
                self.state.write().zones = zones
                    .into_iter()
                    .map(|z| (z.zone_id.clone(), z))
                    .collect();
                self.events.zones_changed();
            }
            CoreEvent::ZonesChanged { changed, removed } => {
                {
                    let mut state = self.state.write();
                    for id in &removed {
                        state.zones.remove(id);
                    }
                    for zone in changed {
                        state.zones.insert(zone.zone_id.clone(), zone);
                    }
                }
                self.events.zones_changed();
            }
            CoreEvent::SeekChanged(updates) => {
                let mut state = self.state.write();
                for update in updates {
                    if let Some(zone) = state.zones.get_mut(&update.zone_id) {
                        zone.seek_position = update.seek_position;
                        if let Some(np) = zone.now_playing.as_mut() {
                            np.seek_position = update.seek_position;
                        }
                    }
                }
            }
        }
    }

    fn expire_grace_if_due(&self) {
        let expired = {
            let mut state = self.state.write();
            match state.grace_deadline() {
                Some(deadline) if Instant::now() >= deadline => {
                    state.grace_expired = true;
                    true
                }
                _ => false,
            }
        };
        if expired {
            log::info!("[Roon] Core still unpaired after {:?}, hiding zones", UNPAIRED_GRACE);
            self.events.zones_changed();
        }
    }

    fn purge_if_due(&self) {
        let purged = {
            let mut state = self.state.write();
            match state.purge_deadline() {
                Some(deadline) if Instant::now() >= deadline => {
                    let count = state.zones.len();
                    state.zones.clear();
                    Some(count)
                }
                _ => None,
            }
        };
        if let Some(count) = purged {
            log::info!("[Roon] Core gone for {:?}, dropped {} zone(s)", UNPAIRED_PURGE, count);
            self.events.zones_changed();
        }
    }

    fn output_volume(&self, output_id: &str) -> Option<super::RoonVolume> {
        self.state
            .read()
            .zones
            .values()
            .flat_map(|z| z.outputs.iter())
            .find(|o| o.output_id == output_id)
            .and_then(|o| o.volume.clone())
    }

    // ── Session ─────────────────────────────────────────────────────────────

    /// One connection attempt, held until it fails. `paired` is set once the
    /// core accepted the registration.
    async fn run_session(
        &self,
        events: &mpsc::UnboundedSender<CoreEvent>,
        paired: &mut bool,
    ) -> MooError {
        let url = self.ws_url();
        let (link, pump) = match transport::connect(&url, self.timeout()).await {
            Ok(connected) => connected,
            Err(e) => return e,
        };
        log::debug!("[Roon] WebSocket open to {}", url);

        tokio::select! {
            error = pump.run() => error,
            result = self.session(&link, events, paired) => match result {
                Ok(never) => match never {},
                Err(error) => error,
            },
        }
    }

    async fn session(
        &self,
        link: &MooLink,
        events: &mpsc::UnboundedSender<CoreEvent>,
        paired: &mut bool,
    ) -> MooResult<std::convert::Infallible> {
        let info: CoreInfo = link
            .request(&format!("{}/info", ROON_REGISTRY_SERVICE), None)
            .await?
            .json()?;
        log::info!(
            "[Roon] Found core {} ({}){}",
            info.display_name,
            info.core_id,
            info.display_version
                .as_deref()
                .map(|v| format!(" version {}", v))
                .unwrap_or_default()
        );

        let token = self.tokens.get(&info.core_id);
        if token.is_none() {
            log::info!(
                "[Roon] Enable \"{}\" under Settings > Extensions in Roon to finish pairing",
                APP_NAME
            );
        }
        let registration: Registration = link
            .request_untimed(
                &format!("{}/register", ROON_REGISTRY_SERVICE),
                Some(registration_body(token)),
            )
            .await?
            .json()?;
        if let Some(token) = &registration.token {
            self.tokens.save(&registration.core_id, token);
        }

        *self.link.write() = Some(link.clone());
        *paired = true;
        let _ = events.send(CoreEvent::Paired {
            core_id: registration.core_id,
            display_name: registration.display_name,
        });

        let mut updates = link.subscribe(
            &format!("{}/subscribe_zones", ROON_TRANSPORT_SERVICE),
            Some(json!({ "subscription_key": 0 })),
        )?;
        while let Some(message) = updates.recv().await {
            if message.is_error() {
                return Err(MooError::Request(format!(
                    "subscribe_zones -> {}",
                    message.name
                )));
            }
            match zone_events(&message) {
                Ok(batch) => {
                    for event in batch {
                        let _ = events.send(event);
                    }
                }
                Err(e) => log::warn!("[Roon] Ignoring zone update: {}", e),
            }
        }
        Err(MooError::Disconnected)
    }

    // ── Commands ────────────────────────────────────────────────────────────

    async fn transport(&self, method: &str, body: Value) -> MooResult<()> {
        self.link()?
            .request(&format!("{}/{}", ROON_TRANSPORT_SERVICE, method), Some(body))
            .await?;
        Ok(())
    }

    async fn change_volume(&self, output_id: &str, change: VolumeChange) -> MooResult<()> {
        let (how, value) = match change {
            VolumeChange::Absolute(v) => ("absolute", v),
            VolumeChange::Relative(v) => ("relative", v),
        };
        self.transport(
            "change_volume",
            json!({ "output_id": output_id, "how": how, "value": value }),
        )
        .await
    }
}

/// Name shown in Roon's extension list; the host tells bridges apart.
fn instance_name() -> String {
    match hostname::get() {
        Ok(host) => format!("{} ({})", APP_NAME, host.to_string_lossy()),
        Err(_) => APP_NAME.to_string(),
    }
}

fn registration_body(token: Option<String>) -> Value {
    let mut body = json!({
        "extension_id": EXTENSION_ID,
        "display_name": instance_name(),
        "display_version": env!("CARGO_PKG_VERSION"),
        "publisher": APP_NAME,
        "email": "",
        "required_services": [ROON_TRANSPORT_SERVICE],
        "optional_services": [],
        "provided_services": [ROON_PING_SERVICE],
    });
    if let (Some(token), Some(map)) = (token, body.as_object_mut()) {
        map.insert("token".into(), Value::String(token));
    }
    body
}

#[async_trait]
impl VolumeSink for RoonInner {
    async fn apply_step(&self, output_id: &str, step: f64) -> BridgeResult<()> {
        if self.output_volume(output_id).is_none() {
            return Err(BridgeError::ZoneNotFound(output_id.to_string()));
        }
        self.change_volume(output_id, VolumeChange::Relative(step))
            .await
            .map_err(BridgeError::from)
    }
}
