//! Polling JSON-RPC client for Logitech Media Server.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use reqwest::Client;
use serde_json::{json, Value};
use tokio::time::MissedTickBehavior;

use super::types::{parse_players, parse_status, LmsPlayer, LmsStatus, PlayMode};
use super::{LmsError, LmsResult};
use crate::config::LmsConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::events::ZoneEvents;
use crate::protocol_constants::{DEVICE_ERROR_LOG_INTERVAL, LMS_MAX_PLAYERS, LMS_REQUEST_TIMEOUT_SECS};
use crate::runtime::BackgroundTasks;
use crate::utils::LogThrottle;
use crate::volume::{clamp, RelativeVolumeBatcher, VolumeSink};

/// Tags requested with every `status` query: artist, coverid, album,
/// artwork_url, duration, remote title, artwork track id, tracknum.
const STATUS_TAGS: &str = "tags:aclKdNJt";

/// Player commands, expressed in the LMS CLI vocabulary.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LmsCommand {
    Play,
    /// `pause 1`
    Pause,
    /// `pause 0`
    Resume,
    /// Bare `pause` flips the current state.
    TogglePause,
    Stop,
    Next,
    Previous,
    /// Absolute position in seconds.
    Seek(f64),
}

impl LmsCommand {
    /// CLI arguments of the command.
    #[must_use]
    pub fn args(&self) -> Vec<String> {
        let args: &[&str] = match self {
            Self::Play => &["play"],
            Self::Pause => &["pause", "1"],
            Self::Resume => &["pause", "0"],
            Self::TogglePause => &["pause"],
            Self::Stop => &["stop"],
            Self::Next => &["playlist", "index", "+1"],
            Self::Previous => &["playlist", "index", "-1"],
            Self::Seek(seconds) => {
                return vec!["time".to_string(), format_number(seconds.max(0.0))];
            }
        };
        args.iter().map(|s| (*s).to_string()).collect()
    }
}

/// Integers without a trailing `.0`, everything else with one decimal.
fn format_number(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{}", value as i64)
    } else {
        format!("{:.1}", value)
    }
}

/// Logitech Media Server client.
pub struct LmsClient {
    inner: Arc<LmsInner>,
    tasks: BackgroundTasks,
    batcher: Mutex<Option<RelativeVolumeBatcher>>,
}

struct LmsInner {
    http: Client,
    config: LmsConfig,
    base_url: String,
    events: ZoneEvents,
    players: RwLock<Vec<LmsPlayer>>,
    connected: AtomicBool,
    last_error: Mutex<Option<String>>,
    throttle: LogThrottle,
}

impl LmsClient {
    /// Creates a stopped client for the server in `config`.
    pub fn new(http: Client, config: LmsConfig, events: ZoneEvents) -> Self {
        let base_url = format!("http://{}:{}", config.host, config.port);
        Self {
            inner: Arc::new(LmsInner {
                http,
                config,
                base_url,
                events,
                players: RwLock::new(Vec::new()),
                connected: AtomicBool::new(false),
                last_error: Mutex::new(None),
                throttle: LogThrottle::new(DEVICE_ERROR_LOG_INTERVAL),
            }),
            tasks: BackgroundTasks::new("LMS"),
            batcher: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.inner.base_url
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.tasks.is_running()
    }

    /// Whether the last poll reached the server.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.inner.last_error.lock().clone()
    }

    /// Starts the poll loop. Does nothing if already running.
    pub fn start(&self) {
        if self.tasks.is_running() {
            return;
        }
        log::info!(
            "[LMS] Polling {} every {}ms",
            self.inner.base_url,
            self.inner.config.poll_interval_ms
        );

        *self.batcher.lock() = Some(RelativeVolumeBatcher::new(
            "LMS",
            Arc::clone(&self.inner) as Arc<dyn VolumeSink>,
            self.tasks.token(),
        ));

        let inner = Arc::clone(&self.inner);
        self.tasks.spawn(move |cancel| async move {
            let period = Duration::from_millis(inner.config.poll_interval_ms);
            let mut interval = tokio::time::interval(period);
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
            log::debug!("[LMS] Poll loop stopped");
        });
    }

    /// Stops polling and pending volume flushes, then forgets all players.
    pub async fn stop(&self) {
        if let Some(batcher) = self.batcher.lock().take() {
            batcher.stop();
        }
        self.tasks.shutdown().await;

        let had_players = {
            let mut players = self.inner.players.write();
            let had = !players.is_empty();
            players.clear();
            had
        };
        if had_players {
            self.inner.events.zones_changed();
        }
        if self.inner.connected.swap(false, Ordering::SeqCst) {
            self.inner.events.connection_changed(false);
        }
        log::info!("[LMS] Stopped");
    }

    /// Runs one poll immediately, outside the loop's schedule.
    pub async fn poll_now(&self) {
        self.inner.poll().await;
    }

    #[must_use]
    pub fn players(&self) -> Vec<LmsPlayer> {
        self.inner.players.read().clone()
    }

    #[must_use]
    pub fn player(&self, player_id: &str) -> Option<LmsPlayer> {
        self.inner.player(player_id)
    }

    #[must_use]
    pub fn player_count(&self) -> usize {
        self.inner.players.read().len()
    }

    /// Sends a transport command to one player.
    ///
    /// # Errors
    /// Transport or JSON-RPC failures.
    pub async fn send(&self, player_id: &str, command: LmsCommand) -> LmsResult<()> {
        log::debug!("[LMS] {} -> {:?}", player_id, command);
        self.inner.rpc(player_id, &command.args()).await?;
        Ok(())
    }

    /// Sets an absolute volume, clamped to 0..=100. Returns the value sent.
    ///
    /// # Errors
    /// Transport or JSON-RPC failures.
    pub async fn set_volume(&self, player_id: &str, value: f64) -> LmsResult<f64> {
        self.inner.set_volume(player_id, value).await
    }

    /// Queues a relative volume change. Returns false if the client is not running.
    pub fn adjust_volume(&self, player_id: &str, delta: f64) -> bool {
        match self.batcher.lock().as_ref() {
            Some(batcher) => {
                batcher.request(player_id, delta);
                true
            }
            None => false,
        }
    }

    /// Server URL of a local cover, optionally resized by the server.
    #[must_use]
    pub fn cover_url(&self, coverid: &str, width: Option<u32>, height: Option<u32>) -> String {
        let file = match (width, height) {
            (Some(w), Some(h)) => format!("cover_{}x{}.jpg", w, h),
            (Some(s), None) | (None, Some(s)) => format!("cover_{}x{}.jpg", s, s),
            (None, None) => "cover.jpg".to_string(),
        };
        format!("{}/music/{}/{}", self.inner.base_url, coverid, file)
    }

    /// Makes a status `artwork_url` absolute.
    #[must_use]
    pub fn resolve_url(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else {
            format!("{}/{}", self.inner.base_url, url.trim_start_matches('/'))
        }
    }

    /// Artwork URL for a player's current track.
    ///
    /// Remote streams use their `artwork_url`; local tracks the cover id.
    #[must_use]
    pub fn status_artwork(
        &self,
        status: &LmsStatus,
        width: Option<u32>,
        height: Option<u32>,
    ) -> Option<String> {
        let cover = status
            .coverid
            .as_deref()
            .map(|id| self.cover_url(id, width, height));
        let remote = status.artwork_url.as_deref().map(|url| self.resolve_url(url));
        if status.remote {
            remote.or(cover)
        } else {
            cover.or(remote)
        }
    }
}

impl LmsInner {
    fn player(&self, player_id: &str) -> Option<LmsPlayer> {
        self.players.read().iter().find(|p| p.id == player_id).cloned()
    }

    /// Issues one `slim.request`; `player_id` is empty for server commands.
    async fn rpc(&self, player_id: &str, args: &[String]) -> LmsResult<Value> {
        let body = json!({
            "id": 1,
            "method": "slim.request",
            "params": [player_id, args],
        });

        let mut request = self
            .http
            .post(format!("{}/jsonrpc.js", self.base_url))
            .timeout(Duration::from_secs(LMS_REQUEST_TIMEOUT_SECS))
            .json(&body);
        if let Some(user) = &self.config.username {
            request = request.basic_auth(user, self.config.password.as_deref());
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(LmsError::HttpStatus(status.as_u16()));
        }

        let mut reply: Value = response.json().await?;
        if let Some(err) = reply.get("error").filter(|e| !e.is_null()) {
            return Err(LmsError::Rpc(err.to_string()));
        }
        Ok(reply.get_mut("result").map(Value::take).unwrap_or(Value::Null))
    }

    /// Fetches the player list and every player's status.
    ///
    /// A player whose status query fails keeps its previous status. Returns
    /// true if the player set or any player's mode changed.
    async fn refresh(&self) -> LmsResult<bool> {
        let listing = self
            .rpc(
                "",
                &["players".to_string(), "0".to_string(), LMS_MAX_PLAYERS.to_string()],
            )
            .await?;
        let mut players = parse_players(&listing);

        let status_args = ["status", "-", "1", STATUS_TAGS].map(String::from);
        let statuses = join_all(players.iter().map(|p| self.rpc(&p.id, &status_args))).await;

        let mut cache = self.players.write();
        for (player, status) in players.iter_mut().zip(statuses) {
            match status {
                Ok(result) => player.status = Some(parse_status(&result)),
                Err(e) => {
                    log::debug!("[LMS] Status of {} failed: {}", player.name, e);
                    player.status = cache
                        .iter()
                        .find(|p| p.id == player.id)
                        .and_then(|p| p.status.clone());
                }
            }
        }

        let fingerprint = |list: &[LmsPlayer]| {
            list.iter()
                .map(|p| (p.id.clone(), p.name.clone(), p.connected, p.mode()))
                .collect::<Vec<(String, String, bool, PlayMode)>>()
        };
        let changed = fingerprint(cache.as_slice()) != fingerprint(players.as_slice());
        if cache.len() != players.len() {
            log::info!("[LMS] {} player(s) -> {}", cache.len(), players.len());
        }
        *cache = players;
        Ok(changed)
    }

    /// One poll cycle, including connection-state bookkeeping.
    async fn poll(&self) {
        match self.refresh().await {
            Ok(changed) => {
                *self.last_error.lock() = None;
                self.throttle.reset("server");
                if !self.connected.swap(true, Ordering::SeqCst) {
                    log::info!("[LMS] Connected to {}", self.base_url);
                    self.events.connection_changed(true);
                }
                if changed {
                    self.events.zones_changed();
                }
            }
            Err(e) => {
                *self.last_error.lock() = Some(e.to_string());
                if self.throttle.should_log("server") {
                    log::warn!("[LMS] Poll of {} failed: {}", self.base_url, e);
                }
                if self.connected.swap(false, Ordering::SeqCst) {
                    self.events.connection_changed(false);
                    let had_players = {
                        let mut players = self.players.write();
                        let had = !players.is_empty();
                        players.clear();
                        had
                    };
                    if had_players {
                        self.events.zones_changed();
                    }
                }
            }
        }
    }

    async fn set_volume(&self, player_id: &str, value: f64) -> LmsResult<f64> {
        let target = clamp(value, 0.0, 100.0).round();
        self.rpc(
            player_id,
            &["mixer".to_string(), "volume".to_string(), format_number(target)],
        )
        .await?;

        if let Some(status) = self
            .players
            .write()
            .iter_mut()
            .find(|p| p.id == player_id)
            .and_then(|p| p.status.as_mut())
        {
            status.volume = Some(target);
        }
        Ok(target)
    }
}

#[async_trait]
impl VolumeSink for LmsInner {
    async fn apply_step(&self, player_id: &str, step: f64) -> BridgeResult<()> {
        let player = self
            .player(player_id)
            .ok_or_else(|| BridgeError::ZoneNotFound(player_id.to_string()))?;
        let current = player.status.and_then(|s| s.volume).ok_or_else(|| {
            BridgeError::BackendUnavailable(format!("volume of {} is unknown", player_id))
        })?;
        self.set_volume(player_id, current + step).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CountingEventEmitter;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn commands_use_cli_vocabulary() {
        assert_eq!(LmsCommand::Pause.args(), vec!["pause", "1"]);
        assert_eq!(LmsCommand::Resume.args(), vec!["pause", "0"]);
        assert_eq!(LmsCommand::TogglePause.args(), vec!["pause"]);
        assert_eq!(LmsCommand::Next.args(), vec!["playlist", "index", "+1"]);
        assert_eq!(LmsCommand::Seek(93.0).args(), vec!["time", "93"]);
        assert_eq!(LmsCommand::Seek(12.4).args(), vec!["time", "12.4"]);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Mock server
    // ─────────────────────────────────────────────────────────────────────────

    /// Minimal LMS: a player list, a shared mixer volume, and a command log.
    #[derive(Default)]
    struct MockLms {
        players: Mutex<Vec<(&'static str, &'static str)>>,
        volume: Mutex<f64>,
        commands: Mutex<Vec<(String, Vec<String>)>>,
        authorization: Mutex<Option<String>>,
    }

    impl MockLms {
        fn reply(&self, player: &str, args: &[String]) -> Value {
            match args.first().map(String::as_str) {
                Some("players") => {
                    let loop_: Vec<Value> = self
                        .players
                        .lock()
                        .iter()
                        .map(|(id, name)| json!({"playerid": id, "name": name, "connected": 1}))
                        .collect();
                    json!({"count": loop_.len(), "players_loop": loop_})
                }
                Some("status") => json!({
                    "mode": "play",
                    "time": 10,
                    "mixer volume": *self.volume.lock(),
                    "playlist_loop": [{"title": "Blue in Green", "coverid": "c0ffee"}]
                }),
                _ => {
                    if args.len() == 3 && args[0] == "mixer" {
                        if let Ok(v) = args[2].parse() {
                            *self.volume.lock() = v;
                        }
                    }
                    self.commands.lock().push((player.to_string(), args.to_vec()));
                    json!({})
                }
            }
        }
    }

    async fn spawn_server(mock: Arc<MockLms>) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let mock = mock.clone();
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let mut chunk = [0u8; 4096];
                    let (header_end, content_length) = loop {
                        match socket.read(&mut chunk).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => buf.extend_from_slice(&chunk[..n]),
                        }
                        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                            let head = String::from_utf8_lossy(&buf[..pos]).to_ascii_lowercase();
                            let len = head
                                .lines()
                                .find_map(|l| l.strip_prefix("content-length:"))
                                .and_then(|v| v.trim().parse::<usize>().ok())
                                .unwrap_or(0);
                            break (pos + 4, len);
                        }
                    };
                    while buf.len() < header_end + content_length {
                        match socket.read(&mut chunk).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => buf.extend_from_slice(&chunk[..n]),
                        }
                    }

                    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
                    if let Some(auth) = head.lines().find_map(|l| {
                        let (name, value) = l.split_once(':')?;
                        name.eq_ignore_ascii_case("authorization").then(|| value.trim().to_string())
                    }) {
                        *mock.authorization.lock() = Some(auth);
                    }

                    let request: Value =
                        serde_json::from_slice(&buf[header_end..header_end + content_length])
                            .unwrap();
                    let player = request["params"][0].as_str().unwrap_or("").to_string();
                    let args: Vec<String> = request["params"][1]
                        .as_array()
                        .unwrap()
                        .iter()
                        .map(|a| a.as_str().unwrap().to_string())
                        .collect();

                    let body = json!({"id": 1, "result": mock.reply(&player, &args)}).to_string();
                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                });
            }
        });

        port
    }

    async fn client_for(
        mock: Arc<MockLms>,
        configure: impl FnOnce(&mut LmsConfig),
    ) -> (LmsClient, Arc<CountingEventEmitter>) {
        let port = spawn_server(mock).await;
        let mut config = LmsConfig {
            host: "127.0.0.1".into(),
            port,
            ..LmsConfig::default()
        };
        configure(&mut config);
        let emitter = Arc::new(CountingEventEmitter::default());
        let client = LmsClient::new(Client::new(), config, ZoneEvents::new("lms", emitter.clone()));
        (client, emitter)
    }

    fn mock_with_players(players: &[(&'static str, &'static str)], volume: f64) -> Arc<MockLms> {
        let mock = Arc::new(MockLms::default());
        *mock.players.lock() = players.to_vec();
        *mock.volume.lock() = volume;
        mock
    }

    #[tokio::test]
    async fn poll_caches_players_and_notifies_on_change_only() {
        let mock = mock_with_players(&[("00:04:20:aa:bb:cc", "Kitchen"), ("b8:27:eb:00:11:22", "Study")], 35.0);
        let (client, emitter) = client_for(mock.clone(), |_| {}).await;

        client.poll_now().await;
        assert!(client.is_connected());
        assert_eq!(emitter.status(), 1);
        assert_eq!(emitter.zones(), 1);

        let kitchen = client.player("00:04:20:aa:bb:cc").unwrap();
        let status = kitchen.status.unwrap();
        assert_eq!(status.mode, PlayMode::Play);
        assert_eq!(status.volume, Some(35.0));
        assert_eq!(status.title.as_deref(), Some("Blue in Green"));

        client.poll_now().await;
        assert_eq!(emitter.zones(), 1, "unchanged poll must not notify");

        mock.players.lock().retain(|(id, _)| *id != "b8:27:eb:00:11:22");
        client.poll_now().await;
        assert_eq!(client.player_count(), 1);
        assert_eq!(emitter.zones(), 2);
    }

    #[tokio::test]
    async fn absolute_volume_is_clamped() {
        let mock = mock_with_players(&[("p1", "Den")], 50.0);
        let (client, _) = client_for(mock.clone(), |_| {}).await;
        client.poll_now().await;

        let sent = client.set_volume("p1", 150.0).await.unwrap();
        assert_eq!(sent, 100.0);
        let sent = client.set_volume("p1", -3.0).await.unwrap();
        assert_eq!(sent, 0.0);

        let commands = mock.commands.lock().clone();
        assert_eq!(commands[0].1, vec!["mixer", "volume", "100"]);
        assert_eq!(commands[1].1, vec!["mixer", "volume", "0"]);
    }

    #[tokio::test]
    async fn volume_step_resolves_against_cached_level() {
        let mock = mock_with_players(&[("p1", "Den")], 90.0);
        let (client, _) = client_for(mock.clone(), |_| {}).await;
        client.poll_now().await;

        client.inner.apply_step("p1", 25.0).await.unwrap();
        assert_eq!(*mock.volume.lock(), 100.0);
        assert_eq!(
            client.player("p1").unwrap().status.unwrap().volume,
            Some(100.0)
        );

        let err = client.inner.apply_step("ghost", 5.0).await.unwrap_err();
        assert!(matches!(err, BridgeError::ZoneNotFound(_)));
    }

    #[tokio::test]
    async fn credentials_are_sent_as_basic_auth() {
        let mock = mock_with_players(&[], 0.0);
        let (client, _) = client_for(mock.clone(), |c| {
            c.username = Some("admin".into());
            c.password = Some("secret".into());
        })
        .await;
        client.poll_now().await;

        // base64("admin:secret")
        assert_eq!(
            mock.authorization.lock().as_deref(),
            Some("Basic YWRtaW46c2VjcmV0")
        );
    }

    #[tokio::test]
    async fn unreachable_server_records_error_without_connecting() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let emitter = Arc::new(CountingEventEmitter::default());
        let client = LmsClient::new(
            Client::new(),
            LmsConfig {
                host: "127.0.0.1".into(),
                port,
                ..LmsConfig::default()
            },
            ZoneEvents::new("lms", emitter.clone()),
        );

        client.poll_now().await;
        assert!(!client.is_connected());
        assert!(client.last_error().is_some());
        assert_eq!(emitter.status(), 0);
    }

    #[test]
    fn artwork_prefers_cover_for_local_and_url_for_remote() {
        let client = LmsClient::new(
            Client::new(),
            LmsConfig {
                host: "lms.local".into(),
                ..LmsConfig::default()
            },
            ZoneEvents::noop("lms"),
        );

        assert_eq!(
            client.cover_url("c0ffee", Some(300), Some(300)),
            "http://lms.local:9000/music/c0ffee/cover_300x300.jpg"
        );

        let mut status = LmsStatus {
            coverid: Some("c0ffee".into()),
            artwork_url: Some("/imageproxy/abc/image.jpg".into()),
            ..LmsStatus::default()
        };
        assert_eq!(
            client.status_artwork(&status, None, None).unwrap(),
            "http://lms.local:9000/music/c0ffee/cover.jpg"
        );

        status.remote = true;
        assert_eq!(
            client.status_artwork(&status, None, None).unwrap(),
            "http://lms.local:9000/imageproxy/abc/image.jpg"
        );
    }
}
