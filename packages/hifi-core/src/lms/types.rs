//! LMS player and status records parsed from JSON-RPC results.
//!
//! LMS is loose with JSON types: numbers arrive as strings, booleans as
//! `0`/`1`, and keys contain spaces (`mixer volume`). Parsing therefore walks
//! `serde_json::Value` instead of deriving.

use serde::Serialize;
use serde_json::Value;

/// Player transport mode as reported by `status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayMode {
    Play,
    Pause,
    Stop,
    #[default]
    Unknown,
}

impl PlayMode {
    #[must_use]
    pub fn parse(mode: &str) -> Self {
        match mode {
            "play" => Self::Play,
            "pause" => Self::Pause,
            "stop" => Self::Stop,
            _ => Self::Unknown,
        }
    }
}

/// Status of one player (`status - 1 tags:aclKdNJt`).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LmsStatus {
    pub mode: PlayMode,
    /// Elapsed seconds.
    pub time: Option<f64>,
    /// Track length in seconds.
    pub duration: Option<f64>,
    /// Volume 0..=100; LMS reports muted players as a negative volume.
    pub volume: Option<f64>,
    pub muted: bool,
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    /// Local cover art id (served under `/music/{coverid}/...`).
    pub coverid: Option<String>,
    /// Artwork of remote streams, absolute or relative to the server.
    pub artwork_url: Option<String>,
    /// Whether the current track is a remote stream.
    pub remote: bool,
}

/// A player with its most recent status.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LmsPlayer {
    /// MAC-style player id.
    pub id: String,
    pub name: String,
    pub model: Option<String>,
    pub connected: bool,
    /// `None` when the status query failed this round.
    pub status: Option<LmsStatus>,
}

impl LmsPlayer {
    #[must_use]
    pub fn mode(&self) -> PlayMode {
        self.status.as_ref().map_or(PlayMode::Unknown, |s| s.mode)
    }

    #[must_use]
    pub fn is_playing(&self) -> bool {
        self.mode() == PlayMode::Play
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Lenient Field Access
// ─────────────────────────────────────────────────────────────────────────────

fn number(value: Option<&Value>) -> Option<f64> {
    let n = match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    n.filter(|n: &f64| n.is_finite())
}

fn flag(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(other) => number(Some(other)).is_some_and(|n| n != 0.0),
        None => false,
    }
}

fn text(value: Option<&Value>) -> Option<String> {
    let s = match value? {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!s.is_empty()).then_some(s)
}

// ─────────────────────────────────────────────────────────────────────────────
// Parsers
// ─────────────────────────────────────────────────────────────────────────────

/// Parses the result of `players 0 N`. Status is filled in separately.
#[must_use]
pub fn parse_players(result: &Value) -> Vec<LmsPlayer> {
    let Some(players) = result.get("players_loop").and_then(Value::as_array) else {
        return Vec::new();
    };

    players
        .iter()
        .filter_map(|p| {
            let id = text(p.get("playerid"))?;
            let name = text(p.get("name")).unwrap_or_else(|| id.clone());
            Some(LmsPlayer {
                id,
                name,
                model: text(p.get("modelname")).or_else(|| text(p.get("model"))),
                connected: flag(p.get("connected")),
                status: None,
            })
        })
        .collect()
}

/// Parses the result of `status - 1 tags:...`.
#[must_use]
pub fn parse_status(result: &Value) -> LmsStatus {
    let track = result
        .get("playlist_loop")
        .and_then(Value::as_array)
        .and_then(|l| l.first());
    let remote_meta = result.get("remoteMeta");
    let field = |key: &str| {
        track
            .and_then(|t| text(t.get(key)))
            .or_else(|| remote_meta.and_then(|m| text(m.get(key))))
    };

    let raw_volume = number(result.get("mixer volume"));

    LmsStatus {
        mode: result
            .get("mode")
            .and_then(Value::as_str)
            .map_or(PlayMode::Unknown, PlayMode::parse),
        time: number(result.get("time")),
        duration: number(result.get("duration"))
            .or_else(|| track.and_then(|t| number(t.get("duration")))),
        volume: raw_volume.map(f64::abs),
        muted: raw_volume.is_some_and(|v| v < 0.0),
        title: field("title").or_else(|| text(result.get("current_title"))),
        artist: field("artist"),
        album: field("album"),
        coverid: track.and_then(|t| text(t.get("coverid"))),
        artwork_url: field("artwork_url"),
        remote: flag(result.get("remote")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn players_loop_parses_loose_types() {
        let result = json!({
            "count": 2,
            "players_loop": [
                {"playerid": "00:04:20:aa:bb:cc", "name": "Kitchen", "modelname": "Squeezebox Touch", "connected": 1},
                {"playerid": "b8:27:eb:00:11:22", "name": "", "model": "squeezelite", "connected": "0"},
                {"name": "no id"}
            ]
        });
        let players = parse_players(&result);
        assert_eq!(players.len(), 2);
        assert_eq!(players[0].name, "Kitchen");
        assert!(players[0].connected);
        assert_eq!(players[0].model.as_deref(), Some("Squeezebox Touch"));
        assert_eq!(players[1].name, "b8:27:eb:00:11:22");
        assert!(!players[1].connected);
    }

    #[test]
    fn status_reads_track_and_mixer() {
        let result = json!({
            "mode": "play",
            "time": 42.7,
            "duration": "215.3",
            "mixer volume": 35,
            "playlist_loop": [{
                "title": "So What",
                "artist": "Miles Davis",
                "album": "Kind of Blue",
                "coverid": "a1b2c3d4"
            }]
        });
        let status = parse_status(&result);
        assert_eq!(status.mode, PlayMode::Play);
        assert_eq!(status.time, Some(42.7));
        assert_eq!(status.duration, Some(215.3));
        assert_eq!(status.volume, Some(35.0));
        assert!(!status.muted);
        assert_eq!(status.title.as_deref(), Some("So What"));
        assert_eq!(status.coverid.as_deref(), Some("a1b2c3d4"));
    }

    #[test]
    fn negative_mixer_volume_means_muted() {
        let status = parse_status(&json!({"mode": "pause", "mixer volume": "-20"}));
        assert_eq!(status.mode, PlayMode::Pause);
        assert_eq!(status.volume, Some(20.0));
        assert!(status.muted);
    }

    #[test]
    fn remote_stream_falls_back_to_remote_meta() {
        let result = json!({
            "mode": "play",
            "remote": 1,
            "current_title": "Radio Paradise",
            "remoteMeta": {
                "artist": "Nils Frahm",
                "artwork_url": "https://img.radioparadise.com/covers/l/123.jpg"
            }
        });
        let status = parse_status(&result);
        assert!(status.remote);
        assert_eq!(status.title.as_deref(), Some("Radio Paradise"));
        assert_eq!(status.artist.as_deref(), Some("Nils Frahm"));
        assert!(status.artwork_url.unwrap().starts_with("https://"));
        assert!(status.coverid.is_none());
    }

    #[test]
    fn empty_status_is_unknown() {
        let status = parse_status(&json!({}));
        assert_eq!(status.mode, PlayMode::Unknown);
        assert!(status.volume.is_none());
    }
}
