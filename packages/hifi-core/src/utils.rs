//! General utilities shared across the application.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;

// ─────────────────────────────────────────────────────────────────────────────
// Time Utilities
// ─────────────────────────────────────────────────────────────────────────────

/// Returns the current Unix timestamp in milliseconds.
///
/// Returns 0 if the system clock is before the Unix epoch (shouldn't happen in practice).
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Parses `H:MM:SS` / `MM:SS` / `SS` (optionally with `.fff`) into seconds.
///
/// Returns `None` for empty input and for UPnP's `NOT_IMPLEMENTED`.
#[must_use]
pub fn parse_hms(value: &str) -> Option<f64> {
    let value = value.trim();
    if value.is_empty() || value.eq_ignore_ascii_case("NOT_IMPLEMENTED") {
        return None;
    }

    let mut total = 0.0;
    for part in value.split(':') {
        let n: f64 = part.trim().parse().ok()?;
        if n < 0.0 {
            return None;
        }
        total = total * 60.0 + n;
    }
    Some(total)
}

/// Formats seconds as `H:MM:SS` (UPnP `REL_TIME` target format).
#[must_use]
pub fn format_hms(seconds: f64) -> String {
    let total = if seconds.is_finite() && seconds > 0.0 {
        seconds.round() as u64
    } else {
        0
    };
    format!("{}:{:02}:{:02}", total / 3600, (total / 60) % 60, total % 60)
}

// ─────────────────────────────────────────────────────────────────────────────
// Log Throttling
// ─────────────────────────────────────────────────────────────────────────────

/// Per-key rate limiter for repetitive warning logs.
///
/// A device that keeps failing every poll would otherwise flood the log.
pub struct LogThrottle {
    interval: Duration,
    last: DashMap<String, Instant>,
}

impl LogThrottle {
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: DashMap::new(),
        }
    }

    /// Returns true (and records the time) if `key` may log now.
    pub fn should_log(&self, key: &str) -> bool {
        let now = Instant::now();
        match self.last.entry(key.to_string()) {
            Entry::Occupied(mut last) => {
                if now.saturating_duration_since(*last.get()) >= self.interval {
                    last.insert(now);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(now);
                true
            }
        }
    }

    /// Forgets `key` so its next failure logs immediately.
    pub fn reset(&self, key: &str) {
        self.last.remove(key);
    }
}
