//! Volume safety: device ranges, clamping, and rate-limited relative steps.
//!
//! Every absolute volume that leaves the bridge is clamped against the target
//! device's own range. Relative requests are accumulated per output and
//! trickled out in bounded steps so a burst of knob turns can never jump a
//! device to full volume.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::BridgeResult;
use crate::model::VolumeControl;
use crate::protocol_constants::{
    DEFAULT_VOLUME_MAX, DEFAULT_VOLUME_MIN, MAX_RELATIVE_VOLUME_STEP, MIN_VOLUME_STEP_INTERVAL,
};

/// Residual below which an accumulator counts as drained.
const EPSILON: f64 = 1e-9;

// ─────────────────────────────────────────────────────────────────────────────
// Range & Clamp
// ─────────────────────────────────────────────────────────────────────────────

/// Legal volume range of a device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VolumeRange {
    pub min: f64,
    pub max: f64,
}

impl Default for VolumeRange {
    fn default() -> Self {
        Self {
            min: DEFAULT_VOLUME_MIN,
            max: DEFAULT_VOLUME_MAX,
        }
    }
}

impl VolumeRange {
    /// Range advertised by a device descriptor, or 0..=100 when absent.
    #[must_use]
    pub fn from_descriptor(control: Option<&VolumeControl>) -> Self {
        match control {
            Some(c) if c.min.is_finite() && c.max.is_finite() && c.min <= c.max => Self {
                min: c.min,
                max: c.max,
            },
            Some(c) => {
                log::warn!(
                    "[Volume] Ignoring malformed range {}..{}, using default",
                    c.min,
                    c.max
                );
                Self::default()
            }
            None => Self::default(),
        }
    }

    /// Clamps `value` into this range.
    #[must_use]
    pub fn clamp(&self, value: f64) -> f64 {
        clamp(value, self.min, self.max)
    }
}

/// Bounds `value` to `[min, max]`; NaN maps to `min`.
#[must_use]
pub fn clamp(value: f64, min: f64, max: f64) -> f64 {
    if value.is_nan() {
        return min;
    }
    value.max(min).min(max)
}

// ─────────────────────────────────────────────────────────────────────────────
// Relative Volume Batching
// ─────────────────────────────────────────────────────────────────────────────

/// Destination for flushed relative volume steps.
///
/// Implemented by each protocol client. Sinks that only accept absolute
/// volume resolve the step against their cached level and clamp the result.
#[async_trait]
pub trait VolumeSink: Send + Sync {
    /// Applies a bounded step (|step| <= 25) to `output_id`.
    async fn apply_step(&self, output_id: &str, step: f64) -> BridgeResult<()>;
}

#[derive(Debug, Default)]
struct PendingVolume {
    accumulated: f64,
    last_sent: Option<Instant>,
    flush_scheduled: bool,
}

impl PendingVolume {
    fn wait_remaining(&self, now: Instant) -> Duration {
        self.last_sent
            .map(|t| MIN_VOLUME_STEP_INTERVAL.saturating_sub(now.saturating_duration_since(t)))
            .unwrap_or(Duration::ZERO)
    }
}

/// Per-output accumulator that turns relative requests into rate-limited steps.
///
/// Accumulation and the flush decision happen under one lock, so concurrent
/// requests are never lost or delivered twice.
pub struct RelativeVolumeBatcher {
    name: &'static str,
    sink: Arc<dyn VolumeSink>,
    pending: Arc<Mutex<HashMap<String, PendingVolume>>>,
    cancel_token: CancellationToken,
}

impl RelativeVolumeBatcher {
    /// Creates a batcher delivering into `sink`.
    ///
    /// # Arguments
    /// * `name` - Component name for logging
    /// * `sink` - Where flushed steps are delivered
    /// * `cancel_token` - Cancelling it abandons every scheduled flush
    pub fn new(
        name: &'static str,
        sink: Arc<dyn VolumeSink>,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            name,
            sink,
            pending: Arc::new(Mutex::new(HashMap::new())),
            cancel_token,
        }
    }

    /// Queues `delta` for `output_id`, scheduling a flush if none is pending.
    pub fn request(&self, output_id: &str, delta: f64) {
        if !delta.is_finite() || delta.abs() < EPSILON {
            return;
        }

        let delay = {
            let mut pending = self.pending.lock();
            let entry = pending.entry(output_id.to_string()).or_default();
            entry.accumulated += delta;
            if entry.flush_scheduled {
                return;
            }
            entry.flush_scheduled = true;
            entry.wait_remaining(Instant::now())
        };

        let output_id = output_id.to_string();
        let pending = Arc::clone(&self.pending);
        let sink = Arc::clone(&self.sink);
        let cancel = self.cancel_token.clone();
        let name = self.name;

        tokio::spawn(async move {
            flush_loop(name, output_id, delay, pending, sink, cancel).await;
        });
    }

    /// Undelivered delta for `output_id`.
    #[must_use]
    pub fn pending_delta(&self, output_id: &str) -> f64 {
        self.pending
            .lock()
            .get(output_id)
            .map(|p| p.accumulated)
            .unwrap_or(0.0)
    }

    /// Drops every accumulator and stops scheduled flushes.
    pub fn stop(&self) {
        self.cancel_token.cancel();
        self.pending.lock().clear();
    }
}

async fn flush_loop(
    name: &'static str,
    output_id: String,
    mut delay: Duration,
    pending: Arc<Mutex<HashMap<String, PendingVolume>>>,
    sink: Arc<dyn VolumeSink>,
    cancel: CancellationToken,
) {
    loop {
        if !delay.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        if cancel.is_cancelled() {
            return;
        }

        let (step, more) = {
            let mut guard = pending.lock();
            let Some(entry) = guard.get_mut(&output_id) else {
                return;
            };

            let now = Instant::now();
            let wait = entry.wait_remaining(now);
            if !wait.is_zero() {
                // Woke early; try again once the interval has elapsed.
                delay = wait;
                continue;
            }

            let step = clamp(
                entry.accumulated,
                -MAX_RELATIVE_VOLUME_STEP,
                MAX_RELATIVE_VOLUME_STEP,
            );
            entry.accumulated -= step;
            if entry.accumulated.abs() < EPSILON {
                entry.accumulated = 0.0;
            }
            entry.last_sent = Some(now);

            let more = entry.accumulated != 0.0;
            entry.flush_scheduled = more;
            (step, more)
        };

        if step != 0.0 {
            log::debug!("[{}] Volume step {:+} -> {}", name, step, output_id);
            if let Err(e) = sink.apply_step(&output_id, step).await {
                log::warn!("[{}] Volume step for {} failed: {}", name, output_id, e);
            }
        }

        if !more {
            return;
        }
        delay = MIN_VOLUME_STEP_INTERVAL;
    }
}
