//! Event system for zone and backend change notifications.
//!
//! This module provides:
//! - [`EventEmitter`] trait for clients to publish events without knowing the transport
//! - [`BroadcastEventBridge`] fanning events out over a `tokio::sync::broadcast` channel
//! - [`ZoneEvents`], the per-backend handle injected into every protocol client

mod bridge;
mod emitter;

use std::sync::Arc;

pub use bridge::BroadcastEventBridge;
pub use emitter::{EventEmitter, LoggingEventEmitter, NoopEventEmitter};

#[cfg(test)]
pub(crate) use emitter::CountingEventEmitter;

use serde::Serialize;

use crate::utils::now_millis;

/// Events published on the bus.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BusEvent {
    /// The set of zones (or their state) of a backend changed.
    ZonesChanged {
        backend: String,
        /// Unix timestamp in milliseconds.
        timestamp: u64,
    },
    /// A backend connected to or lost its upstream (core, server, pipeline).
    BackendStatusChanged {
        backend: String,
        connected: bool,
        /// Unix timestamp in milliseconds.
        timestamp: u64,
    },
}

impl BusEvent {
    /// Backend that produced the event.
    #[must_use]
    pub fn backend(&self) -> &str {
        match self {
            Self::ZonesChanged { backend, .. } | Self::BackendStatusChanged { backend, .. } => {
                backend
            }
        }
    }
}

/// Backend-scoped publisher handed to a protocol client at construction.
///
/// Replaces the "onZonesChanged" callback: clients call
/// [`zones_changed`](Self::zones_changed) and the bus fans the event out.
#[derive(Clone)]
pub struct ZoneEvents {
    backend: String,
    emitter: Arc<dyn EventEmitter>,
}

impl ZoneEvents {
    pub fn new(backend: impl Into<String>, emitter: Arc<dyn EventEmitter>) -> Self {
        Self {
            backend: backend.into(),
            emitter,
        }
    }

    /// Handle that discards everything (tests, one-off clients).
    pub fn noop(backend: impl Into<String>) -> Self {
        Self::new(backend, Arc::new(NoopEventEmitter))
    }

    #[must_use]
    pub fn backend(&self) -> &str {
        &self.backend
    }

    pub fn zones_changed(&self) {
        self.emitter.emit(BusEvent::ZonesChanged {
            backend: self.backend.clone(),
            timestamp: now_millis(),
        });
    }

    pub fn connection_changed(&self, connected: bool) {
        self.emitter.emit(BusEvent::BackendStatusChanged {
            backend: self.backend.clone(),
            connected,
            timestamp: now_millis(),
        });
    }
}
