//! Event emitter abstraction for decoupling clients from transport.
//!
//! Protocol clients depend on the [`EventEmitter`] trait rather than concrete
//! broadcast channels, enabling testing and alternative transport implementations.

use super::BusEvent;

/// Trait for emitting bus events without knowledge of transport.
///
/// # Example
///
/// ```ignore
/// struct MyClient {
///     emitter: Arc<dyn EventEmitter>,
/// }
///
/// impl MyClient {
///     fn on_snapshot(&self) {
///         self.emitter.emit(BusEvent::ZonesChanged { ... });
///     }
/// }
/// ```
pub trait EventEmitter: Send + Sync {
    /// Emits a bus event.
    fn emit(&self, event: BusEvent);
}

/// No-op emitter for tests and standalone clients.
pub struct NoopEventEmitter;

impl EventEmitter for NoopEventEmitter {
    fn emit(&self, _event: BusEvent) {}
}

/// Logging emitter for debugging and development.
///
/// Logs all events at debug level.
pub struct LoggingEventEmitter;

impl EventEmitter for LoggingEventEmitter {
    fn emit(&self, event: BusEvent) {
        tracing::debug!(?event, "bus_event");
    }
}

/// Test emitter that counts events per kind.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct CountingEventEmitter {
    zones: std::sync::atomic::AtomicUsize,
    status: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl CountingEventEmitter {
    pub(crate) fn zones(&self) -> usize {
        self.zones.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub(crate) fn status(&self) -> usize {
        self.status.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
impl EventEmitter for CountingEventEmitter {
    fn emit(&self, event: BusEvent) {
        use std::sync::atomic::Ordering;
        match event {
            BusEvent::ZonesChanged { .. } => self.zones.fetch_add(1, Ordering::SeqCst),
            BusEvent::BackendStatusChanged { .. } => self.status.fetch_add(1, Ordering::SeqCst),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::events::ZoneEvents;

    #[test]
    fn zone_events_tags_backend_and_kind() {
        let emitter = Arc::new(CountingEventEmitter::default());
        let events = ZoneEvents::new("lms", emitter.clone());

        events.zones_changed();
        events.zones_changed();
        events.connection_changed(true);

        assert_eq!(events.backend(), "lms");
        assert_eq!(emitter.zones(), 2);
        assert_eq!(emitter.status(), 1);
    }
}
