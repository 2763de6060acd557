//! Bridge implementation that maps bus events to broadcast transport.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;

use super::emitter::EventEmitter;
use super::BusEvent;

/// Bridges bus events to a `tokio::sync::broadcast` channel.
///
/// External consumers (HTTP layer, MQTT publisher, the server's logger)
/// subscribe to the channel. An optional external emitter receives a copy of
/// every event as well, which can be set after construction.
#[derive(Clone)]
pub struct BroadcastEventBridge {
    tx: broadcast::Sender<BusEvent>,
    external_emitter: Arc<RwLock<Option<Arc<dyn EventEmitter>>>>,
}

impl BroadcastEventBridge {
    /// Creates a new bridge with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            external_emitter: Arc::new(RwLock::new(None)),
        }
    }

    /// Sets an external emitter that sees every event before broadcast.
    pub fn set_external_emitter(&self, emitter: Arc<dyn EventEmitter>) {
        *self.external_emitter.write() = Some(emitter);
    }

    /// Returns a new receiver for the broadcast channel.
    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }
}

impl EventEmitter for BroadcastEventBridge {
    fn emit(&self, event: BusEvent) {
        if let Some(ref emitter) = *self.external_emitter.read() {
            emitter.emit(event.clone());
        }
        if let Err(e) = self.tx.send(event) {
            log::trace!("[EventBridge] No broadcast receivers: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ZoneEvents;

    #[tokio::test]
    async fn subscribers_receive_events() {
        let bridge = Arc::new(BroadcastEventBridge::new(8));
        let mut rx = bridge.subscribe();

        ZoneEvents::new("roon", bridge.clone()).zones_changed();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.backend(), "roon");
        assert!(matches!(event, BusEvent::ZonesChanged { .. }));
    }

    #[test]
    fn emit_without_subscribers_is_harmless() {
        let bridge = BroadcastEventBridge::new(8);
        bridge.emit(BusEvent::BackendStatusChanged {
            backend: "hqplayer".into(),
            connected: false,
            timestamp: 0,
        });
    }
}
