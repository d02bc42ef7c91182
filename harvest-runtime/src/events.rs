//! Lifecycle event fan-out

use tokio::sync::broadcast;
use tracing::debug;

use harvest_core::{EventSink, LifecycleEvent};

/// Events buffered per subscriber before the slowest one starts lagging
pub const EVENT_CAPACITY: usize = 1024;

/// [`EventSink`] that logs every event and forwards it to broadcast subscribers
pub struct BroadcastSink {
    sender: broadcast::Sender<LifecycleEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new(EVENT_CAPACITY)
    }
}

impl EventSink for BroadcastSink {
    fn emit(&self, event: LifecycleEvent) {
        debug!(event = event.name(), "Lifecycle event");
        // no subscribers is fine
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribers_receive_events() {
        let sink = BroadcastSink::new(8);
        let mut rx = sink.subscribe();
        sink.emit(LifecycleEvent::CooldownCleared { scope: "lab".into() });
        assert_eq!(rx.try_recv().unwrap().name(), "cooldown_cleared");
    }

    #[test]
    fn test_emit_without_subscribers() {
        let sink = BroadcastSink::default();
        sink.emit(LifecycleEvent::CooldownCleared { scope: "lab".into() });
    }
}
