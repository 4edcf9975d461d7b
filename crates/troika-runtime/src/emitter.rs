//! Broadcast-based event emitter for [`RunEvent`] dispatch.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::broadcast;
use troika_core::events::{EventSink, RunEvent};

/// Default broadcast channel capacity.
const DEFAULT_CAPACITY: usize = 1024;

/// Broadcast-based event emitter.
///
/// Non-blocking: `emit` never awaits. Slow receivers lag and drop rather
/// than blocking the sender.
pub struct EventEmitter {
    tx: broadcast::Sender<RunEvent>,
    emit_count: AtomicU64,
}

impl EventEmitter {
    /// Emitter with the default channel capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Emitter with a custom channel capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            emit_count: AtomicU64::new(0),
        }
    }

    /// Emit an event to all subscribers. Returns the receiver count.
    pub fn emit(&self, event: RunEvent) -> usize {
        let _ = self.emit_count.fetch_add(1, Ordering::Relaxed);
        self.tx.send(event).unwrap_or(0)
    }

    /// Subscribe to all events emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.tx.subscribe()
    }

    /// Number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Total events emitted.
    pub fn emit_count(&self) -> u64 {
        self.emit_count.load(Ordering::Relaxed)
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for EventEmitter {
    fn emit_event(&self, event: RunEvent) {
        let _ = self.emit(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn_completed(run: &str, turn: &str) -> RunEvent {
        RunEvent::TurnCompleted {
            run_id: run.into(),
            agent_id: "Partner".into(),
            turn_id: turn.into(),
        }
    }

    #[test]
    fn emit_with_no_subscribers() {
        let emitter = EventEmitter::new();
        assert_eq!(emitter.emit(turn_completed("r1", "t1")), 0);
        assert_eq!(emitter.emit_count(), 1);
    }

    #[tokio::test]
    async fn emit_and_receive() {
        let emitter = EventEmitter::new();
        let mut rx = emitter.subscribe();

        let count = emitter.emit(turn_completed("r1", "t1"));
        assert_eq!(count, 1);

        let received = rx.recv().await.unwrap();
        assert_eq!(received.event_type(), "turn_completed");
        assert_eq!(received.run_id(), "r1");
    }

    #[tokio::test]
    async fn multiple_subscribers_all_receive() {
        let emitter = EventEmitter::new();
        let mut rx1 = emitter.subscribe();
        let mut rx2 = emitter.subscribe();
        assert_eq!(emitter.subscriber_count(), 2);

        let count = emitter.emit(turn_completed("r1", "t1"));
        assert_eq!(count, 2);
        assert_eq!(rx1.recv().await.unwrap().run_id(), "r1");
        assert_eq!(rx2.recv().await.unwrap().run_id(), "r1");
    }

    #[tokio::test]
    async fn slow_receiver_lags_instead_of_blocking() {
        let emitter = EventEmitter::with_capacity(2);
        let mut rx = emitter.subscribe();
        for i in 0..3 {
            let _ = emitter.emit(turn_completed("r1", &format!("t{i}")));
        }
        assert!(rx.recv().await.is_err());
    }

    #[test]
    fn sink_trait_delegates() {
        let emitter = EventEmitter::new();
        let sink: &dyn EventSink = &emitter;
        sink.emit_event(turn_completed("r1", "t1"));
        assert_eq!(emitter.emit_count(), 1);
    }
}
