//! Event Bus: a bounded, multi-consumer, drop-on-full pub/sub channel for
//! progress events (snapshot lifecycle, filesystem notification feed).
//! Publish never blocks; a subscriber that falls behind its own buffer
//! silently misses the oldest events it hasn't read yet, but other
//! subscribers are unaffected.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::config::EVENT_BUS_CAPACITY;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum CoreEvent {
    FileCreated { path: String },
    FileModified { path: String },
    FileDeleted { path: String },
    FileMoved { src: String, dest: String },
    DirectoryMoved { src: String, dest: String },
    SnapshotStarted { watched_path: String, storage_subdir: String },
    SnapshotProgress { watched_path: String, processed: u64, total: u64, skipped: u64, errors: u64 },
    SnapshotError { watched_path: String, message: String },
    SnapshotComplete { watched_path: String, processed: u64, skipped: u64, errors: u64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub timestamp: DateTime<Utc>,
    pub event: CoreEvent,
}

/// Process-wide broadcast channel. Cloning an `EventBus` shares the same
/// underlying sender; every clone publishes to the same set of
/// subscribers.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Envelope>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(EVENT_BUS_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish is fire-and-forget: if there are no subscribers the event is
    /// simply discarded, never treated as an error.
    pub fn publish(&self, event: CoreEvent) {
        let envelope = Envelope {
            timestamp: Utc::now(),
            event,
        };
        let _ = self.sender.send(envelope);
    }

    /// A fresh receiver, positioned at "now" — it will not see events
    /// published before this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(CoreEvent::FileCreated { path: "/w/a.txt".into() });

        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.event, CoreEvent::FileCreated { path: "/w/a.txt".into() });
    }

    #[tokio::test]
    async fn each_subscriber_gets_its_own_feed() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(CoreEvent::FileDeleted { path: "/w/a.txt".into() });

        assert!(a.recv().await.is_ok());
        assert!(b.recv().await.is_ok());
    }

    #[tokio::test]
    async fn publishing_with_no_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish(CoreEvent::FileDeleted { path: "/w/a.txt".into() });
    }

    #[tokio::test]
    async fn a_lagging_subscriber_drops_old_events_without_affecting_others() {
        let bus = EventBus::with_capacity(2);
        let mut slow = bus.subscribe();
        let mut fast = bus.subscribe();

        for i in 0..5 {
            bus.publish(CoreEvent::FileModified { path: format!("/w/{i}.txt") });
        }

        // the slow subscriber missed events and sees a Lagged error, not a panic
        let first = slow.recv().await;
        assert!(matches!(first, Err(broadcast::error::RecvError::Lagged(_))) || first.is_ok());

        assert!(fast.recv().await.is_ok());
    }
}
