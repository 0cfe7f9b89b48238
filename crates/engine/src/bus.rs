//! Fan-out event channel for structured observability.
//!
//! Publishing never blocks: each subscriber owns a bounded mailbox and the
//! slowest subscriber's events are dropped with a warning.

use model::events::ReplicationEvent;
use std::sync::Arc;
use tokio::sync::{RwLock, mpsc, mpsc::error::TrySendError};
use tracing::warn;

const SUBSCRIBER_CAPACITY: usize = 256;

#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<RwLock<Vec<mpsc::Sender<Arc<ReplicationEvent>>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe(&self) -> mpsc::Receiver<Arc<ReplicationEvent>> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        self.subscribers.write().await.push(tx);
        rx
    }

    pub async fn publish(&self, event: ReplicationEvent) {
        let event = Arc::new(event);
        let mut subscribers = self.subscribers.write().await;
        subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(event_type = event.event_type(), "dropped event for slow subscriber");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use model::core::operation::Operation;

    fn event() -> ReplicationEvent {
        ReplicationEvent::Replicated {
            replicator: "pg-0".into(),
            resource: "users".into(),
            record_id: "u1".into(),
            operation: Operation::Inserted,
            duration_ms: 3,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn delivers_to_all_subscribers() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe().await;
        let mut rx2 = bus.subscribe().await;

        bus.publish(event()).await;

        assert_eq!(rx1.recv().await.unwrap().event_type(), "replicated");
        assert_eq!(rx2.recv().await.unwrap().event_type(), "replicated");
    }

    #[tokio::test]
    async fn closed_subscribers_are_pruned() {
        let bus = EventBus::new();
        let rx = bus.subscribe().await;
        drop(rx);

        bus.publish(event()).await;
        assert_eq!(bus.subscriber_count().await, 0);
    }

    #[tokio::test]
    async fn full_mailbox_drops_instead_of_blocking() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe().await;

        for _ in 0..(SUBSCRIBER_CAPACITY + 10) {
            bus.publish(event()).await;
        }

        // The subscriber still works and the publisher never blocked.
        assert!(rx.recv().await.is_some());
        assert_eq!(bus.subscriber_count().await, 1);
    }
}
