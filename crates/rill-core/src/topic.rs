//! In-process pub-sub topics keyed by stream identifier.
//!
//! The relay publishes committed batches here; each subscription task holds
//! a receiver for its stream's topic (or for [`ALL_STREAM`]). Topics are
//! `tokio::sync::broadcast` channels: publishing is fire-and-forget
//! best-effort, and a receiver that falls behind observes
//! `RecvError::Lagged` and recovers through catch-up rather than by
//! silently skipping events.

use std::collections::HashMap;

use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::event::EventBatch;

/// Default per-topic buffer capacity.
pub const DEFAULT_TOPIC_CAPACITY: usize = 1024;

/// Hub of per-stream broadcast topics.
///
/// Cheap to clone is not needed; the hub is shared behind the senders it
/// hands out. Topics are created lazily on first subscribe and pruned once
/// their last receiver is gone.
#[derive(Debug)]
pub struct TopicHub {
    topics: RwLock<HashMap<String, broadcast::Sender<EventBatch>>>,
    capacity: usize,
}

impl TopicHub {
    /// Creates a hub whose topics buffer `capacity` batches each.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Subscribes to the topic for `stream_uuid`, creating it if needed.
    ///
    /// The receiver observes every batch published after this call.
    pub fn subscribe(&self, stream_uuid: &str) -> broadcast::Receiver<EventBatch> {
        let topics = self.topics.read();
        if let Some(sender) = topics.get(stream_uuid) {
            return sender.subscribe();
        }
        drop(topics);

        let mut topics = self.topics.write();
        topics
            .entry(stream_uuid.to_owned())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Publishes a batch on the topic for `stream_uuid`.
    ///
    /// Returns the number of receivers the batch reached. A topic with no
    /// receivers (or none at all) absorbs the publish; catch-up replays
    /// history for late subscribers.
    pub fn publish(&self, stream_uuid: &str, batch: EventBatch) -> usize {
        let delivered = {
            let topics = self.topics.read();
            match topics.get(stream_uuid) {
                Some(sender) => sender.send(batch).unwrap_or(0),
                None => return 0,
            }
        };
        if delivered == 0 {
            // Last receiver is gone; drop the topic so the map stays bounded
            // by the number of live subscriptions.
            let mut topics = self.topics.write();
            if let Some(sender) = topics.get(stream_uuid) {
                if sender.receiver_count() == 0 {
                    topics.remove(stream_uuid);
                }
            }
        }
        delivered
    }

    /// Number of live topics.
    #[must_use]
    pub fn topic_count(&self) -> usize {
        self.topics.read().len()
    }
}

impl Default for TopicHub {
    fn default() -> Self {
        Self::new(DEFAULT_TOPIC_CAPACITY)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::event::{RecordedEvent, ALL_STREAM};

    fn make_batch(stream: &str, numbers: &[u64]) -> EventBatch {
        Arc::new(
            numbers
                .iter()
                .map(|&n| RecordedEvent {
                    event_id: uuid::Uuid::new_v4(),
                    event_number: n,
                    stream_uuid: stream.to_owned(),
                    stream_version: n,
                    event_type: "test_event".into(),
                    correlation_id: None,
                    causation_id: None,
                    data: bytes::Bytes::new(),
                    metadata: bytes::Bytes::new(),
                    created_at: chrono::Utc::now(),
                })
                .collect(),
        )
    }

    // --- Publish / subscribe tests ---

    #[tokio::test]
    async fn test_topic_publish_reaches_subscriber() {
        let hub = TopicHub::default();
        let mut rx = hub.subscribe("orders");

        let delivered = hub.publish("orders", make_batch("orders", &[1, 2]));
        assert_eq!(delivered, 1);

        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].event_number, 1);
    }

    #[tokio::test]
    async fn test_topic_publish_without_subscribers_is_absorbed() {
        let hub = TopicHub::default();
        assert_eq!(hub.publish("orders", make_batch("orders", &[1])), 0);
        assert_eq!(hub.topic_count(), 0);
    }

    #[tokio::test]
    async fn test_topic_streams_are_isolated() {
        let hub = TopicHub::default();
        let mut orders = hub.subscribe("orders");
        let mut all = hub.subscribe(ALL_STREAM);

        hub.publish("orders", make_batch("orders", &[1]));
        hub.publish(ALL_STREAM, make_batch("orders", &[1]));
        hub.publish("payments", make_batch("payments", &[2]));

        assert_eq!(orders.recv().await.unwrap()[0].stream_uuid, "orders");
        assert!(orders.try_recv().is_err());
        assert_eq!(all.recv().await.unwrap()[0].event_number, 1);
        assert!(all.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_topic_fan_out_to_multiple_receivers() {
        let hub = TopicHub::default();
        let mut rx1 = hub.subscribe("orders");
        let mut rx2 = hub.subscribe("orders");

        assert_eq!(hub.publish("orders", make_batch("orders", &[7])), 2);
        assert_eq!(rx1.recv().await.unwrap()[0].event_number, 7);
        assert_eq!(rx2.recv().await.unwrap()[0].event_number, 7);
    }

    #[tokio::test]
    async fn test_topic_pruned_after_receivers_drop() {
        let hub = TopicHub::default();
        let rx = hub.subscribe("orders");
        assert_eq!(hub.topic_count(), 1);
        drop(rx);

        hub.publish("orders", make_batch("orders", &[1]));
        assert_eq!(hub.topic_count(), 0);
    }

    #[tokio::test]
    async fn test_topic_lag_reported_to_slow_receiver() {
        let hub = TopicHub::new(2);
        let mut rx = hub.subscribe("orders");

        for n in 1..=5 {
            hub.publish("orders", make_batch("orders", &[n]));
        }

        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(missed)) => assert!(missed > 0),
            other => panic!("expected lag, got {other:?}"),
        }
    }
}
