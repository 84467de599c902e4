//! Notification relay: turns committed `(first, last)` ranges into topic
//! traffic.
//!
//! For every range received the relay loads the covered rows from the
//! all-streams view, groups them by stream, and publishes each group on its
//! stream topic plus the whole batch on the [`ALL_STREAM`] topic. Exactly
//! one relay instance runs per cluster; the range channel is the pluggable
//! seam between the local `LISTEN` loop and any distributed forwarder.
//!
//! Delivery to topics is fire-and-forget. If a range cannot be read after a
//! few attempts it is skipped with an error log; affected subscriptions
//! observe the gap and recover through catch-up.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, trace};

use crate::event::{EventBatch, EventRange, RecordedEvent, ALL_STREAM};
use crate::store::EventReader;
use crate::topic::TopicHub;

/// Read attempts per range before the range is abandoned.
const READ_ATTEMPTS: usize = 3;
/// Pause between failed read attempts.
const RETRY_DELAY: Duration = Duration::from_millis(100);

/// Configuration for the [`NotificationRelay`].
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Maximum rows fetched per read while resolving a range.
    pub read_batch_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            read_batch_size: 1000,
        }
    }
}

/// The cluster-singleton broadcaster.
///
/// Spawn [`run`](Self::run) as a task; it exits when the range channel
/// closes or the shutdown signal flips to `true`.
pub struct NotificationRelay {
    reader: Arc<dyn EventReader>,
    hub: Arc<TopicHub>,
    ranges: mpsc::Receiver<EventRange>,
    shutdown: watch::Receiver<bool>,
    config: RelayConfig,
}

impl NotificationRelay {
    /// Creates a relay over the given reader, hub and range feed.
    #[must_use]
    pub fn new(
        reader: Arc<dyn EventReader>,
        hub: Arc<TopicHub>,
        ranges: mpsc::Receiver<EventRange>,
        shutdown: watch::Receiver<bool>,
        config: RelayConfig,
    ) -> Self {
        Self {
            reader,
            hub,
            ranges,
            shutdown,
            config,
        }
    }

    /// Runs the relay loop until shutdown or range-feed closure.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        debug!("notification relay shutting down");
                        return;
                    }
                }
                range = self.ranges.recv() => {
                    let Some(range) = range else {
                        debug!("notification range feed closed, relay stopping");
                        return;
                    };
                    self.relay_range(range).await;
                }
            }
        }
    }

    /// Reads and publishes one committed range.
    async fn relay_range(&self, range: EventRange) {
        trace!(%range, "relaying committed range");
        let mut from = range.first;
        loop {
            let remaining = (range.last - from + 1) as usize;
            let max = remaining.min(self.config.read_batch_size);
            let Some(page) = self.read_page(from, max, range).await else {
                return;
            };
            if page.is_empty() {
                // Rows of a committed range are visible by the time the
                // notification arrives; an empty page means the range was
                // already truncated to its tail.
                return;
            }

            let last_read = page.last().map_or(range.last, |e| e.event_number);
            self.publish(page);
            if last_read >= range.last {
                return;
            }
            from = last_read + 1;
        }
    }

    async fn read_page(
        &self,
        from: u64,
        max: usize,
        range: EventRange,
    ) -> Option<Vec<RecordedEvent>> {
        for attempt in 1..=READ_ATTEMPTS {
            match self.reader.read_all(from, max).await {
                Ok(page) => {
                    return Some(
                        page.into_iter()
                            .filter(|e| e.event_number <= range.last)
                            .collect(),
                    )
                }
                Err(err) if attempt < READ_ATTEMPTS => {
                    debug!(%range, attempt, %err, "range read failed, retrying");
                    tokio::time::sleep(RETRY_DELAY).await;
                }
                Err(err) => {
                    error!(%range, %err, "abandoning unreadable range; subscriptions will catch up");
                    return None;
                }
            }
        }
        None
    }

    /// Publishes per-stream groups and the all-stream batch.
    fn publish(&self, events: Vec<RecordedEvent>) {
        let mut by_stream: HashMap<String, Vec<RecordedEvent>> = HashMap::new();
        for event in &events {
            by_stream
                .entry(event.stream_uuid.clone())
                .or_default()
                .push(event.clone());
        }
        for (stream_uuid, group) in by_stream {
            self.hub.publish(&stream_uuid, Arc::new(group));
        }
        self.hub.publish(ALL_STREAM, Arc::new(events));
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use bytes::Bytes;
    use tokio::time::timeout;

    use crate::event::{EventData, ExpectedVersion};
    use crate::memory::MemoryStore;

    const TICK: Duration = Duration::from_secs(5);

    struct Fixture {
        store: MemoryStore,
        hub: Arc<TopicHub>,
        _shutdown: watch::Sender<bool>,
    }

    /// Starts a relay fed directly from the memory store's range feed.
    fn start_relay() -> Fixture {
        let store = MemoryStore::new();
        let hub = Arc::new(TopicHub::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let relay = NotificationRelay::new(
            Arc::new(store.clone()),
            Arc::clone(&hub),
            store.notifications(),
            shutdown_rx,
            RelayConfig::default(),
        );
        tokio::spawn(relay.run());
        Fixture {
            store,
            hub,
            _shutdown: shutdown_tx,
        }
    }

    fn events(n: usize) -> Vec<EventData> {
        (0..n)
            .map(|i| EventData::new("test_event", Bytes::from(format!("{i}"))))
            .collect()
    }

    #[tokio::test]
    async fn test_relay_publishes_stream_and_all_topics() {
        let fx = start_relay();
        let mut orders = fx.hub.subscribe("orders");
        let mut all = fx.hub.subscribe(ALL_STREAM);

        fx.store
            .append_to_stream("orders", ExpectedVersion::Any, events(2))
            .unwrap();

        let batch = timeout(TICK, orders.recv()).await.unwrap().unwrap();
        assert_eq!(
            batch.iter().map(|e| e.stream_version).collect::<Vec<_>>(),
            vec![1, 2]
        );

        let batch = timeout(TICK, all.recv()).await.unwrap().unwrap();
        assert_eq!(
            batch.iter().map(|e| e.event_number).collect::<Vec<_>>(),
            vec![1, 2]
        );
    }

    #[tokio::test]
    async fn test_relay_groups_batches_by_stream() {
        let fx = start_relay();
        let mut orders = fx.hub.subscribe("orders");
        let mut payments = fx.hub.subscribe("payments");

        fx.store
            .append_to_stream("orders", ExpectedVersion::Any, events(1))
            .unwrap();
        fx.store
            .append_to_stream("payments", ExpectedVersion::Any, events(1))
            .unwrap();

        let batch = timeout(TICK, orders.recv()).await.unwrap().unwrap();
        assert!(batch.iter().all(|e| e.stream_uuid == "orders"));
        let batch = timeout(TICK, payments.recv()).await.unwrap().unwrap();
        assert!(batch.iter().all(|e| e.stream_uuid == "payments"));
    }

    #[tokio::test]
    async fn test_relay_pages_large_ranges_in_order() {
        let store = MemoryStore::new();
        let hub = Arc::new(TopicHub::default());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let relay = NotificationRelay::new(
            Arc::new(store.clone()),
            Arc::clone(&hub),
            store.notifications(),
            shutdown_rx,
            RelayConfig { read_batch_size: 2 },
        );
        tokio::spawn(relay.run());

        let mut all = hub.subscribe(ALL_STREAM);
        store
            .append_to_stream("s", ExpectedVersion::Any, events(5))
            .unwrap();

        // 5 events with a read batch of 2 arrive as 3 ordered pages.
        let mut seen = Vec::new();
        while seen.len() < 5 {
            let batch = timeout(TICK, all.recv()).await.unwrap().unwrap();
            seen.extend(batch.iter().map(|e| e.event_number));
        }
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_relay_stops_on_shutdown() {
        let store = MemoryStore::new();
        let hub = Arc::new(TopicHub::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let relay = NotificationRelay::new(
            Arc::new(store.clone()),
            hub,
            store.notifications(),
            shutdown_rx,
            RelayConfig::default(),
        );
        let handle = tokio::spawn(relay.run());

        shutdown_tx.send(true).unwrap();
        timeout(TICK, handle).await.unwrap().unwrap();
    }
}
