//! In-process storage backend.
//!
//! [`MemoryStore`] implements every storage seam ([`EventReader`],
//! [`SubscriptionStore`], [`LockManager`]) plus the append collaborator, and
//! feeds committed ranges to any number of notification receivers. It backs
//! the integration tests and works as a single-node store where durability
//! is not required.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::event::{EventData, EventRange, ExpectedVersion, RecordedEvent};
use crate::store::{
    EventReader, LockGuard, LockManager, StoreError, StoredSubscription, SubscriptionStore,
};

/// Buffer capacity handed to notification receivers.
const NOTIFY_CAPACITY: usize = 1024;

#[derive(Default)]
struct Inner {
    /// All events in commit order. `all[n - 1]` has `event_number == n`.
    all: Vec<RecordedEvent>,
    /// Stream uuid -> indices into `all`, in stream-version order.
    streams: HashMap<String, Vec<usize>>,
    /// Durable subscription rows keyed by `(stream_uuid, name)`.
    subscriptions: HashMap<(String, String), StoredSubscription>,
    next_subscription_id: i64,
    /// Currently held advisory locks.
    locks: HashSet<i64>,
    /// Live notification feeds.
    notifiers: Vec<mpsc::Sender<EventRange>>,
}

/// In-memory event store.
///
/// Cheap to clone; clones share the same state.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `events` to `stream_uuid`, assigning dense positions, and
    /// notifies every registered range receiver.
    ///
    /// # Errors
    ///
    /// [`StoreError::WrongExpectedVersion`] when `expected` is `Exact` and
    /// does not match the stream's current version.
    pub fn append_to_stream(
        &self,
        stream_uuid: &str,
        expected: ExpectedVersion,
        events: Vec<EventData>,
    ) -> Result<Vec<RecordedEvent>, StoreError> {
        if events.is_empty() {
            return Ok(Vec::new());
        }

        let (recorded, range, notifiers) = {
            let mut inner = self.inner.lock();

            let current = inner
                .streams
                .get(stream_uuid)
                .map_or(0, |indices| indices.len() as u64);
            if let ExpectedVersion::Exact(expected) = expected {
                if expected != current {
                    return Err(StoreError::WrongExpectedVersion {
                        stream_uuid: stream_uuid.to_owned(),
                        expected,
                        current,
                    });
                }
            }

            let first = inner.all.len() as u64 + 1;
            let created_at = Utc::now();
            let mut recorded = Vec::with_capacity(events.len());
            for (offset, event) in events.into_iter().enumerate() {
                let offset = offset as u64;
                recorded.push(RecordedEvent {
                    event_id: event.event_id,
                    event_number: first + offset,
                    stream_uuid: stream_uuid.to_owned(),
                    stream_version: current + offset + 1,
                    event_type: event.event_type,
                    correlation_id: event.correlation_id,
                    causation_id: event.causation_id,
                    data: event.data,
                    metadata: event.metadata,
                    created_at,
                });
            }
            let last = first + recorded.len() as u64 - 1;

            let start_index = inner.all.len();
            let count = recorded.len();
            inner.all.extend(recorded.iter().cloned());
            inner
                .streams
                .entry(stream_uuid.to_owned())
                .or_default()
                .extend(start_index..start_index + count);

            let notifiers = inner.notifiers.clone();
            (recorded, EventRange::new(first, last), notifiers)
        };

        // Deliver outside the lock. A closed or saturated receiver loses the
        // range; subscriptions recover through catch-up.
        for notifier in notifiers {
            let _ = notifier.try_send(range);
        }
        self.inner.lock().notifiers.retain(|tx| !tx.is_closed());

        Ok(recorded)
    }

    /// Registers a new notification feed receiving the `(first, last)` range
    /// of every subsequent append.
    pub fn notifications(&self) -> mpsc::Receiver<EventRange> {
        let (tx, rx) = mpsc::channel(NOTIFY_CAPACITY);
        self.inner.lock().notifiers.push(tx);
        rx
    }

    /// Number of committed events across all streams.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().all.len()
    }

    /// `true` when no event has been committed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl EventReader for MemoryStore {
    async fn read_stream(
        &self,
        stream_uuid: &str,
        from_version: u64,
        max: usize,
    ) -> Result<Vec<RecordedEvent>, StoreError> {
        let inner = self.inner.lock();
        let indices = inner
            .streams
            .get(stream_uuid)
            .ok_or_else(|| StoreError::StreamNotFound(stream_uuid.to_owned()))?;
        let skip = from_version.saturating_sub(1) as usize;
        Ok(indices
            .iter()
            .skip(skip)
            .take(max)
            .map(|&i| inner.all[i].clone())
            .collect())
    }

    async fn read_all(
        &self,
        from_event_number: u64,
        max: usize,
    ) -> Result<Vec<RecordedEvent>, StoreError> {
        let inner = self.inner.lock();
        let skip = from_event_number.saturating_sub(1) as usize;
        Ok(inner.all.iter().skip(skip).take(max).cloned().collect())
    }

    async fn latest_event_number(&self) -> Result<u64, StoreError> {
        Ok(self.inner.lock().all.len() as u64)
    }

    async fn stream_version(&self, stream_uuid: &str) -> Result<u64, StoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .streams
            .get(stream_uuid)
            .map_or(0, |indices| indices.len() as u64))
    }
}

#[async_trait]
impl SubscriptionStore for MemoryStore {
    async fn subscribe(
        &self,
        stream_uuid: &str,
        name: &str,
        start_event_number: u64,
        start_stream_version: u64,
    ) -> Result<StoredSubscription, StoreError> {
        let mut inner = self.inner.lock();
        let key = (stream_uuid.to_owned(), name.to_owned());
        if let Some(existing) = inner.subscriptions.get(&key) {
            return Ok(existing.clone());
        }
        inner.next_subscription_id += 1;
        let row = StoredSubscription {
            subscription_id: inner.next_subscription_id,
            stream_uuid: stream_uuid.to_owned(),
            subscription_name: name.to_owned(),
            last_seen_event_number: Some(start_event_number),
            last_seen_stream_version: Some(start_stream_version),
            created_at: Utc::now(),
        };
        inner.subscriptions.insert(key, row.clone());
        Ok(row)
    }

    async fn ack(
        &self,
        stream_uuid: &str,
        name: &str,
        event_number: u64,
        stream_version: u64,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let key = (stream_uuid.to_owned(), name.to_owned());
        if let Some(row) = inner.subscriptions.get_mut(&key) {
            row.last_seen_event_number = Some(event_number);
            row.last_seen_stream_version = Some(stream_version);
        }
        Ok(())
    }

    async fn unsubscribe(&self, stream_uuid: &str, name: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner
            .subscriptions
            .remove(&(stream_uuid.to_owned(), name.to_owned()));
        Ok(())
    }
}

struct MemoryLockGuard {
    subscription_id: i64,
    inner: Arc<Mutex<Inner>>,
}

impl LockGuard for MemoryLockGuard {}

impl Drop for MemoryLockGuard {
    fn drop(&mut self) {
        self.inner.lock().locks.remove(&self.subscription_id);
    }
}

#[async_trait]
impl LockManager for MemoryStore {
    async fn try_lock(
        &self,
        subscription_id: i64,
    ) -> Result<Option<Box<dyn LockGuard>>, StoreError> {
        let mut inner = self.inner.lock();
        if inner.locks.insert(subscription_id) {
            Ok(Some(Box::new(MemoryLockGuard {
                subscription_id,
                inner: Arc::clone(&self.inner),
            })))
        } else {
            Ok(None)
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn payload(n: u64) -> EventData {
        EventData::new("test_event", Bytes::from(format!("event-{n}")))
    }

    // --- Append tests ---

    #[tokio::test]
    async fn test_memory_append_assigns_dense_positions() {
        let store = MemoryStore::new();
        let a = store
            .append_to_stream("acct-1", ExpectedVersion::Any, vec![payload(1), payload(2)])
            .unwrap();
        let b = store
            .append_to_stream("acct-2", ExpectedVersion::Any, vec![payload(3)])
            .unwrap();

        assert_eq!(
            a.iter().map(|e| e.event_number).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert_eq!(
            a.iter().map(|e| e.stream_version).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert_eq!(b[0].event_number, 3);
        assert_eq!(b[0].stream_version, 1);
    }

    #[tokio::test]
    async fn test_memory_append_wrong_expected_version() {
        let store = MemoryStore::new();
        store
            .append_to_stream("s", ExpectedVersion::Exact(0), vec![payload(1)])
            .unwrap();

        let err = store
            .append_to_stream("s", ExpectedVersion::Exact(0), vec![payload(2)])
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::WrongExpectedVersion {
                expected: 0,
                current: 1,
                ..
            }
        ));

        // Any always succeeds.
        store
            .append_to_stream("s", ExpectedVersion::Any, vec![payload(3)])
            .unwrap();
    }

    #[tokio::test]
    async fn test_memory_append_empty_batch() {
        let store = MemoryStore::new();
        let recorded = store
            .append_to_stream("s", ExpectedVersion::Any, vec![])
            .unwrap();
        assert!(recorded.is_empty());
        assert!(store.is_empty());
    }

    // --- Reader tests ---

    #[tokio::test]
    async fn test_memory_read_stream() {
        let store = MemoryStore::new();
        store
            .append_to_stream("other", ExpectedVersion::Any, vec![payload(0)])
            .unwrap();
        store
            .append_to_stream(
                "s",
                ExpectedVersion::Any,
                vec![payload(1), payload(2), payload(3)],
            )
            .unwrap();

        let events = store.read_stream("s", 2, 10).await.unwrap();
        assert_eq!(
            events.iter().map(|e| e.stream_version).collect::<Vec<_>>(),
            vec![2, 3]
        );
        assert!(events.iter().all(|e| e.stream_uuid == "s"));

        // from_version 0 and 1 both read from the start.
        assert_eq!(store.read_stream("s", 0, 10).await.unwrap().len(), 3);
        assert_eq!(store.read_stream("s", 1, 2).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_memory_read_stream_not_found() {
        let store = MemoryStore::new();
        let err = store.read_stream("missing", 1, 10).await.unwrap_err();
        assert!(matches!(err, StoreError::StreamNotFound(s) if s == "missing"));
    }

    #[tokio::test]
    async fn test_memory_read_all() {
        let store = MemoryStore::new();
        store
            .append_to_stream("a", ExpectedVersion::Any, vec![payload(1), payload(2)])
            .unwrap();
        store
            .append_to_stream("b", ExpectedVersion::Any, vec![payload(3)])
            .unwrap();

        let events = store.read_all(2, 10).await.unwrap();
        assert_eq!(
            events.iter().map(|e| e.event_number).collect::<Vec<_>>(),
            vec![2, 3]
        );

        assert_eq!(store.latest_event_number().await.unwrap(), 3);
        assert_eq!(store.stream_version("a").await.unwrap(), 2);
        assert_eq!(store.stream_version("missing").await.unwrap(), 0);
    }

    // --- Subscription row tests ---

    #[tokio::test]
    async fn test_memory_subscribe_is_idempotent() {
        let store = MemoryStore::new();
        let first = store.subscribe("s", "proj", 0, 0).await.unwrap();
        assert_eq!(first.subscription_id, 1);
        assert_eq!(first.last_seen_event_number, Some(0));

        // A second subscribe returns the row unchanged, ignoring new starts.
        let again = store.subscribe("s", "proj", 9, 9).await.unwrap();
        assert_eq!(again, first);

        // A different name gets a fresh id.
        let other = store.subscribe("s", "audit", 0, 0).await.unwrap();
        assert_eq!(other.subscription_id, 2);
    }

    #[tokio::test]
    async fn test_memory_ack_overwrites_cursor() {
        let store = MemoryStore::new();
        store.subscribe("s", "proj", 0, 0).await.unwrap();
        store.ack("s", "proj", 7, 4).await.unwrap();

        let row = store.subscribe("s", "proj", 0, 0).await.unwrap();
        assert_eq!(row.last_seen_event_number, Some(7));
        assert_eq!(row.last_seen_stream_version, Some(4));
    }

    #[tokio::test]
    async fn test_memory_unsubscribe_deletes_row() {
        let store = MemoryStore::new();
        let first = store.subscribe("s", "proj", 0, 0).await.unwrap();
        store.unsubscribe("s", "proj").await.unwrap();
        // Idempotent on a missing row.
        store.unsubscribe("s", "proj").await.unwrap();

        let recreated = store.subscribe("s", "proj", 0, 0).await.unwrap();
        assert_ne!(recreated.subscription_id, first.subscription_id);
    }

    // --- Lock tests ---

    #[tokio::test]
    async fn test_memory_lock_exclusive_until_dropped() {
        let store = MemoryStore::new();
        let guard = store.try_lock(1).await.unwrap();
        assert!(guard.is_some());

        // Second holder is refused while the guard lives.
        assert!(store.try_lock(1).await.unwrap().is_none());
        // Unrelated key is free.
        assert!(store.try_lock(2).await.unwrap().is_some());

        drop(guard);
        assert!(store.try_lock(1).await.unwrap().is_some());
    }

    // --- Notification tests ---

    #[tokio::test]
    async fn test_memory_notifications_carry_ranges() {
        let store = MemoryStore::new();
        let mut feed = store.notifications();

        store
            .append_to_stream("s", ExpectedVersion::Any, vec![payload(1), payload(2)])
            .unwrap();
        store
            .append_to_stream("t", ExpectedVersion::Any, vec![payload(3)])
            .unwrap();

        assert_eq!(feed.recv().await, Some(EventRange::new(1, 2)));
        assert_eq!(feed.recv().await, Some(EventRange::new(3, 3)));
    }

    #[tokio::test]
    async fn test_memory_notifications_closed_receiver_pruned() {
        let store = MemoryStore::new();
        let feed = store.notifications();
        drop(feed);

        // Appending with a dropped receiver must not fail.
        store
            .append_to_stream("s", ExpectedVersion::Any, vec![payload(1)])
            .unwrap();
        assert_eq!(store.inner.lock().notifiers.len(), 0);
    }
}
