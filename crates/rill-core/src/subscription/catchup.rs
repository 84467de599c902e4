//! Transient catch-up worker.
//!
//! Spawned whenever a subscription needs to replay history: at startup from
//! the durable cursor, and again whenever a gap or topic lag is detected.
//! Pages forward with a fixed batch size and exits on a short page; the
//! owning task learns of completion by the result channel closing.
//!
//! The page channel is bounded, so a subscription that is slow to drain
//! pages throttles its own worker instead of ballooning memory.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::event::RecordedEvent;
use crate::store::{EventReader, StoreError};
use crate::subscription::StreamSelection;

/// Capacity of the worker-to-subscription page channel.
pub(crate) const PAGE_CHANNEL_CAPACITY: usize = 2;

/// Pages events from `from` (selection-relative, inclusive) to the current
/// tail, sending each page to the owning subscription.
///
/// An absent stream reads as empty: a subscription may start from origin on
/// a stream that has not seen its first append. A failed read is sent to
/// the owner, which crashes the subscription task and lets the supervisor
/// restart it from the durable cursor.
pub(crate) async fn run_catch_up(
    reader: Arc<dyn EventReader>,
    selection: StreamSelection,
    mut from: u64,
    batch_size: usize,
    pages: mpsc::Sender<Result<Vec<RecordedEvent>, StoreError>>,
) {
    trace!(?selection, from, "catch-up worker starting");
    loop {
        let page = match &selection {
            StreamSelection::All => reader.read_all(from, batch_size).await,
            StreamSelection::Single(stream_uuid) => {
                match reader.read_stream(stream_uuid, from, batch_size).await {
                    Err(StoreError::StreamNotFound(_)) => Ok(Vec::new()),
                    other => other,
                }
            }
        };

        match page {
            Ok(events) => {
                let count = events.len();
                if let Some(last) = events.last() {
                    from = selection.position(last) + 1;
                }
                if count > 0 && pages.send(Ok(events)).await.is_err() {
                    // Owner went away; nothing left to do.
                    return;
                }
                if count < batch_size {
                    trace!(?selection, next = from, "catch-up complete");
                    return;
                }
            }
            Err(err) => {
                debug!(?selection, %err, "catch-up read failed");
                let _ = pages.send(Err(err)).await;
                return;
            }
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

    use crate::event::{EventData, ExpectedVersion};
    use crate::memory::MemoryStore;

    fn seed(store: &MemoryStore, stream: &str, n: usize) {
        let events = (0..n)
            .map(|i| EventData::new("test_event", Bytes::from(format!("{i}"))))
            .collect();
        store
            .append_to_stream(stream, ExpectedVersion::Any, events)
            .unwrap();
    }

    async fn collect(
        store: &MemoryStore,
        selection: StreamSelection,
        from: u64,
        batch_size: usize,
    ) -> Vec<Vec<u64>> {
        let (tx, mut rx) = mpsc::channel(PAGE_CHANNEL_CAPACITY);
        let worker = tokio::spawn(run_catch_up(
            Arc::new(store.clone()),
            selection.clone(),
            from,
            batch_size,
            tx,
        ));
        let mut pages = Vec::new();
        while let Some(page) = rx.recv().await {
            pages.push(
                page.unwrap()
                    .iter()
                    .map(|e| selection.position(e))
                    .collect(),
            );
        }
        worker.await.unwrap();
        pages
    }

    #[tokio::test]
    async fn test_catch_up_pages_until_short_page() {
        let store = MemoryStore::new();
        seed(&store, "s", 5);

        let pages = collect(&store, StreamSelection::Single("s".into()), 1, 2).await;
        assert_eq!(pages, vec![vec![1, 2], vec![3, 4], vec![5]]);
    }

    #[tokio::test]
    async fn test_catch_up_exact_multiple_ends_with_empty_read() {
        let store = MemoryStore::new();
        seed(&store, "s", 4);

        // 4 events with batch size 2: the final page is full, so one more
        // (empty) read decides termination.
        let pages = collect(&store, StreamSelection::Single("s".into()), 1, 2).await;
        assert_eq!(pages, vec![vec![1, 2], vec![3, 4]]);
    }

    #[tokio::test]
    async fn test_catch_up_from_cursor() {
        let store = MemoryStore::new();
        seed(&store, "s", 5);

        let pages = collect(&store, StreamSelection::Single("s".into()), 4, 10).await;
        assert_eq!(pages, vec![vec![4, 5]]);
    }

    #[tokio::test]
    async fn test_catch_up_absent_stream_is_empty() {
        let store = MemoryStore::new();
        let pages = collect(&store, StreamSelection::Single("missing".into()), 1, 10).await;
        assert!(pages.is_empty());
    }

    #[tokio::test]
    async fn test_catch_up_all_stream_interleaves_by_event_number() {
        let store = MemoryStore::new();
        seed(&store, "a", 2);
        seed(&store, "b", 2);

        let pages = collect(&store, StreamSelection::All, 1, 3).await;
        assert_eq!(pages, vec![vec![1, 2, 3], vec![4]]);
    }
}
