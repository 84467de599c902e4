//! Storage seams between the subscription runtime and its backend.
//!
//! The runtime never talks to a database directly: it reads events through
//! [`EventReader`], persists cursor progress through [`SubscriptionStore`]
//! and claims single-active-subscriber rights through [`LockManager`]. The
//! PostgreSQL backend lives in `rill-storage`; [`crate::memory::MemoryStore`]
//! implements the same traits in process for tests and single-node use.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::event::RecordedEvent;

// ---------------------------------------------------------------------------
// StoreError
// ---------------------------------------------------------------------------

/// Errors surfaced by a storage backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A read was issued against a stream with no rows.
    ///
    /// Never raised on the subscription flow itself; catch-up treats an
    /// absent stream as empty.
    #[error("stream {0:?} not found")]
    StreamNotFound(String),

    /// A concurrent creator won the check-then-insert race for a durable
    /// subscription row.
    #[error("subscription {name:?} on stream {stream_uuid:?} already exists")]
    SubscriptionAlreadyExists {
        /// Stream the subscription is attached to.
        stream_uuid: String,
        /// Subscription name.
        name: String,
    },

    /// An append carried an `Exact` version expectation that did not match
    /// the stream's current version.
    #[error("wrong expected version for stream {stream_uuid:?}: expected {expected}, current {current}")]
    WrongExpectedVersion {
        /// Stream the append targeted.
        stream_uuid: String,
        /// Version the producer expected.
        expected: u64,
        /// Version the stream actually had.
        current: u64,
    },

    /// Transient backend failure (connection loss, query error, ...).
    ///
    /// Crashes the owning subscription task; the supervisor restarts it with
    /// fresh in-memory state and the durable cursor preserves progress.
    #[error("storage backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl StoreError {
    /// Wraps an arbitrary backend failure.
    pub fn backend(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Backend(Box::new(err))
    }
}

// ---------------------------------------------------------------------------
// EventReader
// ---------------------------------------------------------------------------

/// Stateless forward reads over committed events.
///
/// Batch sizes are chosen by the caller; the reader holds no cursor.
#[async_trait]
pub trait EventReader: Send + Sync {
    /// Reads up to `max` events of `stream_uuid` with
    /// `stream_version >= from_version`, ascending.
    ///
    /// # Errors
    ///
    /// [`StoreError::StreamNotFound`] if the stream has no rows at all.
    async fn read_stream(
        &self,
        stream_uuid: &str,
        from_version: u64,
        max: usize,
    ) -> Result<Vec<RecordedEvent>, StoreError>;

    /// Reads up to `max` events with `event_number >= from_event_number`
    /// from the all-streams view, ascending.
    async fn read_all(
        &self,
        from_event_number: u64,
        max: usize,
    ) -> Result<Vec<RecordedEvent>, StoreError>;

    /// Highest committed event number, or 0 for an empty store.
    async fn latest_event_number(&self) -> Result<u64, StoreError>;

    /// Current version of `stream_uuid`, or 0 if the stream does not exist.
    async fn stream_version(&self, stream_uuid: &str) -> Result<u64, StoreError>;
}

// ---------------------------------------------------------------------------
// StoredSubscription
// ---------------------------------------------------------------------------

/// The durable subscription row: a named cursor over a stream or `$all`.
///
/// `last_seen_*` is the highest contiguous prefix the subscriber has
/// acknowledged. It never decreases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSubscription {
    /// Backend-assigned identifier; also the advisory-lock key.
    pub subscription_id: i64,
    /// Stream the subscription is attached to (may be `$all`).
    pub stream_uuid: String,
    /// Subscription name, unique per stream.
    pub subscription_name: String,
    /// Last acknowledged event number.
    pub last_seen_event_number: Option<u64>,
    /// Last acknowledged stream version.
    pub last_seen_stream_version: Option<u64>,
    /// Row creation timestamp.
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// SubscriptionStore
// ---------------------------------------------------------------------------

/// CRUD over durable subscription rows.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Looks up the row for `(stream_uuid, name)`, creating it with
    /// `last_seen_* = start_*` if absent. An existing row is returned
    /// unchanged, whatever start positions are supplied.
    ///
    /// # Errors
    ///
    /// [`StoreError::SubscriptionAlreadyExists`] only when a concurrent
    /// creator races the check-then-insert and the row cannot be re-read.
    async fn subscribe(
        &self,
        stream_uuid: &str,
        name: &str,
        start_event_number: u64,
        start_stream_version: u64,
    ) -> Result<StoredSubscription, StoreError>;

    /// Unconditionally overwrites the cursor. The caller holds the advisory
    /// lock and guarantees monotonicity.
    async fn ack(
        &self,
        stream_uuid: &str,
        name: &str,
        event_number: u64,
        stream_version: u64,
    ) -> Result<(), StoreError>;

    /// Deletes the durable row. Succeeds if no row exists.
    async fn unsubscribe(&self, stream_uuid: &str, name: &str) -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// LockManager
// ---------------------------------------------------------------------------

/// Session-scoped lock held for as long as the guard lives.
///
/// Dropping the guard releases the lock (for the PostgreSQL backend, by
/// closing the session that holds the advisory lock).
pub trait LockGuard: Send {}

/// Cluster-wide mutual exclusion keyed by subscription id.
///
/// At most one holder per key exists across every node sharing the backend;
/// this is what makes a subscription single-active cluster-wide.
#[async_trait]
pub trait LockManager: Send + Sync {
    /// Attempts to acquire the exclusive lock for `subscription_id` without
    /// waiting. Returns `None` when another session holds it.
    async fn try_lock(
        &self,
        subscription_id: i64,
    ) -> Result<Option<Box<dyn LockGuard>>, StoreError>;
}
