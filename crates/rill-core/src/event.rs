//! Event and stream primitives.
//!
//! Every committed event carries two positions: a store-wide `event_number`
//! (its slot in the [`ALL_STREAM`] total order) and a per-stream
//! `stream_version` (1-based, dense within its stream). Both are assigned at
//! commit time and never change afterwards.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Reserved identifier of the synthetic all-streams view.
///
/// Subscribing to or reading from `$all` observes every event in the store
/// in `event_number` order.
pub const ALL_STREAM: &str = "$all";

// ---------------------------------------------------------------------------
// RecordedEvent
// ---------------------------------------------------------------------------

/// An immutable event as committed to the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedEvent {
    /// Globally unique event identifier.
    pub event_id: Uuid,
    /// Store-wide monotonic, dense position in the `$all` order.
    pub event_number: u64,
    /// Identifier of the owning stream.
    pub stream_uuid: String,
    /// 1-based dense position within the owning stream.
    pub stream_version: u64,
    /// Application-assigned event type.
    pub event_type: String,
    /// Optional correlation identifier shared by related events.
    pub correlation_id: Option<Uuid>,
    /// Optional identifier of the event that caused this one.
    pub causation_id: Option<Uuid>,
    /// Opaque payload. Serialization is the producer's concern.
    pub data: Bytes,
    /// Opaque metadata payload.
    pub metadata: Bytes,
    /// Commit timestamp.
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// EventData
// ---------------------------------------------------------------------------

/// Producer-side input to an append: an event before the store assigns its
/// positions and commit timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventData {
    /// Globally unique event identifier.
    pub event_id: Uuid,
    /// Application-assigned event type.
    pub event_type: String,
    /// Optional correlation identifier.
    pub correlation_id: Option<Uuid>,
    /// Optional causation identifier.
    pub causation_id: Option<Uuid>,
    /// Opaque payload.
    pub data: Bytes,
    /// Opaque metadata payload.
    pub metadata: Bytes,
}

impl EventData {
    /// Creates an event with a fresh id and the given type and payload.
    #[must_use]
    pub fn new(event_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.into(),
            correlation_id: None,
            causation_id: None,
            data: data.into(),
            metadata: Bytes::new(),
        }
    }

    /// Sets the correlation identifier.
    #[must_use]
    pub fn correlation_id(mut self, id: Uuid) -> Self {
        self.correlation_id = Some(id);
        self
    }

    /// Sets the causation identifier.
    #[must_use]
    pub fn causation_id(mut self, id: Uuid) -> Self {
        self.causation_id = Some(id);
        self
    }

    /// Sets the metadata payload.
    #[must_use]
    pub fn metadata(mut self, metadata: impl Into<Bytes>) -> Self {
        self.metadata = metadata.into();
        self
    }
}

// ---------------------------------------------------------------------------
// ExpectedVersion
// ---------------------------------------------------------------------------

/// Optimistic-concurrency expectation for an append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// Append regardless of the stream's current version.
    Any,
    /// Append only if the stream's current version matches exactly
    /// (`Exact(0)` requires the stream to be empty or absent).
    Exact(u64),
}

// ---------------------------------------------------------------------------
// EventBatch
// ---------------------------------------------------------------------------

/// A batch of events shared across broadcast topics.
///
/// Wrapped in an [`Arc`] so fanning a batch out to many subscriptions clones
/// a pointer, not the rows.
pub type EventBatch = Arc<Vec<RecordedEvent>>;

// ---------------------------------------------------------------------------
// EventRange
// ---------------------------------------------------------------------------

/// The `(first, last)` event-number range of one committed append batch, as
/// carried on the asynchronous notification channel.
///
/// Wire format is two decimal integers separated by a comma:
/// `"<first_event_number>,<last_event_number>"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventRange {
    /// Event number of the first event in the batch.
    pub first: u64,
    /// Event number of the last event in the batch.
    pub last: u64,
}

impl EventRange {
    /// Creates a range. `first` must not exceed `last`.
    #[must_use]
    pub fn new(first: u64, last: u64) -> Self {
        debug_assert!(first <= last, "inverted event range {first}..{last}");
        Self { first, last }
    }

    /// Number of events covered by the range.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.last - self.first + 1
    }

    /// Always `false`: a range covers at least one event.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }
}

impl fmt::Display for EventRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.first, self.last)
    }
}

/// Error parsing a notification payload into an [`EventRange`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid notification payload {0:?}")]
pub struct InvalidRange(pub String);

impl FromStr for EventRange {
    type Err = InvalidRange;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || InvalidRange(s.to_owned());
        let (first, last) = s.split_once(',').ok_or_else(bad)?;
        let first: u64 = first.trim().parse().map_err(|_| bad())?;
        let last: u64 = last.trim().parse().map_err(|_| bad())?;
        if first == 0 || first > last {
            return Err(bad());
        }
        Ok(Self { first, last })
    }
}

// ===========================================================================
// Tests
// ===========================================================================
