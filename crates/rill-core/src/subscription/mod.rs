//! Persistent, ordered, at-least-once subscriptions.
//!
//! A subscription couples a durable cursor (a row in the subscription
//! store) with a per-subscription delivery process:
//!
//! ```text
//!  append ──► rows + notify ──► relay ──► topic ──┐
//!                                                 ▼
//!            catch-up worker ──► state machine ──► subscriber
//!                  ▲                   │
//!                  └── durable cursor ◄┘ ack
//! ```
//!
//! The advisory lock makes each `(stream, name)` pair single-active across
//! every node sharing the database; a local registry enforces the same
//! exclusivity within one process. Delivery is at-least-once and strictly
//! ordered; consumers must be idempotent.
//!
//! [`Subscriptions`] is the entry point: it resolves start positions,
//! registers names and spawns the supervised tasks.

mod buffer;
mod catchup;
mod handle;
mod machine;
mod registry;
mod supervisor;
mod task;

pub use handle::{Ack, Subscription, SubscriptionMessage};
pub use machine::SubscriptionState;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use crate::event::{RecordedEvent, ALL_STREAM};
use crate::store::{EventReader, LockManager, SubscriptionStore};
use crate::topic::TopicHub;
use registry::SubscriptionRegistry;
use task::{SubscriptionDeps, SubscriptionParams};

/// Capacity of a handle's control channel.
const COMMAND_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// Selector / Mapper
// ---------------------------------------------------------------------------

/// Predicate applied before forwarding. Rejected events are not delivered
/// but still advance the durable cursor on a later ack.
pub type Selector = Arc<dyn Fn(&RecordedEvent) -> bool + Send + Sync>;

/// Transformation applied to each selected event before delivery.
pub type Mapper<T> = Arc<dyn Fn(&RecordedEvent) -> T + Send + Sync>;

// ---------------------------------------------------------------------------
// StreamSelection
// ---------------------------------------------------------------------------

/// What a subscription observes: one stream, or the `$all` view.
///
/// Also decides the selection-relative position of an event: the dense
/// per-stream `stream_version` for a single stream, the dense store-wide
/// `event_number` for `$all`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum StreamSelection {
    /// The synthetic all-streams view.
    All,
    /// A single named stream.
    Single(String),
}

impl StreamSelection {
    /// Topic key and durable-row stream identifier.
    pub(crate) fn stream_uuid(&self) -> &str {
        match self {
            Self::All => ALL_STREAM,
            Self::Single(stream_uuid) => stream_uuid,
        }
    }

    /// Alias of [`stream_uuid`](Self::stream_uuid) for topic lookups.
    pub(crate) fn topic(&self) -> &str {
        self.stream_uuid()
    }

    /// Selection-relative position of an event.
    pub(crate) fn position(&self, event: &RecordedEvent) -> u64 {
        match self {
            Self::All => event.event_number,
            Self::Single(_) => event.stream_version,
        }
    }
}

// ---------------------------------------------------------------------------
// StartFrom
// ---------------------------------------------------------------------------

/// Where a newly created subscription starts reading.
///
/// Ignored when the durable row already exists: the persisted cursor wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartFrom {
    /// From the first event.
    #[default]
    Origin,
    /// From the stream tail at subscribe time; only later events are
    /// delivered.
    Current,
    /// From an explicit position: a `stream_version` for single-stream
    /// subscriptions, an `event_number` for `$all`. Delivery starts after
    /// this position.
    Position(u64),
}

// ---------------------------------------------------------------------------
// SubscriptionOptions
// ---------------------------------------------------------------------------

/// Per-subscription options, parameterized over the delivered payload type.
///
/// ```rust,ignore
/// // Deliver only even-numbered events, as bare event numbers.
/// let options = SubscriptionOptions::new()
///     .start_from(StartFrom::Origin)
///     .select(|e| e.event_number % 2 == 0)
///     .map(|e| e.event_number);
/// ```
pub struct SubscriptionOptions<T = RecordedEvent> {
    pub(crate) start_from: StartFrom,
    pub(crate) selector: Option<Selector>,
    pub(crate) mapper: Mapper<T>,
    pub(crate) max_size: Option<usize>,
}

impl SubscriptionOptions<RecordedEvent> {
    /// Options delivering raw events from the origin.
    #[must_use]
    pub fn new() -> Self {
        Self {
            start_from: StartFrom::Origin,
            selector: None,
            mapper: Arc::new(RecordedEvent::clone),
            max_size: None,
        }
    }
}

impl Default for SubscriptionOptions<RecordedEvent> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SubscriptionOptions<T> {
    /// Sets the start position for a subscription created by this call.
    #[must_use]
    pub fn start_from(mut self, start_from: StartFrom) -> Self {
        self.start_from = start_from;
        self
    }

    /// Sets the selector predicate.
    #[must_use]
    pub fn select(mut self, selector: impl Fn(&RecordedEvent) -> bool + Send + Sync + 'static) -> Self {
        self.selector = Some(Arc::new(selector));
        self
    }

    /// Replaces the mapper, changing the delivered payload type.
    #[must_use]
    pub fn map<U>(
        self,
        mapper: impl Fn(&RecordedEvent) -> U + Send + Sync + 'static,
    ) -> SubscriptionOptions<U> {
        SubscriptionOptions {
            start_from: self.start_from,
            selector: self.selector,
            mapper: Arc::new(mapper),
            max_size: self.max_size,
        }
    }

    /// Overrides the configured pending-buffer capacity.
    #[must_use]
    pub fn max_size(mut self, max_size: usize) -> Self {
        self.max_size = Some(max_size);
        self
    }
}

impl<T> std::fmt::Debug for SubscriptionOptions<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionOptions")
            .field("start_from", &self.start_from)
            .field("selector", &self.selector.is_some())
            .field("max_size", &self.max_size)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// SubscriptionConfig
// ---------------------------------------------------------------------------

/// Store-wide subscription defaults.
#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
    /// Pending-buffer capacity before a subscription reports max capacity.
    pub max_size: usize,
    /// Drain level at which a max-capacity subscription recovers.
    /// Defaults to half of the effective `max_size`.
    pub low_water: Option<usize>,
    /// Page size for catch-up reads.
    pub catch_up_batch_size: usize,
    /// Poll interval while waiting for the advisory lock.
    pub lock_retry_interval: Duration,
    /// Delay before a crashed subscription restarts.
    pub restart_delay: Duration,
    /// Capacity of the subscriber's mailbox.
    pub mailbox_capacity: usize,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            low_water: None,
            catch_up_batch_size: 1000,
            lock_retry_interval: Duration::from_secs(1),
            restart_delay: Duration::from_millis(200),
            mailbox_capacity: 16,
        }
    }
}

// ---------------------------------------------------------------------------
// SubscribeError
// ---------------------------------------------------------------------------

/// Errors from the subscribe API.
#[derive(Debug, thiserror::Error)]
pub enum SubscribeError {
    /// A live local subscription with the same `(stream, name)` exists.
    #[error("subscription {name:?} on stream {stream_uuid:?} already exists")]
    AlreadyExists {
        /// Stream of the existing subscription.
        stream_uuid: String,
        /// Name of the existing subscription.
        name: String,
    },
    /// The store is shutting down.
    #[error("event store is shutting down")]
    ShuttingDown,
}

// ---------------------------------------------------------------------------
// Subscriptions
// ---------------------------------------------------------------------------

/// Entry point for creating and removing subscriptions.
///
/// Cheap to clone; all clones share the registry and configuration.
#[derive(Clone)]
pub struct Subscriptions {
    reader: Arc<dyn EventReader>,
    store: Arc<dyn SubscriptionStore>,
    locks: Arc<dyn LockManager>,
    hub: Arc<TopicHub>,
    registry: Arc<SubscriptionRegistry>,
    config: SubscriptionConfig,
    shutdown: watch::Receiver<bool>,
}

impl Subscriptions {
    /// Creates the coordinator over a storage backend and topic hub.
    ///
    /// `shutdown` flipping to `true` (or its sender dropping) terminates
    /// every subscription task.
    #[must_use]
    pub fn new(
        reader: Arc<dyn EventReader>,
        store: Arc<dyn SubscriptionStore>,
        locks: Arc<dyn LockManager>,
        hub: Arc<TopicHub>,
        config: SubscriptionConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            reader,
            store,
            locks,
            hub,
            registry: Arc::new(SubscriptionRegistry::new()),
            config,
            shutdown,
        }
    }

    /// Subscribes `name` to a single stream.
    ///
    /// The first message on the returned handle is
    /// [`SubscriptionMessage::Subscribed`], sent once the advisory lock is
    /// won.
    ///
    /// # Errors
    ///
    /// [`SubscribeError::AlreadyExists`] when a live local subscription
    /// holds the same `(stream, name)`; storage errors from resolving
    /// [`StartFrom::Current`].
    pub async fn subscribe_to_stream<T: Clone + Send + 'static>(
        &self,
        stream_uuid: &str,
        name: &str,
        options: SubscriptionOptions<T>,
    ) -> crate::Result<Subscription<T>> {
        self.subscribe(StreamSelection::Single(stream_uuid.to_owned()), name, options)
            .await
    }

    /// Subscribes `name` to the `$all` view.
    ///
    /// # Errors
    ///
    /// As [`subscribe_to_stream`](Self::subscribe_to_stream).
    pub async fn subscribe_to_all_streams<T: Clone + Send + 'static>(
        &self,
        name: &str,
        options: SubscriptionOptions<T>,
    ) -> crate::Result<Subscription<T>> {
        self.subscribe(StreamSelection::All, name, options).await
    }

    /// Deletes the durable subscription row for `(stream_uuid, name)` and
    /// terminates its live process if one runs here. Idempotent.
    ///
    /// # Errors
    ///
    /// Storage errors from the row deletion.
    pub async fn unsubscribe_from_stream(&self, stream_uuid: &str, name: &str) -> crate::Result<()> {
        let key = (stream_uuid.to_owned(), name.to_owned());
        if let Some(control) = self.registry.control(&key) {
            // Stop the live process; it deletes the row on its way out.
            let _ = control.send(handle::Command::Unsubscribe).await;
        }
        // Delete directly as well: the live process may be mid-teardown for
        // another reason, or running on a different node.
        self.store.unsubscribe(stream_uuid, name).await?;
        Ok(())
    }

    /// [`unsubscribe_from_stream`](Self::unsubscribe_from_stream) for a
    /// `$all` subscription.
    ///
    /// # Errors
    ///
    /// Storage errors from the row deletion.
    pub async fn unsubscribe_from_all_streams(&self, name: &str) -> crate::Result<()> {
        self.unsubscribe_from_stream(ALL_STREAM, name).await
    }

    async fn subscribe<T: Clone + Send + 'static>(
        &self,
        selection: StreamSelection,
        name: &str,
        options: SubscriptionOptions<T>,
    ) -> crate::Result<Subscription<T>> {
        if *self.shutdown.borrow() {
            return Err(SubscribeError::ShuttingDown.into());
        }

        let (start_event_number, start_stream_version) =
            self.resolve_start(&selection, options.start_from).await?;

        let key = (selection.stream_uuid().to_owned(), name.to_owned());
        let (control_tx, control_rx) = mpsc::channel(COMMAND_CAPACITY);
        let Some(epoch) = self.registry.register(key.clone(), control_tx.clone()) else {
            return Err(SubscribeError::AlreadyExists {
                stream_uuid: key.0,
                name: key.1,
            }
            .into());
        };
        let (message_tx, message_rx) = mpsc::channel(self.config.mailbox_capacity);

        let params = SubscriptionParams {
            selection,
            name: name.to_owned(),
            start_event_number,
            start_stream_version,
            selector: options.selector,
            mapper: options.mapper,
            max_size: options.max_size.unwrap_or(self.config.max_size),
        };
        let deps = SubscriptionDeps {
            reader: Arc::clone(&self.reader),
            store: Arc::clone(&self.store),
            locks: Arc::clone(&self.locks),
            hub: Arc::clone(&self.hub),
            config: self.config.clone(),
            shutdown: self.shutdown.clone(),
        };
        tokio::spawn(supervisor::run_supervised(
            deps,
            params,
            control_rx,
            message_tx,
            Arc::clone(&self.registry),
            key.clone(),
            epoch,
        ));

        Ok(Subscription::new(key.0, key.1, control_tx, message_rx))
    }

    /// Resolves a [`StartFrom`] into the `(event_number, stream_version)`
    /// pair stored on a freshly created durable row.
    async fn resolve_start(
        &self,
        selection: &StreamSelection,
        start_from: StartFrom,
    ) -> crate::Result<(u64, u64)> {
        Ok(match (start_from, selection) {
            (StartFrom::Origin, _) => (0, 0),
            (StartFrom::Position(position), StreamSelection::All) => (position, 0),
            (StartFrom::Position(position), StreamSelection::Single(_)) => (0, position),
            (StartFrom::Current, StreamSelection::All) => {
                (self.reader.latest_event_number().await?, 0)
            }
            (StartFrom::Current, StreamSelection::Single(stream_uuid)) => {
                (0, self.reader.stream_version(stream_uuid).await?)
            }
        })
    }
}
