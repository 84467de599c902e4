//! The event store facade.
//!
//! Wires the PostgreSQL backend into the subscription runtime: one
//! listener task consumes append notifications, one relay fans committed
//! rows out to topics, and the subscription coordinator spawns supervised
//! per-subscription tasks on demand.
//!
//! ```text
//!  PgEventListener ──(first,last)──► NotificationRelay ──► TopicHub
//!                                                             │
//!  subscribe_to_stream / subscribe_to_all_streams ────────────┤
//!                                                             ▼
//!                                              supervised subscriptions
//! ```
//!
//! The listener/relay pair is a cluster singleton in spirit: every node may
//! run one, but subscriptions deliver only on the node holding their
//! advisory lock, so duplicate relays cost reads, not correctness.

use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::info;

use rill_core::{
    EventData, ExpectedVersion, NotificationRelay, RecordedEvent, Subscription,
    SubscriptionOptions, Subscriptions, TopicHub,
};
use rill_storage::{
    schema, PgAppendWriter, PgEventListener, PgEventReader, PgLockManager, PgSubscriptionStore,
};

use crate::config::StoreConfig;
use crate::error::DbError;

/// A connected event store.
///
/// Dropping the store without [`close`](Self::close) aborts nothing by
/// itself; background tasks stop once the shutdown signal's sender drops
/// with this struct.
pub struct EventStore {
    pool: PgPool,
    reader: Arc<PgEventReader>,
    writer: PgAppendWriter,
    subscriptions: Subscriptions,
    shutdown: watch::Sender<bool>,
    listener_task: JoinHandle<()>,
    relay_task: JoinHandle<()>,
}

impl EventStore {
    /// Connects to PostgreSQL and starts the notification pipeline.
    ///
    /// Run [`initialize`](Self::initialize) once before first use to
    /// install the schema and notification trigger.
    ///
    /// # Errors
    ///
    /// Connection failures.
    pub async fn connect(config: StoreConfig) -> Result<Self, DbError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.pool_size)
            .connect(&config.url)
            .await?;

        let reader = Arc::new(PgEventReader::new(pool.clone()));
        let store = Arc::new(PgSubscriptionStore::new(pool.clone()));
        let locks = Arc::new(PgLockManager::new(config.url.clone()));
        let writer = PgAppendWriter::new(pool.clone());
        let hub = Arc::new(TopicHub::new(config.topic_capacity));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (range_tx, range_rx) = mpsc::channel(config.range_queue_capacity);

        let listener = PgEventListener::new(
            pool.clone(),
            config.listener_config(),
            range_tx,
            shutdown_rx.clone(),
        );
        let relay = NotificationRelay::new(
            Arc::clone(&reader) as Arc<dyn rill_core::EventReader>,
            Arc::clone(&hub),
            range_rx,
            shutdown_rx.clone(),
            config.relay_config(),
        );
        let listener_task = tokio::spawn(listener.run());
        let relay_task = tokio::spawn(relay.run());

        let subscriptions = Subscriptions::new(
            Arc::clone(&reader) as Arc<dyn rill_core::EventReader>,
            store,
            locks,
            hub,
            config.subscription_config(),
            shutdown_rx,
        );

        info!(channel = %config.channel, "event store connected");
        Ok(Self {
            pool,
            reader,
            writer,
            subscriptions,
            shutdown: shutdown_tx,
            listener_task,
            relay_task,
        })
    }

    /// Installs tables and the append-notification trigger. Idempotent.
    ///
    /// # Errors
    ///
    /// Failed DDL statements.
    pub async fn initialize(&self) -> Result<(), DbError> {
        schema::initialize(&self.pool).await?;
        Ok(())
    }

    /// The underlying connection pool.
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Appends events to a stream; the commit notifies every subscription.
    ///
    /// # Errors
    ///
    /// `WrongExpectedVersion` on an `Exact` mismatch; backend errors.
    pub async fn append_to_stream(
        &self,
        stream_uuid: &str,
        expected: ExpectedVersion,
        events: Vec<EventData>,
    ) -> Result<Vec<RecordedEvent>, DbError> {
        Ok(self
            .writer
            .append_to_stream(stream_uuid, expected, events)
            .await?)
    }

    /// Reads a stream forward; see
    /// [`EventReader::read_stream`](rill_core::EventReader::read_stream).
    ///
    /// # Errors
    ///
    /// `StreamNotFound` when the stream has no rows; backend errors.
    pub async fn read_stream(
        &self,
        stream_uuid: &str,
        from_version: u64,
        max: usize,
    ) -> Result<Vec<RecordedEvent>, DbError> {
        use rill_core::EventReader as _;
        Ok(self.reader.read_stream(stream_uuid, from_version, max).await?)
    }

    /// Reads the `$all` view forward.
    ///
    /// # Errors
    ///
    /// Backend errors.
    pub async fn read_all(
        &self,
        from_event_number: u64,
        max: usize,
    ) -> Result<Vec<RecordedEvent>, DbError> {
        use rill_core::EventReader as _;
        Ok(self.reader.read_all(from_event_number, max).await?)
    }

    /// Subscribes `name` to a single stream; see
    /// [`Subscriptions::subscribe_to_stream`].
    ///
    /// # Errors
    ///
    /// `SubscriptionAlreadyExists` for a live duplicate; backend errors.
    pub async fn subscribe_to_stream<T: Clone + Send + 'static>(
        &self,
        stream_uuid: &str,
        name: &str,
        options: SubscriptionOptions<T>,
    ) -> Result<Subscription<T>, DbError> {
        Ok(self
            .subscriptions
            .subscribe_to_stream(stream_uuid, name, options)
            .await?)
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
    ) -> Result<Subscription<T>, DbError> {
        Ok(self
            .subscriptions
            .subscribe_to_all_streams(name, options)
            .await?)
    }

    /// Deletes a durable subscription and stops its live process, if any.
    /// Idempotent.
    ///
    /// # Errors
    ///
    /// Backend errors from the row deletion.
    pub async fn unsubscribe_from_stream(
        &self,
        stream_uuid: &str,
        name: &str,
    ) -> Result<(), DbError> {
        Ok(self
            .subscriptions
            .unsubscribe_from_stream(stream_uuid, name)
            .await?)
    }

    /// [`unsubscribe_from_stream`](Self::unsubscribe_from_stream) for a
    /// `$all` subscription.
    ///
    /// # Errors
    ///
    /// Backend errors from the row deletion.
    pub async fn unsubscribe_from_all_streams(&self, name: &str) -> Result<(), DbError> {
        Ok(self.subscriptions.unsubscribe_from_all_streams(name).await?)
    }

    /// Gracefully stops the listener, relay and every subscription task,
    /// then closes the pool.
    ///
    /// # Errors
    ///
    /// None today; the signature leaves room for drain timeouts.
    pub async fn close(self) -> Result<(), DbError> {
        let _ = self.shutdown.send(true);
        let _ = self.listener_task.await;
        let _ = self.relay_task.await;
        self.pool.close().await;
        info!("event store closed");
        Ok(())
    }
}
