//! The async task driving one subscription.
//!
//! Owns the state machine and performs its effects: polls the advisory
//! lock, subscribes to the stream topic, spawns catch-up workers, delivers
//! to the subscriber mailbox and persists acks. Every await point also
//! watches the two termination signals: the subscriber's mailbox closing
//! (the bidirectional link) and the store-wide shutdown flag.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::event::RecordedEvent;
use crate::store::{EventReader, LockManager, StoreError, SubscriptionStore};
use crate::subscription::catchup::{run_catch_up, PAGE_CHANNEL_CAPACITY};
use crate::subscription::handle::{Command, SubscriptionMessage};
use crate::subscription::machine::{Effect, SubscriptionMachine};
use crate::subscription::{Mapper, Selector, StreamSelection, SubscriptionConfig};
use crate::topic::TopicHub;

// ---------------------------------------------------------------------------
// ExitReason
// ---------------------------------------------------------------------------

/// Why a subscription task stopped. Only [`Crashed`](ExitReason::Crashed)
/// leads to a supervised restart.
#[derive(Debug)]
pub(crate) enum ExitReason {
    /// Explicit unsubscribe: the durable row is deleted.
    Unsubscribed,
    /// The linked subscriber went away; the durable row survives.
    SubscriberDown,
    /// Store-wide shutdown.
    Shutdown,
    /// Transient failure; in-memory state is discarded and the durable
    /// cursor preserves progress across the restart.
    Crashed(StoreError),
}

// ---------------------------------------------------------------------------
// Dependencies and parameters
// ---------------------------------------------------------------------------

/// Services shared by every subscription task of a store.
#[derive(Clone)]
pub(crate) struct SubscriptionDeps {
    pub reader: Arc<dyn EventReader>,
    pub store: Arc<dyn SubscriptionStore>,
    pub locks: Arc<dyn LockManager>,
    pub hub: Arc<TopicHub>,
    pub config: SubscriptionConfig,
    pub shutdown: watch::Receiver<bool>,
}

/// Per-subscription parameters, kept across supervised restarts.
#[derive(Clone)]
pub(crate) struct SubscriptionParams<T> {
    pub selection: StreamSelection,
    pub name: String,
    pub start_event_number: u64,
    pub start_stream_version: u64,
    pub selector: Option<Selector>,
    pub mapper: Mapper<T>,
    pub max_size: usize,
}

/// Aborts the catch-up worker when the owning task unwinds.
struct WorkerGuard(JoinHandle<()>);

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

// ---------------------------------------------------------------------------
// run_subscription
// ---------------------------------------------------------------------------

/// Runs one subscription until it terminates; see [`ExitReason`].
///
/// The control receiver and subscriber sender outlive a single run so a
/// supervised restart keeps serving the same handle.
pub(crate) async fn run_subscription<T: Clone + Send + 'static>(
    deps: &SubscriptionDeps,
    params: &SubscriptionParams<T>,
    control: &mut mpsc::Receiver<Command>,
    subscriber: &mpsc::Sender<SubscriptionMessage<T>>,
) -> ExitReason {
    let mut shutdown = deps.shutdown.clone();
    let stream_uuid = params.selection.stream_uuid().to_owned();

    let row = match deps
        .store
        .subscribe(
            &stream_uuid,
            &params.name,
            params.start_event_number,
            params.start_stream_version,
        )
        .await
    {
        Ok(row) => row,
        Err(err) => return ExitReason::Crashed(err),
    };

    // Initial: poll until this process wins the advisory lock. Whichever
    // node holds it runs the single active subscription for this row.
    let _lock = loop {
        match deps.locks.try_lock(row.subscription_id).await {
            Ok(Some(guard)) => break guard,
            Ok(None) => {}
            Err(err) => return ExitReason::Crashed(err),
        }
        tokio::select! {
            () = tokio::time::sleep(deps.config.lock_retry_interval) => {}
            () = subscriber.closed() => return ExitReason::SubscriberDown,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return ExitReason::Shutdown;
                }
            }
            cmd = control.recv() => match cmd {
                Some(Command::Unsubscribe) => {
                    return match deps.store.unsubscribe(&stream_uuid, &params.name).await {
                        Ok(()) => ExitReason::Unsubscribed,
                        Err(err) => ExitReason::Crashed(err),
                    };
                }
                Some(Command::Ack(_)) => {}
                None => return ExitReason::SubscriberDown,
            }
        }
    };
    debug!(
        stream_uuid = %stream_uuid,
        name = %params.name,
        subscription_id = row.subscription_id,
        "advisory lock acquired"
    );

    // Subscribe to the topic before computing the catch-up range so no
    // commit can fall between replayed history and the live tail.
    let mut topic = deps.hub.subscribe(params.selection.topic());

    // Re-read the cursor now that the lock is held: the previous holder
    // may have acknowledged progress while this task was polling.
    let row = match deps
        .store
        .subscribe(
            &stream_uuid,
            &params.name,
            params.start_event_number,
            params.start_stream_version,
        )
        .await
    {
        Ok(row) => row,
        Err(err) => return ExitReason::Crashed(err),
    };
    let start_position = match params.selection {
        StreamSelection::All => row.last_seen_event_number.unwrap_or(0),
        StreamSelection::Single(_) => row.last_seen_stream_version.unwrap_or(0),
    };

    let low_water = deps.config.low_water.unwrap_or(params.max_size / 2);
    let mut machine: SubscriptionMachine<T> = SubscriptionMachine::new(
        params.selection.clone(),
        params.selector.clone(),
        params.mapper.clone(),
        params.max_size,
        low_water,
        start_position,
    );
    let mut pages: Option<mpsc::Receiver<Result<Vec<RecordedEvent>, StoreError>>> = None;
    let mut worker: Option<WorkerGuard> = None;

    let effects = machine.start();
    if let Some(exit) = apply_effects(
        effects,
        deps,
        params,
        &stream_uuid,
        &mut machine,
        &mut pages,
        &mut worker,
        subscriber,
    )
    .await
    {
        return exit;
    }

    loop {
        let effects = tokio::select! {
            cmd = control.recv() => match cmd {
                Some(Command::Ack(ack)) => machine.ack(ack),
                Some(Command::Unsubscribe) => machine.unsubscribe(),
                None => return ExitReason::SubscriberDown,
            },
            page = next_page(&mut pages) => match page {
                Some(Ok(events)) => machine.caught_up_events(&events),
                Some(Err(err)) => return ExitReason::Crashed(err),
                None => {
                    pages = None;
                    worker = None;
                    machine.catch_up_finished()
                }
            },
            batch = topic.recv() => match batch {
                Ok(events) => machine.live_events(&events),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(
                        stream_uuid = %stream_uuid,
                        name = %params.name,
                        missed,
                        "subscription fell behind its topic, catching up from the store"
                    );
                    machine.lagged()
                }
                Err(broadcast::error::RecvError::Closed) => return ExitReason::Shutdown,
            },
            () = subscriber.closed() => return ExitReason::SubscriberDown,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return ExitReason::Shutdown;
                }
                Vec::new()
            }
        };

        if let Some(exit) = apply_effects(
            effects,
            deps,
            params,
            &stream_uuid,
            &mut machine,
            &mut pages,
            &mut worker,
            subscriber,
        )
        .await
        {
            return exit;
        }
    }
}

/// Next catch-up page, pending forever while no worker is active.
async fn next_page(
    pages: &mut Option<mpsc::Receiver<Result<Vec<RecordedEvent>, StoreError>>>,
) -> Option<Result<Vec<RecordedEvent>, StoreError>> {
    match pages {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Performs machine effects in order; returns an exit reason when one ends
/// the task.
#[allow(clippy::too_many_arguments)]
async fn apply_effects<T: Clone + Send + 'static>(
    effects: Vec<Effect<T>>,
    deps: &SubscriptionDeps,
    params: &SubscriptionParams<T>,
    stream_uuid: &str,
    machine: &mut SubscriptionMachine<T>,
    pages: &mut Option<mpsc::Receiver<Result<Vec<RecordedEvent>, StoreError>>>,
    worker: &mut Option<WorkerGuard>,
    subscriber: &mpsc::Sender<SubscriptionMessage<T>>,
) -> Option<ExitReason> {
    for effect in effects {
        match effect {
            Effect::NotifySubscribed => {
                if subscriber.send(SubscriptionMessage::Subscribed).await.is_err() {
                    return Some(ExitReason::SubscriberDown);
                }
            }
            Effect::Forward(batch) => {
                if subscriber
                    .send(SubscriptionMessage::Events(batch))
                    .await
                    .is_err()
                {
                    return Some(ExitReason::SubscriberDown);
                }
            }
            Effect::PersistAck {
                event_number,
                stream_version,
            } => {
                if let Err(err) = deps
                    .store
                    .ack(stream_uuid, &params.name, event_number, stream_version)
                    .await
                {
                    return Some(ExitReason::Crashed(err));
                }
            }
            Effect::StartCatchUp { from } => {
                let (tx, rx) = mpsc::channel(PAGE_CHANNEL_CAPACITY);
                let handle = tokio::spawn(run_catch_up(
                    Arc::clone(&deps.reader),
                    params.selection.clone(),
                    from,
                    deps.config.catch_up_batch_size,
                    tx,
                ));
                *worker = Some(WorkerGuard(handle));
                *pages = Some(rx);
                machine.catch_up_started();
            }
            Effect::DeleteDurable => {
                if let Err(err) = deps.store.unsubscribe(stream_uuid, &params.name).await {
                    return Some(ExitReason::Crashed(err));
                }
            }
            Effect::Stop => return Some(ExitReason::Unsubscribed),
        }
    }
    None
}
