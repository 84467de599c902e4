//! The per-subscription state machine.
//!
//! Pure transition logic: every input is a method that mutates the machine
//! and returns the [`Effect`]s the driving task must perform (send to the
//! subscriber, persist the cursor, spawn a catch-up worker, ...). Keeping
//! the machine free of I/O makes every transition unit-testable.
//!
//! # States
//!
//! ```text
//!                lock acquired
//!   Initial ───────────────────► RequestingCatchUp ──► CatchingUp
//!                                        ▲                  │ worker done
//!                 gap / lag detected     │                  ▼
//!   MaxCapacity ◄────────────────────► Subscribed ◄─────────┘
//!        │  ack drains below low water      │
//!        └──────────────────────────────────┘      any ──► Unsubscribed
//! ```
//!
//! Positions are selection-relative: a `$all` subscription orders by
//! `event_number`, a single-stream subscription by `stream_version`. Both
//! are dense, which is what makes duplicate suppression
//! (`position <= last_received`) and gap detection
//! (`position > last_received + 1`) sound.

use tracing::trace;

use crate::event::RecordedEvent;
use crate::subscription::buffer::{PendingBuffer, PendingEntry};
use crate::subscription::handle::Ack;
use crate::subscription::{Mapper, Selector, StreamSelection};

// ---------------------------------------------------------------------------
// SubscriptionState
// ---------------------------------------------------------------------------

/// Lifecycle state of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Waiting to win the advisory lock; polling.
    Initial,
    /// Lock held; a catch-up worker is about to start.
    RequestingCatchUp,
    /// Replaying history from the durable cursor.
    CatchingUp,
    /// Live-tailing committed events.
    Subscribed,
    /// Pending buffer reached `max_size`; ingress is still accepted but
    /// arrivals no longer trigger forwarding until the buffer drains to the
    /// low-water mark.
    MaxCapacity,
    /// Terminal: the durable row is gone and the process is stopping.
    Unsubscribed,
}

// ---------------------------------------------------------------------------
// Effect
// ---------------------------------------------------------------------------

/// Side effects requested by a transition, performed by the driver task in
/// order.
#[derive(Debug)]
pub(crate) enum Effect<T> {
    /// Tell the subscriber the subscription is live (sent once per lock
    /// acquisition).
    NotifySubscribed,
    /// Deliver an ordered batch to the subscriber.
    Forward(Vec<T>),
    /// Overwrite the durable cursor.
    PersistAck {
        event_number: u64,
        stream_version: u64,
    },
    /// Spawn a catch-up worker reading from `from` (selection-relative).
    StartCatchUp { from: u64 },
    /// Delete the durable subscription row.
    DeleteDurable,
    /// Terminate the subscription task.
    Stop,
}

// ---------------------------------------------------------------------------
// SubscriptionMachine
// ---------------------------------------------------------------------------

/// State machine for one subscription, parameterized over the mapped
/// payload type delivered to the subscriber.
pub(crate) struct SubscriptionMachine<T> {
    selection: StreamSelection,
    selector: Option<Selector>,
    mapper: Mapper<T>,
    state: SubscriptionState,
    pending: PendingBuffer<T>,
    /// Live events parked while catching up, reconciled on worker exit.
    backlog: Vec<RecordedEvent>,
    /// Highest position ingested from any source.
    last_received: u64,
    /// Highest position forwarded to the subscriber.
    last_seen: u64,
    /// Highest position the subscriber has acknowledged.
    last_ack: u64,
    /// A catch-up worker is currently running.
    catchup_active: bool,
    /// Lag was observed mid-catch-up; run another catch-up when the current
    /// worker exits instead of trusting the backlog.
    recatchup_on_finish: bool,
}

impl<T: Clone> SubscriptionMachine<T> {
    pub(crate) fn new(
        selection: StreamSelection,
        selector: Option<Selector>,
        mapper: Mapper<T>,
        max_size: usize,
        low_water: usize,
        start_position: u64,
    ) -> Self {
        Self {
            selection,
            selector,
            mapper,
            state: SubscriptionState::Initial,
            pending: PendingBuffer::new(max_size, low_water),
            backlog: Vec::new(),
            last_received: start_position,
            last_seen: start_position,
            last_ack: start_position,
            catchup_active: false,
            recatchup_on_finish: false,
        }
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> SubscriptionState {
        self.state
    }

    #[cfg(test)]
    pub(crate) fn last_received(&self) -> u64 {
        self.last_received
    }

    /// The advisory lock was acquired: announce the subscription and start
    /// catching up from the durable cursor.
    pub(crate) fn start(&mut self) -> Vec<Effect<T>> {
        debug_assert_eq!(self.state, SubscriptionState::Initial);
        self.state = SubscriptionState::RequestingCatchUp;
        vec![
            Effect::NotifySubscribed,
            Effect::StartCatchUp {
                from: self.last_received + 1,
            },
        ]
    }

    /// The driver spawned the requested catch-up worker.
    pub(crate) fn catch_up_started(&mut self) {
        if self.state == SubscriptionState::RequestingCatchUp {
            self.state = SubscriptionState::CatchingUp;
        }
        self.catchup_active = true;
    }

    /// A page of history from the catch-up worker.
    pub(crate) fn caught_up_events(&mut self, events: &[RecordedEvent]) -> Vec<Effect<T>> {
        if self.state == SubscriptionState::Unsubscribed {
            return Vec::new();
        }
        let mut effects = Vec::new();
        self.ingest(events);
        self.pump(&mut effects);
        effects
    }

    /// The catch-up worker exited: reconcile the parked live backlog and go
    /// live, unless lag or a backlog gap forces another round.
    pub(crate) fn catch_up_finished(&mut self) -> Vec<Effect<T>> {
        self.catchup_active = false;
        if self.state == SubscriptionState::Unsubscribed {
            return Vec::new();
        }
        if self.recatchup_on_finish {
            return self.begin_recatchup();
        }

        let backlog = std::mem::take(&mut self.backlog);
        let fresh: Vec<RecordedEvent> = backlog
            .into_iter()
            .filter(|e| self.matches_stream(e) && self.selection.position(e) > self.last_received)
            .collect();
        if let Some(first) = fresh.first() {
            if self.selection.position(first) > self.last_received + 1 {
                // The backlog starts past the tail we caught up to: a live
                // notification was lost in between. Read the hole back.
                return self.begin_recatchup();
            }
        }
        self.ingest(&fresh);

        if self.state != SubscriptionState::MaxCapacity {
            self.state = SubscriptionState::Subscribed;
        }
        let mut effects = Vec::new();
        self.pump(&mut effects);
        effects
    }

    /// A live batch from the stream topic.
    pub(crate) fn live_events(&mut self, events: &[RecordedEvent]) -> Vec<Effect<T>> {
        match self.state {
            SubscriptionState::Unsubscribed | SubscriptionState::Initial => Vec::new(),
            _ if self.catchup_active || self.state == SubscriptionState::RequestingCatchUp => {
                // Parked until the catch-up worker exits; reconciled then.
                self.backlog.extend(events.iter().cloned());
                Vec::new()
            }
            _ => {
                if let Some(first) = events
                    .iter()
                    .find(|e| self.matches_stream(e) && self.selection.position(e) > self.last_received)
                {
                    if self.selection.position(first) > self.last_received + 1 {
                        trace!(
                            expected = self.last_received + 1,
                            got = self.selection.position(first),
                            "gap in live events, catching up"
                        );
                        return self.begin_recatchup();
                    }
                }
                self.ingest(events);
                let mut effects = Vec::new();
                self.pump(&mut effects);
                effects
            }
        }
    }

    /// The topic receiver lagged: events were dropped on the broadcast
    /// channel and must be read back from the store.
    pub(crate) fn lagged(&mut self) -> Vec<Effect<T>> {
        match self.state {
            SubscriptionState::Unsubscribed | SubscriptionState::Initial => Vec::new(),
            _ if self.catchup_active || self.state == SubscriptionState::RequestingCatchUp => {
                self.recatchup_on_finish = true;
                Vec::new()
            }
            _ => self.begin_recatchup(),
        }
    }

    /// Subscriber acknowledgement.
    pub(crate) fn ack(&mut self, ack: Ack) -> Vec<Effect<T>> {
        if self.state == SubscriptionState::Unsubscribed {
            return Vec::new();
        }
        let position = match ack {
            Ack::Position(p) => p,
            Ack::Event {
                event_number,
                stream_version,
            } => match self.selection {
                StreamSelection::All => event_number,
                StreamSelection::Single(_) => stream_version,
            },
        };
        let Some(acked) = self.pending.ack_through(position) else {
            return Vec::new();
        };
        self.last_ack = self.last_ack.max(acked.position);

        let mut effects = vec![Effect::PersistAck {
            event_number: acked.event_number,
            stream_version: acked.stream_version,
        }];
        if self.state == SubscriptionState::MaxCapacity && self.pending.below_low_water() {
            self.state = if self.catchup_active {
                SubscriptionState::CatchingUp
            } else {
                SubscriptionState::Subscribed
            };
        }
        self.pump(&mut effects);
        effects
    }

    /// Explicit unsubscribe: delete the durable row and stop.
    pub(crate) fn unsubscribe(&mut self) -> Vec<Effect<T>> {
        self.state = SubscriptionState::Unsubscribed;
        vec![Effect::DeleteDurable, Effect::Stop]
    }

    // -- internals --

    fn matches_stream(&self, event: &RecordedEvent) -> bool {
        match &self.selection {
            StreamSelection::All => true,
            StreamSelection::Single(stream_uuid) => &event.stream_uuid == stream_uuid,
        }
    }

    /// Dedups, filters, maps and buffers a slice of in-order events.
    fn ingest(&mut self, events: &[RecordedEvent]) {
        for event in events {
            if !self.matches_stream(event) {
                trace!(
                    stream_uuid = %event.stream_uuid,
                    "discarding event for foreign stream"
                );
                continue;
            }
            let position = self.selection.position(event);
            if position <= self.last_received {
                continue;
            }
            self.last_received = position;
            let payload = match &self.selector {
                Some(selector) if !selector(event) => None,
                _ => Some((self.mapper)(event)),
            };
            self.pending.push(PendingEntry {
                event_number: event.event_number,
                stream_version: event.stream_version,
                position,
                payload,
            });
        }
        if self.pending.at_capacity()
            && matches!(
                self.state,
                SubscriptionState::CatchingUp | SubscriptionState::Subscribed
            )
        {
            self.state = SubscriptionState::MaxCapacity;
        }
    }

    /// Forwards the next batch when every previously forwarded event has
    /// been acknowledged.
    ///
    /// The gate (`last_ack == last_seen`) is the only forwarding condition
    /// besides lifecycle: in `MaxCapacity` the gate is normally closed
    /// because the full buffer starts with unacked in-flight events, but
    /// when it is open the queue must still drain or no ack could ever
    /// arrive to recover the subscription.
    fn pump(&mut self, effects: &mut Vec<Effect<T>>) {
        if !matches!(
            self.state,
            SubscriptionState::CatchingUp
                | SubscriptionState::Subscribed
                | SubscriptionState::MaxCapacity
        ) {
            return;
        }
        if self.last_ack != self.last_seen {
            return;
        }
        let (batch, last_delivered) = self.pending.collect_deliverable(self.last_seen);
        if batch.is_empty() {
            return;
        }
        self.last_seen = last_delivered;
        effects.push(Effect::Forward(batch));
    }

    fn begin_recatchup(&mut self) -> Vec<Effect<T>> {
        self.backlog.clear();
        self.recatchup_on_finish = false;
        self.state = SubscriptionState::RequestingCatchUp;
        vec![Effect::StartCatchUp {
            from: self.last_received + 1,
        }]
    }
}

// ===========================================================================
// Tests
// ===========================================================================
