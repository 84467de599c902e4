//! Subscriber-facing subscription handle.
//!
//! [`Subscription`] is the subscriber's end of a live subscription: it
//! receives [`SubscriptionMessage`]s in order and sends acknowledgements
//! back. The handle and the subscription task are bidirectionally linked:
//! dropping the handle terminates the task (the durable row survives for a
//! later re-subscribe), and a task that terminates closes the handle's
//! message channel.

use tokio::sync::mpsc;

use crate::event::RecordedEvent;

// ---------------------------------------------------------------------------
// Messages and commands
// ---------------------------------------------------------------------------

/// Messages delivered to the subscriber, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionMessage<T> {
    /// The subscription won the advisory lock and is live. Sent once per
    /// lock acquisition (so again after a supervised restart).
    Subscribed,
    /// An ordered batch of events, raw or mapper output.
    Events(Vec<T>),
}

/// Acknowledgement forms accepted by [`Subscription::ack`] and friends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    /// A bare position: an event number for `$all` subscriptions, a stream
    /// version for single-stream subscriptions.
    Position(u64),
    /// The maximum numbers of one or more previously delivered events.
    Event {
        /// Highest acknowledged event number.
        event_number: u64,
        /// Highest acknowledged stream version.
        stream_version: u64,
    },
}

/// Control messages from the handle to the subscription task.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Command {
    Ack(Ack),
    Unsubscribe,
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// A live subscription handle.
///
/// The first message received is [`SubscriptionMessage::Subscribed`]; every
/// batch after it is in strictly ascending event-number order. Progress must
/// be acknowledged for delivery to continue.
#[derive(Debug)]
pub struct Subscription<T> {
    stream_uuid: String,
    name: String,
    control: mpsc::Sender<Command>,
    messages: mpsc::Receiver<SubscriptionMessage<T>>,
}

impl<T> Subscription<T> {
    pub(crate) fn new(
        stream_uuid: String,
        name: String,
        control: mpsc::Sender<Command>,
        messages: mpsc::Receiver<SubscriptionMessage<T>>,
    ) -> Self {
        Self {
            stream_uuid,
            name,
            control,
            messages,
        }
    }

    /// Stream this subscription is attached to (possibly
    /// [`ALL_STREAM`](crate::event::ALL_STREAM)).
    #[must_use]
    pub fn stream_uuid(&self) -> &str {
        &self.stream_uuid
    }

    /// Subscription name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Receives the next message, or `None` once the subscription task has
    /// terminated.
    pub async fn recv(&mut self) -> Option<SubscriptionMessage<T>> {
        self.messages.recv().await
    }

    /// Receives without waiting; `None` when no message is ready or the
    /// task is gone.
    pub fn try_recv(&mut self) -> Option<SubscriptionMessage<T>> {
        self.messages.try_recv().ok()
    }

    /// Acknowledges everything up to and including `position`: an event
    /// number for `$all` subscriptions, a stream version otherwise.
    ///
    /// An ack against a subscription that has already terminated silently
    /// succeeds; the durable row keeps its previous cursor.
    pub async fn ack(&self, position: u64) {
        let _ = self.control.send(Command::Ack(Ack::Position(position))).await;
    }

    /// Acknowledges a single delivered event.
    pub async fn ack_event(&self, event: &RecordedEvent) {
        self.ack_events(std::slice::from_ref(event)).await;
    }

    /// Acknowledges a batch of delivered events, taking the maximum
    /// numbers.
    pub async fn ack_events(&self, events: &[RecordedEvent]) {
        let Some(ack) = events
            .iter()
            .map(|e| (e.event_number, e.stream_version))
            .max()
            .map(|(event_number, stream_version)| Ack::Event {
                event_number,
                stream_version,
            })
        else {
            return;
        };
        let _ = self.control.send(Command::Ack(ack)).await;
    }

    /// Deletes the durable subscription row and terminates the subscription
    /// task, waiting for it to wind down.
    ///
    /// To detach while keeping the durable cursor, simply drop the handle.
    pub async fn unsubscribe(mut self) {
        let _ = self.control.send(Command::Unsubscribe).await;
        // Drain until the task closes the channel so a follow-up subscribe
        // with the same name cannot race the teardown.
        while self.messages.recv().await.is_some() {}
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(
        control_capacity: usize,
    ) -> (
        Subscription<RecordedEvent>,
        mpsc::Receiver<Command>,
        mpsc::Sender<SubscriptionMessage<RecordedEvent>>,
    ) {
        let (control_tx, control_rx) = mpsc::channel(control_capacity);
        let (message_tx, message_rx) = mpsc::channel(8);
        (
            Subscription::new("s".into(), "n".into(), control_tx, message_rx),
            control_rx,
            message_tx,
        )
    }

    fn event(event_number: u64, stream_version: u64) -> RecordedEvent {
        RecordedEvent {
            event_id: uuid::Uuid::new_v4(),
            event_number,
            stream_uuid: "s".into(),
            stream_version,
            event_type: "test_event".into(),
            correlation_id: None,
            causation_id: None,
            data: bytes::Bytes::new(),
            metadata: bytes::Bytes::new(),
            created_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_handle_ack_forms() {
        let (sub, mut control_rx, _msg_tx) = handle(8);

        sub.ack(3).await;
        assert!(matches!(
            control_rx.recv().await,
            Some(Command::Ack(Ack::Position(3)))
        ));

        sub.ack_event(&event(7, 4)).await;
        assert!(matches!(
            control_rx.recv().await,
            Some(Command::Ack(Ack::Event {
                event_number: 7,
                stream_version: 4
            }))
        ));

        // A batch ack takes the maximum numbers.
        sub.ack_events(&[event(5, 2), event(9, 6), event(8, 5)]).await;
        assert!(matches!(
            control_rx.recv().await,
            Some(Command::Ack(Ack::Event {
                event_number: 9,
                stream_version: 6
            }))
        ));

        // An empty batch sends nothing.
        sub.ack_events(&[]).await;
        assert!(control_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_handle_ack_to_dead_subscription_succeeds() {
        let (sub, control_rx, _msg_tx) = handle(8);
        drop(control_rx);
        // Must not error or hang.
        sub.ack(1).await;
        sub.ack_event(&event(1, 1)).await;
    }

    #[tokio::test]
    async fn test_handle_recv_orders_messages() {
        let (mut sub, _control_rx, msg_tx) = handle(8);
        msg_tx.send(SubscriptionMessage::Subscribed).await.unwrap();
        msg_tx
            .send(SubscriptionMessage::Events(vec![event(1, 1)]))
            .await
            .unwrap();

        assert_eq!(sub.recv().await, Some(SubscriptionMessage::Subscribed));
        match sub.recv().await {
            Some(SubscriptionMessage::Events(batch)) => assert_eq!(batch[0].event_number, 1),
            other => panic!("expected events, got {other:?}"),
        }

        drop(msg_tx);
        assert_eq!(sub.recv().await, None);
    }

    #[tokio::test]
    async fn test_handle_unsubscribe_waits_for_teardown() {
        let (sub, mut control_rx, msg_tx) = handle(8);

        let task = tokio::spawn(async move {
            // Simulated subscription task: close the message channel only
            // after seeing the unsubscribe command.
            assert!(matches!(
                control_rx.recv().await,
                Some(Command::Unsubscribe)
            ));
            drop(msg_tx);
        });

        sub.unsubscribe().await;
        task.await.unwrap();
    }
}
