//! Pending-event buffer for a subscription.
//!
//! Entries stay in the buffer from ingestion until the subscriber
//! acknowledges them, so the buffer always holds the forwarded-but-unacked
//! head followed by the not-yet-forwarded tail. Selector-rejected events are
//! kept as positional placeholders (no payload): they are never delivered,
//! but their store positions ride along so a later ack moves the durable
//! cursor past them.

use std::collections::VecDeque;

/// One buffered event, in selection-relative position order.
#[derive(Debug, Clone)]
pub(crate) struct PendingEntry<T> {
    /// Store-wide position of the underlying event.
    pub event_number: u64,
    /// Per-stream position of the underlying event.
    pub stream_version: u64,
    /// Selection-relative position: `event_number` for `$all`
    /// subscriptions, `stream_version` for single-stream ones.
    pub position: u64,
    /// Mapped payload, or `None` for a selector-rejected placeholder.
    pub payload: Option<T>,
}

/// Cursor persisted when an ack drains buffered entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct AckedThrough {
    pub event_number: u64,
    pub stream_version: u64,
    pub position: u64,
}

/// Ordered buffer of unacknowledged events with a capacity watermark pair.
#[derive(Debug)]
pub(crate) struct PendingBuffer<T> {
    entries: VecDeque<PendingEntry<T>>,
    max_size: usize,
    low_water: usize,
}

impl<T: Clone> PendingBuffer<T> {
    pub(crate) fn new(max_size: usize, low_water: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            max_size,
            low_water,
        }
    }

    pub(crate) fn push(&mut self, entry: PendingEntry<T>) {
        debug_assert!(
            self.entries
                .back()
                .map_or(true, |last| last.position < entry.position),
            "pending entries must arrive in position order"
        );
        self.entries.push_back(entry);
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Buffer has reached `max_size`; the subscription reports
    /// max-capacity. Ingress is still accepted.
    pub(crate) fn at_capacity(&self) -> bool {
        self.entries.len() >= self.max_size
    }

    /// Buffer has drained to the low-water mark; a max-capacity
    /// subscription resumes normal operation.
    pub(crate) fn below_low_water(&self) -> bool {
        self.entries.len() <= self.low_water
    }

    /// Drops the head entries with `position <= position` and returns the
    /// cursor of the last one dropped, or `None` for a stale ack.
    pub(crate) fn ack_through(&mut self, position: u64) -> Option<AckedThrough> {
        let mut acked = None;
        while let Some(front) = self.entries.front() {
            if front.position > position {
                break;
            }
            acked = Some(AckedThrough {
                event_number: front.event_number,
                stream_version: front.stream_version,
                position: front.position,
            });
            self.entries.pop_front();
        }
        acked
    }

    /// Clones the deliverable payloads positioned after `after`.
    ///
    /// Returns the batch and the position of its last delivered entry.
    /// Placeholders between delivered entries are covered by the returned
    /// position; trailing placeholders are left for a later batch so the
    /// forwarding gate never waits on an ack that cannot arrive.
    pub(crate) fn collect_deliverable(&self, after: u64) -> (Vec<T>, u64) {
        let mut batch = Vec::new();
        let mut last_delivered = after;
        for entry in &self.entries {
            if entry.position <= after {
                continue;
            }
            if let Some(payload) = &entry.payload {
                batch.push(payload.clone());
                last_delivered = entry.position;
            }
        }
        (batch, last_delivered)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(position: u64, payload: Option<u64>) -> PendingEntry<u64> {
        PendingEntry {
            event_number: position + 100,
            stream_version: position,
            position,
            payload,
        }
    }

    fn buffer_with(positions: &[(u64, Option<u64>)]) -> PendingBuffer<u64> {
        let mut buf = PendingBuffer::new(1000, 500);
        for &(p, payload) in positions {
            buf.push(entry(p, payload));
        }
        buf
    }

    // --- Capacity tests ---

    #[test]
    fn test_buffer_capacity_watermarks() {
        let mut buf: PendingBuffer<u64> = PendingBuffer::new(3, 1);
        assert!(!buf.at_capacity());
        assert!(buf.below_low_water());

        for p in 1..=3 {
            buf.push(entry(p, Some(p)));
        }
        assert!(buf.at_capacity());
        assert!(!buf.below_low_water());

        buf.ack_through(2);
        assert_eq!(buf.len(), 1);
        assert!(buf.below_low_water());
    }

    // --- Ack tests ---

    #[test]
    fn test_buffer_ack_through_partial() {
        let mut buf = buffer_with(&[(1, Some(1)), (2, Some(2)), (3, Some(3))]);

        let acked = buf.ack_through(2).unwrap();
        assert_eq!(acked.position, 2);
        assert_eq!(acked.event_number, 102);
        assert_eq!(buf.len(), 1);

        // Stale ack: nothing at or below position 2 remains.
        assert!(buf.ack_through(2).is_none());

        let acked = buf.ack_through(9).unwrap();
        assert_eq!(acked.position, 3);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_buffer_ack_covers_placeholders() {
        let mut buf = buffer_with(&[(1, None), (2, Some(2)), (3, None)]);

        // Ack of the delivered entry also drops the placeholder before it.
        let acked = buf.ack_through(2).unwrap();
        assert_eq!(acked.position, 2);
        assert_eq!(buf.len(), 1);
    }

    // --- Deliverable collection tests ---

    #[test]
    fn test_buffer_collect_deliverable_skips_forwarded() {
        let buf = buffer_with(&[(1, Some(1)), (2, Some(2)), (3, Some(3))]);

        let (batch, seen) = buf.collect_deliverable(1);
        assert_eq!(batch, vec![2, 3]);
        assert_eq!(seen, 3);

        let (batch, seen) = buf.collect_deliverable(3);
        assert!(batch.is_empty());
        assert_eq!(seen, 3);
    }

    #[test]
    fn test_buffer_collect_deliverable_trailing_placeholder() {
        let buf = buffer_with(&[(1, None), (2, Some(2)), (3, None)]);

        // The trailing placeholder must not advance the forwarded position:
        // no ack could ever cover it.
        let (batch, seen) = buf.collect_deliverable(0);
        assert_eq!(batch, vec![2]);
        assert_eq!(seen, 2);
    }

    #[test]
    fn test_buffer_collect_deliverable_all_placeholders() {
        let buf = buffer_with(&[(1, None), (2, None)]);
        let (batch, seen) = buf.collect_deliverable(0);
        assert!(batch.is_empty());
        assert_eq!(seen, 0);
    }
}
