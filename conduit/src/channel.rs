//! Selective-repeat ARQ and the per-channel-family delivery semantics,
//! per `spec.md` §4.4.5: the building blocks every `Connection` composes
//! one of per channel (`Unreliable`, `UnreliableSequenced`,
//! `ReliableUnordered`, `ReliableSequenced`, `ReliableOrdered`).
//!
//! There is no teacher file that does ARQ — `neutronium`'s channels are
//! TCP streams and leave retransmission to the kernel. This module is
//! new, built the way the teacher structures adjacent stateful pieces
//! (plain structs with `new`/mutating methods, `IndexMap` for ordered
//! keyed state, `#[cfg(test)] mod tests` alongside the code it covers).

use crate::sequence::{self, SequenceNumber};
use conduit_support::time::Clock;
use indexmap::IndexMap;
use std::time::Duration;

/// Width of the selective-repeat ack bitmask: how far past the
/// cumulative ack point a receiver can report individual receipts.
///
/// Must be at least [`crate::config::DEFAULT_SEND_WINDOW_SIZE`], or an
/// arrival beyond the bitmask's reach is dropped by [`AckTracker::record`]
/// even though it is still within the configured send window (`spec.md`
/// §3's window invariant).
pub const ACK_BITMASK_WIDTH: u32 = 64;

/// Outcome of trying to hand a new reliable message to its send window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueResult {
    Enqueued(SequenceNumber),
    WindowFull,
}

struct PendingSend {
    payload: Vec<u8>,
    /// Mirrors the wire header's fragment bit for this payload, so a
    /// resend can reconstruct the same header it was first sent with.
    fragmented: bool,
    sent_at: Option<Clock>,
    attempts: u32,
}

/// Outgoing half of a reliable channel: holds every message sent but
/// not yet acknowledged, up to `window_size` in flight at once.
pub struct ReliableSendWindow {
    next_seq: SequenceNumber,
    window_size: usize,
    pending: IndexMap<SequenceNumber, PendingSend>,
}

impl ReliableSendWindow {
    pub fn new(window_size: usize) -> Self {
        ReliableSendWindow {
            next_seq: 0,
            window_size,
            pending: IndexMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Assigns the next sequence number to `payload` and admits it to
    /// the window, unless it is already full. `fragmented` records
    /// whether `payload` begins with a `FragmentHeader`, so resends can
    /// set the wire header's fragment bit correctly too.
    pub fn enqueue(&mut self, payload: Vec<u8>, fragmented: bool) -> EnqueueResult {
        if self.pending.len() >= self.window_size {
            return EnqueueResult::WindowFull;
        }

        let seq = self.next_seq;
        self.next_seq = sequence::next(self.next_seq);
        self.pending.insert(
            seq,
            PendingSend {
                payload,
                fragmented,
                sent_at: None,
                attempts: 0,
            },
        );
        EnqueueResult::Enqueued(seq)
    }

    /// Returns the sequence numbers due for (re)transmission: never
    /// sent, or sent longer than `resend_delay` ago.
    pub fn due_for_send(&self, now: Clock, resend_delay: Duration) -> Vec<SequenceNumber> {
        self.pending
            .iter()
            .filter(|(_, pending)| match pending.sent_at {
                None => true,
                Some(sent_at) => now.elapsed_since(sent_at) >= resend_delay,
            })
            .map(|(seq, _)| *seq)
            .collect()
    }

    pub fn payload(&self, seq: SequenceNumber) -> Option<&[u8]> {
        self.pending.get(&seq).map(|p| p.payload.as_slice())
    }

    pub fn fragmented(&self, seq: SequenceNumber) -> bool {
        self.pending.get(&seq).map(|p| p.fragmented).unwrap_or(false)
    }

    pub fn mark_sent(&mut self, seq: SequenceNumber, now: Clock) {
        if let Some(pending) = self.pending.get_mut(&seq) {
            pending.sent_at = Some(now);
            pending.attempts += 1;
        }
    }

    pub fn attempts(&self, seq: SequenceNumber) -> u32 {
        self.pending.get(&seq).map(|p| p.attempts).unwrap_or(0)
    }

    /// Applies a selective-repeat ack: everything cumulatively before
    /// `base` is acknowledged, plus any of the next [`ACK_BITMASK_WIDTH`]
    /// sequence numbers flagged in `mask`.
    pub fn apply_ack(&mut self, base: SequenceNumber, mask: u64) {
        self.pending.retain(|seq, _| {
            if sequence::is_before(*seq, base) {
                return false;
            }
            let rel = sequence::relative(base, *seq);
            if (1..=ACK_BITMASK_WIDTH as i32).contains(&rel) {
                let bit = (rel - 1) as u32;
                if mask & (1 << bit) != 0 {
                    return false;
                }
            }
            true
        });
    }
}

/// Receiving half of a reliable channel: deduplicates arrivals and
/// produces the `(base, mask)` pair to send back as an acknowledgement.
pub struct AckTracker {
    base: SequenceNumber,
    received_mask: u64,
}

impl AckTracker {
    pub fn new() -> Self {
        AckTracker {
            base: 0,
            received_mask: 0,
        }
    }

    /// Records receipt of `seq`. Returns `true` if this is the first
    /// time it has been seen (i.e. it should be processed), `false` if
    /// it's a duplicate or too far outside the trackable window to
    /// matter.
    pub fn record(&mut self, seq: SequenceNumber) -> bool {
        let rel = sequence::relative(self.base, seq);

        if rel < 0 {
            return false; // already cumulatively acknowledged
        }

        if rel == 0 {
            self.base = sequence::next(self.base);
            self.absorb_contiguous_bits();
            return true;
        }

        let bit = rel - 1;
        if bit >= ACK_BITMASK_WIDTH as i32 {
            return false;
        }

        let mask_bit = 1u64 << bit;
        if self.received_mask & mask_bit != 0 {
            return false;
        }
        self.received_mask |= mask_bit;
        true
    }

    fn absorb_contiguous_bits(&mut self) {
        while self.received_mask & 1 != 0 {
            self.received_mask >>= 1;
            self.base = sequence::next(self.base);
        }
    }

    pub fn ack_fields(&self) -> (SequenceNumber, u64) {
        (self.base, self.received_mask)
    }
}

impl Default for AckTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Newest-wins filter for `UnreliableSequenced`: no retransmission, just
/// drop anything that isn't strictly newer than the last accepted
/// sequence number.
pub struct SequencedFilter {
    last_accepted: Option<SequenceNumber>,
}

impl SequencedFilter {
    pub fn new() -> Self {
        SequencedFilter { last_accepted: None }
    }

    pub fn accept(&mut self, seq: SequenceNumber) -> bool {
        let is_newer = match self.last_accepted {
            None => true,
            Some(last) => sequence::is_before(last, seq),
        };
        if is_newer {
            self.last_accepted = Some(seq);
        }
        is_newer
    }
}

impl Default for SequencedFilter {
    fn default() -> Self {
        Self::new()
    }
}

/// In-order delivery buffer for `ReliableOrdered`: holds reliably
/// delivered-but-out-of-order payloads until the gap ahead of them
/// closes.
pub struct OrderedReceiveBuffer {
    next_deliver: SequenceNumber,
    buffered: IndexMap<SequenceNumber, Vec<u8>>,
}

impl OrderedReceiveBuffer {
    pub fn new() -> Self {
        OrderedReceiveBuffer {
            next_deliver: 0,
            buffered: IndexMap::new(),
        }
    }

    /// Buffers `payload` at `seq`, returning every payload now ready for
    /// delivery in order (possibly none, if a gap remains before it).
    pub fn insert(&mut self, seq: SequenceNumber, payload: Vec<u8>) -> Vec<Vec<u8>> {
        if sequence::is_before(seq, self.next_deliver) {
            return Vec::new(); // already delivered, duplicate
        }

        self.buffered.entry(seq).or_insert(payload);

        let mut ready = Vec::new();
        while let Some(payload) = self.buffered.shift_remove(&self.next_deliver) {
            ready.push(payload);
            self.next_deliver = sequence::next(self.next_deliver);
        }
        ready
    }
}

impl Default for OrderedReceiveBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks only the newest sequence number for which the application has
/// actually been given data, for `ReliableSequenced`: every reliable
/// arrival is acknowledged (and thus never resent by the peer), but an
/// arrival older than one already delivered is dropped rather than
/// handed to the application out of order.
pub struct SequencedDeliveryGate {
    last_delivered: Option<SequenceNumber>,
}

impl SequencedDeliveryGate {
    pub fn new() -> Self {
        SequencedDeliveryGate { last_delivered: None }
    }

    pub fn should_deliver(&mut self, seq: SequenceNumber) -> bool {
        let newer = match self.last_delivered {
            None => true,
            Some(last) => sequence::is_before(last, seq),
        };
        if newer {
            self.last_delivered = Some(seq);
        }
        newer
    }
}

impl Default for SequencedDeliveryGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_window_rejects_beyond_capacity() {
        let mut window = ReliableSendWindow::new(2);
        assert!(matches!(window.enqueue(vec![1], false), EnqueueResult::Enqueued(_)));
        assert!(matches!(window.enqueue(vec![2], false), EnqueueResult::Enqueued(_)));
        assert_eq!(window.enqueue(vec![3], false), EnqueueResult::WindowFull);
    }

    #[test]
    fn send_window_due_for_send_includes_unset_entries() {
        let mut window = ReliableSendWindow::new(4);
        window.enqueue(vec![1], false);
        let now = Clock::now();
        assert_eq!(window.due_for_send(now, Duration::from_millis(100)).len(), 1);
    }

    #[test]
    fn send_window_respects_resend_delay() {
        let mut window = ReliableSendWindow::new(4);
        let EnqueueResult::Enqueued(seq) = window.enqueue(vec![1], false) else {
            panic!("expected Enqueued")
        };
        let now = Clock::now();
        window.mark_sent(seq, now);
        assert!(window.due_for_send(now, Duration::from_millis(100)).is_empty());

        let later = now.advance(Duration::from_millis(150));
        assert_eq!(window.due_for_send(later, Duration::from_millis(100)), vec![seq]);
    }

    #[test]
    fn ack_tracker_deduplicates_and_advances_base() {
        let mut tracker = AckTracker::new();
        assert!(tracker.record(0));
        assert!(!tracker.record(0)); // duplicate
        assert!(tracker.record(1));
        let (base, mask) = tracker.ack_fields();
        assert_eq!(base, 2);
        assert_eq!(mask, 0);
    }

    #[test]
    fn ack_tracker_handles_out_of_order_arrivals() {
        let mut tracker = AckTracker::new();
        assert!(tracker.record(2)); // arrives first, bit 1 of the mask
        let (base, mask) = tracker.ack_fields();
        assert_eq!(base, 0);
        assert_eq!(mask, 0b10);

        assert!(tracker.record(0));
        assert!(tracker.record(1));
        let (base, mask) = tracker.ack_fields();
        assert_eq!(base, 3);
        assert_eq!(mask, 0);
    }

    #[test]
    fn send_window_apply_ack_clears_cumulative_and_selective() {
        let mut window = ReliableSendWindow::new(8);
        for i in 0..4u8 {
            window.enqueue(vec![i], false);
        }
        // base=2 (0,1 cumulatively acked), bit0 set => seq 3 acked too, seq 2 still pending.
        window.apply_ack(2, 0b1);
        assert_eq!(window.len(), 1);
        assert!(window.payload(2).is_some());
    }

    #[test]
    fn sequenced_filter_drops_stale_packets() {
        let mut filter = SequencedFilter::new();
        assert!(filter.accept(5));
        assert!(!filter.accept(3));
        assert!(filter.accept(6));
    }

    #[test]
    fn ordered_buffer_releases_in_order_once_gap_closes() {
        let mut buf = OrderedReceiveBuffer::new();
        assert!(buf.insert(1, vec![1]).is_empty());
        assert!(buf.insert(2, vec![2]).is_empty());
        assert_eq!(buf.insert(0, vec![0]), vec![vec![0], vec![1], vec![2]]);
    }

    #[test]
    fn ordered_buffer_ignores_already_delivered_duplicates() {
        let mut buf = OrderedReceiveBuffer::new();
        assert_eq!(buf.insert(0, vec![0]), vec![vec![0]]);
        assert!(buf.insert(0, vec![99]).is_empty());
    }

    #[test]
    fn sequenced_delivery_gate_drops_stale_after_newer_delivered() {
        let mut gate = SequencedDeliveryGate::new();
        assert!(gate.should_deliver(5));
        assert!(!gate.should_deliver(3));
        assert!(gate.should_deliver(6));
    }

    #[test]
    fn send_window_remembers_fragmented_flag_for_resend() {
        let mut window = ReliableSendWindow::new(4);
        let EnqueueResult::Enqueued(whole) = window.enqueue(vec![1], false) else {
            panic!("expected Enqueued")
        };
        let EnqueueResult::Enqueued(piece) = window.enqueue(vec![2], true) else {
            panic!("expected Enqueued")
        };
        assert!(!window.fragmented(whole));
        assert!(window.fragmented(piece));
    }
}
