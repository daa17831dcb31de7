//! One CAS ring: the segment of the linked ring queue.
//!
//! The protocol is the circular ring queue of Morrison & Afek ("Fast
//! Concurrent Queues for x86 Processors", PPoPP 2013): enqueuers and
//! dequeuers claim sequence numbers with fetch-and-increment and then
//! resolve their claim against the slot at `seq % R` with a single
//! double-width CAS. A dequeuer that overruns an enqueuer marks the slot
//! unsafe for the current lap; an enqueuer that cannot make progress within
//! a starvation bound, or that has lapped the head, closes the ring for
//! good and the queue layer chains a fresh segment.

use manege_primitives::sync::{AtomicU64, Ordering};
use manege_primitives::{AtomicTaggedRef, Cursor, Padded, SlotDesc, SlotWord, TaggedRef};

use crate::{STARVATION, check_seq};

pub(crate) enum RingPush {
    Ok,
    Closed,
}

pub(crate) enum RingPop {
    Value(u32),
    Empty,
}

/// A fixed-capacity ring plus its place in the segment chain.
pub(crate) struct Segment {
    head: Padded<Cursor>,
    tail: Padded<Cursor>,
    next: Padded<AtomicTaggedRef>,
    index: Padded<AtomicU64>,
    /// The pool handle this segment was allocated under; what gets retired.
    self_ref: AtomicU64,
    ring: Box<[Padded<SlotWord>]>,
}

impl Segment {
    pub(crate) fn new(ring_size: usize) -> Self {
        assert!(ring_size >= 2, "ring_size must be at least 2");
        let ring = (0..ring_size)
            .map(|i| Padded::new(SlotWord::new(SlotDesc::new(i as u32, true, false), 0)))
            .collect();
        Segment {
            head: Padded::new(Cursor::new()),
            tail: Padded::new(Cursor::new()),
            next: Padded::new(AtomicTaggedRef::null()),
            index: Padded::new(AtomicU64::new(0)),
            self_ref: AtomicU64::new(TaggedRef::NULL.bits()),
            ring,
        }
    }

    /// Reinitializes a recycled segment. Exclusive access until published:
    /// the hazard discipline guarantees no stale reader overlaps a reuse.
    pub(crate) fn reset(&self, index: u64, self_ref: TaggedRef) {
        self.head.init(SlotDesc::from_bits(0));
        self.tail.init(SlotDesc::from_bits(0));
        self.next.init(TaggedRef::NULL);
        self.index.store(index, Ordering::Relaxed);
        self.self_ref.store(self_ref.bits(), Ordering::Relaxed);
        for (i, slot) in self.ring.iter().enumerate() {
            slot.init(SlotDesc::new(i as u32, true, false), 0);
        }
    }

    #[inline]
    pub(crate) fn ring_size(&self) -> u32 {
        self.ring.len() as u32
    }

    #[inline]
    pub(crate) fn next(&self) -> &AtomicTaggedRef {
        &self.next
    }

    #[inline]
    pub(crate) fn index(&self) -> u64 {
        self.index.load(Ordering::SeqCst)
    }

    #[inline]
    pub(crate) fn set_index(&self, index: u64) {
        self.index.store(index, Ordering::SeqCst);
    }

    #[inline]
    pub(crate) fn handle(&self) -> TaggedRef {
        TaggedRef::from_bits(self.self_ref.load(Ordering::SeqCst))
    }

    pub(crate) fn enqueue(&self, value: u32) -> RingPush {
        debug_assert!(value != 0);
        let r = self.ring_size();
        let mut starvation = 0u32;
        loop {
            let t = self.tail.fetch_inc();
            if t.closed() {
                return RingPush::Closed;
            }
            check_seq(t.seq());

            let slot = &self.ring[(t.seq() % r) as usize];
            let (desc, val) = slot.load();
            if val == 0
                && desc.seq() <= t.seq()
                && (desc.safe() || self.head.load().seq() <= t.seq())
                && slot.compare_exchange(desc, 0, SlotDesc::new(t.seq(), true, false), value)
            {
                return RingPush::Ok;
            }

            // Claimed index unusable: slot ahead of us, unsafe, or lost the
            // race. Close once we lap the head or starve out.
            let h = self.head.load();
            if (t.seq() as i64 - h.seq() as i64) >= r as i64 || starvation >= STARVATION {
                self.tail.close();
                return RingPush::Closed;
            }
            starvation += 1;
        }
    }

    pub(crate) fn dequeue(&self) -> RingPop {
        let r = self.ring_size();
        loop {
            // empty-state fast path
            if self.tail.load().seq() <= self.head.load().seq() {
                self.fix_state();
                return RingPop::Empty;
            }

            let h = self.head.fetch_inc();
            check_seq(h.seq());
            let slot = &self.ring[(h.seq() % r) as usize];
            loop {
                let (desc, val) = slot.load();
                if desc.seq() > h.seq() {
                    // this head claim is behind reality
                    if self.dequeue_failed(h) {
                        return RingPop::Empty;
                    }
                    break;
                }
                if val != 0 {
                    if desc.seq() == h.seq() {
                        // dequeue transition: empty the slot one lap ahead
                        if slot.compare_exchange(desc, val, desc.with_seq(h.seq() + r), 0) {
                            return RingPop::Value(val);
                        }
                    } else {
                        // older value we overran: bar the slot for this lap
                        let unsafe_desc = SlotDesc::new(desc.seq(), false, desc.aux());
                        if slot.compare_exchange(desc, val, unsafe_desc, val) {
                            if self.dequeue_failed(h) {
                                return RingPop::Empty;
                            }
                            break;
                        }
                    }
                } else if slot.compare_exchange(desc, 0, desc.with_seq(h.seq() + r), 0) {
                    // empty at or behind our claim: push its sequence past us
                    if self.dequeue_failed(h) {
                        return RingPop::Empty;
                    }
                    break;
                }
            }
        }
    }

    /// After a fruitless head claim: empty if the tail is at most one ahead
    /// (repairing head/tail order on the way), otherwise retry.
    fn dequeue_failed(&self, h: SlotDesc) -> bool {
        let t = self.tail.load();
        if t.seq() <= h.seq() + 1 {
            self.fix_state();
            true
        } else {
            false
        }
    }

    /// Repairs `head > tail` (a dequeuer overran the tail) by dragging the
    /// tail up to the head, keeping whatever closed state the tail had.
    pub(crate) fn fix_state(&self) {
        let h = self.head.load();
        let t = self.tail.load();
        if h.seq() <= t.seq() {
            return;
        }
        let repaired = h.with_closed(t.closed());
        let _ = self.tail.compare_exchange(t, repaired);
    }

    /// Closes and drains the segment; true once it is terminal (closed and
    /// `head >= tail`), false while values remain.
    pub(crate) fn seal(&self) -> bool {
        loop {
            let h = self.head.load();
            let t = self.tail.load();
            if t.closed() && h.seq() >= t.seq() {
                return true;
            }
            if h.seq() < t.seq() {
                return false;
            }
            if self.tail.compare_exchange(t, h.with_closed(true)) {
                return true;
            }
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn fifo_within_one_ring() {
        let seg = Segment::new(8);
        for v in 1..=5 {
            assert!(matches!(seg.enqueue(v), RingPush::Ok));
        }
        for v in 1..=5 {
            match seg.dequeue() {
                RingPop::Value(got) => assert_eq!(got, v),
                RingPop::Empty => panic!("ring lost value {v}"),
            }
        }
        assert!(matches!(seg.dequeue(), RingPop::Empty));
    }

    #[test]
    fn full_ring_closes() {
        let seg = Segment::new(4);
        for v in 1..=4 {
            assert!(matches!(seg.enqueue(v), RingPush::Ok));
        }
        assert!(matches!(seg.enqueue(5), RingPush::Closed));
        // closing loses nothing already in the ring
        for v in 1..=4 {
            match seg.dequeue() {
                RingPop::Value(got) => assert_eq!(got, v),
                RingPop::Empty => panic!("ring lost value {v}"),
            }
        }
    }

    #[test]
    fn closed_ring_rejects_all_later_enqueues() {
        let seg = Segment::new(4);
        seg.enqueue(1);
        for _ in 0..5 {
            seg.enqueue(9); // fill + close
        }
        assert!(matches!(seg.enqueue(2), RingPush::Closed));
        assert!(matches!(seg.enqueue(3), RingPush::Closed));
    }

    #[test]
    fn seal_empty_then_reject() {
        let seg = Segment::new(4);
        assert!(seg.seal());
        assert!(matches!(seg.enqueue(1), RingPush::Closed));
        assert!(matches!(seg.dequeue(), RingPop::Empty));
    }

    #[test]
    fn seal_refuses_while_occupied() {
        let seg = Segment::new(4);
        seg.enqueue(42);
        assert!(!seg.seal());
        assert!(matches!(seg.dequeue(), RingPop::Value(42)));
        assert!(seg.seal());
    }

    #[test]
    fn reset_restores_a_drained_ring() {
        let seg = Segment::new(4);
        for v in 1..=4 {
            seg.enqueue(v);
        }
        while let RingPop::Value(_) = seg.dequeue() {}
        seg.seal();

        seg.reset(3, TaggedRef::new(0, 1));
        assert_eq!(seg.index(), 3);
        assert!(seg.next().load().is_null());
        assert!(matches!(seg.enqueue(7), RingPush::Ok));
        assert!(matches!(seg.dequeue(), RingPop::Value(7)));
    }
}
