//! Linked circular ring queue: an unbounded MPMC FIFO.
//!
//! Segments chain through set-once `next` links; the queue-level head and
//! tail are counted references into the segment pool, bumped on every
//! swing so a stale swing cannot land. A dequeuer that drains and seals
//! the head segment advances past it and hands it to the reclaimer; an
//! enqueuer that finds the tail closed seeds a fresh segment with its own
//! value and races to link it.

use manege_primitives::sync::{AtomicU64, Ordering};
use manege_primitives::{AtomicTaggedRef, Padded, TaggedRef};

use crate::pool::Pool;
use crate::reclaim::SegmentReclaimer;
use crate::ring::{RingPop, RingPush, Segment};
use crate::{Container, DEFAULT_RING_SIZE};

/// Segments a queue may have live at once (including retired-not-yet-free).
const SEGMENT_POOL_CAPACITY: u32 = 4096;

pub struct Lcrq {
    head: Padded<AtomicTaggedRef>,
    tail: Padded<AtomicTaggedRef>,
    /// Lower bound on the head segment's index; what threads publish as
    /// their hazard before touching any segment.
    head_index: Padded<AtomicU64>,
    pool: Pool<Segment>,
    reclaim: SegmentReclaimer,
    max_threads: usize,
}

impl Lcrq {
    /// A queue for up to `max_threads` threads with the default ring size.
    pub fn new(max_threads: usize) -> Self {
        Self::with_ring_size(max_threads, DEFAULT_RING_SIZE)
    }

    pub fn with_ring_size(max_threads: usize, ring_size: usize) -> Self {
        assert!(max_threads > 0 && max_threads < 0xFFFF);
        let pool = Pool::new(SEGMENT_POOL_CAPACITY, max_threads, move || {
            Segment::new(ring_size)
        });
        let reclaim = SegmentReclaimer::new(max_threads);

        let first = pool.alloc(0);
        pool.get_raw(first.index()).reset(0, first);

        Lcrq {
            head: Padded::new(AtomicTaggedRef::new(TaggedRef::new(first.index(), 0))),
            tail: Padded::new(AtomicTaggedRef::new(TaggedRef::new(first.index(), 0))),
            head_index: Padded::new(AtomicU64::new(0)),
            pool,
            reclaim,
            max_threads,
        }
    }

    pub fn enqueue(&self, value: i32, tid: usize) {
        assert!(value != 0, "value 0 is reserved as the empty sentinel");
        debug_assert!(tid < self.max_threads);

        // Successor already seeded with our value, kept across retries.
        let mut spare: Option<TaggedRef> = None;
        loop {
            self.reclaim
                .publish(tid, self.head_index.load(Ordering::SeqCst));
            let crq = self.tail.load();
            let seg = self.pool.get_raw(crq.index());

            let next = seg.next().load();
            if !next.is_null() {
                // stale tail: help it forward
                self.tail
                    .compare_exchange(crq, TaggedRef::new(next.index(), crq.tag() + 1));
                continue;
            }

            if matches!(seg.enqueue(value as u32), RingPush::Ok) {
                self.reclaim.clear(tid);
                if let Some(s) = spare {
                    self.pool.free(s, tid);
                }
                return;
            }

            // Tail ring closed: seed a successor with our value, link it
            // with the set-once CAS, then swing the tail.
            if spare.is_none() {
                let h = self.pool.alloc(tid);
                let fresh = self.pool.get_raw(h.index());
                fresh.reset(0, h);
                if !matches!(fresh.enqueue(value as u32), RingPush::Ok) {
                    self.pool.free(h, tid);
                    continue;
                }
                spare = Some(h);
            }
            let Some(h) = spare else { continue };
            let fresh = self.pool.get_raw(h.index());
            fresh.set_index(seg.index() + 1);

            if seg.next().compare_exchange(TaggedRef::NULL, h) {
                tracing::trace!(segment = fresh.index(), "appended ring segment");
                self.tail
                    .compare_exchange(crq, TaggedRef::new(h.index(), crq.tag() + 1));
                self.reclaim.clear(tid);
                return;
            }
            // Lost the link race; the spare stays seeded for the next lap.
        }
    }

    pub fn dequeue(&self, tid: usize) -> Option<i32> {
        debug_assert!(tid < self.max_threads);
        loop {
            self.reclaim
                .publish(tid, self.head_index.load(Ordering::SeqCst));
            let crq = self.head.load();
            let seg = self.pool.get_raw(crq.index());

            if let RingPop::Value(v) = seg.dequeue() {
                self.reclaim.clear(tid);
                return Some(v as i32);
            }
            let next = seg.next().load();
            if next.is_null() {
                self.reclaim.clear(tid);
                return None;
            }
            if !seg.seal() {
                continue;
            }
            // Head segment is terminal: advance past it and retire it.
            if self
                .head
                .compare_exchange(crq, TaggedRef::new(next.index(), crq.tag() + 1))
            {
                self.head_index.fetch_add(1, Ordering::SeqCst);
                self.reclaim.clear(tid);
                self.reclaim
                    .retire(seg.handle(), seg.index(), tid, &self.pool);
            }
        }
    }
}

impl Container<i32> for Lcrq {
    fn insert(&self, item: i32, tid: usize) {
        self.enqueue(item, tid);
    }

    fn remove(&self, tid: usize) -> Option<i32> {
        self.dequeue(tid)
    }
}
