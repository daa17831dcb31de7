//! Segment reclamation by hazard index.
//!
//! The ring queues retire whole segments, and segments carry monotonically
//! increasing indices, so the hazard protocol can be cheaper than general
//! hazard pointers: before dereferencing any segment a thread publishes the
//! queue's `head_index`, a lower bound on the index of every segment still
//! reachable, as its hazard value. A retired segment may be freed once its
//! index is below the minimum published hazard: nobody can still be inside
//! it, and nobody can pick up a reference to it anymore.
//!
//! Retired-but-not-yet-free segments sit on the retiring thread's private
//! list, ordered by index (each thread only ever retires segments it
//! unlinked itself, so the order is automatic). Every retire drains the
//! front of the caller's own list against the freshly computed minimum.

use std::cell::UnsafeCell;
use std::collections::VecDeque;

use manege_primitives::sync::{AtomicU64, Ordering};
use manege_primitives::{Padded, TaggedRef};

use crate::pool::Pool;

/// Published when a thread holds no segment reference.
pub const NO_HAZARD: u64 = u64::MAX;

struct RetiredSeg {
    handle: TaggedRef,
    index: u64,
}

/// Hazard-index reclaimer for one segment queue.
pub struct SegmentReclaimer {
    hazards: Box<[Padded<AtomicU64>]>,
    retired: Box<[Padded<UnsafeCell<VecDeque<RetiredSeg>>>]>,
}

// SAFETY: hazards are atomics; each retired list is only touched by the
// thread owning its `tid`.
unsafe impl Send for SegmentReclaimer {}
unsafe impl Sync for SegmentReclaimer {}

impl SegmentReclaimer {
    pub fn new(max_threads: usize) -> Self {
        let hazards = (0..max_threads)
            .map(|_| Padded::new(AtomicU64::new(NO_HAZARD)))
            .collect();
        let retired = (0..max_threads)
            .map(|_| Padded::new(UnsafeCell::new(VecDeque::new())))
            .collect();
        SegmentReclaimer { hazards, retired }
    }

    /// Announces the lowest segment index `tid` may be about to touch.
    #[inline]
    pub fn publish(&self, tid: usize, head_index: u64) {
        self.hazards[tid].store(head_index, Ordering::SeqCst);
    }

    /// Clears `tid`'s announcement.
    #[inline]
    pub fn clear(&self, tid: usize) {
        self.hazards[tid].store(NO_HAZARD, Ordering::SeqCst);
    }

    pub fn min_hazard(&self) -> u64 {
        self.hazards
            .iter()
            .map(|h| h.load(Ordering::SeqCst))
            .min()
            .unwrap_or(NO_HAZARD)
    }

    /// Hands an unlinked segment over: freed on the spot when nobody can
    /// reach it, deferred to `tid`'s list otherwise. Also drains the front
    /// of `tid`'s list against the current minimum.
    pub fn retire<T>(&self, handle: TaggedRef, index: u64, tid: usize, pool: &Pool<T>) {
        let min = self.min_hazard();
        // SAFETY: retired[tid] is only touched by the thread owning `tid`.
        let list = unsafe { &mut *self.retired[tid].get() };

        if index < min {
            pool.free(handle, tid);
        } else {
            tracing::trace!(segment = index, min_hazard = min, "deferring segment free");
            list.push_back(RetiredSeg { handle, index });
        }

        // Everything on our list got there by us unlinking it, so entries
        // are unique and index-ordered; pop from the front while clear.
        while list.front().is_some_and(|r| r.index < min) {
            if let Some(r) = list.pop_front() {
                pool.free(r.handle, tid);
            }
        }
    }

    /// Number of segments parked on `tid`'s retired list.
    pub fn deferred(&self, tid: usize) -> usize {
        // SAFETY: retired[tid] is only touched by the thread owning `tid`.
        unsafe { &*self.retired[tid].get() }.len()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn retire_frees_when_unhazarded() {
        let pool: Pool<u32> = Pool::new(4, 2, || 0);
        let rec = SegmentReclaimer::new(2);
        let h = pool.alloc(0);
        rec.retire(h, 5, 0, &pool);
        assert_eq!(rec.deferred(0), 0);
        // the block is reusable again
        let h2 = pool.alloc(0);
        assert_eq!(h2.index(), h.index());
    }

    #[test]
    fn retire_defers_under_hazard_and_drains_after() {
        let pool: Pool<u32> = Pool::new(4, 2, || 0);
        let rec = SegmentReclaimer::new(2);

        rec.publish(1, 3); // thread 1 may still be inside segment 3+
        let h = pool.alloc(0);
        rec.retire(h, 5, 0, &pool);
        assert_eq!(rec.deferred(0), 1, "segment 5 must wait for thread 1");

        rec.clear(1);
        let h2 = pool.alloc(0);
        rec.retire(h2, 6, 0, &pool);
        assert_eq!(rec.deferred(0), 0, "both drained once the hazard lifted");
    }

    #[test]
    fn min_hazard_tracks_lowest_announcement() {
        let rec = SegmentReclaimer::new(3);
        assert_eq!(rec.min_hazard(), NO_HAZARD);
        rec.publish(0, 10);
        rec.publish(2, 4);
        assert_eq!(rec.min_hazard(), 4);
        rec.clear(2);
        assert_eq!(rec.min_hazard(), 10);
    }
}
