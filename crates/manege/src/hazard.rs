//! General hazard reservations for pooled nodes.
//!
//! The segment queues get away with a single index per thread
//! ([`crate::reclaim`]); the generic dual composition peeks at placeholders
//! and requests it does not own, so those need classic hazard slots: a
//! thread reserves the handle it is about to dereference, and a retired
//! node is only freed once no thread has it reserved.
//!
//! Retired lists are private per thread; a retire scans and frees whatever
//! has become clear once the list grows past the threshold.

use std::cell::UnsafeCell;

use manege_primitives::sync::{AtomicU64, Ordering};
use manege_primitives::{Padded, TaggedRef};

use crate::pool::Pool;

pub struct HazardTracker {
    slots_per_thread: usize,
    reservations: Box<[Padded<AtomicU64>]>,
    retired: Box<[Padded<UnsafeCell<Vec<TaggedRef>>>]>,
    threshold: usize,
}

// SAFETY: reservations are atomics; each retired list is only touched by
// the thread owning its `tid`.
unsafe impl Send for HazardTracker {}
unsafe impl Sync for HazardTracker {}

impl HazardTracker {
    pub fn new(max_threads: usize, slots_per_thread: usize, threshold: usize) -> Self {
        assert!(slots_per_thread > 0);
        let reservations = (0..max_threads * slots_per_thread)
            .map(|_| Padded::new(AtomicU64::new(TaggedRef::NULL.bits())))
            .collect();
        let retired = (0..max_threads)
            .map(|_| Padded::new(UnsafeCell::new(Vec::new())))
            .collect();
        HazardTracker {
            slots_per_thread,
            reservations,
            retired,
            threshold,
        }
    }

    #[inline]
    fn slot(&self, tid: usize, slot: usize) -> &AtomicU64 {
        debug_assert!(slot < self.slots_per_thread);
        &self.reservations[tid * self.slots_per_thread + slot]
    }

    /// Publishes `handle` in `tid`'s reservation slot. Overwrites whatever
    /// was there.
    #[inline]
    pub fn reserve(&self, handle: TaggedRef, slot: usize, tid: usize) {
        self.slot(tid, slot).store(handle.bits(), Ordering::SeqCst);
    }

    /// Clears all of `tid`'s reservation slots.
    pub fn clear_all(&self, tid: usize) {
        for slot in 0..self.slots_per_thread {
            self.slot(tid, slot)
                .store(TaggedRef::NULL.bits(), Ordering::SeqCst);
        }
    }

    /// Queues `handle` for freeing once nobody has it reserved.
    pub fn retire<T>(&self, handle: TaggedRef, tid: usize, pool: &Pool<T>) {
        // SAFETY: retired[tid] is only touched by the thread owning `tid`.
        let list = unsafe { &mut *self.retired[tid].get() };
        list.push(handle);
        if list.len() > self.threshold {
            self.scan(tid, pool);
        }
    }

    /// Frees every retired node of `tid` that no thread has reserved.
    pub fn scan<T>(&self, tid: usize, pool: &Pool<T>) {
        let reserved: Vec<u64> = self
            .reservations
            .iter()
            .map(|r| r.load(Ordering::SeqCst))
            .filter(|&bits| !TaggedRef::from_bits(bits).is_null())
            .collect();

        // SAFETY: retired[tid] is only touched by the thread owning `tid`.
        let list = unsafe { &mut *self.retired[tid].get() };
        let mut kept = Vec::with_capacity(list.len());
        for handle in list.drain(..) {
            if reserved.contains(&handle.bits()) {
                kept.push(handle);
            } else {
                pool.free(handle, tid);
            }
        }
        *list = kept;
    }

    /// Number of nodes awaiting reclamation for `tid`.
    pub fn pending(&self, tid: usize) -> usize {
        // SAFETY: retired[tid] is only touched by the thread owning `tid`.
        unsafe { &*self.retired[tid].get() }.len()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn reserved_nodes_survive_scans() {
        let pool: Pool<u32> = Pool::new(8, 2, || 0);
        let tracker = HazardTracker::new(2, 1, 0);

        let h = pool.alloc(0);
        tracker.reserve(h, 0, 1);
        tracker.retire(h, 0, &pool);
        assert_eq!(tracker.pending(0), 1, "reserved handle must not be freed");
        assert!(pool.get(h).is_some());

        tracker.clear_all(1);
        tracker.scan(0, &pool);
        assert_eq!(tracker.pending(0), 0);
        let h2 = pool.alloc(0);
        assert_eq!(h2.index(), h.index(), "block recycled after the hazard lifted");
    }

    #[test]
    fn unreserved_nodes_free_on_retire() {
        let pool: Pool<u32> = Pool::new(8, 1, || 0);
        let tracker = HazardTracker::new(1, 1, 0);
        let h = pool.alloc(0);
        tracker.retire(h, 0, &pool);
        assert_eq!(tracker.pending(0), 0);
    }

    #[test]
    fn reservation_is_per_handle_not_per_slot_index() {
        let pool: Pool<u32> = Pool::new(8, 2, || 0);
        let tracker = HazardTracker::new(2, 1, 0);

        let a = pool.alloc(0);
        pool.free(a, 0);
        let b = pool.alloc(0); // same slot, fresh generation
        tracker.reserve(a, 0, 1); // stale reservation
        tracker.retire(b, 0, &pool);
        assert_eq!(
            tracker.pending(0),
            0,
            "a stale-generation reservation must not pin the new block"
        );
    }
}
