//! Bounded block pools with generation-stamped handles.
//!
//! Every node the containers link through (ring segments, queue nodes,
//! placeholders, requests) comes out of a [`Pool`]. A pool is a fixed
//! table of slots; each slot lazily allocates one boxed block the first
//! time it is handed out and keeps that box until the pool is dropped.
//! Nothing is ever returned to the system allocator mid-flight, which is
//! what makes the reclamation story memory-safe: a thread holding a stale
//! handle can read a recycled block and fail its CAS, but it can never
//! touch unmapped memory.
//!
//! Handles are [`TaggedRef`]s carrying the slot's generation, bumped on
//! every allocation, so a handle from a previous life of the slot is
//! detectable. Frees go to the freeing thread's private cache first and
//! spill to a tag-counted global free list (a Treiber stack of slot
//! indices; the tag makes the pop immune to index reuse races).

use std::cell::UnsafeCell;

use manege_primitives::sync::{AtomicPtr, AtomicU32, AtomicU64, Ordering, spin_loop};
use manege_primitives::{NIL, Padded, TaggedRef};

/// Per-thread cache size before frees spill to the shared list.
const CACHE_MAX: usize = 32;

/// Slot states. A slot cycles Free -> Allocated -> Free; anything else on a
/// transition is a caller bug and aborts.
const FREE: u32 = 0;
const ALLOCATED: u32 = 1;

struct PoolSlot<T> {
    /// Boxed block, null until the slot is first allocated, then stable for
    /// the pool's lifetime.
    item: AtomicPtr<T>,
    state: AtomicU32,
    generation: AtomicU32,
    /// Link for the shared free list.
    next_free: AtomicU32,
}

/// A bounded arena of reusable blocks.
pub struct Pool<T> {
    slots: Box<[PoolSlot<T>]>,
    /// (tag << 32) | index of the shared free-list head; NIL = empty.
    free_head: AtomicU64,
    /// Bump cursor over never-yet-used slots.
    next_unused: AtomicU32,
    caches: Box<[Padded<UnsafeCell<Vec<u32>>>]>,
    factory: Box<dyn Fn() -> T + Send + Sync>,
}

// SAFETY: slots are only reached through atomics; each cache entry is only
// touched by the thread owning its `tid` (a documented caller contract).
unsafe impl<T: Send + Sync> Send for Pool<T> {}
unsafe impl<T: Send + Sync> Sync for Pool<T> {}

impl<T> Pool<T> {
    /// Builds a pool of at most `capacity` blocks shared by `max_threads`
    /// threads. Blocks are created on demand by `factory`.
    pub fn new(
        capacity: u32,
        max_threads: usize,
        factory: impl Fn() -> T + Send + Sync + 'static,
    ) -> Self {
        assert!(capacity > 0 && capacity < NIL, "invalid pool capacity");
        assert!(max_threads > 0, "max_threads must be > 0");

        let slots = (0..capacity)
            .map(|_| PoolSlot {
                item: AtomicPtr::new(std::ptr::null_mut()),
                state: AtomicU32::new(FREE),
                generation: AtomicU32::new(0),
                next_free: AtomicU32::new(NIL),
            })
            .collect();
        let caches = (0..max_threads)
            .map(|_| Padded::new(UnsafeCell::new(Vec::new())))
            .collect();

        Pool {
            slots,
            free_head: AtomicU64::new(pack_free_head(NIL, 0)),
            next_unused: AtomicU32::new(0),
            caches,
            factory: Box::new(factory),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.slots.len() as u32
    }

    /// Allocates a block. Aborts on exhaustion: the pools are a designed
    /// capacity bound, there is no backpressure path.
    pub fn alloc(&self, tid: usize) -> TaggedRef {
        let index = self
            .pop_cached(tid)
            .or_else(|| self.pop_free())
            .or_else(|| self.pop_unused())
            .unwrap_or_else(|| {
                tracing::error!(capacity = self.slots.len(), "block pool exhausted");
                panic!("manege: block pool exhausted ({} blocks)", self.slots.len());
            });

        let slot = &self.slots[index as usize];
        if slot.item.load(Ordering::Acquire).is_null() {
            // First use of this slot; it is exclusively ours until freed.
            let block = Box::into_raw(Box::new((self.factory)()));
            slot.item.store(block, Ordering::Release);
        }
        if slot
            .state
            .compare_exchange(FREE, ALLOCATED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            panic!("manege: pool slot handed out twice");
        }
        let generation = slot.generation.fetch_add(1, Ordering::AcqRel) + 1;
        TaggedRef::new(index, generation)
    }

    /// Returns a block to the freeing thread's pool. A stale or doubly
    /// freed handle is an invariant breach and aborts.
    pub fn free(&self, handle: TaggedRef, tid: usize) {
        let slot = &self.slots[handle.index() as usize];
        if slot.generation.load(Ordering::Acquire) != handle.tag() {
            panic!("manege: freeing a stale pool handle");
        }
        if slot
            .state
            .compare_exchange(ALLOCATED, FREE, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            panic!("manege: double free of a pool block");
        }

        // SAFETY: caches[tid] is only touched by the thread owning `tid`.
        let cache = unsafe { &mut *self.caches[tid].get() };
        if cache.len() < CACHE_MAX {
            cache.push(handle.index());
        } else {
            self.push_free(handle.index());
        }
    }

    /// Dereferences a handle, failing on a slot that was never allocated or
    /// has been recycled since the handle was minted.
    pub fn get(&self, handle: TaggedRef) -> Option<&T> {
        if handle.is_null() {
            return None;
        }
        let slot = self.slots.get(handle.index() as usize)?;
        let ptr = slot.item.load(Ordering::Acquire);
        if ptr.is_null() || slot.generation.load(Ordering::Acquire) != handle.tag() {
            return None;
        }
        // SAFETY: non-null item pointers are never freed or replaced while
        // the pool lives.
        Some(unsafe { &*ptr })
    }

    /// Dereferences by bare index. Used by the queue protocols, whose
    /// counted head/tail words carry a swing counter rather than a
    /// generation: logical validity there is the hazard discipline's job,
    /// and the backing memory is pinned by the pool either way.
    pub fn get_raw(&self, index: u32) -> &T {
        let slot = &self.slots[index as usize];
        let ptr = slot.item.load(Ordering::Acquire);
        assert!(!ptr.is_null(), "manege: dereferencing an unused pool slot");
        // SAFETY: as in `get`.
        unsafe { &*ptr }
    }

    /// The current handle of an allocated slot.
    pub fn current_handle(&self, index: u32) -> TaggedRef {
        let slot = &self.slots[index as usize];
        TaggedRef::new(index, slot.generation.load(Ordering::Acquire))
    }

    fn pop_cached(&self, tid: usize) -> Option<u32> {
        // SAFETY: caches[tid] is only touched by the thread owning `tid`.
        let cache = unsafe { &mut *self.caches[tid].get() };
        cache.pop()
    }

    fn pop_free(&self) -> Option<u32> {
        loop {
            let head = self.free_head.load(Ordering::Acquire);
            let (index, tag) = unpack_free_head(head);
            if index == NIL {
                return None;
            }
            let next = self.slots[index as usize].next_free.load(Ordering::Acquire);
            let new = pack_free_head(next, tag.wrapping_add(1));
            if self
                .free_head
                .compare_exchange_weak(head, new, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(index);
            }
            spin_loop();
        }
    }

    fn push_free(&self, index: u32) {
        loop {
            let head = self.free_head.load(Ordering::Acquire);
            let (old_index, tag) = unpack_free_head(head);
            self.slots[index as usize]
                .next_free
                .store(old_index, Ordering::Release);
            let new = pack_free_head(index, tag.wrapping_add(1));
            if self
                .free_head
                .compare_exchange_weak(head, new, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
            spin_loop();
        }
    }

    fn pop_unused(&self) -> Option<u32> {
        loop {
            let i = self.next_unused.load(Ordering::Acquire);
            if i >= self.slots.len() as u32 {
                return None;
            }
            if self
                .next_unused
                .compare_exchange_weak(i, i + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(i);
            }
            spin_loop();
        }
    }
}

impl<T> Drop for Pool<T> {
    fn drop(&mut self) {
        for slot in self.slots.iter() {
            let ptr = slot.item.load(Ordering::Acquire);
            if !ptr.is_null() {
                // SAFETY: the pointer came from Box::into_raw in `alloc`
                // and nothing else can reach it once the pool is dropped.
                drop(unsafe { Box::from_raw(ptr) });
            }
        }
    }
}

#[inline]
fn pack_free_head(index: u32, tag: u32) -> u64 {
    ((tag as u64) << 32) | (index as u64)
}

#[inline]
fn unpack_free_head(packed: u64) -> (u32, u32) {
    (packed as u32, (packed >> 32) as u32)
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn alloc_free_recycles_with_fresh_generation() {
        let pool: Pool<u32> = Pool::new(4, 1, || 0);
        let a = pool.alloc(0);
        assert!(pool.get(a).is_some());

        pool.free(a, 0);
        let b = pool.alloc(0);
        // the cache hands the same slot back under a new generation
        assert_eq!(b.index(), a.index());
        assert_ne!(b.tag(), a.tag());
        assert!(pool.get(a).is_none(), "stale handle must not validate");
        assert!(pool.get(b).is_some());
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_aborts() {
        let pool: Pool<u32> = Pool::new(4, 1, || 0);
        let a = pool.alloc(0);
        pool.free(a, 0);
        // second free must not silently corrupt the free list
        let fresh = pool.current_handle(a.index());
        pool.free(fresh, 0);
    }

    #[test]
    #[should_panic(expected = "exhausted")]
    fn exhaustion_aborts() {
        let pool: Pool<u32> = Pool::new(2, 1, || 0);
        let _a = pool.alloc(0);
        let _b = pool.alloc(0);
        let _c = pool.alloc(0);
    }

    #[test]
    fn blocks_are_stable_across_reuse() {
        let pool: Pool<std::sync::atomic::AtomicU32> =
            Pool::new(2, 1, || std::sync::atomic::AtomicU32::new(7));
        let a = pool.alloc(0);
        let p1 = pool.get_raw(a.index()) as *const _;
        pool.free(a, 0);
        let b = pool.alloc(0);
        let p2 = pool.get_raw(b.index()) as *const _;
        assert_eq!(p1, p2, "a recycled slot keeps its block");
    }
}
