//! Treiber stack over pooled nodes, with a keyed peek surface.
//!
//! The top-of-stack word is a counted reference; `down` links are plain
//! indices, never CASed, so they need no tag. Pops free nodes straight
//! back to the pool: the counted top plus the pool's pinned blocks make
//! the recycled-node race benign (a stale CAS fails on the bumped tag).

use std::marker::PhantomData;

use manege_primitives::sync::{AtomicU32, AtomicU64, Ordering, spin_loop};
use manege_primitives::{AtomicTaggedRef, NIL, Padded, TaggedRef};

use crate::pool::Pool;
use crate::{Bits, Container, Peekable};

const NODE_POOL_CAPACITY: u32 = 1 << 16;

pub(crate) struct SNode {
    /// Index of the node below, NIL at the bottom.
    down: AtomicU32,
    value: AtomicU64,
    self_ref: AtomicU64,
}

impl Default for SNode {
    fn default() -> Self {
        SNode {
            down: AtomicU32::new(NIL),
            value: AtomicU64::new(0),
            self_ref: AtomicU64::new(TaggedRef::NULL.bits()),
        }
    }
}

pub struct TreiberStack<T> {
    top: Padded<AtomicTaggedRef>,
    pool: Pool<SNode>,
    max_threads: usize,
    _marker: PhantomData<fn(T) -> T>,
}

impl<T: Bits> TreiberStack<T> {
    pub fn new(max_threads: usize) -> Self {
        Self::with_capacity(max_threads, NODE_POOL_CAPACITY)
    }

    pub fn with_capacity(max_threads: usize, capacity: u32) -> Self {
        assert!(max_threads > 0);
        TreiberStack {
            top: Padded::new(AtomicTaggedRef::null()),
            pool: Pool::new(capacity, max_threads, SNode::default),
            max_threads,
            _marker: PhantomData,
        }
    }

    pub fn push(&self, item: T, tid: usize) {
        debug_assert!(tid < self.max_threads);
        let h = self.pool.alloc(tid);
        let node = self.pool.get_raw(h.index());
        node.self_ref.store(h.bits(), Ordering::Relaxed);
        node.value.store(item.to_bits(), Ordering::SeqCst);

        loop {
            let top = self.top.load();
            node.down.store(top.index(), Ordering::SeqCst);
            if self
                .top
                .compare_exchange(top, TaggedRef::new(h.index(), top.tag() + 1))
            {
                return;
            }
            spin_loop();
        }
    }

    pub fn pop(&self, tid: usize) -> Option<T> {
        debug_assert!(tid < self.max_threads);
        loop {
            let top = self.top.load();
            if top.is_null() {
                return None;
            }
            let node = self.pool.get_raw(top.index());
            let down = node.down.load(Ordering::SeqCst);
            // read before the swing: the node is recyclable right after
            let value = node.value.load(Ordering::SeqCst);
            if self
                .top
                .compare_exchange(top, TaggedRef::new(down, top.tag() + 1))
            {
                let stale = TaggedRef::from_bits(node.self_ref.load(Ordering::SeqCst));
                self.pool.free(stale, tid);
                return Some(T::from_bits(value));
            }
            spin_loop();
        }
    }

    pub fn peek(&self, _tid: usize) -> Option<(u64, T)> {
        loop {
            let top = self.top.load();
            if top.is_null() {
                return None;
            }
            let value = self.pool.get_raw(top.index()).value.load(Ordering::SeqCst);
            if self.top.load().bits() == top.bits() {
                return Some((top.bits(), T::from_bits(value)));
            }
            spin_loop();
        }
    }

    pub fn remove_cond(&self, key: u64, tid: usize) -> bool {
        let top = TaggedRef::from_bits(key);
        if top.is_null() || self.top.load().bits() != key {
            return false;
        }
        let node = self.pool.get_raw(top.index());
        let down = node.down.load(Ordering::SeqCst);
        if self
            .top
            .compare_exchange(top, TaggedRef::new(down, top.tag() + 1))
        {
            let stale = TaggedRef::from_bits(node.self_ref.load(Ordering::SeqCst));
            self.pool.free(stale, tid);
            return true;
        }
        false
    }
}

impl<T: Bits + Send + Sync> Container<T> for TreiberStack<T> {
    fn insert(&self, item: T, tid: usize) {
        self.push(item, tid);
    }

    fn remove(&self, tid: usize) -> Option<T> {
        self.pop(tid)
    }
}

impl<T: Bits + Send + Sync> Peekable<T> for TreiberStack<T> {
    fn peek(&self, tid: usize) -> Option<(u64, T)> {
        TreiberStack::peek(self, tid)
    }

    fn remove_cond(&self, key: u64, tid: usize) -> bool {
        TreiberStack::remove_cond(self, key, tid)
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn lifo_order() {
        let s: TreiberStack<i32> = TreiberStack::with_capacity(1, 16);
        for v in 1..=5 {
            s.push(v, 0);
        }
        for v in (1..=5).rev() {
            assert_eq!(s.pop(0), Some(v));
        }
        assert_eq!(s.pop(0), None);
    }

    #[test]
    fn peek_then_conditional_removal() {
        let s: TreiberStack<i32> = TreiberStack::with_capacity(1, 16);
        s.push(1, 0);
        s.push(2, 0);

        let (key, v) = s.peek(0).unwrap();
        assert_eq!(v, 2);
        assert!(s.remove_cond(key, 0));
        assert!(!s.remove_cond(key, 0), "stale key refused");
        assert_eq!(s.pop(0), Some(1));
    }

    #[test]
    fn stale_key_after_push_is_refused() {
        let s: TreiberStack<i32> = TreiberStack::with_capacity(1, 16);
        s.push(1, 0);
        let (key, _) = s.peek(0).unwrap();
        s.push(2, 0);
        assert!(!s.remove_cond(key, 0), "top moved since the peek");
        assert_eq!(s.pop(0), Some(2));
        assert_eq!(s.pop(0), Some(1));
    }
}
