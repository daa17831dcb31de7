//! Michael–Scott queue over pooled nodes, with a keyed peek surface.
//!
//! The classic two-pointer linked queue with a dummy head. Head, tail and
//! every `next` link are counted references, so a node recycled through the
//! pool cannot satisfy a CAS taken against its previous life. `peek` /
//! `remove_cond` expose the head snapshot as an opaque key: a conditional
//! removal succeeds only if the queue head has not moved since the peek,
//! which is what the non-blocking dual composition builds its committed
//! removals on.

use std::marker::PhantomData;

use manege_primitives::sync::{AtomicU64, Ordering, spin_loop};
use manege_primitives::{AtomicTaggedRef, Padded, TaggedRef};

use crate::pool::Pool;
use crate::{Bits, Container, Peekable};

/// Nodes a queue may have live at once (queued items plus the dummy).
const NODE_POOL_CAPACITY: u32 = 1 << 16;

pub(crate) struct QNode {
    next: AtomicTaggedRef,
    value: AtomicU64,
    /// Pool handle of this node, for freeing after a head swing.
    self_ref: AtomicU64,
}

impl Default for QNode {
    fn default() -> Self {
        QNode {
            next: AtomicTaggedRef::null(),
            value: AtomicU64::new(0),
            self_ref: AtomicU64::new(TaggedRef::NULL.bits()),
        }
    }
}

pub struct MsQueue<T> {
    head: Padded<AtomicTaggedRef>,
    tail: Padded<AtomicTaggedRef>,
    pool: Pool<QNode>,
    max_threads: usize,
    _marker: PhantomData<fn(T) -> T>,
}

impl<T: Bits> MsQueue<T> {
    pub fn new(max_threads: usize) -> Self {
        Self::with_capacity(max_threads, NODE_POOL_CAPACITY)
    }

    pub fn with_capacity(max_threads: usize, capacity: u32) -> Self {
        assert!(max_threads > 0);
        let pool = Pool::new(capacity, max_threads, QNode::default);

        let dummy = pool.alloc(0);
        let node = pool.get_raw(dummy.index());
        node.self_ref.store(dummy.bits(), Ordering::Relaxed);

        MsQueue {
            head: Padded::new(AtomicTaggedRef::new(TaggedRef::new(dummy.index(), 0))),
            tail: Padded::new(AtomicTaggedRef::new(TaggedRef::new(dummy.index(), 0))),
            pool,
            max_threads,
            _marker: PhantomData,
        }
    }

    pub fn enqueue(&self, item: T, tid: usize) {
        debug_assert!(tid < self.max_threads);
        let h = self.pool.alloc(tid);
        let node = self.pool.get_raw(h.index());
        node.self_ref.store(h.bits(), Ordering::Relaxed);
        node.value.store(item.to_bits(), Ordering::SeqCst);
        // Null the link but keep its tag: a CAS snapshot from this node's
        // previous life must not line up with the fresh word.
        let old_next = node.next.load();
        node.next.init(TaggedRef::null_with_tag(old_next.tag()));

        loop {
            let my_tail = self.tail.load();
            let tail_node = self.pool.get_raw(my_tail.index());
            let my_next = tail_node.next.load();
            if self.tail.load().bits() != my_tail.bits() {
                continue;
            }
            if my_next.is_null() {
                // last node: link ourselves after it
                if tail_node
                    .next
                    .compare_exchange(my_next, TaggedRef::new(h.index(), my_next.tag() + 1))
                {
                    self.tail
                        .compare_exchange(my_tail, TaggedRef::new(h.index(), my_tail.tag() + 1));
                    return;
                }
            } else {
                // tail is falling behind: help it
                self.tail.compare_exchange(
                    my_tail,
                    TaggedRef::new(my_next.index(), my_tail.tag() + 1),
                );
            }
            spin_loop();
        }
    }

    pub fn dequeue(&self, tid: usize) -> Option<T> {
        debug_assert!(tid < self.max_threads);
        loop {
            let my_head = self.head.load();
            let my_tail = self.tail.load();
            let head_node = self.pool.get_raw(my_head.index());
            let my_next = head_node.next.load();
            if self.head.load().bits() != my_head.bits() {
                continue;
            }
            if my_head.index() != my_tail.index() {
                if my_next.is_null() {
                    continue;
                }
                // read the value before the swing: after it, another
                // dequeuer may free and recycle the node
                let value = self.pool.get_raw(my_next.index()).value.load(Ordering::SeqCst);
                if self
                    .head
                    .compare_exchange(my_head, TaggedRef::new(my_next.index(), my_head.tag() + 1))
                {
                    let stale = TaggedRef::from_bits(head_node.self_ref.load(Ordering::SeqCst));
                    self.pool.free(stale, tid);
                    return Some(T::from_bits(value));
                }
            } else {
                if my_next.is_null() {
                    return None;
                }
                self.tail
                    .compare_exchange(my_tail, TaggedRef::new(my_next.index(), my_tail.tag() + 1));
            }
            spin_loop();
        }
    }

    /// Observes the next removable item without removing it. The returned
    /// key commits the observation for [`MsQueue::remove_cond`].
    pub fn peek(&self, _tid: usize) -> Option<(u64, T)> {
        loop {
            let my_head = self.head.load();
            let my_tail = self.tail.load();
            let head_node = self.pool.get_raw(my_head.index());
            let my_next = head_node.next.load();
            if self.head.load().bits() != my_head.bits() {
                continue;
            }
            if my_head.index() != my_tail.index() {
                if my_next.is_null() {
                    continue;
                }
                let value = self.pool.get_raw(my_next.index()).value.load(Ordering::SeqCst);
                // verify the snapshot before handing the pair out
                if self.head.load().bits() == my_head.bits() {
                    return Some((my_head.bits(), T::from_bits(value)));
                }
            } else {
                if my_next.is_null() {
                    return None;
                }
                self.tail
                    .compare_exchange(my_tail, TaggedRef::new(my_next.index(), my_tail.tag() + 1));
            }
            spin_loop();
        }
    }

    /// Removes the item observed under `key` iff the head has not moved.
    pub fn remove_cond(&self, key: u64, tid: usize) -> bool {
        let my_head = TaggedRef::from_bits(key);
        if self.head.load().bits() != key {
            return false;
        }
        let my_tail = self.tail.load();
        let head_node = self.pool.get_raw(my_head.index());
        let my_next = head_node.next.load();
        if self.head.load().bits() != key {
            return false;
        }
        if my_head.index() != my_tail.index() {
            if my_next.is_null() {
                return false;
            }
            if self
                .head
                .compare_exchange(my_head, TaggedRef::new(my_next.index(), my_head.tag() + 1))
            {
                let stale = TaggedRef::from_bits(head_node.self_ref.load(Ordering::SeqCst));
                self.pool.free(stale, tid);
                return true;
            }
        } else if !my_next.is_null() {
            self.tail
                .compare_exchange(my_tail, TaggedRef::new(my_next.index(), my_tail.tag() + 1));
        }
        false
    }
}

impl<T: Bits + Send + Sync> Container<T> for MsQueue<T> {
    fn insert(&self, item: T, tid: usize) {
        self.enqueue(item, tid);
    }

    fn remove(&self, tid: usize) -> Option<T> {
        self.dequeue(tid)
    }
}

impl<T: Bits + Send + Sync> Peekable<T> for MsQueue<T> {
    fn peek(&self, tid: usize) -> Option<(u64, T)> {
        MsQueue::peek(self, tid)
    }

    fn remove_cond(&self, key: u64, tid: usize) -> bool {
        MsQueue::remove_cond(self, key, tid)
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn fifo_order() {
        let q: MsQueue<i32> = MsQueue::with_capacity(1, 32);
        for v in 1..=10 {
            q.enqueue(v, 0);
        }
        for v in 1..=10 {
            assert_eq!(q.dequeue(0), Some(v));
        }
        assert_eq!(q.dequeue(0), None);
    }

    #[test]
    fn peek_does_not_remove() {
        let q: MsQueue<i32> = MsQueue::with_capacity(1, 32);
        assert!(q.peek(0).is_none());
        q.enqueue(5, 0);
        let (_, v) = q.peek(0).unwrap();
        assert_eq!(v, 5);
        let (_, v) = q.peek(0).unwrap();
        assert_eq!(v, 5);
        assert_eq!(q.dequeue(0), Some(5));
    }

    #[test]
    fn remove_cond_honors_the_snapshot() {
        let q: MsQueue<i32> = MsQueue::with_capacity(1, 32);
        q.enqueue(1, 0);
        q.enqueue(2, 0);

        let (key, v) = q.peek(0).unwrap();
        assert_eq!(v, 1);
        assert!(q.remove_cond(key, 0), "head unmoved: removal commits");
        assert!(!q.remove_cond(key, 0), "stale key: removal refused");
        assert_eq!(q.dequeue(0), Some(2));
    }

    #[test]
    fn nodes_recycle_through_the_pool() {
        let q: MsQueue<i32> = MsQueue::with_capacity(1, 4);
        for round in 0..100 {
            q.enqueue(round + 1, 0);
            q.enqueue(round + 2, 0);
            assert_eq!(q.dequeue(0), Some(round + 1));
            assert_eq!(q.dequeue(0), Some(round + 2));
        }
    }
}
