//! Single-polarity dual ring queue.
//!
//! Every segment holds either data or antidata (parked consumer requests),
//! never both. The queue's head segment decides which side is currently
//! backed up: an operation whose polarity matches the head enqueues into
//! the tail; the opposite operation dequeues from the head and, when it
//! drains the head empty, seals it, appends a fresh segment of its *own*
//! polarity seeded with itself, and swings the head. That flip is how the
//! structure alternates between holding values and holding waiters.
//!
//! A consumer never receives a value through a return path: its `remove`
//! parks a [`WaitCell`] token inside the slot it claimed, and the producer
//! that claims that slot writes the value straight into the consumer's
//! cell. The consumer spins only on its own cache line.
//!
//! In lock-free mode the antidata rings run the ready-bit wavefront
//! protocol: a freshly written slot is invisible to producers until the
//! slot before it in sequence has been produced, and producers walk the
//! head index forwards/backwards to find the front instead of trusting
//! fetch-and-increment alone. The walk has no iteration bound under
//! adversarial scheduling; that is a known liveness caveat of the design.

use manege_primitives::sync::{AtomicBool, AtomicU32, AtomicU64, Ordering, thread};
use manege_primitives::{
    AtomicTaggedRef, Cursor, Padded, SlotDesc, SlotWord, TaggedRef, WaitCell, WaitToken,
};

use crate::pool::Pool;
use crate::reclaim::SegmentReclaimer;
use crate::{DEFAULT_RING_SIZE, DualContainer, Polarity, STARVATION, check_seq};

const SEGMENT_POOL_CAPACITY: u32 = 4096;

pub(crate) enum DualPop {
    /// Handed our value to a parked waiter (data-side rendezvous).
    Satisfied,
    /// Took a plain value out (antidata side draining a data backlog).
    Value(u32),
    Empty,
}

enum SideResult {
    /// The operation completed; payload meaningful on the antidata side.
    Done(u32),
    /// The head flipped to our own polarity: retry from dispatch.
    Flipped,
}

/// One single-polarity ring segment.
pub(crate) struct DualSegment {
    head: Padded<Cursor>,
    tail: Padded<Cursor>,
    next: Padded<AtomicTaggedRef>,
    index: Padded<AtomicU64>,
    self_ref: AtomicU64,
    polarity: AtomicU32,
    lock_free: AtomicBool,
    /// Latched once `seal` succeeds; terminal.
    sealed: AtomicBool,
    ring: Box<[Padded<SlotWord>]>,
}

impl DualSegment {
    fn new(ring_size: usize) -> Self {
        assert!(ring_size >= 2, "ring_size must be at least 2");
        let ring = (0..ring_size)
            .map(|i| Padded::new(SlotWord::new(SlotDesc::new(i as u32, true, true), 0)))
            .collect();
        DualSegment {
            head: Padded::new(Cursor::new()),
            tail: Padded::new(Cursor::new()),
            next: Padded::new(AtomicTaggedRef::null()),
            index: Padded::new(AtomicU64::new(0)),
            self_ref: AtomicU64::new(TaggedRef::NULL.bits()),
            polarity: AtomicU32::new(0),
            lock_free: AtomicBool::new(false),
            sealed: AtomicBool::new(false),
            ring,
        }
    }

    fn reset(&self, index: u64, self_ref: TaggedRef, polarity: Polarity, lock_free: bool) {
        self.head.init(SlotDesc::from_bits(0));
        self.tail.init(SlotDesc::from_bits(0));
        self.next.init(TaggedRef::NULL);
        self.index.store(index, Ordering::Relaxed);
        self.self_ref.store(self_ref.bits(), Ordering::Relaxed);
        self.polarity
            .store(polarity.aux_bit() as u32, Ordering::Relaxed);
        self.lock_free.store(lock_free, Ordering::Relaxed);
        self.sealed.store(false, Ordering::Relaxed);

        if lock_free && polarity == Polarity::Antidata {
            // wavefront rings: only the first slot starts ready
            for (i, slot) in self.ring.iter().enumerate() {
                slot.init(SlotDesc::new(i as u32, true, i == 0), 0);
            }
        } else {
            for (i, slot) in self.ring.iter().enumerate() {
                slot.init(SlotDesc::new(i as u32, true, true), 0);
            }
        }
    }

    #[inline]
    fn ring_size(&self) -> u32 {
        self.ring.len() as u32
    }

    #[inline]
    fn next(&self) -> &AtomicTaggedRef {
        &self.next
    }

    #[inline]
    fn polarity(&self) -> Polarity {
        Polarity::from_aux(self.polarity.load(Ordering::SeqCst) != 0)
    }

    #[inline]
    fn is_lock_free(&self) -> bool {
        self.lock_free.load(Ordering::SeqCst)
    }

    #[inline]
    fn index(&self) -> u64 {
        self.index.load(Ordering::SeqCst)
    }

    #[inline]
    fn set_index(&self, index: u64) {
        self.index.store(index, Ordering::SeqCst);
    }

    #[inline]
    fn handle(&self) -> TaggedRef {
        TaggedRef::from_bits(self.self_ref.load(Ordering::SeqCst))
    }

    /// Ready bit written into slots this ring produces; false only on the
    /// wavefront (lock-free antidata) rings.
    #[inline]
    fn ready_after(&self) -> bool {
        !(self.is_lock_free() && self.polarity() == Polarity::Antidata)
    }

    fn seal(&self) -> bool {
        {
            let h = self.head.load();
            let t = self.tail.load();
            if t.closed() && h.seq() >= t.seq() {
                self.sealed.store(true, Ordering::SeqCst);
                return true;
            }
        }
        loop {
            if self.sealed.load(Ordering::SeqCst) {
                return true;
            }
            let h = self.head.load();
            let t = self.tail.load();
            if h.seq() < t.seq() {
                return false;
            }
            if self.tail.compare_exchange(t, h.with_closed(true)) {
                self.sealed.store(true, Ordering::SeqCst);
                return true;
            }
        }
    }

    fn fix_state(&self) {
        let h = self.head.load();
        let t = self.tail.load();
        if h.seq() <= t.seq() {
            return;
        }
        let repaired = h.with_closed(t.closed());
        let _ = self.tail.compare_exchange(t, repaired);
    }

    fn empty_check(&self, hseq: u32) -> bool {
        let t = self.tail.load();
        if t.seq() <= hseq + 1 {
            self.fix_state();
            true
        } else {
            false
        }
    }

    /// Enqueue of the segment's own polarity. For antidata, `armer` arms
    /// the caller's wait cell right before each publication attempt.
    fn enqueue(&self, payload: u32, armer: Option<(&WaitCell, u32)>) -> bool {
        debug_assert!(payload != 0);
        let r = self.ring_size();
        let ready_after = self.ready_after();
        let mut starvation = 0u32;
        loop {
            let t = self.tail.fetch_inc();
            if t.closed() {
                return false;
            }
            check_seq(t.seq());

            let slot = &self.ring[(t.seq() % r) as usize];
            let (desc, val) = slot.load();
            if val == 0 {
                if let Some((cell, ticket)) = armer {
                    cell.arm(ticket);
                }
                if desc.seq() <= t.seq()
                    && (desc.safe() || self.head.load().seq() <= t.seq())
                    && slot.compare_exchange(
                        desc,
                        0,
                        SlotDesc::new(t.seq(), true, ready_after),
                        payload,
                    )
                {
                    return true;
                }
            }

            let h = self.head.load();
            if (t.seq() as i64 - h.seq() as i64) >= r as i64 || starvation >= STARVATION {
                self.tail.close();
                return false;
            }
            starvation += 1;
        }
    }

    fn dequeue(&self, polarity: Polarity, arg: u32, waiters: &[Padded<WaitCell>]) -> DualPop {
        if !self.is_lock_free() || self.polarity() == Polarity::Data {
            self.dequeue_normal(polarity, arg, waiters)
        } else {
            self.dequeue_wavefront(polarity, arg, waiters)
        }
    }

    /// Dequeue by the opposite polarity: a data-side caller satisfies the
    /// parked waiter it finds, an antidata-side caller takes the value.
    fn dequeue_normal(&self, polarity: Polarity, arg: u32, waiters: &[Padded<WaitCell>]) -> DualPop {
        debug_assert!(polarity != self.polarity());
        let r = self.ring_size();
        let ready_after = self.ready_after();

        if self.tail.load().seq() <= self.head.load().seq() {
            self.fix_state();
            return DualPop::Empty;
        }

        loop {
            let h = self.head.fetch_inc();
            check_seq(h.seq());
            let slot = &self.ring[(h.seq() % r) as usize];
            loop {
                let (desc, val) = slot.load();
                debug_assert!(desc.aux(), "non-wavefront slots are always ready");

                if desc.seq() > h.seq() {
                    if self.empty_check(h.seq()) {
                        return DualPop::Empty;
                    }
                    break;
                }
                if val != 0 {
                    if desc.seq() == h.seq() {
                        let empty = SlotDesc::new(h.seq() + r, desc.safe(), ready_after);
                        if polarity == Polarity::Data {
                            let token = WaitToken::unpack(val);
                            if waiters[token.tid].satisfy(token.ticket, arg) {
                                slot.compare_exchange(desc, val, empty, 0);
                                return DualPop::Satisfied;
                            }
                            // only the wavefront protocol can lose this race
                            slot.compare_exchange(desc, val, empty, 0);
                            panic!("manege: rendezvous cell satisfied twice");
                        } else if slot.compare_exchange(desc, val, empty, 0) {
                            return DualPop::Value(val);
                        }
                    } else {
                        let unsafe_desc = SlotDesc::new(desc.seq(), false, ready_after);
                        if slot.compare_exchange(desc, val, unsafe_desc, val) {
                            if self.empty_check(h.seq()) {
                                return DualPop::Empty;
                            }
                            break;
                        }
                    }
                } else {
                    let empty = SlotDesc::new(h.seq() + r, desc.safe(), ready_after);
                    if slot.compare_exchange(desc, 0, empty, 0) {
                        if self.empty_check(h.seq()) {
                            return DualPop::Empty;
                        }
                        break;
                    }
                }
            }
        }
    }

    /// Ready-bit wavefront dequeue over a lock-free antidata ring: find the
    /// frontmost ready slot by stepping the claimed index, then either
    /// satisfy the waiter there or step past an exhausted slot.
    fn dequeue_wavefront(
        &self,
        polarity: Polarity,
        arg: u32,
        waiters: &[Padded<WaitCell>],
    ) -> DualPop {
        debug_assert!(polarity != self.polarity());
        let r = self.ring_size();
        let ready_after = self.ready_after();

        let mut hseq = self.head.fetch_inc().seq();
        let mut paused = false;
        loop {
            check_seq(hseq);
            let slot = &self.ring[(hseq % r) as usize];
            let (desc, val) = slot.load();
            let idx = desc.seq();

            if idx > hseq {
                // behind the front
                hseq += 1;
                continue;
            }
            if idx < hseq {
                // lapped past it
                debug_assert!(hseq >= r);
                hseq = (hseq - r) + 1;
                continue;
            }

            if !desc.aux() {
                // not ready: either we sit exactly on the front, or ahead
                let on_front = hseq == 0 || {
                    let (prev, _) = self.ring[((hseq - 1) % r) as usize].load();
                    prev.seq() != hseq - 1
                };
                if on_front {
                    self.set_ready(hseq);
                    continue;
                }
                if !paused {
                    thread::yield_now();
                    paused = true;
                    continue;
                }
                hseq -= 1;
                continue;
            }

            if val != 0 {
                let empty = SlotDesc::new(hseq + r, desc.safe(), ready_after);
                let token = WaitToken::unpack(val);
                if waiters[token.tid].satisfy(token.ticket, arg) {
                    slot.compare_exchange(desc, val, empty, 0);
                    self.set_ready(hseq + 1);
                    return DualPop::Satisfied;
                }
                // beaten to the cell: clean the slot and move on
                slot.compare_exchange(desc, val, empty, 0);
                self.set_ready(hseq + 1);
                hseq += 1;
            } else {
                let empty = SlotDesc::new(hseq + r, desc.safe(), ready_after);
                if slot.compare_exchange(desc, 0, empty, 0) {
                    self.set_ready(hseq + 1);
                    if self.empty_check(hseq) {
                        return DualPop::Empty;
                    }
                    hseq = self.head.fetch_inc().seq();
                }
            }
        }
    }

    /// Flips the ready bit of the slot expected at `seq`; a no-op if the
    /// slot has moved on or is already ready.
    fn set_ready(&self, seq: u32) {
        check_seq(seq);
        let r = self.ring_size();
        let slot = &self.ring[(seq % r) as usize];
        let (desc, val) = slot.load();
        if desc.seq() != seq || desc.aux() {
            return;
        }
        slot.compare_exchange(desc, val, SlotDesc::new(seq, desc.safe(), true), val);
    }
}

/// The dual queue proper: a chain of single-polarity segments.
pub struct Spdq {
    head: Padded<AtomicTaggedRef>,
    tail: Padded<AtomicTaggedRef>,
    head_index: Padded<AtomicU64>,
    waiters: Box<[Padded<WaitCell>]>,
    tickets: Box<[Padded<AtomicU32>]>,
    pool: Pool<DualSegment>,
    reclaim: SegmentReclaimer,
    lock_free: bool,
    max_threads: usize,
}

impl Spdq {
    /// `lock_free: false` gives the blocking-producer variant; `true`
    /// switches antidata rings to the wavefront protocol.
    pub fn new(max_threads: usize, lock_free: bool) -> Self {
        Self::with_ring_size(max_threads, DEFAULT_RING_SIZE, lock_free)
    }

    pub fn with_ring_size(max_threads: usize, ring_size: usize, lock_free: bool) -> Self {
        assert!(max_threads > 0 && max_threads < 0xFFFF);
        let pool = Pool::new(SEGMENT_POOL_CAPACITY, max_threads, move || {
            DualSegment::new(ring_size)
        });
        let reclaim = SegmentReclaimer::new(max_threads);

        // the queue starts on the antidata side, as an empty dual queue is
        // about to hold waiters, not values
        let first = pool.alloc(0);
        pool.get_raw(first.index())
            .reset(0, first, Polarity::Antidata, lock_free);

        let waiters = (0..max_threads).map(|_| Padded::new(WaitCell::new())).collect();
        let tickets = (0..max_threads)
            .map(|_| Padded::new(AtomicU32::new(0)))
            .collect();

        Spdq {
            head: Padded::new(AtomicTaggedRef::new(TaggedRef::new(first.index(), 0))),
            tail: Padded::new(AtomicTaggedRef::new(TaggedRef::new(first.index(), 0))),
            head_index: Padded::new(AtomicU64::new(0)),
            waiters,
            tickets,
            pool,
            reclaim,
            lock_free,
            max_threads,
        }
    }

    fn next_ticket(&self, tid: usize) -> u32 {
        self.tickets[tid].fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Blocks until matched with an `insert`.
    pub fn remove(&self, tid: usize) -> i32 {
        debug_assert!(tid < self.max_threads);
        loop {
            let href = self.head.load();
            let seg = self.pool.get_raw(href.index());
            if seg.polarity() == Polarity::Antidata {
                // waiters are backed up (or the queue is empty): join them
                let ticket = self.next_ticket(tid);
                let token = WaitToken { tid, ticket };
                let cell = &*self.waiters[tid];
                if self.enqueue_side(
                    href,
                    Polarity::Antidata,
                    token.pack(),
                    Some((cell, ticket)),
                    tid,
                ) {
                    return cell.wait() as i32;
                }
            } else if let SideResult::Done(v) = self.dequeue_side(Polarity::Antidata, 0, tid) {
                return v as i32;
            }
        }
    }

    pub fn insert(&self, value: i32, tid: usize) {
        assert!(value != 0, "value 0 is reserved as the empty sentinel");
        debug_assert!(tid < self.max_threads);
        loop {
            let href = self.head.load();
            let seg = self.pool.get_raw(href.index());
            if seg.polarity() == Polarity::Data {
                if self.enqueue_side(href, Polarity::Data, value as u32, None, tid) {
                    return;
                }
            } else if let SideResult::Done(_) = self.dequeue_side(Polarity::Data, value as u32, tid)
            {
                return;
            }
        }
    }

    /// Enqueue onto the tail while it matches `polarity`. Returns false
    /// when the tail belongs to the other side (the head needs to move).
    fn enqueue_side(
        &self,
        h: TaggedRef,
        polarity: Polarity,
        payload: u32,
        armer: Option<(&WaitCell, u32)>,
        tid: usize,
    ) -> bool {
        let mut spare: Option<TaggedRef> = None;
        loop {
            self.reclaim
                .publish(tid, self.head_index.load(Ordering::SeqCst));
            let tref = self.tail.load();
            let seg = self.pool.get_raw(tref.index());

            let next = seg.next().load();
            if !next.is_null() {
                self.tail
                    .compare_exchange(tref, TaggedRef::new(next.index(), tref.tag() + 1));
                continue;
            }
            if seg.polarity() != polarity {
                // the structure flipped beneath us; help the head along
                if self.head.load().bits() == h.bits() {
                    let hseg = self.pool.get_raw(h.index());
                    if hseg.seal() {
                        self.swing_head(h, tid);
                    }
                }
                self.reclaim.clear(tid);
                if let Some(s) = spare {
                    self.pool.free(s, tid);
                }
                return false;
            }

            if seg.enqueue(payload, armer) {
                self.reclaim.clear(tid);
                if let Some(s) = spare {
                    self.pool.free(s, tid);
                }
                return true;
            }

            // tail ring closed: chain a segment of the same polarity,
            // seeded with our own payload
            if spare.is_none() {
                let nh = self.pool.alloc(tid);
                let fresh = self.pool.get_raw(nh.index());
                fresh.reset(0, nh, polarity, self.lock_free);
                if !fresh.enqueue(payload, armer) {
                    self.pool.free(nh, tid);
                    continue;
                }
                spare = Some(nh);
            }
            let Some(nh) = spare else { continue };
            if self.append_ring(tref, nh) {
                self.reclaim.clear(tid);
                return true;
            }
            self.pool.free(nh, tid);
            spare = None;
        }
    }

    /// Dequeue from an opposite-polarity head; on exhaustion, appends a
    /// segment of the caller's polarity carrying the caller's operation and
    /// swings the head to it.
    fn dequeue_side(&self, polarity: Polarity, arg: u32, tid: usize) -> SideResult {
        let mut spare: Option<TaggedRef> = None;
        loop {
            self.reclaim
                .publish(tid, self.head_index.load(Ordering::SeqCst));
            let href = self.head.load();
            let seg = self.pool.get_raw(href.index());

            if seg.polarity() == polarity {
                // head changed beneath us
                self.reclaim.clear(tid);
                if let Some(s) = spare {
                    self.pool.free(s, tid);
                }
                return SideResult::Flipped;
            }

            match seg.dequeue(polarity, arg, &self.waiters) {
                DualPop::Satisfied => {
                    self.reclaim.clear(tid);
                    if let Some(s) = spare {
                        self.pool.free(s, tid);
                    }
                    return SideResult::Done(0);
                }
                DualPop::Value(v) => {
                    self.reclaim.clear(tid);
                    if let Some(s) = spare {
                        self.pool.free(s, tid);
                    }
                    return SideResult::Done(v);
                }
                DualPop::Empty => {}
            }

            if !seg.seal() {
                self.reclaim.clear(tid);
                continue;
            }

            let next = seg.next().load();
            if next.is_null() {
                // drained head with no successor: flip the structure to our
                // polarity, with our own operation already inside
                if spare.is_none() {
                    let nh = self.pool.alloc(tid);
                    let fresh = self.pool.get_raw(nh.index());
                    fresh.reset(0, nh, polarity, self.lock_free);
                    let ok = if polarity == Polarity::Antidata {
                        let ticket = self.next_ticket(tid);
                        let token = WaitToken { tid, ticket };
                        fresh.enqueue(token.pack(), Some((&self.waiters[tid], ticket)))
                    } else {
                        fresh.enqueue(arg, None)
                    };
                    if !ok {
                        self.pool.free(nh, tid);
                        continue;
                    }
                    spare = Some(nh);
                }
                let Some(nh) = spare else { continue };
                if self.append_ring(href, nh) {
                    self.swing_head(href, tid);
                    if polarity == Polarity::Antidata {
                        let v = self.waiters[tid].wait();
                        self.reclaim.clear(tid);
                        return SideResult::Done(v);
                    }
                    self.reclaim.clear(tid);
                    return SideResult::Done(0);
                }
                self.pool.free(nh, tid);
                spare = None;
            } else {
                // sealed with a successor: advance and retry
                self.swing_head(href, tid);
                self.reclaim.clear(tid);
            }
        }
    }

    /// Links `new_h` after the segment at `prev` and swings the tail.
    fn append_ring(&self, prev: TaggedRef, new_h: TaggedRef) -> bool {
        let prev_seg = self.pool.get_raw(prev.index());
        let new_seg = self.pool.get_raw(new_h.index());
        new_seg.set_index(prev_seg.index() + 1);
        if prev_seg.next().compare_exchange(TaggedRef::NULL, new_h) {
            tracing::trace!(
                segment = new_seg.index(),
                polarity = ?new_seg.polarity(),
                "appended dual ring segment"
            );
            self.tail
                .compare_exchange(prev, TaggedRef::new(new_h.index(), prev.tag() + 1));
            return true;
        }
        false
    }

    /// Advances the head past a sealed segment and retires it. The caller
    /// must have observed `h` sealed.
    fn swing_head(&self, h: TaggedRef, tid: usize) -> bool {
        if self.head.load().bits() != h.bits() {
            return false;
        }
        let seg = self.pool.get_raw(h.index());
        let next = seg.next().load();
        if next.is_null() {
            return false;
        }
        if self
            .head
            .compare_exchange(h, TaggedRef::new(next.index(), h.tag() + 1))
        {
            self.head_index.fetch_add(1, Ordering::SeqCst);
            self.reclaim.retire(seg.handle(), seg.index(), tid, &self.pool);
            return true;
        }
        false
    }
}

impl DualContainer for Spdq {
    fn insert(&self, value: i32, tid: usize) {
        Spdq::insert(self, value, tid);
    }

    fn remove(&self, tid: usize) -> i32 {
        Spdq::remove(self, tid)
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn data_backlog_drains_in_fifo_order() {
        let q = Spdq::with_ring_size(1, 8, false);
        for v in 1..=5 {
            q.insert(v, 0);
        }
        for v in 1..=5 {
            assert_eq!(q.remove(0), v);
        }
    }

    #[test]
    fn backlog_spills_across_segments() {
        let q = Spdq::with_ring_size(1, 4, false);
        for v in 1..=9 {
            q.insert(v, 0);
        }
        for v in 1..=9 {
            assert_eq!(q.remove(0), v);
        }
    }

    #[test]
    fn polarity_flips_back_and_forth() {
        let q = Spdq::with_ring_size(1, 4, false);
        for round in 0..50 {
            let v = round * 3 + 1;
            q.insert(v, 0);
            assert_eq!(q.remove(0), v);
        }
    }

    #[test]
    #[should_panic(expected = "reserved")]
    fn zero_insert_is_a_contract_violation() {
        let q = Spdq::with_ring_size(1, 8, false);
        q.insert(0, 0);
    }
}
