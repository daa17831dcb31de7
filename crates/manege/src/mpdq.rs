//! Mixed-polarity dual ring queue.
//!
//! One ring serves both sides at once: a data cursor and an antidata
//! cursor walk the same slot array, and each occupied slot records its
//! polarity. An operation claims an index from its own cursor; if the slot
//! there holds the opposite polarity it rendezvouses (a producer satisfies
//! the parked waiter directly, a consumer takes the value), and if the slot
//! is empty it enqueues itself; a consumer then blocks on its wait cell.
//!
//! Closing is two-phase: whoever gives up (starved, lapped, or finding a
//! closed cursor) closes the other side's cursor too and then races one CAS
//! to record the final close index, the max of both cursors. Claims below
//! the close index still rendezvous; claims above it report the segment
//! closed, and once the close index is also below the opposite cursor the
//! segment is drained and the single thread that wins the `abandoned` flag
//! unlinks and retires it.
//!
//! Lock-free mode replaces the data side's fetch-and-increment discipline
//! with the wavefront walk (no iteration bound; known liveness caveat).

use manege_primitives::sync::{AtomicU32, AtomicU64, Ordering};
use manege_primitives::{
    AtomicTaggedRef, Cursor, Padded, SlotDesc, SlotWord, TaggedRef, WaitCell, WaitToken,
};

use crate::pool::Pool;
use crate::reclaim::SegmentReclaimer;
use crate::{DEFAULT_RING_SIZE, DualContainer, Polarity, STARVATION, check_seq};

const SEGMENT_POOL_CAPACITY: u32 = 4096;

#[derive(Clone, Copy)]
enum MixedOutcome {
    /// Data-side success: value delivered or parked.
    Ok,
    /// Antidata-side success: the matched value.
    Value(u32),
    /// Closed with opposite operations still owed below the close index.
    Closed,
    /// Closed and fully served: safe to unlink.
    Drained,
}

/// One mixed ring segment.
pub(crate) struct MixedSegment {
    data_idx: Padded<Cursor>,
    antidata_idx: Padded<Cursor>,
    /// (close index, closed) once the segment is shut; zero before.
    closed_info: Padded<Cursor>,
    next: Padded<AtomicTaggedRef>,
    index: Padded<AtomicU64>,
    self_ref: AtomicU64,
    /// Gates the single head-advance-and-retire of this segment.
    abandoned: AtomicU32,
    ring: Box<[Padded<SlotWord>]>,
}

impl MixedSegment {
    fn new(ring_size: usize) -> Self {
        assert!(ring_size >= 2, "ring_size must be at least 2");
        let ring = (0..ring_size)
            .map(|i| Padded::new(SlotWord::new(SlotDesc::new(i as u32, true, false), 0)))
            .collect();
        MixedSegment {
            data_idx: Padded::new(Cursor::new()),
            antidata_idx: Padded::new(Cursor::new()),
            closed_info: Padded::new(Cursor::new()),
            next: Padded::new(AtomicTaggedRef::null()),
            index: Padded::new(AtomicU64::new(0)),
            self_ref: AtomicU64::new(TaggedRef::NULL.bits()),
            abandoned: AtomicU32::new(0),
            ring,
        }
    }

    fn reset(&self, index: u64, self_ref: TaggedRef) {
        self.data_idx.init(SlotDesc::from_bits(0));
        self.antidata_idx.init(SlotDesc::from_bits(0));
        self.closed_info.init(SlotDesc::from_bits(0));
        self.next.init(TaggedRef::NULL);
        self.index.store(index, Ordering::Relaxed);
        self.self_ref.store(self_ref.bits(), Ordering::Relaxed);
        self.abandoned.store(0, Ordering::Relaxed);
        for (i, slot) in self.ring.iter().enumerate() {
            slot.init(SlotDesc::new(i as u32, true, false), 0);
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

    #[inline]
    fn cursors(&self, polarity: Polarity) -> (&Cursor, &Cursor) {
        match polarity {
            Polarity::Data => (&self.data_idx, &self.antidata_idx),
            Polarity::Antidata => (&self.antidata_idx, &self.data_idx),
        }
    }

    /// Finishes the two-phase close and returns the final close index.
    fn discovered_closing(&self, polarity: Polarity) -> u32 {
        let ci = self.closed_info.load();
        if ci.closed() {
            return ci.seq();
        }
        let (_, opp) = self.cursors(polarity);
        if !opp.load().closed() {
            opp.close();
        }
        let d = self.data_idx.load();
        let a = self.antidata_idx.load();
        let close_at = d.seq().max(a.seq());
        let sealed = SlotDesc::new(close_at, false, false).with_closed(true);
        self.closed_info
            .compare_exchange(SlotDesc::from_bits(0), sealed);
        let ci = self.closed_info.load();
        debug_assert!(ci.closed());
        ci.seq()
    }

    /// Maps a close discovery to its caller-visible outcome.
    fn close_outcome(&self, pseq: u32, polarity: Polarity) -> Option<MixedOutcome> {
        let close_idx = self.discovered_closing(polarity);
        if close_idx <= pseq {
            let (_, opp) = self.cursors(polarity);
            if close_idx < opp.load().seq() {
                Some(MixedOutcome::Drained)
            } else {
                Some(MixedOutcome::Closed)
            }
        } else {
            None
        }
    }

    /// The combined enqueue-or-rendezvous of one polarity.
    fn denqueue(
        &self,
        payload: u32,
        polarity: Polarity,
        armer: Option<(&WaitCell, u32)>,
        waiters: &[Padded<WaitCell>],
    ) -> MixedOutcome {
        debug_assert!(payload != 0);
        let r = self.ring_size();
        let (own, opp) = self.cursors(polarity);
        let mut starvation = 0u32;

        loop {
            let p = own.fetch_inc();
            if p.closed() {
                if let Some(out) = self.close_outcome(p.seq(), polarity) {
                    return out;
                }
            }
            check_seq(p.seq());

            let slot = &self.ring[(p.seq() % r) as usize];
            loop {
                let (desc, val) = slot.load();

                if val != 0 {
                    if desc.seq() == p.seq() && Polarity::from_aux(desc.aux()) != polarity {
                        // rendezvous with the opposite operation parked here
                        if slot.compare_exchange(desc, val, desc.with_seq(p.seq() + r), 0) {
                            return self.mix(payload, val, polarity, waiters);
                        }
                    } else {
                        // stale or same-polarity occupant: bar the slot
                        let unsafe_desc = SlotDesc::new(desc.seq(), false, desc.aux());
                        if slot.compare_exchange(desc, val, unsafe_desc, val) {
                            break;
                        }
                    }
                } else if desc.safe() {
                    // empty and usable: enqueue ourselves
                    if let Some((cell, ticket)) = armer {
                        cell.arm(ticket);
                    }
                    let mine = SlotDesc::new(p.seq(), true, polarity.aux_bit());
                    if slot.compare_exchange(desc, 0, mine, payload) {
                        return self.finished_enqueue(polarity, armer);
                    }
                } else {
                    break;
                }
            }

            starvation += 1;
            let op_idx = opp.load();
            if ((p.seq() as i64 - op_idx.seq() as i64) >= r as i64 || starvation > STARVATION)
                && !p.closed()
            {
                own.close();
                if let Some(out) = self.close_outcome(p.seq(), polarity) {
                    return out;
                }
            }
        }
    }

    /// Wavefront variant of the data side.
    fn denqueue_wavefront(&self, payload: u32, waiters: &[Padded<WaitCell>]) -> MixedOutcome {
        let polarity = Polarity::Data;
        let r = self.ring_size();
        let own = &self.data_idx;
        let opp = &self.antidata_idx;
        // stay a margin short of a full lap: wavefront walkers stray around
        // the front, so closing right at the lap boundary is too late
        let lap_guard = if r >= 128 { (r - 96) as i64 } else { (r - 1) as i64 };

        let p = own.fetch_inc();
        let p_closed = p.closed();
        let mut pseq = p.seq();
        loop {
            if p_closed || own.load().closed() {
                if let Some(out) = self.close_outcome(pseq, polarity) {
                    return out;
                }
            }
            if !p_closed
                && (own.load().seq() as i64 - opp.load().seq() as i64) >= lap_guard
            {
                own.close();
                if let Some(out) = self.close_outcome(pseq, polarity) {
                    return out;
                }
            }
            check_seq(pseq);

            let slot = &self.ring[(pseq % r) as usize];
            let (desc, val) = slot.load();
            let idx = desc.seq();

            if pseq < idx {
                pseq += 1;
                continue;
            }
            if idx < pseq {
                debug_assert!(pseq >= r);
                pseq = (pseq - r) + 1;
                continue;
            }
            if pseq != 0 {
                // if the previous slot is still unconsumed we are ahead of
                // the front
                let (prev, prev_val) = self.ring[((pseq - 1) % r) as usize].load();
                if prev.seq() == idx.wrapping_sub(1) && prev_val == 0 {
                    pseq -= 1;
                    continue;
                }
            }

            if val != 0 {
                if Polarity::from_aux(desc.aux()) == Polarity::Antidata {
                    let empty = desc.with_seq(pseq + r);
                    let token = WaitToken::unpack(val);
                    if waiters[token.tid].satisfy(token.ticket, payload) {
                        slot.compare_exchange(desc, val, empty, 0);
                        return MixedOutcome::Ok;
                    }
                    // beaten to the cell: scrub the slot and walk on
                    slot.compare_exchange(desc, val, empty, 0);
                    pseq += 1;
                } else {
                    pseq += 1;
                }
            } else if desc.safe() || opp.load().seq() <= pseq {
                let mine = SlotDesc::new(pseq, true, polarity.aux_bit());
                if slot.compare_exchange(desc, 0, mine, payload) {
                    return MixedOutcome::Ok;
                }
            }
        }
    }

    fn mix(
        &self,
        payload: u32,
        val: u32,
        polarity: Polarity,
        waiters: &[Padded<WaitCell>],
    ) -> MixedOutcome {
        match polarity {
            Polarity::Data => {
                let token = WaitToken::unpack(val);
                if !waiters[token.tid].satisfy(token.ticket, payload) {
                    panic!("manege: rendezvous cell satisfied twice");
                }
                MixedOutcome::Ok
            }
            Polarity::Antidata => MixedOutcome::Value(val),
        }
    }

    fn finished_enqueue(&self, polarity: Polarity, armer: Option<(&WaitCell, u32)>) -> MixedOutcome {
        match polarity {
            Polarity::Data => MixedOutcome::Ok,
            Polarity::Antidata => match armer {
                Some((cell, _)) => MixedOutcome::Value(cell.wait()),
                None => panic!("manege: antidata enqueue without a wait cell"),
            },
        }
    }
}

/// The queue proper: both polarities share one chain of mixed segments,
/// each side advancing its own head reference over it.
pub struct Mpdq {
    data_head: Padded<AtomicTaggedRef>,
    antidata_head: Padded<AtomicTaggedRef>,
    head_index: Padded<AtomicU64>,
    waiters: Box<[Padded<WaitCell>]>,
    tickets: Box<[Padded<AtomicU32>]>,
    pool: Pool<MixedSegment>,
    reclaim: SegmentReclaimer,
    lock_free: bool,
    max_threads: usize,
}

impl Mpdq {
    pub fn new(max_threads: usize, lock_free: bool) -> Self {
        Self::with_ring_size(max_threads, DEFAULT_RING_SIZE, lock_free)
    }

    pub fn with_ring_size(max_threads: usize, ring_size: usize, lock_free: bool) -> Self {
        assert!(max_threads > 0 && max_threads < 0xFFFF);
        let pool = Pool::new(SEGMENT_POOL_CAPACITY, max_threads, move || {
            MixedSegment::new(ring_size)
        });
        let reclaim = SegmentReclaimer::new(max_threads);

        let first = pool.alloc(0);
        pool.get_raw(first.index()).reset(0, first);

        let waiters = (0..max_threads).map(|_| Padded::new(WaitCell::new())).collect();
        let tickets = (0..max_threads)
            .map(|_| Padded::new(AtomicU32::new(0)))
            .collect();

        Mpdq {
            data_head: Padded::new(AtomicTaggedRef::new(TaggedRef::new(first.index(), 0))),
            antidata_head: Padded::new(AtomicTaggedRef::new(TaggedRef::new(first.index(), 0))),
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

    pub fn insert(&self, value: i32, tid: usize) {
        assert!(value != 0, "value 0 is reserved as the empty sentinel");
        debug_assert!(tid < self.max_threads);
        self.denqueue(value as u32, Polarity::Data, None, tid);
    }

    /// Blocks until matched with an `insert`.
    pub fn remove(&self, tid: usize) -> i32 {
        debug_assert!(tid < self.max_threads);
        let ticket = self.next_ticket(tid);
        let token = WaitToken { tid, ticket };
        let cell = &*self.waiters[tid];
        self.denqueue(token.pack(), Polarity::Antidata, Some((cell, ticket)), tid) as i32
    }

    /// Runs one side's operation against its head segment, chasing and
    /// extending the chain on closed segments.
    fn denqueue(
        &self,
        payload: u32,
        polarity: Polarity,
        armer: Option<(&WaitCell, u32)>,
        tid: usize,
    ) -> u32 {
        let head = match polarity {
            Polarity::Data => &self.data_head,
            Polarity::Antidata => &self.antidata_head,
        };

        loop {
            self.reclaim
                .publish(tid, self.head_index.load(Ordering::SeqCst));
            let dref = head.load();
            let seg = self.pool.get_raw(dref.index());

            let outcome = if polarity == Polarity::Data && self.lock_free {
                seg.denqueue_wavefront(payload, &self.waiters)
            } else {
                seg.denqueue(payload, polarity, armer, &self.waiters)
            };

            let drained = matches!(outcome, MixedOutcome::Drained);
            match outcome {
                MixedOutcome::Ok => {
                    self.reclaim.clear(tid);
                    return 0;
                }
                MixedOutcome::Value(v) => {
                    self.reclaim.clear(tid);
                    return v;
                }
                MixedOutcome::Closed | MixedOutcome::Drained => {
                    let next = seg.next().load();
                    if !next.is_null() {
                        head.compare_exchange(dref, TaggedRef::new(next.index(), dref.tag() + 1));
                    } else {
                        let nh = self.pool.alloc(tid);
                        let fresh = self.pool.get_raw(nh.index());
                        fresh.reset(seg.index() + 1, nh);
                        if seg.next().compare_exchange(TaggedRef::NULL, nh) {
                            tracing::trace!(segment = fresh.index(), "appended mixed ring segment");
                            head.compare_exchange(
                                dref,
                                TaggedRef::new(nh.index(), dref.tag() + 1),
                            );
                        } else {
                            self.pool.free(nh, tid);
                        }
                    }
                    if drained {
                        // exactly one thread gets to unlink and retire
                        if seg
                            .abandoned
                            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
                            .is_ok()
                        {
                            // move BOTH heads off the segment before bumping
                            // head_index: a thread that publishes the bumped
                            // index as its hazard must no longer be able to
                            // reach this segment through either head
                            let nxt = seg.next().load();
                            if !nxt.is_null() {
                                for side in [&self.data_head, &self.antidata_head] {
                                    let cur = side.load();
                                    if cur.index() == dref.index() {
                                        side.compare_exchange(
                                            cur,
                                            TaggedRef::new(nxt.index(), cur.tag() + 1),
                                        );
                                    }
                                }
                            }
                            self.head_index.fetch_add(1, Ordering::SeqCst);
                            self.reclaim.clear(tid);
                            self.reclaim
                                .retire(seg.handle(), seg.index(), tid, &self.pool);
                        }
                    }
                }
            }
        }
    }
}

impl DualContainer for Mpdq {
    fn insert(&self, value: i32, tid: usize) {
        Mpdq::insert(self, value, tid);
    }

    fn remove(&self, tid: usize) -> i32 {
        Mpdq::remove(self, tid)
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn data_backlog_drains_in_fifo_order() {
        let q = Mpdq::with_ring_size(1, 8, false);
        for v in 1..=5 {
            q.insert(v, 0);
        }
        for v in 1..=5 {
            assert_eq!(q.remove(0), v);
        }
    }

    #[test]
    fn backlog_spills_across_segments() {
        let q = Mpdq::with_ring_size(1, 4, false);
        for v in 1..=9 {
            q.insert(v, 0);
        }
        for v in 1..=9 {
            assert_eq!(q.remove(0), v);
        }
    }

    #[test]
    fn alternating_polarity_reuses_slots() {
        let q = Mpdq::with_ring_size(1, 4, false);
        for round in 0..50 {
            let v = round * 3 + 1;
            q.insert(v, 0);
            assert_eq!(q.remove(0), v);
        }
    }

    #[test]
    fn wavefront_mode_single_thread() {
        let q = Mpdq::with_ring_size(1, 8, true);
        for v in 1..=5 {
            q.insert(v, 0);
        }
        for v in 1..=5 {
            assert_eq!(q.remove(0), v);
        }
    }

    #[test]
    #[should_panic(expected = "reserved")]
    fn zero_insert_is_a_contract_violation() {
        let q = Mpdq::with_ring_size(1, 8, false);
        q.insert(0, 0);
    }
}
