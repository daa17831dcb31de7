//! Generic dual composition: any data container plus any antidata
//! container become one dual container.
//!
//! Each operation allocates a [`Placeholder`] (one atomic word holding
//! value, state and satisfying-request) and runs a small transaction:
//! check the opposite container for a parked counterpart, insert the
//! placeholder into one's own container, check the opposite side again (a
//! rendezvous that raced the insert must not be missed), then try to
//! validate INVALID→VALID. Exactly one CAS takes a placeholder out of
//! INVALID: either its owner validates it or an opposite thread aborts it,
//! so a matched pair commits on one word and an aborted owner simply
//! retries with a fresh placeholder.
//!
//! Placeholders are freed through an abandonment handshake (whichever of
//! {owner, matcher} retires second actually releases the block) because
//! both sides hold the handle at the end of a match.
//!
//! The blocking opposite-check drains the opposite container until it
//! finds a validated entry or runs empty, which makes an unmatched
//! `remove` loop unbounded work for its peers. The non-blocking mode (data
//! side) replaces it with a single global active-request word: a thread
//! peeks the opposite container, posts its intent to match that exact
//! placeholder, helps whatever request is already posted first, and only
//! removes the opposite entry (`remove_cond`) once the match is provably
//! committed. Peeked placeholders and posted requests are protected by
//! hazard reservations.

use manege_primitives::sync::{AtomicBool, AtomicU32, AtomicU64, Ordering, spin_loop, thread};
use manege_primitives::{AtomicTaggedRef, Padded, TaggedRef};

use crate::hazard::HazardTracker;
use crate::pool::Pool;
use crate::{DualContainer, Peekable, Polarity};

const PH_POOL_CAPACITY: u32 = 1 << 16;
const REQ_POOL_CAPACITY: u32 = 1 << 12;

/// Retired nodes a thread accumulates before a hazard scan.
const RETIREMENT_THRESHOLD: usize = 0;

// Placeholder word layout: value in the low 32 bits, state in bits 32..=33,
// satisfying request index + 1 in bits 34.. (0 = none).
const STATE_INVALID: u64 = 0;
const STATE_ABORTED: u64 = 1 << 32;
const STATE_VALID: u64 = 2 << 32;
const STATE_SATISFIED: u64 = 3 << 32;
const STATE_MASK: u64 = 3 << 32;
const REQ_SHIFT: u32 = 34;

#[inline]
fn pack_ph(value: u32, state: u64, req_plus1: u32) -> u64 {
    value as u64 | state | ((req_plus1 as u64) << REQ_SHIFT)
}

/// Decoded view of a placeholder word.
#[derive(Clone, Copy)]
struct PhSnapshot(u64);

impl PhSnapshot {
    #[inline]
    fn value(self) -> u32 {
        self.0 as u32
    }

    #[inline]
    fn state(self) -> u64 {
        self.0 & STATE_MASK
    }

    #[inline]
    fn aborted(self) -> bool {
        self.state() == STATE_ABORTED
    }

    #[inline]
    fn satisfied(self) -> bool {
        self.state() == STATE_SATISFIED
    }

    #[inline]
    fn req_plus1(self) -> u32 {
        (self.0 >> REQ_SHIFT) as u32
    }
}

/// One pending operation, owned by a pool.
pub(crate) struct Placeholder {
    word: AtomicU64,
    abandoned: AtomicBool,
}

impl Default for Placeholder {
    fn default() -> Self {
        Placeholder {
            word: AtomicU64::new(0),
            abandoned: AtomicBool::new(false),
        }
    }
}

impl Placeholder {
    fn reset(&self, value: u32) {
        self.abandoned.store(false, Ordering::Relaxed);
        self.word
            .store(pack_ph(value, STATE_INVALID, 0), Ordering::SeqCst);
    }

    #[inline]
    fn load(&self) -> PhSnapshot {
        PhSnapshot(self.word.load(Ordering::SeqCst))
    }

    #[inline]
    fn cas(&self, old: u64, new: u64) -> bool {
        self.word
            .compare_exchange(old, new, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// VALID → SATISFIED with the producer's value, tagged by the request
    /// that committed the match (0 for the blocking path).
    #[inline]
    fn satisfy(&self, value: u32, req_plus1: u32) -> bool {
        self.cas(
            pack_ph(0, STATE_VALID, 0),
            pack_ph(value, STATE_SATISFIED, req_plus1),
        )
    }

    /// First abandoner returns true and leaves cleanup to the other side.
    fn abandon(&self) -> bool {
        if self.abandoned.load(Ordering::Acquire) {
            return false;
        }
        self.abandoned
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

/// A posted intent to match one specific opposite placeholder.
pub(crate) struct Request {
    value: AtomicU32,
    ph: AtomicU64,
    key: AtomicU64,
}

impl Default for Request {
    fn default() -> Self {
        Request {
            value: AtomicU32::new(0),
            ph: AtomicU64::new(TaggedRef::NULL.bits()),
            key: AtomicU64::new(0),
        }
    }
}

impl Request {
    fn reset(&self, value: u32, ph: TaggedRef, key: u64) {
        self.value.store(value, Ordering::SeqCst);
        self.ph.store(ph.bits(), Ordering::SeqCst);
        self.key.store(key, Ordering::SeqCst);
    }
}

#[derive(PartialEq)]
enum HelpOutcome {
    Aborted,
    Satisfied,
}

/// Composes a data container and a peekable antidata container into a dual
/// container of placeholder handles.
pub struct GenericDual<D, A> {
    data: D,
    anti: A,
    ph_pool: Pool<Placeholder>,
    req_pool: Pool<Request>,
    haz_ph: HazardTracker,
    haz_req: HazardTracker,
    active_request: Padded<AtomicTaggedRef>,
    non_blocking: bool,
    max_threads: usize,
}

impl<D, A> GenericDual<D, A>
where
    D: crate::Container<TaggedRef>,
    A: Peekable<TaggedRef>,
{
    /// `non_blocking: true` switches the data side's opposite-checking to
    /// the active-request protocol (the antidata side keeps the removal
    /// loop either way).
    pub fn new(data: D, anti: A, non_blocking: bool, max_threads: usize) -> Self {
        assert!(max_threads > 0);
        GenericDual {
            data,
            anti,
            ph_pool: Pool::new(PH_POOL_CAPACITY, max_threads, Placeholder::default),
            req_pool: Pool::new(REQ_POOL_CAPACITY, max_threads, Request::default),
            haz_ph: HazardTracker::new(max_threads, 1, RETIREMENT_THRESHOLD),
            haz_req: HazardTracker::new(max_threads, 1, RETIREMENT_THRESHOLD),
            active_request: Padded::new(AtomicTaggedRef::null()),
            non_blocking,
            max_threads,
        }
    }

    pub fn insert(&self, value: i32, tid: usize) {
        assert!(value != 0, "value 0 is reserved as the empty sentinel");
        debug_assert!(tid < self.max_threads);
        self.remsert(value as u32, Polarity::Data, tid);
    }

    /// Blocks until matched with an `insert`.
    pub fn remove(&self, tid: usize) -> i32 {
        debug_assert!(tid < self.max_threads);
        self.remsert(0, Polarity::Antidata, tid) as i32
    }

    fn ph(&self, handle: TaggedRef) -> &Placeholder {
        match self.ph_pool.get(handle) {
            Some(p) => p,
            None => panic!("manege: stale placeholder handle"),
        }
    }

    fn req(&self, handle: TaggedRef) -> &Request {
        self.req_pool.get_raw(handle.index())
    }

    fn alloc_placeholder(&self, value: u32, tid: usize) -> TaggedRef {
        let h = self.ph_pool.alloc(tid);
        self.ph_pool.get_raw(h.index()).reset(value);
        h
    }

    fn remsert(&self, value: u32, polarity: Polarity, tid: usize) -> u32 {
        let nb = self.non_blocking && polarity == Polarity::Data;
        let mut ph = self.alloc_placeholder(value, tid);

        // precheck: a counterpart may already be parked
        if let Some(v) = self.opposite_check(ph, polarity, nb, tid) {
            self.retire_placeholder(ph, tid); // never inserted: both releases are ours
            self.retire_placeholder(ph, tid);
            return v;
        }

        loop {
            match polarity {
                Polarity::Data => self.data.insert(ph, tid),
                Polarity::Antidata => self.anti.insert(ph, tid),
            }

            // second look: a counterpart may have arrived while we inserted
            if let Some(v) = self.opposite_check(ph, polarity, nb, tid) {
                self.retire_placeholder(ph, tid);
                return v;
            }
            if let Some(v) = self.validate_and_complete(ph, value, polarity) {
                self.retire_placeholder(ph, tid);
                return v;
            }

            // someone aborted us: retry the transaction from scratch
            self.retire_placeholder(ph, tid);
            thread::yield_now();
            ph = self.alloc_placeholder(value, tid);
        }
    }

    /// INVALID -> VALID; on success the operation is committed, and the
    /// antidata side waits for satisfaction.
    fn validate_and_complete(&self, ph: TaggedRef, value: u32, polarity: Polarity) -> Option<u32> {
        let p = self.ph(ph);
        if p.cas(
            pack_ph(value, STATE_INVALID, 0),
            pack_ph(value, STATE_VALID, 0),
        ) {
            Some(self.finished_insert(ph, polarity))
        } else {
            None
        }
    }

    fn finished_insert(&self, ph: TaggedRef, polarity: Polarity) -> u32 {
        match polarity {
            Polarity::Data => 0,
            Polarity::Antidata => {
                // spin on our own placeholder until a producer fills it
                let p = self.ph(ph);
                let mut spins = 0u32;
                loop {
                    let snap = p.load();
                    if snap.satisfied() {
                        return snap.value();
                    }
                    spins = spins.wrapping_add(1);
                    if spins % 64 == 0 {
                        thread::yield_now();
                    }
                    spin_loop();
                }
            }
        }
    }

    fn mix(&self, ph: TaggedRef, opp: TaggedRef, polarity: Polarity) -> u32 {
        match polarity {
            Polarity::Data => {
                let my_value = self.ph(ph).load().value();
                if !self.ph(opp).satisfy(my_value, 0) {
                    panic!("manege: validated antidata placeholder satisfied twice");
                }
                my_value
            }
            Polarity::Antidata => self.ph(opp).load().value(),
        }
    }

    fn opposite_check(
        &self,
        ph: TaggedRef,
        polarity: Polarity,
        nb: bool,
        tid: usize,
    ) -> Option<u32> {
        if nb {
            self.opposite_check_nb(ph, tid)
        } else {
            self.opposite_check_blocking(ph, polarity, tid)
        }
    }

    /// Drains the opposite container until it yields a validated
    /// counterpart (match it) or runs empty.
    fn opposite_check_blocking(
        &self,
        ph: TaggedRef,
        polarity: Polarity,
        tid: usize,
    ) -> Option<u32> {
        loop {
            let removed = match polarity {
                Polarity::Data => self.anti.remove(tid),
                Polarity::Antidata => self.data.remove(tid),
            };
            let opp = removed?;

            let snap = self.ph(opp).load();
            // race the owner for its INVALID placeholder
            if !self.ph(opp).cas(
                pack_ph(snap.value(), STATE_INVALID, 0),
                pack_ph(snap.value(), STATE_ABORTED, 0),
            ) {
                // it validated first: this is a real counterpart
                let v = self.mix(ph, opp, polarity);
                self.retire_placeholder(opp, tid);
                return Some(v);
            }
            // aborted an unvalidated one; its owner will retry
            self.retire_placeholder(opp, tid);
        }
    }

    /// Non-blocking opposite check (data side): peek, post a request for
    /// the peeked placeholder, help whatever request is in flight, and
    /// conclude from whose request satisfied the placeholder.
    fn opposite_check_nb(&self, ph: TaggedRef, tid: usize) -> Option<u32> {
        let my_value = self.ph(ph).load().value();
        let mut my_req = self.req_pool.alloc(tid);
        let mut result = None;

        loop {
            self.clear_hazards(tid);

            let active = self.active_request.load();
            if !active.is_null() {
                // a request is already posted: help it through, then retry
                self.haz_req.reserve(active, 0, tid);
                if self.active_request.load().bits() != active.bits() {
                    continue;
                }
                let req_ph = TaggedRef::from_bits(self.req(active).ph.load(Ordering::SeqCst));
                self.haz_ph.reserve(req_ph, 0, tid);
                if self.active_request.load().bits() != active.bits() {
                    continue;
                }
                self.help_request(active, tid);
                continue;
            }

            let Some((key, opp)) = self.anti.peek(tid) else {
                break;
            };
            self.req(my_req).reset(my_value, opp, key);
            self.haz_ph.reserve(opp, 0, tid);
            self.haz_req.reserve(my_req, 0, tid);

            if self
                .active_request
                .compare_exchange(active, TaggedRef::new(my_req.index(), active.tag() + 1))
            {
                let posted = TaggedRef::new(my_req.index(), active.tag() + 1);
                if self.help_request(posted, tid) != HelpOutcome::Aborted {
                    // satisfied, but by whose request? Ours iff the
                    // placeholder carries our request's identity.
                    if self.ph(opp).load().req_plus1() == my_req.index() + 1 {
                        // the remove_cond winner retires our request
                        result = Some(my_value);
                        return self.finish_nb(result, None, tid);
                    }
                }
                // our request lost; replace it and retry
                self.haz_req.retire(my_req, tid, &self.req_pool);
                my_req = self.req_pool.alloc(tid);
            }
        }

        self.finish_nb(result, Some(my_req), tid)
    }

    fn finish_nb(&self, result: Option<u32>, unused_req: Option<TaggedRef>, tid: usize) -> Option<u32> {
        if let Some(r) = unused_req {
            self.haz_req.retire(r, tid, &self.req_pool);
        }
        self.clear_hazards(tid);
        result
    }

    /// Resolves a posted request: abort the target if it is still
    /// unvalidated, satisfy it otherwise, take the request down, and if
    /// we win the conditional removal, release the matched placeholder
    /// and its satisfying request.
    fn help_request(&self, req_ref: TaggedRef, tid: usize) -> HelpOutcome {
        let req = self.req(req_ref);
        let req_value = req.value.load(Ordering::SeqCst);
        let opp = TaggedRef::from_bits(req.ph.load(Ordering::SeqCst));
        let key = req.key.load(Ordering::SeqCst);
        let opp_ph = self.ph(opp);

        let snap = opp_ph.load();
        let outcome = if opp_ph.cas(
            pack_ph(snap.value(), STATE_INVALID, 0),
            pack_ph(snap.value(), STATE_ABORTED, 0),
        ) {
            HelpOutcome::Aborted
        } else if opp_ph.load().aborted() {
            HelpOutcome::Aborted
        } else {
            // valid or already satisfied; losing the satisfy race just
            // means another helper drove the same request home
            let _ = opp_ph.satisfy(req_value, req_ref.index() + 1);
            HelpOutcome::Satisfied
        };

        self.active_request
            .compare_exchange(req_ref, TaggedRef::null_with_tag(req_ref.tag() + 1));

        if self.anti.remove_cond(key, tid) {
            // committed: we are the one thread that unlinked the target
            let rp1 = opp_ph.load().req_plus1();
            if rp1 != 0 {
                let winner = self.req_pool.current_handle(rp1 - 1);
                self.haz_req.retire(winner, tid, &self.req_pool);
            }
            self.retire_placeholder(opp, tid);
        }

        outcome
    }

    /// Second retire of a placeholder actually frees it.
    fn retire_placeholder(&self, ph: TaggedRef, tid: usize) {
        if self.ph(ph).abandon() {
            return;
        }
        if self.non_blocking {
            self.haz_ph.retire(ph, tid, &self.ph_pool);
        } else {
            self.ph_pool.free(ph, tid);
        }
    }

    fn clear_hazards(&self, tid: usize) {
        if self.non_blocking {
            self.haz_ph.clear_all(tid);
            self.haz_req.clear_all(tid);
        }
    }
}

impl<D, A> DualContainer for GenericDual<D, A>
where
    D: crate::Container<TaggedRef>,
    A: Peekable<TaggedRef>,
{
    fn insert(&self, value: i32, tid: usize) {
        GenericDual::insert(self, value, tid);
    }

    fn remove(&self, tid: usize) -> i32 {
        GenericDual::remove(self, tid)
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::msqueue::MsQueue;

    fn blocking_pair() -> GenericDual<MsQueue<TaggedRef>, MsQueue<TaggedRef>> {
        GenericDual::new(MsQueue::new(2), MsQueue::new(2), false, 2)
    }

    fn nb_pair() -> GenericDual<MsQueue<TaggedRef>, MsQueue<TaggedRef>> {
        GenericDual::new(MsQueue::new(2), MsQueue::new(2), true, 2)
    }

    #[test]
    fn insert_then_remove_round_trips() {
        let dq = blocking_pair();
        dq.insert(41, 0);
        dq.insert(42, 0);
        assert_eq!(dq.remove(0), 41);
        assert_eq!(dq.remove(0), 42);
    }

    #[test]
    fn nonblocking_mode_round_trips() {
        let dq = nb_pair();
        dq.insert(7, 0);
        assert_eq!(dq.remove(0), 7);
        dq.insert(8, 0);
        dq.insert(9, 0);
        assert_eq!(dq.remove(0), 8);
        assert_eq!(dq.remove(0), 9);
    }

    #[test]
    fn many_matches_recycle_placeholders() {
        let dq = blocking_pair();
        for round in 1..=500 {
            dq.insert(round, 0);
            assert_eq!(dq.remove(0), round);
        }
    }

    #[test]
    fn negative_payloads_survive() {
        let dq = blocking_pair();
        dq.insert(-12345, 0);
        assert_eq!(dq.remove(0), -12345);
    }

    #[test]
    #[should_panic(expected = "reserved")]
    fn zero_insert_is_a_contract_violation() {
        let dq = blocking_pair();
        dq.insert(0, 0);
    }
}
