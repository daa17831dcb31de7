//! Rendezvous correctness of the dual ring queues.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use manege::{DualContainer, Mpdq, Spdq};

/// A remove overlapping exactly one insert(7) must return 7 and must not
/// keep spinning once the insert has completed.
fn single_rendezvous(q: Arc<dyn DualContainer>) {
    let started = Arc::new(AtomicBool::new(false));

    let consumer = {
        let q = q.clone();
        let started = started.clone();
        thread::spawn(move || {
            started.store(true, Ordering::SeqCst);
            q.remove(0)
        })
    };

    while !started.load(Ordering::SeqCst) {
        thread::yield_now();
    }
    thread::sleep(Duration::from_millis(20));
    q.insert(7, 1);

    assert_eq!(consumer.join().unwrap(), 7);
}

#[test]
fn spdq_blocked_remove_is_satisfied_by_insert() {
    single_rendezvous(Arc::new(Spdq::with_ring_size(2, 8, false)));
}

#[test]
fn spdq_lock_free_blocked_remove_is_satisfied_by_insert() {
    single_rendezvous(Arc::new(Spdq::with_ring_size(2, 8, true)));
}

#[test]
fn mpdq_blocked_remove_is_satisfied_by_insert() {
    single_rendezvous(Arc::new(Mpdq::with_ring_size(2, 8, false)));
}

#[test]
fn mpdq_lock_free_blocked_remove_is_satisfied_by_insert() {
    single_rendezvous(Arc::new(Mpdq::with_ring_size(2, 8, true)));
}

/// Every inserted value is removed exactly once, across polarity flips and
/// segment churn.
fn pairing_stress(q: Arc<dyn DualContainer>, producers: usize, consumers: usize, per: i32) {
    let total = producers as i32 * per;
    assert_eq!(total % consumers as i32, 0);

    let mut handles = Vec::new();
    for p in 0..producers {
        let q = q.clone();
        handles.push(thread::spawn(move || {
            let base = p as i32 * per;
            for i in 1..=per {
                q.insert(base + i, p);
            }
        }));
    }

    let mut takers = Vec::new();
    for c in 0..consumers {
        let q = q.clone();
        takers.push(thread::spawn(move || {
            let tid = producers + c;
            let share = (total / consumers as i32) as usize;
            let mut got = Vec::with_capacity(share);
            for _ in 0..share {
                got.push(q.remove(tid));
            }
            got
        }));
    }

    for h in handles {
        h.join().unwrap();
    }
    let mut seen = HashSet::new();
    for t in takers {
        for v in t.join().unwrap() {
            assert!(v != 0, "empty sentinel leaked out of a dual remove");
            assert!(seen.insert(v), "value {v} delivered twice");
        }
    }
    assert_eq!(seen.len(), total as usize, "values lost in rendezvous");
}

#[test]
fn spdq_pairing_stress() {
    pairing_stress(Arc::new(Spdq::with_ring_size(4, 8, false)), 2, 2, 2_000);
}

#[test]
fn spdq_lock_free_pairing_stress() {
    pairing_stress(Arc::new(Spdq::with_ring_size(4, 8, true)), 2, 2, 2_000);
}

#[test]
fn mpdq_pairing_stress() {
    pairing_stress(Arc::new(Mpdq::with_ring_size(4, 8, false)), 2, 2, 2_000);
}

#[test]
fn mpdq_lock_free_pairing_stress() {
    pairing_stress(Arc::new(Mpdq::with_ring_size(4, 8, true)), 2, 2, 2_000);
}

/// Many waiters parked at once, one producer serving them all.
fn waiter_herd(q: Arc<dyn DualContainer>, waiters: usize, per: i32) {
    let mut takers = Vec::new();
    for w in 0..waiters {
        let q = q.clone();
        takers.push(thread::spawn(move || {
            let mut got = Vec::new();
            for _ in 0..per {
                got.push(q.remove(w));
            }
            got
        }));
    }

    let total = waiters as i32 * per;
    for i in 1..=total {
        q.insert(i, waiters);
    }

    let mut seen = HashSet::new();
    for t in takers {
        for v in t.join().unwrap() {
            assert!(seen.insert(v));
        }
    }
    assert_eq!(seen.len(), total as usize);
}

#[test]
fn spdq_serves_a_herd_of_waiters() {
    waiter_herd(Arc::new(Spdq::with_ring_size(4, 8, false)), 3, 500);
}

#[test]
fn mpdq_serves_a_herd_of_waiters() {
    waiter_herd(Arc::new(Mpdq::with_ring_size(4, 8, false)), 3, 500);
}
