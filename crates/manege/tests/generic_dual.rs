//! The generic dual composition over both linked containers, in blocking
//! and non-blocking matching modes.

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use manege::{DualContainer, GenericDual, MsQueue, TaggedRef, TreiberStack};

fn queue_pair(non_blocking: bool, threads: usize) -> Arc<dyn DualContainer> {
    Arc::new(GenericDual::new(
        MsQueue::<TaggedRef>::new(threads),
        MsQueue::<TaggedRef>::new(threads),
        non_blocking,
        threads,
    ))
}

fn stack_pair(non_blocking: bool, threads: usize) -> Arc<dyn DualContainer> {
    Arc::new(GenericDual::new(
        TreiberStack::<TaggedRef>::new(threads),
        TreiberStack::<TaggedRef>::new(threads),
        non_blocking,
        threads,
    ))
}

fn single_rendezvous(dq: Arc<dyn DualContainer>) {
    let consumer = {
        let dq = dq.clone();
        thread::spawn(move || dq.remove(0))
    };
    thread::sleep(Duration::from_millis(20));
    dq.insert(7, 1);
    assert_eq!(consumer.join().unwrap(), 7);
}

#[test]
fn blocking_queue_composition_rendezvous() {
    single_rendezvous(queue_pair(false, 2));
}

#[test]
fn nonblocking_queue_composition_rendezvous() {
    single_rendezvous(queue_pair(true, 2));
}

#[test]
fn blocking_stack_composition_rendezvous() {
    single_rendezvous(stack_pair(false, 2));
}

#[test]
fn nonblocking_stack_composition_rendezvous() {
    single_rendezvous(stack_pair(true, 2));
}

fn pairing_stress(dq: Arc<dyn DualContainer>, producers: usize, consumers: usize, per: i32) {
    let total = producers as i32 * per;
    assert_eq!(total % consumers as i32, 0);

    let mut handles = Vec::new();
    for p in 0..producers {
        let dq = dq.clone();
        handles.push(thread::spawn(move || {
            let base = p as i32 * per;
            for i in 1..=per {
                dq.insert(base + i, p);
            }
        }));
    }
    let mut takers = Vec::new();
    for c in 0..consumers {
        let dq = dq.clone();
        takers.push(thread::spawn(move || {
            let tid = producers + c;
            let share = (total / consumers as i32) as usize;
            let mut got = Vec::with_capacity(share);
            for _ in 0..share {
                got.push(dq.remove(tid));
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
    assert_eq!(seen.len(), total as usize, "values lost in composition");
}

#[test]
fn blocking_queue_composition_stress() {
    pairing_stress(queue_pair(false, 4), 2, 2, 1_000);
}

#[test]
fn nonblocking_queue_composition_stress() {
    pairing_stress(queue_pair(true, 4), 2, 2, 1_000);
}

#[test]
fn blocking_stack_composition_stress() {
    pairing_stress(stack_pair(false, 4), 2, 2, 1_000);
}

#[test]
fn consumers_first_then_producers() {
    let dq = queue_pair(false, 4);
    let mut takers = Vec::new();
    for c in 0..3 {
        let dq = dq.clone();
        takers.push(thread::spawn(move || dq.remove(c)));
    }
    thread::sleep(Duration::from_millis(20));
    for v in [11, 22, 33] {
        dq.insert(v, 3);
    }
    let mut got: Vec<i32> = takers.into_iter().map(|t| t.join().unwrap()).collect();
    got.sort_unstable();
    assert_eq!(got, vec![11, 22, 33]);
}
