#![cfg(all(test, loom))]

use crate::cursor::Cursor;
use crate::slot::{SlotDesc, SlotWord};
use crate::sync::thread;
use crate::tagged::{AtomicTaggedRef, TaggedRef};
use crate::wait::WaitCell;
use loom::sync::Arc;

#[test]
fn slot_claim_is_exclusive() {
    loom::model(|| {
        let slot = Arc::new(SlotWord::default());

        let claim = |slot: Arc<SlotWord>, value: u32| {
            thread::spawn(move || {
                let (d, v) = slot.load();
                if v == 0 {
                    slot.compare_exchange(d, 0, SlotDesc::new(0, true, false), value)
                } else {
                    false
                }
            })
        };

        let t1 = claim(slot.clone(), 1);
        let t2 = claim(slot.clone(), 2);
        let r1 = t1.join().unwrap();
        let r2 = t2.join().unwrap();

        // at most one claim can land on the empty slot
        assert!(!(r1 && r2));
        let (_, v) = slot.load();
        if r1 {
            assert_eq!(v, 1);
        }
        if r2 {
            assert_eq!(v, 2);
        }
    });
}

#[test]
fn cursor_claims_are_unique() {
    loom::model(|| {
        let cursor = Arc::new(Cursor::new());

        let t1 = thread::spawn({
            let cursor = cursor.clone();
            move || cursor.fetch_inc().seq()
        });
        let t2 = thread::spawn({
            let cursor = cursor.clone();
            move || cursor.fetch_inc().seq()
        });

        let a = t1.join().unwrap();
        let b = t2.join().unwrap();
        assert_ne!(a, b);
        assert_eq!(cursor.load().seq(), 2);
    });
}

#[test]
fn close_survives_racing_increment() {
    loom::model(|| {
        let cursor = Arc::new(Cursor::new());

        let closer = thread::spawn({
            let cursor = cursor.clone();
            move || cursor.close()
        });
        let bumper = thread::spawn({
            let cursor = cursor.clone();
            move || {
                cursor.fetch_inc();
            }
        });

        closer.join().unwrap();
        bumper.join().unwrap();
        assert!(cursor.load().closed());
        assert_eq!(cursor.load().seq(), 1);
    });
}

#[test]
fn wait_cell_single_delivery() {
    loom::model(|| {
        let cell = Arc::new(WaitCell::new());
        cell.arm(7);

        let s1 = thread::spawn({
            let cell = cell.clone();
            move || cell.satisfy(7, 10)
        });
        let s2 = thread::spawn({
            let cell = cell.clone();
            move || cell.satisfy(7, 20)
        });

        let r1 = s1.join().unwrap();
        let r2 = s2.join().unwrap();
        assert!(r1 != r2);
        let v = cell.value();
        assert!(v == 10 || v == 20);
    });
}

#[test]
fn tagged_swing_race_has_one_winner() {
    loom::model(|| {
        let word = Arc::new(AtomicTaggedRef::new(TaggedRef::new(0, 0)));

        let swing = |word: Arc<AtomicTaggedRef>, to: u32| {
            thread::spawn(move || {
                let old = TaggedRef::new(0, 0);
                word.compare_exchange(old, TaggedRef::new(to, old.tag() + 1))
            })
        };

        let t1 = swing(word.clone(), 1);
        let t2 = swing(word.clone(), 2);
        let r1 = t1.join().unwrap();
        let r2 = t2.join().unwrap();
        assert!(r1 != r2);
        assert_eq!(word.load().tag(), 1);
    });
}
