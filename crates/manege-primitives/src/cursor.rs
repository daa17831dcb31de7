use crate::slot::{CLOSED_BIT, SlotDesc};
use crate::sync::{AtomicU32, Ordering};

/// A head or tail index word with the [`SlotDesc`] bit layout.
///
/// The sequence occupies the low bits, so [`Cursor::fetch_inc`] is a plain
/// `fetch_add(1)` on the whole word, which is why the flags live in the high
/// bits. Closing is a one-way `fetch_or` of the closed bit; nothing ever
/// clears it.
pub struct Cursor(AtomicU32);

impl Cursor {
    pub fn new() -> Self {
        Cursor(AtomicU32::new(0))
    }

    #[inline]
    pub fn load(&self) -> SlotDesc {
        SlotDesc::from_bits(self.0.load(Ordering::SeqCst))
    }

    /// Claims the current index, returning the pre-increment value
    /// (sequence plus flags as they were).
    #[inline]
    pub fn fetch_inc(&self) -> SlotDesc {
        SlotDesc::from_bits(self.0.fetch_add(1, Ordering::SeqCst))
    }

    /// Sets the closed bit. One-way.
    #[inline]
    pub fn close(&self) {
        self.0.fetch_or(CLOSED_BIT, Ordering::SeqCst);
    }

    #[inline]
    pub fn compare_exchange(&self, old: SlotDesc, new: SlotDesc) -> bool {
        self.0
            .compare_exchange(old.bits(), new.bits(), Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Plain store, for (re)initialization while the owner is exclusive.
    #[inline]
    pub fn init(&self, desc: SlotDesc) {
        self.0.store(desc.bits(), Ordering::Relaxed);
    }
}

impl Default for Cursor {
    fn default() -> Self {
        Cursor::new()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn fetch_inc_advances_sequence_only() {
        let c = Cursor::new();
        assert_eq!(c.fetch_inc().seq(), 0);
        assert_eq!(c.fetch_inc().seq(), 1);
        assert_eq!(c.load().seq(), 2);
        assert!(!c.load().closed());
    }

    #[test]
    fn close_is_one_way_and_preserves_sequence() {
        let c = Cursor::new();
        c.fetch_inc();
        c.fetch_inc();
        c.close();
        let d = c.load();
        assert!(d.closed());
        assert_eq!(d.seq(), 2);

        // increments after the close keep the bit
        let prev = c.fetch_inc();
        assert!(prev.closed());
        assert!(c.load().closed());
    }
}
