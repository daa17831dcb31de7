use crate::sync::{AtomicU64, Ordering};

/// Index of the null reference.
pub const NIL: u32 = u32::MAX;

/// A (pool index, tag) pair packed into one u64.
///
/// This is both the counted pointer of the queue protocols (the tag is
/// bumped on every successful swing, so a stale CAS against a since-reused
/// index cannot silently succeed) and the generation-stamped handle of the
/// block pools (the tag is the slot generation recorded at allocation).
/// Which of the two a given word means is up to the owning structure; the
/// packing is the same.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct TaggedRef(u64);

impl TaggedRef {
    /// The null reference (index [`NIL`], tag 0).
    pub const NULL: TaggedRef = TaggedRef(NIL as u64);

    #[inline]
    pub fn new(index: u32, tag: u32) -> Self {
        TaggedRef(((tag as u64) << 32) | index as u64)
    }

    #[inline]
    pub fn from_bits(bits: u64) -> Self {
        TaggedRef(bits)
    }

    #[inline]
    pub fn bits(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn index(self) -> u32 {
        self.0 as u32
    }

    #[inline]
    pub fn tag(self) -> u32 {
        (self.0 >> 32) as u32
    }

    #[inline]
    pub fn is_null(self) -> bool {
        self.index() == NIL
    }

    /// Null with a given tag, used where a cleared word must not compare
    /// equal to an older cleared word.
    #[inline]
    pub fn null_with_tag(tag: u32) -> Self {
        TaggedRef::new(NIL, tag)
    }
}

impl core::fmt::Debug for TaggedRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.is_null() {
            write!(f, "TaggedRef(null, tag={})", self.tag())
        } else {
            write!(f, "TaggedRef({}, tag={})", self.index(), self.tag())
        }
    }
}

/// A shared [`TaggedRef`] word.
pub struct AtomicTaggedRef(AtomicU64);

impl AtomicTaggedRef {
    pub fn new(r: TaggedRef) -> Self {
        AtomicTaggedRef(AtomicU64::new(r.bits()))
    }

    pub fn null() -> Self {
        Self::new(TaggedRef::NULL)
    }

    #[inline]
    pub fn load(&self) -> TaggedRef {
        TaggedRef::from_bits(self.0.load(Ordering::SeqCst))
    }

    #[inline]
    pub fn compare_exchange(&self, old: TaggedRef, new: TaggedRef) -> bool {
        self.0
            .compare_exchange(old.bits(), new.bits(), Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Plain store, for (re)initialization while the owner is exclusive.
    #[inline]
    pub fn init(&self, r: TaggedRef) {
        self.0.store(r.bits(), Ordering::Relaxed);
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn pack_round_trip() {
        let r = TaggedRef::new(17, 0xDEAD_BEEF);
        assert_eq!(r.index(), 17);
        assert_eq!(r.tag(), 0xDEAD_BEEF);
        assert!(!r.is_null());
        assert!(TaggedRef::NULL.is_null());
        assert!(TaggedRef::null_with_tag(3).is_null());
        assert_ne!(TaggedRef::null_with_tag(3), TaggedRef::NULL);
    }

    #[test]
    fn stale_swing_fails_after_tag_bump() {
        let a = AtomicTaggedRef::new(TaggedRef::new(0, 0));
        let stale = a.load();
        assert!(a.compare_exchange(stale, TaggedRef::new(1, stale.tag() + 1)));
        // index 0 comes back, but under a fresh tag
        let cur = a.load();
        assert!(a.compare_exchange(cur, TaggedRef::new(0, cur.tag() + 1)));
        // the first snapshot must not apply anymore
        assert!(!a.compare_exchange(stale, TaggedRef::new(2, stale.tag() + 1)));
    }
}
