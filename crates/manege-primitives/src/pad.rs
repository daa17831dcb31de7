use core::ops::{Deref, DerefMut};

/// Cache line size assumed for padding hot per-thread words.
pub const CACHE_LINE: usize = 64;

/// Aligns a value to its own cache line.
///
/// Hazard words, wait cells and cursors are written by one thread and
/// scanned by all the others; giving each its own line keeps those scans
/// from invalidating a neighbour's hot word.
#[derive(Debug, Default)]
#[repr(align(64))]
pub struct Padded<T>(pub T);

impl<T> Padded<T> {
    pub const fn new(value: T) -> Self {
        Padded(value)
    }
}

impl<T> Deref for Padded<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T> DerefMut for Padded<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.0
    }
}

const _: () = assert!(core::mem::align_of::<Padded<u64>>() == CACHE_LINE);
