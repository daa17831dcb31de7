//! Single-word CAS primitives for the manege container family.
//!
//! Every shared mutable word in the containers built on this crate is one of
//! four shapes, and all of them fit a single atomic integer so that every
//! update is one compare-and-swap:
//!
//! - [`SlotWord`]: a ring slot, 32-bit payload plus a packed [`SlotDesc`]
//!   (sequence, safe/closed flags, one structure-specific auxiliary flag).
//! - [`Cursor`]: a head or tail index with a one-way closed bit, advanced
//!   with fetch-and-increment.
//! - [`TaggedRef`] / [`AtomicTaggedRef`]: a (pool index, tag) pair. The tag
//!   doubles as the CAS counter of a counted pointer and the generation
//!   stamp of an arena handle.
//! - [`WaitCell`]: a per-thread rendezvous cell satisfied exactly once per
//!   armed ticket.
//!
//! All packing is explicit shift/mask arithmetic (no bitfields, no unions,
//! no layout assumptions) so the words read back identically on any
//! endianness.
//!
//! # Loom Testing
//!
//! Build with `RUSTFLAGS="--cfg loom"` to swap the atomics for loom's and
//! run the model tests:
//!
//! ```text
//! RUSTFLAGS="--cfg loom" cargo test -p manege-primitives
//! ```

#![no_std]

#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod cursor;
pub mod pad;
pub mod slot;
pub mod sync;
pub mod tagged;
pub mod wait;

pub use cursor::Cursor;
pub use pad::Padded;
pub use slot::{SEQ_LIMIT, SEQ_MASK, SlotDesc, SlotWord};
pub use tagged::{AtomicTaggedRef, NIL, TaggedRef};
pub use wait::{WaitCell, WaitToken};

#[cfg(all(test, loom))]
mod loom_tests;
