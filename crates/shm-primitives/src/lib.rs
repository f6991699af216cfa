//! Primitives for shared memory IPC.
//!
//! This crate provides the building blocks the ogawayama transport lays out
//! inside its shared memory segments. They work on raw views of memory-mapped
//! regions and leave ownership of the mapping to the caller.
//!
//! # Primitives
//!
//! - [`Region`]: a bounds-checked view of a mapping, plus [`HeapRegion`] for
//!   heap-backed tests.
//! - [`ByteRing`]: a circular byte buffer addressed by monotonic cursors. Every
//!   ring-shaped structure in the transport (framed message wires, result-set
//!   wires) goes through it for wraparound copies.
//! - [`Waiter`] (`std` feature): a futex-backed waitable predicate usable across
//!   processes.
//!
//! # Loom Testing
//!
//! The cursor protocol is modelled under loom:
//!
//! ```text
//! cargo test -p shm-primitives --features loom --release
//! ```

#![no_std]

#[cfg(any(test, feature = "alloc"))]
extern crate alloc;
#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod region;
pub mod ring;
pub mod sync;

#[cfg(all(feature = "std", not(feature = "loom")))]
pub mod futex;

#[cfg(any(test, feature = "alloc"))]
pub use region::HeapRegion;
pub use region::{MappedRegion, Region};
pub use ring::{ByteRing, ByteRingHeader};

#[cfg(all(feature = "std", not(feature = "loom")))]
pub use futex::{Waiter, futex_signal, futex_wait};
