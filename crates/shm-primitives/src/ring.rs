//! Byte ring with monotonic cursors.
//!
//! Both cursors only ever grow. The occupied length is `push - pop`, free
//! space is `capacity - (push - pop)`, and the only place a cursor is reduced
//! to a physical position is [`ByteRing::physical`]. Copies that straddle the
//! end of the buffer are split in two there and nowhere else.
//!
//! The ring does not decide who may write where: callers own the range
//! `[push, push + n)` on the producer side and `[pop, pop + n)` on the
//! consumer side, and publish by moving the matching cursor.

use core::mem::size_of;
use core::ptr;

use crate::region::Region;
use crate::sync::{AtomicU64, Ordering};

/// Ring cursors (192 bytes, one cache line per hot field).
#[repr(C, align(64))]
pub struct ByteRingHeader {
    /// Bytes ever published by the producer.
    pub push: AtomicU64,
    _pad1: [u8; 56],

    /// Bytes ever released by the consumer.
    pub pop: AtomicU64,
    _pad2: [u8; 56],

    /// Data area size in bytes (immutable after init).
    pub capacity: u64,
    _pad3: [u8; 56],
}

#[cfg(not(feature = "loom"))]
const _: () = assert!(size_of::<ByteRingHeader>() == 192);

impl ByteRingHeader {
    /// Write a fresh header at `this`.
    ///
    /// # Safety
    ///
    /// `this` must be valid for writes and not concurrently accessed.
    pub unsafe fn init(this: *mut Self, capacity: u64) {
        assert!(capacity > 0, "ring capacity must be > 0");
        unsafe {
            ptr::write(
                this,
                Self {
                    push: AtomicU64::new(0),
                    _pad1: [0; 56],
                    pop: AtomicU64::new(0),
                    _pad2: [0; 56],
                    capacity,
                    _pad3: [0; 56],
                },
            )
        }
    }

    /// Bytes published but not yet released.
    #[inline]
    pub fn occupied(&self) -> u64 {
        // pop first: a later push can only be larger, so the difference never underflows.
        let pop = self.pop.load(Ordering::Acquire);
        let push = self.push.load(Ordering::Acquire);
        push.saturating_sub(pop)
    }
}

/// A view of a byte ring (header + data area) inside a region.
#[derive(Clone, Copy)]
pub struct ByteRing {
    region: Region,
    header_offset: usize,
    data_offset: usize,
    capacity: u64,
}

unsafe impl Send for ByteRing {}
unsafe impl Sync for ByteRing {}

impl ByteRing {
    /// Size of the header that precedes the data area.
    pub const HEADER_SIZE: usize = size_of::<ByteRingHeader>();

    /// Bytes needed for a ring of `capacity` data bytes.
    pub const fn required_size(capacity: usize) -> usize {
        Self::HEADER_SIZE + capacity
    }

    /// Initialize a new ring at `header_offset`.
    ///
    /// # Safety
    ///
    /// The region must be writable and exclusively owned during initialization.
    pub unsafe fn init(region: Region, header_offset: usize, capacity: u64) -> Self {
        assert!(
            header_offset.is_multiple_of(64),
            "header_offset must be 64-byte aligned"
        );
        let data_offset = header_offset + Self::HEADER_SIZE;
        assert!(
            data_offset as u64 + capacity <= region.len() as u64,
            "region too small for ring"
        );

        unsafe { ByteRingHeader::init(region.ptr::<ByteRingHeader>(header_offset), capacity) };

        Self {
            region,
            header_offset,
            data_offset,
            capacity,
        }
    }

    /// Attach to an initialized ring at `header_offset`.
    ///
    /// # Safety
    ///
    /// The region must contain a valid, initialized ring header at `header_offset`.
    pub unsafe fn attach(region: Region, header_offset: usize) -> Result<Self, &'static str> {
        if !header_offset.is_multiple_of(64) {
            return Err("header_offset must be 64-byte aligned");
        }
        let header = unsafe { region.get::<ByteRingHeader>(header_offset) };
        let capacity = header.capacity;
        if capacity == 0 {
            return Err("ring capacity must be > 0");
        }
        let data_offset = header_offset + Self::HEADER_SIZE;
        if data_offset as u64 + capacity > region.len() as u64 {
            return Err("region too small for ring");
        }

        Ok(Self {
            region,
            header_offset,
            data_offset,
            capacity,
        })
    }

    #[inline]
    pub fn header(&self) -> &ByteRingHeader {
        unsafe { self.region.get::<ByteRingHeader>(self.header_offset) }
    }

    #[inline]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Physical position of a cursor in the data area.
    #[inline]
    pub fn physical(&self, cursor: u64) -> usize {
        (cursor % self.capacity) as usize
    }

    #[inline]
    pub fn push_cursor(&self) -> u64 {
        self.header().push.load(Ordering::Acquire)
    }

    #[inline]
    pub fn pop_cursor(&self) -> u64 {
        self.header().pop.load(Ordering::Acquire)
    }

    #[inline]
    pub fn occupied(&self) -> u64 {
        self.header().occupied()
    }

    /// Free bytes as seen by a producer whose private cursor is `push`.
    #[inline]
    pub fn free_from(&self, push: u64) -> u64 {
        let pop = self.pop_cursor();
        self.capacity.saturating_sub(push.saturating_sub(pop))
    }

    /// Publish everything up to `push`.
    #[inline]
    pub fn publish(&self, push: u64) {
        debug_assert!(push >= self.push_cursor(), "push cursor went backwards");
        self.header().push.store(push, Ordering::Release);
    }

    /// Release everything up to `pop`.
    #[inline]
    pub fn release(&self, pop: u64) {
        debug_assert!(pop <= self.push_cursor(), "pop cursor passed push cursor");
        self.header().pop.store(pop, Ordering::Release);
    }

    /// Reset both cursors to zero.
    ///
    /// Only valid while neither side is using the ring.
    pub fn reset(&self) {
        self.header().pop.store(0, Ordering::Release);
        self.header().push.store(0, Ordering::Release);
    }

    /// Split `len` bytes at `cursor` into (start, first_span_len).
    #[inline]
    fn spans(&self, cursor: u64, len: usize) -> (usize, usize) {
        assert!(len as u64 <= self.capacity, "span longer than ring");
        let start = self.physical(cursor);
        let first = len.min(self.capacity as usize - start);
        (start, first)
    }

    #[inline]
    fn data_ptr(&self, at: usize) -> *mut u8 {
        self.region.offset(self.data_offset + at)
    }

    /// Copy `src` into the ring starting at `cursor`, wrapping if needed.
    ///
    /// # Safety
    ///
    /// The caller must own `[cursor, cursor + src.len())`: it is beyond the
    /// published push cursor and within free space.
    pub unsafe fn write_at(&self, cursor: u64, src: &[u8]) {
        let (start, first) = self.spans(cursor, src.len());
        unsafe {
            ptr::copy_nonoverlapping(src.as_ptr(), self.data_ptr(start), first);
            if first < src.len() {
                ptr::copy_nonoverlapping(
                    src.as_ptr().add(first),
                    self.data_ptr(0),
                    src.len() - first,
                );
            }
        }
    }

    /// Copy `dst.len()` bytes starting at `cursor` out of the ring.
    ///
    /// # Safety
    ///
    /// `[cursor, cursor + dst.len())` must be published and not yet released.
    pub unsafe fn read_at(&self, cursor: u64, dst: &mut [u8]) {
        let (start, first) = self.spans(cursor, dst.len());
        unsafe {
            ptr::copy_nonoverlapping(self.data_ptr(start), dst.as_mut_ptr(), first);
            if first < dst.len() {
                ptr::copy_nonoverlapping(
                    self.data_ptr(0),
                    dst.as_mut_ptr().add(first),
                    dst.len() - first,
                );
            }
        }
    }

    /// Borrow `len` bytes at `cursor` in place, if they do not wrap.
    ///
    /// # Safety
    ///
    /// Same as [`ByteRing::read_at`]. The caller picks the lifetime: the
    /// mapping must stay alive and the range unreleased while the slice is used.
    pub unsafe fn contiguous<'a>(&self, cursor: u64, len: usize) -> Option<&'a [u8]> {
        let (start, first) = self.spans(cursor, len);
        if first < len {
            return None;
        }
        Some(unsafe { core::slice::from_raw_parts(self.data_ptr(start), len) })
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use crate::region::HeapRegion;

    fn ring(capacity: u64) -> (HeapRegion, ByteRing) {
        let owner = HeapRegion::new_zeroed(ByteRing::required_size(capacity as usize));
        let ring = unsafe { ByteRing::init(owner.region(), 0, capacity) };
        (owner, ring)
    }

    #[test]
    fn header_is_192_bytes() {
        assert_eq!(ByteRing::HEADER_SIZE, 192);
    }

    #[test]
    fn write_then_read_without_wrap() {
        let (_owner, ring) = ring(16);
        unsafe { ring.write_at(0, b"hello") };
        ring.publish(5);
        assert_eq!(ring.occupied(), 5);

        let mut out = [0u8; 5];
        unsafe { ring.read_at(0, &mut out) };
        assert_eq!(&out, b"hello");
        assert_eq!(unsafe { ring.contiguous(0, 5) }, Some(&b"hello"[..]));
    }

    #[test]
    fn copies_split_at_the_end_of_the_buffer() {
        let (_owner, ring) = ring(8);
        ring.publish(6);
        ring.release(6);

        unsafe { ring.write_at(6, b"abcde") };
        ring.publish(11);
        assert_eq!(ring.occupied(), 5);

        let mut out = [0u8; 5];
        unsafe { ring.read_at(6, &mut out) };
        assert_eq!(&out, b"abcde");
        assert!(unsafe { ring.contiguous(6, 5) }.is_none());
        assert_eq!(ring.physical(11), 3);
    }

    #[test]
    fn free_space_tracks_cursor_difference() {
        let (_owner, ring) = ring(10);
        assert_eq!(ring.free_from(0), 10);
        ring.publish(7);
        assert_eq!(ring.free_from(7), 3);
        ring.release(4);
        assert_eq!(ring.free_from(7), 7);
        assert_eq!(ring.occupied(), 3);
    }

    #[test]
    fn cursors_keep_growing_past_capacity() {
        let (_owner, ring) = ring(4);
        let mut push = 0u64;
        for round in 0..10u8 {
            unsafe { ring.write_at(push, &[round, round]) };
            push += 2;
            ring.publish(push);

            let mut out = [0u8; 2];
            unsafe { ring.read_at(push - 2, &mut out) };
            assert_eq!(out, [round, round]);
            ring.release(push);
        }
        assert_eq!(ring.push_cursor(), 20);
        assert_eq!(ring.pop_cursor(), 20);
        assert_eq!(ring.occupied(), 0);
    }

    #[test]
    fn attach_reads_back_capacity() {
        let (owner, _ring) = ring(32);
        let attached = unsafe { ByteRing::attach(owner.region(), 0) }.unwrap();
        assert_eq!(attached.capacity(), 32);
    }
}
