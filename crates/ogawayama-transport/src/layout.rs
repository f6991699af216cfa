//! Shared memory layout definitions.
//!
//! Every segment starts with a [`SegmentHeader`]. What follows depends on the
//! segment kind:
//!
//! ```text
//! server segment "{db}"
//! +---------------------------------------------------------------+
//! | SEGMENT HEADER (128 bytes)                                    |
//! +---------------------------------------------------------------+
//!
//! connection segment "{db}-connection"
//! +---------------------------------------------------------------+
//! | SEGMENT HEADER (128 bytes)                                    |
//! | CONNECTION QUEUE HEADER (64 bytes)                            |
//! |   requested, accepted, futex words, terminate                 |
//! +---------------------------------------------------------------+
//!
//! session segment "{db}-{session_id}"
//! +---------------------------------------------------------------+
//! | SEGMENT HEADER (128 bytes), carries the session layout        |
//! +---------------------------------------------------------------+
//! | REQUEST WIRE:  WireSignals (64) + ByteRingHeader (192) + data |
//! | RESPONSE WIRE: WireSignals (64) + ByteRingHeader (192) + data |
//! +---------------------------------------------------------------+
//! | RESULT SET TABLE (result_set_slots entries)                   |
//! |   ResultSetEntryHeader (128): state, flags, name              |
//! |   writers x [ResultSetWireSignals (64) + ByteRingHeader + data]|
//! +---------------------------------------------------------------+
//! ```
//!
//! All offsets are computed with checked arithmetic; a configuration that does
//! not fit in `usize` is a [`LayoutError`], never a wrapped offset.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use bitflags::bitflags;
use shm_primitives::ByteRing;
use static_assertions::const_assert_eq;

use crate::config::TransportConfig;

// =============================================================================
// Constants
// =============================================================================

/// Magic bytes identifying an ogawayama segment.
pub const SEGMENT_MAGIC: [u8; 8] = *b"OGAWAYAM";

/// Current layout version (major.minor packed into u32).
pub const PROTOCOL_VERSION: u32 = 1 << 16; // v1.0

/// Longest segment or result-set name, in bytes.
pub const NAME_MAX: usize = 64;

/// Size of the framed-wire message header.
pub const MESSAGE_HEADER_SIZE: usize = 8;

/// Size of the result-set chunk length prefix.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Alignment of every structure placed in a segment.
pub const SEGMENT_ALIGN: usize = 64;

/// Size of a framed wire's signal block.
pub const WIRE_SIGNALS_SIZE: usize = 64;

// Result-set entry states.
pub const ENTRY_FREE: u32 = 0;
pub const ENTRY_ACTIVE: u32 = 1;
/// Released by the server, waiting for the consumer before reuse.
pub const ENTRY_RELEASED: u32 = 2;

bitflags! {
    /// Flags on a framed wire or result-set wire.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WireFlags: u32 {
        /// Either side closed the wire.
        const CLOSED = 1 << 0;
        /// A producer acquired this result-set wire.
        const IN_USE = 1 << 1;
        /// The producer signalled end of records.
        const EOR = 1 << 2;
    }
}

bitflags! {
    /// Flags on a result-set entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EntryFlags: u32 {
        /// The consumer stopped reading.
        const CLOSED = 1 << 0;
    }
}

pub(crate) fn load_wire_flags(word: &AtomicU32) -> WireFlags {
    WireFlags::from_bits_truncate(word.load(Ordering::Acquire))
}

pub(crate) fn set_wire_flags(word: &AtomicU32, flags: WireFlags) {
    word.fetch_or(flags.bits(), Ordering::AcqRel);
}

/// Round `value` up to the segment alignment.
pub fn align_up(value: usize) -> Option<usize> {
    value
        .checked_add(SEGMENT_ALIGN - 1)
        .map(|v| v & !(SEGMENT_ALIGN - 1))
}

// =============================================================================
// Segment header
// =============================================================================

/// What a segment holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SegmentKind {
    Server = 1,
    Connection = 2,
    Session = 3,
}

impl SegmentKind {
    fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::Server),
            2 => Some(Self::Connection),
            3 => Some(Self::Session),
            _ => None,
        }
    }
}

/// Sizes a session segment was laid out with. Zero for other kinds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionLayout {
    pub request_capacity: u64,
    pub response_capacity: u64,
    pub result_set_capacity: u64,
    pub result_set_slots: u32,
    pub writers_per_result_set: u32,
}

impl SessionLayout {
    pub fn from_config(config: &TransportConfig) -> Self {
        Self {
            request_capacity: config.request_capacity,
            response_capacity: config.response_capacity,
            result_set_capacity: config.result_set_capacity,
            result_set_slots: config.result_set_slots,
            writers_per_result_set: config.writers_per_result_set,
        }
    }
}

/// Header at the start of every segment (128 bytes).
#[repr(C, align(64))]
pub struct SegmentHeader {
    /// Magic bytes: "OGAWAYAM".
    pub magic: [u8; 8],
    /// Layout version (major.minor packed).
    pub version: u32,
    /// [`SegmentKind`] as u32.
    pub kind: u32,
    /// Total mapped size in bytes.
    pub size: u64,
    /// Pid of the creating process.
    pub owner_pid: u32,
    /// Pid of the attached peer, 0 until one records itself.
    pub peer_pid: AtomicU32,

    pub request_capacity: u64,
    pub response_capacity: u64,
    pub result_set_capacity: u64,
    pub result_set_slots: u32,
    pub writers_per_result_set: u32,

    pub _reserved: [u8; 64],
}

const_assert_eq!(core::mem::size_of::<SegmentHeader>(), 128);

impl SegmentHeader {
    /// Initialize a zeroed header.
    ///
    /// The magic goes in last: a header with magic is complete, one without
    /// is still being written.
    pub fn init(&mut self, kind: SegmentKind, size: u64, owner_pid: u32, layout: SessionLayout) {
        self.version = PROTOCOL_VERSION;
        self.kind = kind as u32;
        self.size = size;
        self.owner_pid = owner_pid;
        self.peer_pid = AtomicU32::new(0);
        self.request_capacity = layout.request_capacity;
        self.response_capacity = layout.response_capacity;
        self.result_set_capacity = layout.result_set_capacity;
        self.result_set_slots = layout.result_set_slots;
        self.writers_per_result_set = layout.writers_per_result_set;
        self._reserved = [0; 64];
        core::sync::atomic::fence(Ordering::Release);
        // SAFETY: `&mut self` is a valid, aligned place for the field.
        unsafe { core::ptr::write_volatile(&raw mut self.magic, SEGMENT_MAGIC) };
    }

    /// Check magic, version and kind.
    pub fn validate(&self, expected: SegmentKind, mapped: usize) -> Result<(), LayoutError> {
        if self.magic != SEGMENT_MAGIC {
            return Err(LayoutError::InvalidMagic);
        }
        if self.version >> 16 != PROTOCOL_VERSION >> 16 {
            return Err(LayoutError::IncompatibleVersion {
                expected: PROTOCOL_VERSION,
                found: self.version,
            });
        }
        match SegmentKind::from_raw(self.kind) {
            Some(kind) if kind == expected => {}
            _ => {
                return Err(LayoutError::WrongKind {
                    expected: expected as u32,
                    found: self.kind,
                });
            }
        }
        if (self.size as usize) > mapped {
            return Err(LayoutError::SegmentTooSmall {
                required: self.size as usize,
                found: mapped,
            });
        }
        Ok(())
    }

    pub fn session_layout(&self) -> SessionLayout {
        SessionLayout {
            request_capacity: self.request_capacity,
            response_capacity: self.response_capacity,
            result_set_capacity: self.result_set_capacity,
            result_set_slots: self.result_set_slots,
            writers_per_result_set: self.writers_per_result_set,
        }
    }
}

// =============================================================================
// Framed wire
// =============================================================================

/// Phase of a message on a framed wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PhaseKind {
    /// A complete one-phase response.
    Single = 0,
    /// First phase of a two-phase response.
    Head = 1,
    /// Second phase of a two-phase response.
    Body = 2,
}

impl TryFrom<u8> for PhaseKind {
    type Error = LayoutError;

    fn try_from(raw: u8) -> Result<Self, Self::Error> {
        match raw {
            0 => Ok(Self::Single),
            1 => Ok(Self::Head),
            2 => Ok(Self::Body),
            other => Err(LayoutError::UnknownPhase(other)),
        }
    }
}

/// Header in front of every message on a framed wire.
///
/// Encoded little-endian as `length u32 | index u16 | kind u8 | reserved u8`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub length: u32,
    pub index: u16,
    pub kind: PhaseKind,
}

impl MessageHeader {
    pub fn new(length: u32, index: u16, kind: PhaseKind) -> Self {
        Self {
            length,
            index,
            kind,
        }
    }

    pub fn encode(&self) -> [u8; MESSAGE_HEADER_SIZE] {
        let mut out = [0u8; MESSAGE_HEADER_SIZE];
        out[0..4].copy_from_slice(&self.length.to_le_bytes());
        out[4..6].copy_from_slice(&self.index.to_le_bytes());
        out[6] = self.kind as u8;
        out
    }

    pub fn decode(raw: &[u8; MESSAGE_HEADER_SIZE]) -> Result<Self, LayoutError> {
        Ok(Self {
            length: u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
            index: u16::from_le_bytes([raw[4], raw[5]]),
            kind: PhaseKind::try_from(raw[6])?,
        })
    }
}

/// Futex words and flags of a framed wire (64 bytes).
#[repr(C, align(64))]
pub struct WireSignals {
    /// Bumped when a message is published.
    pub not_empty: AtomicU32,
    /// Bumped when a message is released.
    pub not_full: AtomicU32,
    /// [`WireFlags`].
    pub flags: AtomicU32,
    pub _pad: [u8; 52],
}

const_assert_eq!(core::mem::size_of::<WireSignals>(), WIRE_SIGNALS_SIZE);

impl WireSignals {
    pub fn init(&mut self) {
        self.not_empty = AtomicU32::new(0);
        self.not_full = AtomicU32::new(0);
        self.flags = AtomicU32::new(0);
        self._pad = [0; 52];
    }
}

// =============================================================================
// Result sets
// =============================================================================

/// Header of one result-set entry (128 bytes).
#[repr(C, align(64))]
pub struct ResultSetEntryHeader {
    /// `ENTRY_FREE`, `ENTRY_ACTIVE` or `ENTRY_RELEASED`.
    pub state: AtomicU32,
    /// [`EntryFlags`].
    pub flags: AtomicU32,
    /// Number of producer wires handed out.
    pub writers: AtomicU32,
    /// Valid bytes in `name`.
    pub name_len: AtomicU32,
    /// Bumped on every reuse of the entry.
    pub generation: AtomicU32,
    /// Bumped whenever any wire of this entry commits or ends.
    pub changed: AtomicU32,
    pub _pad1: [u8; 8],
    /// Written only while the entry is `ENTRY_FREE`.
    pub name: UnsafeCell<[u8; NAME_MAX]>,
    pub _pad2: [u8; 32],
}

const_assert_eq!(core::mem::size_of::<ResultSetEntryHeader>(), 128);

impl ResultSetEntryHeader {
    pub fn init(&mut self) {
        self.state = AtomicU32::new(ENTRY_FREE);
        self.flags = AtomicU32::new(0);
        self.writers = AtomicU32::new(0);
        self.name_len = AtomicU32::new(0);
        self.generation = AtomicU32::new(0);
        self.changed = AtomicU32::new(0);
        self._pad1 = [0; 8];
        self.name = UnsafeCell::new([0; NAME_MAX]);
        self._pad2 = [0; 32];
    }

    /// Generation of this entry when it is published under `name`.
    ///
    /// Released entries still match: the server releases a result set as soon
    /// as its producers finish, possibly before the consumer opened it, and
    /// only a sweep after the consumer closed it frees the entry.
    pub fn matches(&self, name: &str) -> Option<u32> {
        let generation = self.generation.load(Ordering::Acquire);
        let state = self.state.load(Ordering::Acquire);
        if state != ENTRY_ACTIVE && state != ENTRY_RELEASED {
            return None;
        }
        let len = self.name_len.load(Ordering::Acquire) as usize;
        if len != name.len() || len > NAME_MAX {
            return None;
        }
        // SAFETY: the name is only written while the entry is free, and the
        // Acquire load of `state` orders that write before this read.
        let stored = unsafe { &*self.name.get() };
        if &stored[..len] != name.as_bytes() {
            return None;
        }
        // A reuse racing with the read above shows up as a new generation.
        (self.generation.load(Ordering::Acquire) == generation).then_some(generation)
    }

    /// Store `name`.
    ///
    /// # Safety
    ///
    /// The entry must be free, and only the pool may call this.
    pub unsafe fn set_name(&self, name: &str) {
        debug_assert!(name.len() <= NAME_MAX);
        let stored = unsafe { &mut *self.name.get() };
        stored[..name.len()].copy_from_slice(name.as_bytes());
        self.name_len.store(name.len() as u32, Ordering::Release);
    }

    pub fn load_flags(&self) -> EntryFlags {
        EntryFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }
}

/// Signals of one result-set wire (64 bytes).
#[repr(C, align(64))]
pub struct ResultSetWireSignals {
    /// [`WireFlags`]: `IN_USE`, `EOR`.
    pub flags: AtomicU32,
    /// Bumped on every commit or end of records.
    pub data: AtomicU32,
    /// Bumped on every disposed chunk and on consumer close.
    pub space: AtomicU32,
    pub _pad0: u32,
    /// Committed chunks not yet disposed.
    pub records: AtomicU64,
    pub _pad1: [u8; 40],
}

const_assert_eq!(core::mem::size_of::<ResultSetWireSignals>(), 64);

impl ResultSetWireSignals {
    pub fn init(&mut self) {
        self.flags = AtomicU32::new(0);
        self.data = AtomicU32::new(0);
        self.space = AtomicU32::new(0);
        self._pad0 = 0;
        self.records = AtomicU64::new(0);
        self._pad1 = [0; 40];
    }

    /// Back to a fresh state between uses of the owning entry.
    pub fn reset(&self) {
        self.flags.store(0, Ordering::Release);
        self.records.store(0, Ordering::Release);
    }
}

// =============================================================================
// Connection queue
// =============================================================================

/// Admission counters in the connection segment (64 bytes).
#[repr(C, align(64))]
pub struct ConnectionQueueHeader {
    /// Tickets handed out to clients.
    pub requested: AtomicU64,
    /// Highest ticket the server accepted.
    pub accepted: AtomicU64,
    /// Bumped on every request and on terminate.
    pub request_futex: AtomicU32,
    /// Bumped on every accept and on terminate.
    pub accept_futex: AtomicU32,
    /// Non-zero once the server asked the listener to stop.
    pub terminate: AtomicU32,
    pub _pad: [u8; 36],
}

const_assert_eq!(core::mem::size_of::<ConnectionQueueHeader>(), 64);

impl ConnectionQueueHeader {
    pub fn init(&mut self) {
        self.requested = AtomicU64::new(0);
        self.accepted = AtomicU64::new(0);
        self.request_futex = AtomicU32::new(0);
        self.accept_futex = AtomicU32::new(0);
        self.terminate = AtomicU32::new(0);
        self._pad = [0; 36];
    }
}

/// Offset of the queue header in the connection segment.
pub const CONNECTION_QUEUE_OFFSET: usize = core::mem::size_of::<SegmentHeader>();

/// Size of the connection segment.
pub const CONNECTION_SEGMENT_SIZE: usize =
    CONNECTION_QUEUE_OFFSET + core::mem::size_of::<ConnectionQueueHeader>();

/// Size of the server segment.
pub const SERVER_SEGMENT_SIZE: usize = core::mem::size_of::<SegmentHeader>();

// =============================================================================
// Session offsets
// =============================================================================

/// Bytes taken by a framed wire of `capacity` data bytes.
pub fn wire_footprint(capacity: u64) -> Option<usize> {
    let capacity = usize::try_from(capacity).ok()?;
    WIRE_SIGNALS_SIZE
        .checked_add(ByteRing::required_size(0))?
        .checked_add(capacity)
        .and_then(align_up)
}

/// Where everything lives in a session segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOffsets {
    pub request_wire: usize,
    pub response_wire: usize,
    pub result_set_table: usize,
    /// Bytes per result-set entry (header plus its wires).
    pub entry_stride: usize,
    /// Bytes per result-set wire (signals, ring header, data).
    pub wire_stride: usize,
    pub total_size: usize,
}

impl SessionOffsets {
    pub fn calculate(layout: &SessionLayout) -> Result<Self, LayoutError> {
        let overflow = || LayoutError::Overflow;

        let request_wire = core::mem::size_of::<SegmentHeader>();
        let request_len = wire_footprint(layout.request_capacity).ok_or_else(overflow)?;
        let response_wire = request_wire.checked_add(request_len).ok_or_else(overflow)?;
        let response_len = wire_footprint(layout.response_capacity).ok_or_else(overflow)?;
        let result_set_table = response_wire
            .checked_add(response_len)
            .ok_or_else(overflow)?;

        // Result-set wires share the framed-wire footprint: 64 bytes of signals,
        // then the ring header and data.
        let wire_stride = wire_footprint(layout.result_set_capacity).ok_or_else(overflow)?;
        let entry_stride = (layout.writers_per_result_set as usize)
            .checked_mul(wire_stride)
            .and_then(|w| w.checked_add(core::mem::size_of::<ResultSetEntryHeader>()))
            .ok_or_else(overflow)?;
        let total_size = (layout.result_set_slots as usize)
            .checked_mul(entry_stride)
            .and_then(|t| t.checked_add(result_set_table))
            .ok_or_else(overflow)?;

        Ok(Self {
            request_wire,
            response_wire,
            result_set_table,
            entry_stride,
            wire_stride,
            total_size,
        })
    }

    pub fn entry(&self, index: u32) -> usize {
        self.result_set_table + index as usize * self.entry_stride
    }

    /// Offset of the signals of wire `wire` in entry `entry`.
    pub fn result_set_wire(&self, entry: u32, wire: u32) -> usize {
        self.entry(entry) + core::mem::size_of::<ResultSetEntryHeader>() + wire as usize * self.wire_stride
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Errors from layout validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
    /// Invalid magic bytes.
    InvalidMagic,
    /// Incompatible layout version.
    IncompatibleVersion { expected: u32, found: u32 },
    /// Segment holds something else.
    WrongKind { expected: u32, found: u32 },
    /// Mapping shorter than the header claims.
    SegmentTooSmall { required: usize, found: usize },
    /// Unknown phase kind in a message header.
    UnknownPhase(u8),
    /// Offsets do not fit in `usize`.
    Overflow,
    /// Invalid configuration.
    InvalidConfig(&'static str),
}

impl std::fmt::Display for LayoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidMagic => write!(f, "invalid segment magic bytes (expected OGAWAYAM)"),
            Self::IncompatibleVersion { expected, found } => {
                write!(
                    f,
                    "incompatible layout version: expected {}.{}, found {}.{}",
                    expected >> 16,
                    expected & 0xFFFF,
                    found >> 16,
                    found & 0xFFFF
                )
            }
            Self::WrongKind { expected, found } => {
                write!(f, "wrong segment kind: expected {}, found {}", expected, found)
            }
            Self::SegmentTooSmall { required, found } => {
                write!(f, "segment too small: need {} bytes, got {}", required, found)
            }
            Self::UnknownPhase(raw) => write!(f, "unknown phase kind {}", raw),
            Self::Overflow => write!(f, "segment layout overflows usize"),
            Self::InvalidConfig(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for LayoutError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_layout() -> SessionLayout {
        SessionLayout {
            request_capacity: 4096,
            response_capacity: 4096,
            result_set_capacity: 1000,
            result_set_slots: 2,
            writers_per_result_set: 3,
        }
    }

    #[test]
    fn message_header_layout_is_fixed() {
        let header = MessageHeader::new(0x0102_0304, 0x0506, PhaseKind::Body);
        assert_eq!(header.encode(), [4, 3, 2, 1, 6, 5, 2, 0]);
        assert_eq!(MessageHeader::decode(&header.encode()).unwrap(), header);
    }

    #[test]
    fn unknown_phase_is_rejected() {
        let raw = [0, 0, 0, 0, 0, 0, 9, 0];
        assert_eq!(MessageHeader::decode(&raw), Err(LayoutError::UnknownPhase(9)));
    }

    #[test]
    fn offsets_are_aligned_and_disjoint() {
        let offsets = SessionOffsets::calculate(&small_layout()).unwrap();
        assert_eq!(offsets.request_wire, 128);
        assert_eq!(offsets.response_wire, 128 + 64 + 192 + 4096);
        assert_eq!(offsets.wire_stride, align_up(64 + 192 + 1000).unwrap());
        assert_eq!(offsets.entry_stride, 128 + 3 * offsets.wire_stride);
        for offset in [
            offsets.request_wire,
            offsets.response_wire,
            offsets.result_set_table,
            offsets.result_set_wire(1, 2),
        ] {
            assert_eq!(offset % SEGMENT_ALIGN, 0);
        }
        assert_eq!(
            offsets.total_size,
            offsets.result_set_table + 2 * offsets.entry_stride
        );
    }

    #[test]
    fn oversized_layout_is_an_error() {
        let layout = SessionLayout {
            result_set_slots: u32::MAX,
            writers_per_result_set: u32::MAX,
            result_set_capacity: u32::MAX as u64,
            ..small_layout()
        };
        assert_eq!(SessionOffsets::calculate(&layout), Err(LayoutError::Overflow));
    }

    #[test]
    fn flags_round_trip_through_atomics() {
        let word = AtomicU32::new(0);
        set_wire_flags(&word, WireFlags::IN_USE);
        set_wire_flags(&word, WireFlags::EOR);
        assert_eq!(load_wire_flags(&word), WireFlags::IN_USE | WireFlags::EOR);
    }
}
