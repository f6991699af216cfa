//! Framed message wire.
//!
//! A one-way byte ring carrying `[MessageHeader][payload]` frames. Writers on
//! one side serialize through a local mutex; the reader side is a single
//! thread (the request reader on the server, the demultiplexer on the client).
//!
//! Frames are never split across the end of the ring by the writer: the ring
//! copies straddle the wrap point themselves, so the wire only ever deals in
//! monotonic cursors.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use shm_primitives::{ByteRing, MappedRegion, Region, Waiter};

use crate::error::{Result, TransportError};
use crate::layout::{
    MESSAGE_HEADER_SIZE, MessageHeader, PhaseKind, WIRE_SIGNALS_SIZE, WireFlags, WireSignals,
    load_wire_flags, set_wire_flags,
};
use crate::liveness::{Liveness, wait_while_alive};

/// A frame taken off the wire without consuming it.
///
/// Holds the wire's reader side borrowed, so the frame cannot be released
/// while the payload is still in use.
#[derive(Debug)]
pub struct WireView<'a> {
    wire: &'a FramedWire,
    pub header: MessageHeader,
    /// Borrowed from the ring when contiguous, copied when the frame wraps.
    pub payload: Cow<'a, [u8]>,
    point: u64,
}

impl WireView<'_> {
    /// Read cursor of this frame.
    pub fn read_point(&self) -> u64 {
        self.point
    }

    /// Release the frame.
    pub fn dispose(self) {
        self.wire.release_point(self.point);
    }
}

/// One direction of a session's message channel.
pub struct FramedWire {
    // Keeps the mapping alive for `region`.
    _backing: Arc<dyn MappedRegion>,
    region: Region,
    signals_offset: usize,
    ring: ByteRing,
    write_lock: Mutex<()>,
    liveness: Arc<dyn Liveness>,
    timeout: Duration,
    label: &'static str,
}

impl FramedWire {
    /// Lay out a fresh wire of `capacity` data bytes at `offset`.
    ///
    /// # Safety
    ///
    /// `[offset, offset + layout::wire_footprint(capacity))` must lie in the
    /// backing region and be untouched by anyone else during the call.
    pub unsafe fn init(
        backing: Arc<dyn MappedRegion>,
        offset: usize,
        capacity: u64,
        liveness: Arc<dyn Liveness>,
        timeout: Duration,
        label: &'static str,
    ) -> Self {
        let region = backing.region();
        // SAFETY: caller guarantees exclusive access to the range.
        unsafe { (*region.ptr::<WireSignals>(offset)).init() };
        let ring = unsafe { ByteRing::init(region, offset + WIRE_SIGNALS_SIZE, capacity) };
        Self {
            _backing: backing,
            region,
            signals_offset: offset,
            ring,
            write_lock: Mutex::new(()),
            liveness,
            timeout,
            label,
        }
    }

    /// Attach to a wire laid out by the peer.
    ///
    /// # Safety
    ///
    /// A wire must have been initialized at `offset` in the backing region.
    pub unsafe fn attach(
        backing: Arc<dyn MappedRegion>,
        offset: usize,
        liveness: Arc<dyn Liveness>,
        timeout: Duration,
        label: &'static str,
    ) -> Result<Self> {
        let region = backing.region();
        let ring = unsafe { ByteRing::attach(region, offset + WIRE_SIGNALS_SIZE) }
            .map_err(crate::layout::LayoutError::InvalidConfig)?;
        Ok(Self {
            _backing: backing,
            region,
            signals_offset: offset,
            ring,
            write_lock: Mutex::new(()),
            liveness,
            timeout,
            label,
        })
    }

    fn signals(&self) -> &WireSignals {
        // SAFETY: init/attach checked the offset; the mapping outlives self.
        unsafe { self.region.get::<WireSignals>(self.signals_offset) }
    }

    pub fn capacity(&self) -> u64 {
        self.ring.capacity()
    }

    /// Largest payload a single frame can carry.
    pub fn max_payload(&self) -> usize {
        (self.capacity() as usize).saturating_sub(MESSAGE_HEADER_SIZE)
    }

    /// Bytes currently buffered.
    pub fn occupied(&self) -> u64 {
        self.ring.occupied()
    }

    pub fn is_closed(&self) -> bool {
        load_wire_flags(&self.signals().flags).contains(WireFlags::CLOSED)
    }

    /// Close the wire and wake both sides.
    pub fn close(&self) {
        set_wire_flags(&self.signals().flags, WireFlags::CLOSED);
        Waiter::new(&self.signals().not_empty).notify();
        Waiter::new(&self.signals().not_full).notify();
        tracing::debug!(wire = self.label, "wire closed");
    }

    /// Write a one-phase frame.
    pub fn write(&self, payload: &[u8], index: u16) -> Result<()> {
        self.write_with_kind(payload, index, PhaseKind::Single)
    }

    /// Write a frame, blocking while the ring is full.
    pub fn write_with_kind(&self, payload: &[u8], index: u16, kind: PhaseKind) -> Result<()> {
        let max = self.max_payload();
        if payload.len() > max {
            return Err(TransportError::MessageTooLarge {
                len: payload.len(),
                max,
            });
        }
        let frame = (MESSAGE_HEADER_SIZE + payload.len()) as u64;
        let header = MessageHeader::new(payload.len() as u32, index, kind);

        let _guard = self.write_lock.lock();
        let push = self.ring.push_cursor();
        wait_while_alive(
            Waiter::new(&self.signals().not_full),
            self.timeout,
            self.liveness.as_ref(),
            self.label,
            || {
                if self.is_closed() {
                    return Err(TransportError::Closed);
                }
                Ok((self.ring.free_from(push) >= frame).then_some(()))
            },
        )?;

        // SAFETY: the write lock makes us the only producer, and the wait above
        // guarantees `frame` free bytes past `push`.
        unsafe {
            self.ring.write_at(push, &header.encode());
            self.ring.write_at(push + MESSAGE_HEADER_SIZE as u64, payload);
        }
        self.ring.publish(push + frame);
        Waiter::new(&self.signals().not_empty).notify();

        tracing::trace!(wire = self.label, index, ?kind, len = payload.len(), "frame written");
        Ok(())
    }

    fn front_header(&self) -> Result<Option<MessageHeader>> {
        let occupied = self.ring.occupied();
        if occupied >= MESSAGE_HEADER_SIZE as u64 {
            let mut raw = [0u8; MESSAGE_HEADER_SIZE];
            // SAFETY: at least a header is published past the pop cursor.
            unsafe { self.ring.read_at(self.ring.pop_cursor(), &mut raw) };
            let header = MessageHeader::decode(&raw)?;
            // Writers publish whole frames, so a header never outruns its payload.
            let frame = MESSAGE_HEADER_SIZE as u64 + u64::from(header.length);
            if header.length as usize > self.max_payload() || frame > occupied {
                return Err(TransportError::violation(format!(
                    "{} wire: frame of {} bytes with {occupied} bytes buffered",
                    self.label, header.length
                )));
            }
            return Ok(Some(header));
        }
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        Ok(None)
    }

    /// Header of the next frame, without consuming it.
    ///
    /// With `wait == false` returns `None` when the wire is empty. Buffered
    /// frames are still returned after close; an empty closed wire is
    /// [`TransportError::Closed`].
    pub fn peek(&self, wait: bool) -> Result<Option<MessageHeader>> {
        if !wait {
            return self.front_header();
        }
        wait_while_alive(
            Waiter::new(&self.signals().not_empty),
            self.timeout,
            self.liveness.as_ref(),
            self.label,
            || self.front_header(),
        )
        .map(Some)
    }

    /// Wait at most `timeout` for a frame.
    ///
    /// `Ok(None)` when the wait elapsed and the peer is still alive.
    pub fn peek_for(&self, timeout: Duration) -> Result<Option<MessageHeader>> {
        let mut outcome = None;
        Waiter::new(&self.signals().not_empty).wait_for(timeout, || match self.front_header() {
            Ok(None) => false,
            other => {
                outcome = Some(other);
                true
            }
        });
        match outcome {
            Some(result) => result,
            None if self.liveness.is_alive() => Ok(None),
            None => {
                tracing::warn!(wire = self.label, "peer is gone");
                Err(TransportError::PeerFailure)
            }
        }
    }

    /// Copy the next frame's payload into `dest` and consume it.
    ///
    /// `dest` must be exactly the peeked length.
    pub fn read(&self, dest: &mut [u8]) -> Result<()> {
        let Some(header) = self.front_header()? else {
            return Err(TransportError::violation(format!(
                "{} wire read with no pending frame",
                self.label
            )));
        };
        if dest.len() != header.length as usize {
            return Err(TransportError::violation(format!(
                "{} wire read of {} bytes, frame holds {}",
                self.label,
                dest.len(),
                header.length
            )));
        }
        let pop = self.ring.pop_cursor();
        // SAFETY: the whole frame is published past pop.
        unsafe { self.ring.read_at(pop + MESSAGE_HEADER_SIZE as u64, dest) };
        self.consume(pop, header);
        Ok(())
    }

    /// Borrow the next frame in place when it does not wrap.
    ///
    /// The frame stays on the wire until the view is disposed.
    pub fn view(&mut self, wait: bool) -> Result<Option<WireView<'_>>> {
        let this: &Self = self;
        let Some(header) = this.peek(wait)? else {
            return Ok(None);
        };
        let pop = this.ring.pop_cursor();
        let start = pop + MESSAGE_HEADER_SIZE as u64;
        let len = header.length as usize;
        // SAFETY: the frame is published, and releasing it needs either the
        // view itself or &mut self; the mapping outlives self.
        let payload = match unsafe { this.ring.contiguous(start, len) } {
            Some(slice) => Cow::Borrowed(slice),
            None => {
                let mut staged = vec![0u8; len];
                unsafe { this.ring.read_at(start, &mut staged) };
                Cow::Owned(staged)
            }
        };
        Ok(Some(WireView {
            wire: this,
            header,
            payload,
            point: pop,
        }))
    }

    /// Release the frame at `point`. Stale points are ignored.
    pub fn dispose_read_point(&mut self, point: u64) {
        self.release_point(point);
    }

    fn release_point(&self, point: u64) {
        if point != self.ring.pop_cursor() {
            return;
        }
        if let Ok(Some(header)) = self.front_header() {
            self.consume(point, header);
        }
    }

    /// Read and consume the next frame into an owned buffer.
    pub fn read_message(&self, wait: bool) -> Result<Option<(MessageHeader, Vec<u8>)>> {
        let Some(header) = self.peek(wait)? else {
            return Ok(None);
        };
        let mut payload = vec![0u8; header.length as usize];
        self.read(&mut payload)?;
        Ok(Some((header, payload)))
    }

    fn consume(&self, pop: u64, header: MessageHeader) {
        self.ring
            .release(pop + MESSAGE_HEADER_SIZE as u64 + header.length as u64);
        Waiter::new(&self.signals().not_full).notify();
    }
}

impl std::fmt::Debug for FramedWire {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramedWire")
            .field("label", &self.label)
            .field("capacity", &self.capacity())
            .field("occupied", &self.occupied())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::wire_footprint;
    use crate::liveness::AlwaysAlive;
    use shm_primitives::HeapRegion;
    use std::thread;

    fn pair(capacity: u64, liveness: Arc<dyn Liveness>) -> (FramedWire, FramedWire) {
        let backing: Arc<dyn MappedRegion> =
            Arc::new(HeapRegion::new_zeroed(wire_footprint(capacity).unwrap()));
        let timeout = Duration::from_millis(20);
        let writer =
            unsafe { FramedWire::init(backing.clone(), 0, capacity, liveness.clone(), timeout, "test") };
        let reader = unsafe { FramedWire::attach(backing, 0, liveness, timeout, "test") }.unwrap();
        (writer, reader)
    }

    #[test]
    fn frames_arrive_in_order() {
        let (writer, reader) = pair(4096, Arc::new(AlwaysAlive));
        writer.write(b"hello", 1).unwrap();
        writer.write_with_kind(b"world!", 2, PhaseKind::Head).unwrap();

        let header = reader.peek(false).unwrap().unwrap();
        assert_eq!(header, MessageHeader::new(5, 1, PhaseKind::Single));
        let mut buf = vec![0u8; 5];
        reader.read(&mut buf).unwrap();
        assert_eq!(buf, b"hello");

        let (header, payload) = reader.read_message(false).unwrap().unwrap();
        assert_eq!(header.kind, PhaseKind::Head);
        assert_eq!(header.index, 2);
        assert_eq!(payload, b"world!");
        assert!(reader.peek(false).unwrap().is_none());
    }

    #[test]
    fn frames_straddling_the_wrap_point() {
        let (writer, mut reader) = pair(64, Arc::new(AlwaysAlive));
        for round in 0..20u8 {
            let payload = vec![round; 13 + (round as usize % 7)];
            writer.write(&payload, round as u16).unwrap();
            let view = reader.view(false).unwrap().unwrap();
            assert_eq!(view.header.index, round as u16);
            assert_eq!(&*view.payload, &payload[..]);
            let point = view.read_point();
            if round % 2 == 0 {
                view.dispose();
            } else {
                drop(view);
                reader.dispose_read_point(point);
            }
            // A second dispose of the same point is stale.
            reader.dispose_read_point(point);
        }
        assert_eq!(reader.occupied(), 0);
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let (writer, _reader) = pair(64, Arc::new(AlwaysAlive));
        assert!(writer.write(&[0u8; 56], 0).is_ok());
        assert!(matches!(
            writer.write(&[0u8; 57], 0),
            Err(TransportError::MessageTooLarge { len: 57, max: 56 })
        ));
    }

    #[test]
    fn full_wire_blocks_until_reader_drains() {
        let (writer, reader) = pair(32, Arc::new(AlwaysAlive));
        writer.write(&[1u8; 20], 0).unwrap();

        thread::scope(|s| {
            s.spawn(|| writer.write(&[2u8; 20], 1).unwrap());
            thread::sleep(Duration::from_millis(30));
            let (_, first) = reader.read_message(true).unwrap().unwrap();
            assert_eq!(first, vec![1u8; 20]);
            let (_, second) = reader.read_message(true).unwrap().unwrap();
            assert_eq!(second, vec![2u8; 20]);
        });
    }

    #[test]
    fn dead_peer_turns_a_full_wire_into_peer_failure() {
        let (writer, _reader) = pair(32, Arc::new(|| false));
        writer.write(&[0u8; 24], 0).unwrap();
        assert!(matches!(
            writer.write(&[0u8; 8], 0),
            Err(TransportError::PeerFailure)
        ));
    }

    #[test]
    fn close_drains_then_reports_closed() {
        let (writer, reader) = pair(256, Arc::new(AlwaysAlive));
        writer.write(b"last", 0).unwrap();
        writer.close();
        assert!(matches!(writer.write(b"more", 0), Err(TransportError::Closed)));

        let (_, payload) = reader.read_message(true).unwrap().unwrap();
        assert_eq!(payload, b"last");
        assert!(matches!(reader.peek(true), Err(TransportError::Closed)));
    }

    #[test]
    fn peek_for_returns_none_while_peer_lives() {
        let (_writer, reader) = pair(256, Arc::new(AlwaysAlive));
        assert_eq!(reader.peek_for(Duration::from_millis(5)).unwrap(), None);

        let (_writer, reader) = pair(256, Arc::new(|| false));
        assert!(matches!(
            reader.peek_for(Duration::from_millis(5)),
            Err(TransportError::PeerFailure)
        ));
    }

    #[test]
    fn corrupt_frame_header_is_a_violation() {
        let (writer, mut reader) = pair(64, Arc::new(AlwaysAlive));
        // Longer than any frame the wire can hold.
        unsafe {
            writer
                .ring
                .write_at(0, &MessageHeader::new(1000, 0, PhaseKind::Single).encode());
        }
        writer.ring.publish(MESSAGE_HEADER_SIZE as u64);
        assert!(matches!(
            reader.read_message(false),
            Err(TransportError::ProtocolViolation(_))
        ));

        // Fits the wire, but more than was published.
        unsafe {
            writer
                .ring
                .write_at(0, &MessageHeader::new(20, 0, PhaseKind::Single).encode());
        }
        writer.ring.publish(MESSAGE_HEADER_SIZE as u64 + 4);
        assert!(matches!(
            reader.peek(false),
            Err(TransportError::ProtocolViolation(_))
        ));
        assert!(matches!(
            reader.view(false),
            Err(TransportError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn read_with_wrong_length_is_a_violation() {
        let (writer, reader) = pair(256, Arc::new(AlwaysAlive));
        writer.write(b"abc", 0).unwrap();
        let mut buf = [0u8; 2];
        assert!(matches!(
            reader.read(&mut buf),
            Err(TransportError::ProtocolViolation(_))
        ));
    }
}
