//! Result-set wires.
//!
//! Query results stream from server to client through named result sets. A
//! session segment holds a fixed table of entries; each entry carries a name
//! and `writers_per_result_set` independent byte rings, one per producer.
//!
//! On a wire, records are grouped into chunks: `[len: u32 LE][bytes]`. A
//! producer stages bytes with [`ResultSetWriter::write`] and publishes them as
//! one chunk with [`ResultSetWriter::commit`]; an empty commit marks end of
//! records (EOR) for that wire. The consumer finds a wire with a complete
//! chunk ([`ResultSetReader::search`]), reads it in place
//! ([`ResultSetReader::get_chunk`]) and frees it
//! ([`ResultSetReader::dispose`]).
//!
//! Entries are reclaimed lazily: releasing a result set on the server only
//! marks it, and [`ResultSetPool::sweep`] reuses it once the consumer closed
//! (or died) and every producer ended.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use parking_lot::Mutex;
use shm_primitives::{ByteRing, MappedRegion, Region, Waiter};

use crate::error::{Result, TransportError};
use crate::layout::{
    ENTRY_ACTIVE, ENTRY_FREE, ENTRY_RELEASED, EntryFlags, LENGTH_PREFIX_SIZE, LayoutError, NAME_MAX,
    ResultSetEntryHeader, ResultSetWireSignals, SessionLayout, SessionOffsets, WIRE_SIGNALS_SIZE,
    WireFlags, load_wire_flags, set_wire_flags,
};
use crate::liveness::{Liveness, wait_while_alive};

/// Geometry of the result-set table inside a session segment.
#[derive(Clone)]
pub struct ResultSetTable {
    _backing: Arc<dyn MappedRegion>,
    region: Region,
    offsets: SessionOffsets,
    slots: u32,
    writers: u32,
    capacity: u64,
}

impl ResultSetTable {
    pub fn new(backing: Arc<dyn MappedRegion>, layout: &SessionLayout) -> Result<Self> {
        let offsets = SessionOffsets::calculate(layout)?;
        let region = backing.region();
        if offsets.total_size > region.len() {
            return Err(LayoutError::SegmentTooSmall {
                required: offsets.total_size,
                found: region.len(),
            }
            .into());
        }
        Ok(Self {
            _backing: backing,
            region,
            offsets,
            slots: layout.result_set_slots,
            writers: layout.writers_per_result_set,
            capacity: layout.result_set_capacity,
        })
    }

    pub fn slots(&self) -> u32 {
        self.slots
    }

    pub fn writers_per_entry(&self) -> u32 {
        self.writers
    }

    fn entry(&self, entry: u32) -> &ResultSetEntryHeader {
        debug_assert!(entry < self.slots);
        // SAFETY: the table was checked against the region size in `new`.
        unsafe { self.region.get(self.offsets.entry(entry)) }
    }

    fn signals(&self, entry: u32, wire: u32) -> &ResultSetWireSignals {
        debug_assert!(wire < self.writers);
        unsafe { self.region.get(self.offsets.result_set_wire(entry, wire)) }
    }

    /// Ring of an initialized wire.
    fn ring(&self, entry: u32, wire: u32) -> Result<ByteRing> {
        let offset = self.offsets.result_set_wire(entry, wire) + WIRE_SIGNALS_SIZE;
        // SAFETY: offset is 64-aligned and the whole wire lies in the region;
        // an uninitialized header reads as capacity 0 and is rejected.
        let ring = unsafe { ByteRing::attach(self.region, offset) }
            .map_err(LayoutError::InvalidConfig)?;
        if ring.capacity() != self.capacity {
            return Err(LayoutError::InvalidConfig("result set wire capacity mismatch").into());
        }
        Ok(ring)
    }

    /// Lay out entry `entry` and all its wires from scratch.
    ///
    /// # Safety
    ///
    /// Nobody else may touch the entry during the call.
    unsafe fn init_entry(&self, entry: u32) {
        unsafe {
            (*self.region.ptr::<ResultSetEntryHeader>(self.offsets.entry(entry))).init();
            for wire in 0..self.writers {
                let offset = self.offsets.result_set_wire(entry, wire);
                (*self.region.ptr::<ResultSetWireSignals>(offset)).init();
                ByteRing::init(self.region, offset + WIRE_SIGNALS_SIZE, self.capacity);
            }
        }
    }

    /// Entry published under `name`, with its generation.
    fn find(&self, name: &str) -> Option<(u32, u32)> {
        (0..self.slots).find_map(|i| self.entry(i).matches(name).map(|generation| (i, generation)))
    }

    /// Mark `entry` closed by its consumer, unless it was reused since `generation`.
    fn close_entry(&self, entry: u32, generation: u32) -> bool {
        let header = self.entry(entry);
        if header.generation.load(Ordering::Acquire) != generation {
            return false;
        }
        header
            .flags
            .fetch_or(EntryFlags::CLOSED.bits(), Ordering::AcqRel);
        for wire in 0..self.writers {
            Waiter::new(&self.signals(entry, wire).space).notify();
        }
        Waiter::new(&header.changed).notify();
        true
    }

    /// Close the result set published as `name` without reading it.
    ///
    /// For a consumer that learned the name but could not open a reader, so
    /// the server's producers stop and the entry can be swept.
    pub fn close_named(&self, name: &str) -> bool {
        match self.find(name) {
            Some((entry, generation)) => self.close_entry(entry, generation),
            None => false,
        }
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.len() > NAME_MAX {
        return Err(TransportError::NameTooLong {
            name: name.to_owned(),
            max: NAME_MAX,
        });
    }
    Ok(())
}

// =============================================================================
// Server side
// =============================================================================

#[derive(Default)]
struct PoolState {
    /// Entries laid out so far; the rest of the table is still zeroed.
    initialized: u32,
    /// Released entries waiting for their consumer.
    deferred: Vec<u32>,
}

/// Server-side allocator of result-set entries for one session.
pub struct ResultSetPool {
    table: ResultSetTable,
    state: Mutex<PoolState>,
    liveness: Arc<dyn Liveness>,
    timeout: Duration,
}

impl ResultSetPool {
    pub fn new(table: ResultSetTable, liveness: Arc<dyn Liveness>, timeout: Duration) -> Self {
        Self {
            table,
            state: Mutex::new(PoolState::default()),
            liveness,
            timeout,
        }
    }

    /// Open a result set under `name`.
    ///
    /// Acquire the writers before sending the name to the client: the client
    /// reports EOR only once at least one writer exists.
    pub fn acquire(self: &Arc<Self>, name: &str) -> Result<ResultSetWires> {
        validate_name(name)?;
        let mut state = self.state.lock();
        if self.table.find(name).is_some() {
            return Err(TransportError::AlreadyExists(name.to_owned()));
        }

        let entry = match self.free_entry(&mut state) {
            Some(entry) => entry,
            None => {
                self.sweep_locked(&mut state);
                self.free_entry(&mut state)
                    .ok_or(TransportError::OutOfWires)?
            }
        };

        let header = self.table.entry(entry);
        // SAFETY: the entry is free and we hold the pool lock.
        unsafe { header.set_name(name) };
        header.flags.store(0, Ordering::Release);
        header.writers.store(0, Ordering::Release);
        header.generation.fetch_add(1, Ordering::AcqRel);
        header.state.store(ENTRY_ACTIVE, Ordering::Release);

        tracing::debug!(name, entry, "result set acquired");
        Ok(ResultSetWires {
            pool: self.clone(),
            entry,
            name: name.to_owned(),
            released: false,
        })
    }

    fn free_entry(&self, state: &mut PoolState) -> Option<u32> {
        if let Some(entry) = (0..state.initialized)
            .find(|&i| self.table.entry(i).state.load(Ordering::Acquire) == ENTRY_FREE)
        {
            return Some(entry);
        }
        if state.initialized < self.table.slots {
            let entry = state.initialized;
            // SAFETY: entries past `initialized` are untouched by anyone.
            unsafe { self.table.init_entry(entry) };
            state.initialized += 1;
            return Some(entry);
        }
        None
    }

    fn release(&self, entry: u32) {
        let mut state = self.state.lock();
        self.table
            .entry(entry)
            .state
            .store(ENTRY_RELEASED, Ordering::Release);
        state.deferred.push(entry);
    }

    /// Close every entry in use, failing blocked producers with
    /// [`TransportError::Closed`]. Used when the session is torn down.
    pub fn close_all(&self) {
        let state = self.state.lock();
        for entry in 0..state.initialized {
            let header = self.table.entry(entry);
            if header.state.load(Ordering::Acquire) != ENTRY_FREE {
                self.table
                    .close_entry(entry, header.generation.load(Ordering::Acquire));
            }
        }
    }

    /// Reclaim released entries whose consumer is done. Returns how many.
    pub fn sweep(&self) -> usize {
        let mut state = self.state.lock();
        self.sweep_locked(&mut state)
    }

    fn sweep_locked(&self, state: &mut PoolState) -> usize {
        let peer_alive = self.liveness.is_alive();
        let before = state.deferred.len();
        state.deferred.retain(|&entry| {
            let header = self.table.entry(entry);
            let consumer_done = !peer_alive || header.load_flags().contains(EntryFlags::CLOSED);
            let writers = header.writers.load(Ordering::Acquire);
            let producers_done = (0..writers).all(|wire| {
                load_wire_flags(&self.table.signals(entry, wire).flags).contains(WireFlags::EOR)
            });
            if !(consumer_done && producers_done) {
                return true;
            }

            for wire in 0..self.table.writers {
                self.table.signals(entry, wire).reset();
                if let Ok(ring) = self.table.ring(entry, wire) {
                    ring.reset();
                }
            }
            header.flags.store(0, Ordering::Release);
            header.writers.store(0, Ordering::Release);
            header.state.store(ENTRY_FREE, Ordering::Release);
            tracing::trace!(entry, "result set entry reclaimed");
            false
        });
        let reclaimed = before - state.deferred.len();
        if reclaimed > 0 {
            tracing::debug!(reclaimed, pending = state.deferred.len(), "result set sweep");
        }
        reclaimed
    }

    /// Entries acquired and not yet reclaimed.
    pub fn active(&self) -> usize {
        let state = self.state.lock();
        (0..state.initialized)
            .filter(|&i| self.table.entry(i).state.load(Ordering::Acquire) != ENTRY_FREE)
            .count()
    }
}

/// An acquired result set on the server. Releases itself on drop.
pub struct ResultSetWires {
    pool: Arc<ResultSetPool>,
    entry: u32,
    name: String,
    released: bool,
}

impl ResultSetWires {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Hand out the next producer wire of this result set.
    pub fn acquire_writer(&self) -> Result<ResultSetWriter> {
        let table = &self.pool.table;
        let header = table.entry(self.entry);
        let wire = header
            .writers
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < table.writers).then_some(n + 1)
            })
            .map_err(|_| TransportError::OutOfWires)?;

        let ring = table.ring(self.entry, wire)?;
        set_wire_flags(&table.signals(self.entry, wire).flags, WireFlags::IN_USE);
        tracing::trace!(name = %self.name, wire, "result set writer acquired");
        Ok(ResultSetWriter {
            pool: self.pool.clone(),
            entry: self.entry,
            wire,
            push: ring.push_cursor(),
            ring,
            staged: 0,
            ended: false,
        })
    }

    /// Whether the consumer stopped reading.
    pub fn is_closed(&self) -> bool {
        self.pool
            .table
            .entry(self.entry)
            .load_flags()
            .contains(EntryFlags::CLOSED)
    }

    /// Give the entry back; it is reused after the consumer closes.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !std::mem::replace(&mut self.released, true) {
            self.pool.release(self.entry);
            tracing::debug!(name = %self.name, "result set released");
        }
    }
}

impl Drop for ResultSetWires {
    fn drop(&mut self) {
        self.release_inner();
    }
}

/// One producer of a result set. Ends its wire on drop.
pub struct ResultSetWriter {
    pool: Arc<ResultSetPool>,
    entry: u32,
    wire: u32,
    ring: ByteRing,
    /// Start of the chunk being staged.
    push: u64,
    /// Bytes staged after the length prefix.
    staged: usize,
    ended: bool,
}

impl ResultSetWriter {
    fn signals(&self) -> &ResultSetWireSignals {
        self.pool.table.signals(self.entry, self.wire)
    }

    fn entry_header(&self) -> &ResultSetEntryHeader {
        self.pool.table.entry(self.entry)
    }

    pub fn is_closed(&self) -> bool {
        self.entry_header().load_flags().contains(EntryFlags::CLOSED)
    }

    /// Largest chunk this wire can carry.
    pub fn max_chunk(&self) -> usize {
        self.ring.capacity() as usize - LENGTH_PREFIX_SIZE
    }

    /// Stage `bytes` into the current chunk, blocking while the wire is full.
    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        if self.ended {
            return Err(TransportError::violation("write after end of records"));
        }
        let chunk = self.staged + bytes.len();
        if chunk > self.max_chunk() {
            return Err(TransportError::MessageTooLarge {
                len: chunk,
                max: self.max_chunk(),
            });
        }
        let needed = (LENGTH_PREFIX_SIZE + chunk) as u64;
        let (ring, push, entry) = (self.ring, self.push, self.entry);
        let pool = &self.pool;
        wait_while_alive(
            Waiter::new(&pool.table.signals(entry, self.wire).space),
            pool.timeout,
            pool.liveness.as_ref(),
            "result set space",
            || {
                if pool.table.entry(entry).load_flags().contains(EntryFlags::CLOSED) {
                    return Err(TransportError::Closed);
                }
                Ok((ring.free_from(push) >= needed).then_some(()))
            },
        )?;

        // SAFETY: `needed` bytes past `push` are free and only this writer
        // produces on this wire.
        unsafe {
            ring.write_at(push + (LENGTH_PREFIX_SIZE + self.staged) as u64, bytes);
        }
        self.staged = chunk;
        Ok(())
    }

    /// Publish the staged bytes as one chunk. An empty commit marks end of records.
    pub fn commit(&mut self) -> Result<()> {
        if self.ended {
            return Err(TransportError::violation("commit after end of records"));
        }
        if self.staged == 0 {
            self.end();
            return Ok(());
        }
        if self.is_closed() {
            self.staged = 0;
            return Err(TransportError::Closed);
        }

        let len = self.staged as u32;
        // SAFETY: `write` reserved room for the prefix in front of the chunk.
        unsafe { self.ring.write_at(self.push, &len.to_le_bytes()) };
        self.push += (LENGTH_PREFIX_SIZE + self.staged) as u64;
        self.staged = 0;
        self.ring.publish(self.push);
        self.signals().records.fetch_add(1, Ordering::AcqRel);
        self.notify_data();
        tracing::trace!(entry = self.entry, wire = self.wire, len, "chunk committed");
        Ok(())
    }

    /// Commit anything staged, then mark end of records.
    pub fn finish(mut self) -> Result<()> {
        if self.staged > 0 {
            self.commit()?;
        }
        self.commit()
    }

    fn end(&mut self) {
        if std::mem::replace(&mut self.ended, true) {
            return;
        }
        self.staged = 0;
        set_wire_flags(&self.signals().flags, WireFlags::EOR);
        self.notify_data();
        tracing::trace!(entry = self.entry, wire = self.wire, "end of records");
    }

    fn notify_data(&self) {
        Waiter::new(&self.signals().data).notify();
        Waiter::new(&self.entry_header().changed).notify();
    }
}

impl Drop for ResultSetWriter {
    fn drop(&mut self) {
        self.end();
    }
}

// =============================================================================
// Client side
// =============================================================================

/// Chunk returned for a wire that ended with nothing left.
const END_OF_RECORDS: &[u8] = &[];

/// A wire of a result set, as seen by the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WireHandle(u32);

impl WireHandle {
    pub fn index(self) -> u32 {
        self.0
    }
}

/// Client-side reader of one result set. Closes it on drop.
pub struct ResultSetReader {
    table: ResultSetTable,
    entry: u32,
    generation: u32,
    name: String,
    /// Chunk handed out by `get_chunk` and not yet disposed.
    current: Option<(WireHandle, u32)>,
    /// Copy of a chunk that wraps around the end of its ring.
    staging: Vec<u8>,
    liveness: Arc<dyn Liveness>,
    timeout: Duration,
    closed: bool,
}

impl ResultSetReader {
    /// Find the result set published as `name`.
    ///
    /// The server may already have released it; its chunks stay readable
    /// until this reader closes.
    pub fn open(
        table: ResultSetTable,
        name: &str,
        liveness: Arc<dyn Liveness>,
        timeout: Duration,
    ) -> Result<Self> {
        validate_name(name)?;
        let (entry, generation) = table
            .find(name)
            .ok_or_else(|| TransportError::NotFound(name.to_owned()))?;
        tracing::debug!(name, entry, generation, "result set opened");
        Ok(Self {
            table,
            entry,
            generation,
            name: name.to_owned(),
            current: None,
            staging: Vec::new(),
            liveness,
            timeout,
            closed: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn header(&self) -> &ResultSetEntryHeader {
        self.table.entry(self.entry)
    }

    fn writers(&self) -> u32 {
        self.header()
            .writers
            .load(Ordering::Acquire)
            .min(self.table.writers)
    }

    fn records(&self, wire: u32) -> u64 {
        self.table
            .signals(self.entry, wire)
            .records
            .load(Ordering::Acquire)
    }

    fn ready_wire(&self) -> Option<WireHandle> {
        (0..self.writers())
            .find(|&wire| self.records(wire) > 0)
            .map(WireHandle)
    }

    /// A wire that has a complete chunk, or `None` without one.
    ///
    /// With `wait`, blocks until some wire has a chunk or the whole result
    /// set reached EOR (then `None`).
    pub fn search(&self, wait: bool) -> Result<Option<WireHandle>> {
        if !wait {
            return Ok(self.ready_wire());
        }
        wait_while_alive(
            Waiter::new(&self.header().changed),
            self.timeout,
            self.liveness.as_ref(),
            "result set data",
            || {
                if let Some(handle) = self.ready_wire() {
                    return Ok(Some(Some(handle)));
                }
                Ok(self.is_eor().then_some(None))
            },
        )
    }

    /// The oldest chunk of `handle`, read in place when it does not wrap.
    ///
    /// An ended wire with nothing left yields an empty chunk. Without `wait`,
    /// `None` means no chunk yet.
    pub fn get_chunk(&mut self, handle: WireHandle, wait: bool) -> Result<Option<&[u8]>> {
        if handle.0 >= self.writers() {
            return Err(TransportError::NotFound(format!(
                "{}: wire {}",
                self.name, handle.0
            )));
        }
        let signals = self.table.signals(self.entry, handle.0);
        let poll = || -> Result<Option<bool>> {
            if signals.records.load(Ordering::Acquire) > 0 {
                return Ok(Some(true));
            }
            if load_wire_flags(&signals.flags).contains(WireFlags::EOR) {
                return Ok(Some(false));
            }
            Ok(None)
        };
        let has_chunk = if wait {
            wait_while_alive(
                Waiter::new(&signals.data),
                self.timeout,
                self.liveness.as_ref(),
                "result set chunk",
                poll,
            )?
        } else {
            match poll()? {
                Some(has_chunk) => has_chunk,
                None => return Ok(None),
            }
        };
        if !has_chunk {
            return Ok(Some(END_OF_RECORDS));
        }

        let ring = self.table.ring(self.entry, handle.0)?;
        let pop = ring.pop_cursor();
        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        // SAFETY: a committed chunk starts at the pop cursor.
        unsafe { ring.read_at(pop, &mut prefix) };
        let len = u32::from_le_bytes(prefix);
        let framed = LENGTH_PREFIX_SIZE as u64 + u64::from(len);
        if framed > ring.capacity() || framed > ring.occupied() {
            return Err(TransportError::violation(format!(
                "chunk of {len} bytes with {} of {} bytes buffered",
                ring.occupied(),
                ring.capacity()
            )));
        }
        self.current = Some((handle, len));

        let start = pop + LENGTH_PREFIX_SIZE as u64;
        // SAFETY: the chunk stays unreleased until `dispose`, which needs
        // &mut self; the table keeps the mapping alive.
        if let Some(chunk) = unsafe { ring.contiguous(start, len as usize) } {
            return Ok(Some(chunk));
        }
        self.staging.resize(len as usize, 0);
        unsafe { ring.read_at(start, &mut self.staging) };
        Ok(Some(&self.staging))
    }

    /// Free the chunk last returned by `get_chunk` for `handle`.
    pub fn dispose(&mut self, handle: WireHandle) {
        let Some((current, len)) = self.current else {
            return;
        };
        if current != handle {
            return;
        }
        self.current = None;
        self.staging.clear();

        let Ok(ring) = self.table.ring(self.entry, handle.0) else {
            return;
        };
        ring.release(ring.pop_cursor() + (LENGTH_PREFIX_SIZE as u64) + len as u64);
        let signals = self.table.signals(self.entry, handle.0);
        signals.records.fetch_sub(1, Ordering::AcqRel);
        Waiter::new(&signals.space).notify();
    }

    /// Every producer ended and no chunk is left.
    pub fn is_eor(&self) -> bool {
        let writers = self.writers();
        writers > 0 && (0..writers).all(|wire| self.wire_is_eor(WireHandle(wire)))
    }

    /// This wire ended and no chunk is left on it.
    pub fn wire_is_eor(&self, handle: WireHandle) -> bool {
        if handle.0 >= self.writers() {
            return false;
        }
        let signals = self.table.signals(self.entry, handle.0);
        load_wire_flags(&signals.flags).contains(WireFlags::EOR)
            && signals.records.load(Ordering::Acquire) == 0
    }

    /// Stop reading; producers see [`TransportError::Closed`].
    pub fn set_closed(&mut self) {
        if std::mem::replace(&mut self.closed, true) {
            return;
        }
        if self.table.close_entry(self.entry, self.generation) {
            tracing::debug!(name = %self.name, "result set closed by consumer");
        } else {
            tracing::warn!(name = %self.name, "result set entry was reused before close");
        }
    }
}

impl Drop for ResultSetReader {
    fn drop(&mut self) {
        self.set_closed();
    }
}

impl std::fmt::Debug for ResultSetReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultSetReader")
            .field("name", &self.name)
            .field("entry", &self.entry)
            .field("closed", &self.closed)
            .finish()
    }
}
