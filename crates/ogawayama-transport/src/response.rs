//! Client-side response slots.
//!
//! Every request carries the index of a slot the client claimed. The
//! demultiplexer reads response frames off the wire and drops each one into
//! its slot with [`ResponseSlotTable::note_arrival`]; the thread that sent the
//! request blocks in [`ResponseSlotTable::consume`]. A response is either one
//! `Single` frame or a `Head` frame followed by a `Body` frame, and `consume`
//! hands the phases out in arrival order.
//!
//! A slot whose response is still owed is never handed to another request:
//! a caller that stops waiting [abandons](ResponseSlotTable::abandon) it, and
//! the demultiplexer frees it when the last phase lands.
//!
//! The table is process-local: nothing here lives in shared memory.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::error::{Result, TransportError};
use crate::layout::PhaseKind;

/// A claimed response slot. Its index goes on the wire in the request header.
///
/// Only valid for the claim that produced it: once the slot is freed, every
/// call with this handle is stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotIndex {
    index: u16,
    generation: u32,
}

impl SlotIndex {
    pub fn get(self) -> u16 {
        self.index
    }
}

/// Why every pending slot was failed at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotFailure {
    /// The server went away.
    PeerFailure,
    /// The session was closed.
    Closed,
    /// The response stream was malformed.
    ProtocolViolation,
}

impl SlotFailure {
    fn to_error(self) -> TransportError {
        match self {
            Self::PeerFailure => TransportError::PeerFailure,
            Self::Closed => TransportError::Closed,
            Self::ProtocolViolation => {
                TransportError::ProtocolViolation("session aborted by an earlier violation".into())
            }
        }
    }
}

#[derive(Debug, Default)]
struct SlotState {
    /// Bumped every time the slot is freed.
    generation: u32,
    /// Phases noted by the demultiplexer.
    received: u8,
    /// Phases handed to the caller.
    consumed: u8,
    /// 1 for one-phase, 2 for two-phase, 0 until the first frame.
    expected: u8,
    /// Nobody waits for the response; free the slot when it completes.
    abandoned: bool,
    head: Option<Bytes>,
    body: Option<Bytes>,
}

impl SlotState {
    fn complete(&self) -> bool {
        self.expected > 0 && self.received == self.expected
    }

    fn recycle(&mut self) {
        *self = SlotState {
            generation: self.generation.wrapping_add(1),
            ..SlotState::default()
        };
    }
}

struct Slot {
    in_use: AtomicBool,
    state: Mutex<SlotState>,
    ready: Condvar,
}

impl Slot {
    fn new() -> Self {
        Self {
            in_use: AtomicBool::new(false),
            state: Mutex::new(SlotState::default()),
            ready: Condvar::new(),
        }
    }
}

/// Fixed table of response slots for one client session.
pub struct ResponseSlotTable {
    slots: Box<[Slot]>,
    freed_lock: Mutex<()>,
    freed: Condvar,
    failure: Mutex<Option<SlotFailure>>,
    timeout: Duration,
}

impl ResponseSlotTable {
    /// `count` must be within `1..=65536`.
    pub fn new(count: usize, timeout: Duration) -> Self {
        assert!(
            count > 0 && count <= u16::MAX as usize + 1,
            "slot count must fit the u16 index"
        );
        Self {
            slots: (0..count).map(|_| Slot::new()).collect(),
            freed_lock: Mutex::new(()),
            freed: Condvar::new(),
            failure: Mutex::new(None),
            timeout,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Slots currently claimed.
    pub fn in_use(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.in_use.load(Ordering::Acquire))
            .count()
    }

    pub fn failure(&self) -> Option<SlotFailure> {
        *self.failure.lock()
    }

    fn check_failure(&self) -> Result<()> {
        match self.failure() {
            Some(failure) => Err(failure.to_error()),
            None => Ok(()),
        }
    }

    fn slot(&self, index: u16) -> Result<&Slot> {
        self.slots.get(index as usize).ok_or_else(|| {
            TransportError::violation(format!("response slot {index} out of range"))
        })
    }

    /// The slot and its state, if `index` is still the current claim.
    fn claimed(&self, index: SlotIndex) -> Option<(&Slot, MutexGuard<'_, SlotState>)> {
        let slot = self.slots.get(index.index as usize)?;
        let state = slot.state.lock();
        (slot.in_use.load(Ordering::Acquire) && state.generation == index.generation)
            .then_some((slot, state))
    }

    /// Claim a free slot without blocking.
    pub fn claim(&self) -> Result<SlotIndex> {
        self.check_failure()?;
        for (i, slot) in self.slots.iter().enumerate() {
            if slot
                .in_use
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(SlotIndex {
                    index: i as u16,
                    generation: slot.state.lock().generation,
                });
            }
        }
        Err(TransportError::OutOfSlots)
    }

    /// Claim a slot, waiting up to `timeout` for one to be freed.
    pub fn claim_wait(&self, timeout: Duration) -> Result<SlotIndex> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.freed_lock.lock();
        loop {
            match self.claim() {
                Err(TransportError::OutOfSlots) => {}
                other => return other,
            }
            // Frees notify under `freed_lock`, so no wakeup is lost between
            // the failed claim and the wait.
            if self.freed.wait_until(&mut guard, deadline).timed_out() {
                return self.claim();
            }
        }
    }

    /// Record a frame for `index`. Called by the demultiplexer only.
    pub fn note_arrival(&self, index: u16, kind: PhaseKind, message: Bytes) -> Result<()> {
        let slot = self.slot(index)?;
        if !slot.in_use.load(Ordering::Acquire) {
            return Err(TransportError::violation(format!(
                "response for unclaimed slot {index}"
            )));
        }

        let mut state = slot.state.lock();
        match (state.received, kind) {
            (0, PhaseKind::Single) => {
                state.expected = 1;
                state.body = Some(message);
            }
            (0, PhaseKind::Head) => {
                state.expected = 2;
                state.head = Some(message);
            }
            (1, PhaseKind::Body) if state.expected == 2 => {
                state.body = Some(message);
            }
            (received, kind) => {
                return Err(TransportError::violation(format!(
                    "{kind:?} frame for slot {index} after {received} phase(s)"
                )));
            }
        }
        state.received += 1;
        if state.abandoned && state.complete() {
            state.recycle();
            drop(state);
            self.free(slot);
            tracing::trace!(slot = index, "abandoned slot freed");
            return Ok(());
        }
        slot.ready.notify_all();
        Ok(())
    }

    /// Take the next phase of the response in `index`, blocking until it arrives.
    ///
    /// For a two-phase response the first call returns the head and the second
    /// the body. The slot is freed once the last phase is handed out, or when
    /// the session fails.
    pub fn consume(&self, index: SlotIndex) -> Result<Bytes> {
        let Some((slot, mut state)) = self.claimed(index) else {
            return Err(TransportError::violation(format!(
                "consume of stale slot {}",
                index.index
            )));
        };

        while state.received <= state.consumed {
            if let Some(failure) = self.failure() {
                state.recycle();
                drop(state);
                self.free(slot);
                return Err(failure.to_error());
            }
            if slot.ready.wait_for(&mut state, self.timeout).timed_out() {
                tracing::trace!(slot = index.index, "still waiting for response");
            }
        }

        if state.expected == 2 && state.consumed == 0 {
            state.consumed = 1;
            return state
                .head
                .take()
                .ok_or_else(|| TransportError::violation("head phase missing"));
        }

        let body = state.body.take();
        state.recycle();
        drop(state);
        self.free(slot);
        body.ok_or_else(|| TransportError::violation("response phase missing"))
    }

    /// Free a claimed slot whose request never went out.
    ///
    /// Refused while a response is half delivered: its remaining phase would
    /// land in whatever request claims the slot next. Use
    /// [`abandon`](Self::abandon) for a response that is still owed. Stale
    /// handles are ignored.
    pub fn release(&self, index: SlotIndex) -> Result<()> {
        let Some((slot, mut state)) = self.claimed(index) else {
            return Ok(());
        };
        if state.received > 0 && !state.complete() {
            return Err(TransportError::violation(format!(
                "release of slot {} while a response phase is owed",
                index.index
            )));
        }
        state.recycle();
        drop(state);
        self.free(slot);
        Ok(())
    }

    /// Stop waiting for the response in `index`.
    ///
    /// The slot is freed at once when the response is complete, otherwise
    /// when its last phase arrives. Stale handles are ignored.
    pub fn abandon(&self, index: SlotIndex) {
        let Some((slot, mut state)) = self.claimed(index) else {
            return;
        };
        if state.complete() || self.failure().is_some() {
            state.recycle();
            drop(state);
            self.free(slot);
        } else {
            state.abandoned = true;
            tracing::trace!(slot = index.index, "slot abandoned");
        }
    }

    /// Fail every current and future wait with `failure`. The first failure sticks.
    pub fn fail_all(&self, failure: SlotFailure) {
        {
            let mut current = self.failure.lock();
            if current.is_none() {
                *current = Some(failure);
                tracing::debug!(?failure, "failing all response slots");
            }
        }
        for slot in self.slots.iter() {
            let mut state = slot.state.lock();
            if state.abandoned {
                state.recycle();
                drop(state);
                self.free(slot);
            } else {
                slot.ready.notify_all();
            }
        }
        let _guard = self.freed_lock.lock();
        self.freed.notify_all();
    }

    fn free(&self, slot: &Slot) {
        slot.in_use.store(false, Ordering::Release);
        let _guard = self.freed_lock.lock();
        self.freed.notify_all();
    }
}

impl std::fmt::Debug for ResponseSlotTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseSlotTable")
            .field("len", &self.len())
            .field("in_use", &self.in_use())
            .field("failure", &self.failure())
            .finish()
    }
}
