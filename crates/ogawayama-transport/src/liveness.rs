//! Peer liveness and bounded waits.
//!
//! No blocking wait in the transport is unbounded. Each one sleeps for at most
//! the configured timeout, then asks a [`Liveness`] whether the peer is still
//! there: if so it keeps waiting, otherwise the wait fails with
//! [`TransportError::PeerFailure`].

use std::sync::Arc;
use std::time::Duration;

use shm_primitives::Waiter;

use crate::error::{Result, TransportError};
use crate::segment::SharedSegment;

/// Answers "is the other side still running?".
pub trait Liveness: Send + Sync {
    fn is_alive(&self) -> bool;
}

impl<F> Liveness for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn is_alive(&self) -> bool {
        self()
    }
}

/// The peer is alive while the named segment exists and its owner runs.
///
/// Used by clients to watch the server.
#[derive(Debug, Clone)]
pub struct SegmentLiveness {
    name: String,
}

impl SegmentLiveness {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Liveness for SegmentLiveness {
    fn is_alive(&self) -> bool {
        SharedSegment::is_alive(&self.name)
    }
}

/// The peer is alive while the pid it recorded in the segment runs.
///
/// Used by the server to watch a client.
#[derive(Debug, Clone)]
pub struct PeerProcessLiveness {
    segment: Arc<SharedSegment>,
}

impl PeerProcessLiveness {
    pub fn new(segment: Arc<SharedSegment>) -> Self {
        Self { segment }
    }
}

impl Liveness for PeerProcessLiveness {
    fn is_alive(&self) -> bool {
        self.segment.peer_alive()
    }
}

/// Never reports failure. For waits with no single peer (the listener).
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysAlive;

impl Liveness for AlwaysAlive {
    fn is_alive(&self) -> bool {
        true
    }
}

/// Block on `waiter` until `poll` yields a value or an error.
///
/// After every `timeout` without progress the peer is checked; a dead peer
/// turns into [`TransportError::PeerFailure`].
pub fn wait_while_alive<T>(
    waiter: Waiter<'_>,
    timeout: Duration,
    liveness: &dyn Liveness,
    what: &'static str,
    mut poll: impl FnMut() -> Result<Option<T>>,
) -> Result<T> {
    loop {
        let mut outcome = None;
        waiter.wait_for(timeout, || match poll() {
            Ok(None) => false,
            other => {
                outcome = Some(other);
                true
            }
        });
        match outcome {
            Some(Ok(Some(value))) => return Ok(value),
            Some(Err(e)) => return Err(e),
            Some(Ok(None)) | None => {}
        }

        if !liveness.is_alive() {
            tracing::warn!(what, ?timeout, "peer is gone");
            return Err(TransportError::PeerFailure);
        }
        tracing::trace!(what, ?timeout, "wait timed out, peer still alive");
    }
}
