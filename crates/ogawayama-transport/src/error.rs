use std::io;

use crate::layout::LayoutError;

/// Errors from the shared memory transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Segment, result set or wire is absent.
    #[error("`{0}` not found")]
    NotFound(String),

    /// A live segment (or active result set) already has this name.
    #[error("`{0}` already exists")]
    AlreadyExists(String),

    /// A bounded wait elapsed while the peer was still alive.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// A wait timed out and the peer is gone. Terminal for the session.
    #[error("peer is no longer alive")]
    PeerFailure,

    /// Sequencing or framing invariant broken. Never retry.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("no free response slot")]
    OutOfSlots,

    #[error("no free result set wire")]
    OutOfWires,

    #[error("message of {len} bytes exceeds wire limit of {max} bytes")]
    MessageTooLarge { len: usize, max: usize },

    #[error("name `{name}` exceeds {max} bytes")]
    NameTooLong { name: String, max: usize },

    #[error("invalid segment name `{0}`")]
    InvalidName(String),

    /// The wire or queue was closed by either side.
    #[error("closed")]
    Closed,

    #[error("layout error: {0}")]
    Layout(#[from] LayoutError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    /// The peer went away; every in-flight operation of the session fails.
    pub fn is_peer_failure(&self) -> bool {
        matches!(self, Self::PeerFailure)
    }

    /// Resource exhaustion the caller may back off from.
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::OutOfSlots | Self::OutOfWires)
    }

    pub(crate) fn violation(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        tracing::error!(%msg, "protocol violation");
        Self::ProtocolViolation(msg)
    }
}

pub type Result<T, E = TransportError> = std::result::Result<T, E>;
