use ogawayama_transport::TransportError;

use crate::protocol::ErrorCode;

/// Errors seen by stub users.
#[derive(Debug, thiserror::Error)]
pub enum StubError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The server or its engine rejected the request.
    #[error("server error {code:?}: {message}")]
    Server { code: ErrorCode, message: String },

    #[error("codec error: {0}")]
    Codec(#[from] postcard::Error),

    /// The server answered with a response the verb does not allow.
    #[error("unexpected response to {verb}: {response}")]
    Unexpected { verb: &'static str, response: String },
}

impl StubError {
    /// The server process is gone; the connection is unusable.
    pub fn is_server_gone(&self) -> bool {
        matches!(self, StubError::Transport(TransportError::PeerFailure))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, StubError::Transport(TransportError::Timeout(_)))
    }

    /// Out of response slots or result-set wires; worth retrying later.
    pub fn is_no_capacity(&self) -> bool {
        match self {
            StubError::Transport(e) => e.is_exhausted(),
            StubError::Server { code, .. } => *code == ErrorCode::ResourceExhausted,
            _ => false,
        }
    }

    /// Code of a server-reported error.
    pub fn server_code(&self) -> Option<ErrorCode> {
        match self {
            StubError::Server { code, .. } => Some(*code),
            _ => None,
        }
    }
}

pub type Result<T, E = StubError> = std::result::Result<T, E>;
