//! SQL sessions over the ogawayama shared memory transport.
//!
//! The server side ([`Server`]) admits clients through the database's
//! connection queue and serves each session on its own thread, forwarding
//! verbs to a [`SqlEngine`]. The client side ([`Connection`]) multiplexes
//! requests from many threads over one session and reads query rows directly
//! from the shared result sets.
//!
//! Envelopes and rows are encoded with postcard through [`PostcardCodec`].

pub mod client;
pub mod codec;
pub mod engine;
pub mod error;
pub mod protocol;
pub mod server;
pub mod value;

pub use client::{Connection, PreparedStatement, ResultSet, Transaction};
pub use codec::{Codec, PostcardCodec};
pub use engine::{EngineError, RecordStream, SqlEngine, VecRecordStream};
pub use error::{Result, StubError};
pub use protocol::{ErrorCode, Request, Response, StatementId, TransactionId};
pub use server::{Server, ServerConfig};
pub use value::{Column, ColumnType, Parameter, Placeholder, Row, Value};

pub use ogawayama_transport::TransportConfig;
