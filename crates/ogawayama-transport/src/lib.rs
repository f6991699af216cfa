//! Shared memory transport for the ogawayama SQL stub.
//!
//! A database server publishes three kinds of POSIX shared memory segments:
//!
//! - `{db}`: the server segment, whose existence and owner pid say the
//!   server is up,
//! - `{db}-connection`: the admission queue clients take tickets from,
//! - `{db}-{session_id}`: one per session, carrying the request wire, the
//!   response wire and the result-set table.
//!
//! Every blocking operation is bounded by [`TransportConfig::timeout`]; when
//! it elapses the peer's liveness is checked and a dead peer surfaces as
//! [`TransportError::PeerFailure`].

pub mod config;
pub mod connection;
pub mod error;
pub mod layout;
pub mod liveness;
pub mod response;
pub mod resultset;
pub mod segment;
pub mod session;
pub mod wire;

pub use config::TransportConfig;
pub use connection::ConnectionQueue;
pub use error::{Result, TransportError};
pub use layout::{MessageHeader, PhaseKind, SegmentKind};
pub use liveness::{AlwaysAlive, Liveness, PeerProcessLiveness, SegmentLiveness};
pub use response::{ResponseSlotTable, SlotFailure, SlotIndex};
pub use resultset::{
    ResultSetPool, ResultSetReader, ResultSetTable, ResultSetWires, ResultSetWriter, WireHandle,
};
pub use segment::{
    SharedSegment, connection_segment_name, server_segment_name, session_segment_name,
};
pub use session::{ClientSession, ServerSession};
pub use wire::{FramedWire, WireView};
