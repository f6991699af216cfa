//! Per-session views of a session segment.
//!
//! The server creates the segment for an admitted ticket ([`ServerSession`]);
//! the client maps it afterwards ([`ClientSession`]). Both see the same
//! request wire, response wire and result-set table, laid out from the
//! sizes recorded in the segment header.

use std::sync::Arc;
use std::time::Duration;

use shm_primitives::MappedRegion;

use crate::config::TransportConfig;
use crate::error::Result;
use crate::layout::{LayoutError, SegmentKind, SessionLayout, SessionOffsets};
use crate::liveness::{Liveness, PeerProcessLiveness, SegmentLiveness};
use crate::resultset::{ResultSetPool, ResultSetReader, ResultSetTable};
use crate::segment::{SharedSegment, session_segment_name};
use crate::wire::FramedWire;

/// Server side of one session.
pub struct ServerSession {
    id: u64,
    segment: Arc<SharedSegment>,
    request: FramedWire,
    response: FramedWire,
    result_sets: Arc<ResultSetPool>,
}

impl ServerSession {
    /// Create and lay out the segment for session `id` of `db`.
    pub fn create(db: &str, id: u64, config: &TransportConfig) -> Result<Self> {
        config.validate()?;
        let name = session_segment_name(db, id);
        let layout = SessionLayout::from_config(config);
        let offsets = SessionOffsets::calculate(&layout)?;
        let segment = Arc::new(SharedSegment::create(
            &name,
            offsets.total_size,
            SegmentKind::Session,
            layout,
        )?);

        let backing: Arc<dyn MappedRegion> = segment.clone();
        let liveness: Arc<dyn Liveness> = Arc::new(PeerProcessLiveness::new(segment.clone()));
        // SAFETY: the segment is fresh and the offsets come from its layout.
        let request = unsafe {
            FramedWire::init(
                backing.clone(),
                offsets.request_wire,
                layout.request_capacity,
                liveness.clone(),
                config.timeout,
                "request",
            )
        };
        let response = unsafe {
            FramedWire::init(
                backing.clone(),
                offsets.response_wire,
                layout.response_capacity,
                liveness.clone(),
                config.timeout,
                "response",
            )
        };
        let table = ResultSetTable::new(backing, &layout)?;
        let result_sets = Arc::new(ResultSetPool::new(table, liveness, config.timeout));

        tracing::debug!(%name, id, size = offsets.total_size, "session segment laid out");
        Ok(Self {
            id,
            segment,
            request,
            response,
            result_sets,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Requests from the client.
    pub fn request_wire(&self) -> &FramedWire {
        &self.request
    }

    /// Responses to the client.
    pub fn response_wire(&self) -> &FramedWire {
        &self.response
    }

    pub fn result_sets(&self) -> &Arc<ResultSetPool> {
        &self.result_sets
    }

    pub fn segment(&self) -> &Arc<SharedSegment> {
        &self.segment
    }

    /// Whether the client process is still running.
    pub fn client_alive(&self) -> bool {
        self.segment.peer_alive()
    }

    /// Close both wires. The segment is unlinked when the session is dropped.
    pub fn close(&self) {
        self.request.close();
        self.response.close();
    }
}

/// Client side of one session.
pub struct ClientSession {
    id: u64,
    segment: Arc<SharedSegment>,
    request: FramedWire,
    response: FramedWire,
    table: ResultSetTable,
    liveness: Arc<dyn Liveness>,
    timeout: Duration,
}

impl ClientSession {
    /// Map the segment of admitted session `id` and record ourselves as its peer.
    pub fn open(db: &str, id: u64, config: &TransportConfig) -> Result<Self> {
        let name = session_segment_name(db, id);
        let segment = Arc::new(SharedSegment::open(&name, SegmentKind::Session)?);
        let layout = segment.header().session_layout();
        let offsets = SessionOffsets::calculate(&layout)?;
        if offsets.total_size > segment.len() {
            return Err(LayoutError::SegmentTooSmall {
                required: offsets.total_size,
                found: segment.len(),
            }
            .into());
        }
        segment.record_peer();

        let backing: Arc<dyn MappedRegion> = segment.clone();
        let liveness: Arc<dyn Liveness> = Arc::new(SegmentLiveness::new(name.clone()));
        // SAFETY: the server laid out both wires before accepting the ticket.
        let request = unsafe {
            FramedWire::attach(
                backing.clone(),
                offsets.request_wire,
                liveness.clone(),
                config.timeout,
                "request",
            )?
        };
        let response = unsafe {
            FramedWire::attach(
                backing.clone(),
                offsets.response_wire,
                liveness.clone(),
                config.timeout,
                "response",
            )?
        };
        let table = ResultSetTable::new(backing, &layout)?;

        tracing::debug!(%name, id, "session segment opened");
        Ok(Self {
            id,
            segment,
            request,
            response,
            table,
            liveness,
            timeout: config.timeout,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Requests to the server.
    pub fn request_wire(&self) -> &FramedWire {
        &self.request
    }

    /// Responses from the server.
    pub fn response_wire(&self) -> &FramedWire {
        &self.response
    }

    pub fn segment(&self) -> &Arc<SharedSegment> {
        &self.segment
    }

    pub fn server_alive(&self) -> bool {
        self.liveness.is_alive()
    }

    /// Start reading the result set the server published as `name`.
    pub fn open_result_set(&self, name: &str) -> Result<ResultSetReader> {
        ResultSetReader::open(self.table.clone(), name, self.liveness.clone(), self.timeout)
    }

    /// Tell the server's producers to stop on a result set we will not read.
    pub fn close_result_set(&self, name: &str) -> bool {
        self.table.close_named(name)
    }

    pub fn close(&self) {
        self.request.close();
        self.response.close();
    }
}
