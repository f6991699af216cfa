//! Session admission.
//!
//! Clients take a ticket with [`ConnectionQueue::request`] and wait in
//! [`ConnectionQueue::check`]. The server's listener picks tickets up in
//! order with [`ConnectionQueue::listen`], creates the session segment for
//! the ticket, then calls [`ConnectionQueue::accept`]. The ticket doubles as
//! the session id.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use shm_primitives::Waiter;

use crate::config::TransportConfig;
use crate::error::{Result, TransportError};
use crate::layout::{
    CONNECTION_QUEUE_OFFSET, CONNECTION_SEGMENT_SIZE, ConnectionQueueHeader, SegmentKind,
    SessionLayout,
};
use crate::liveness::{Liveness, SegmentLiveness, wait_while_alive};
use crate::segment::{SharedSegment, connection_segment_name};

/// Admission counters shared by the server and all clients of one database.
pub struct ConnectionQueue {
    segment: SharedSegment,
    liveness: Arc<dyn Liveness>,
    timeout: Duration,
}

impl ConnectionQueue {
    /// Create the queue for `db`. Server side.
    pub fn create(db: &str, config: &TransportConfig) -> Result<Self> {
        let name = connection_segment_name(db);
        let segment = SharedSegment::create(
            &name,
            CONNECTION_SEGMENT_SIZE,
            SegmentKind::Connection,
            SessionLayout::default(),
        )?;
        // SAFETY: fresh segment, nobody else has mapped it yet.
        unsafe { (*(segment_ptr(&segment))).init() };
        tracing::info!(%name, "connection queue created");
        Ok(Self {
            segment,
            liveness: Arc::new(crate::liveness::AlwaysAlive),
            timeout: config.timeout,
        })
    }

    /// Open the queue of a running server. Client side.
    pub fn open(db: &str, config: &TransportConfig) -> Result<Self> {
        let name = connection_segment_name(db);
        let segment = SharedSegment::open(&name, SegmentKind::Connection)?;
        if segment.len() < CONNECTION_SEGMENT_SIZE {
            return Err(crate::layout::LayoutError::SegmentTooSmall {
                required: CONNECTION_SEGMENT_SIZE,
                found: segment.len(),
            }
            .into());
        }
        Ok(Self {
            segment,
            liveness: Arc::new(SegmentLiveness::new(name)),
            timeout: config.timeout,
        })
    }

    fn header(&self) -> &ConnectionQueueHeader {
        // SAFETY: create/open checked the segment holds the queue header.
        unsafe { &*segment_ptr(&self.segment) }
    }

    pub fn requested(&self) -> u64 {
        self.header().requested.load(Ordering::Acquire)
    }

    pub fn accepted(&self) -> u64 {
        self.header().accepted.load(Ordering::Acquire)
    }

    pub fn is_terminated(&self) -> bool {
        self.header().terminate.load(Ordering::Acquire) != 0
    }

    /// Take the next ticket. Tickets start at 1.
    pub fn request(&self) -> Result<u64> {
        if self.is_terminated() {
            return Err(TransportError::Closed);
        }
        let ticket = self.header().requested.fetch_add(1, Ordering::AcqRel) + 1;
        Waiter::new(&self.header().request_futex).notify();
        tracing::debug!(ticket, "session requested");
        Ok(ticket)
    }

    fn pending(&self) -> Option<u64> {
        let accepted = self.accepted();
        (self.requested() > accepted).then_some(accepted + 1)
    }

    /// Next ticket to admit.
    ///
    /// `None` when nothing is pending and `wait` is false, or once the queue
    /// is terminated.
    pub fn listen(&self, wait: bool) -> Result<Option<u64>> {
        let header = self.header();
        loop {
            let woke = Waiter::new(&header.request_futex).wait_for(
                if wait { self.timeout } else { Duration::ZERO },
                || self.is_terminated() || self.pending().is_some(),
            );
            if self.is_terminated() {
                return Ok(None);
            }
            if woke && let Some(ticket) = self.pending() {
                return Ok(Some(ticket));
            }
            if !wait {
                return Ok(None);
            }
            tracing::trace!("listener idle");
        }
    }

    /// Admit `ticket`. Tickets must be accepted in order and only once requested.
    pub fn accept(&self, ticket: u64) -> Result<()> {
        let header = self.header();
        let requested = header.requested.load(Ordering::Acquire);
        if ticket == 0 || ticket > requested {
            return Err(TransportError::violation(format!(
                "accept of ticket {ticket} with {requested} requested"
            )));
        }
        header
            .accepted
            .compare_exchange(ticket - 1, ticket, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|accepted| {
                TransportError::violation(format!(
                    "accept of ticket {ticket} out of order, {accepted} already accepted"
                ))
            })?;
        Waiter::new(&header.accept_futex).notify();
        tracing::info!(ticket, "session accepted");
        Ok(())
    }

    /// Whether `ticket` was admitted, optionally waiting for it.
    pub fn check(&self, ticket: u64, wait: bool) -> Result<bool> {
        let header = self.header();
        let poll = || -> Result<Option<bool>> {
            if header.accepted.load(Ordering::Acquire) >= ticket {
                return Ok(Some(true));
            }
            if self.is_terminated() {
                return Err(TransportError::Closed);
            }
            Ok(None)
        };
        if !wait {
            return Ok(poll()?.unwrap_or(false));
        }
        wait_while_alive(
            Waiter::new(&header.accept_futex),
            self.timeout,
            self.liveness.as_ref(),
            "session admission",
            poll,
        )
    }

    /// Stop the listener and fail every waiting client.
    pub fn request_terminate(&self) {
        let header = self.header();
        header.terminate.store(1, Ordering::Release);
        Waiter::new(&header.request_futex).notify();
        Waiter::new(&header.accept_futex).notify();
        tracing::info!("connection queue terminated");
    }

    pub fn segment(&self) -> &SharedSegment {
        &self.segment
    }
}

fn segment_ptr(segment: &SharedSegment) -> *mut ConnectionQueueHeader {
    use shm_primitives::MappedRegion;
    segment
        .region()
        .ptr::<ConnectionQueueHeader>(CONNECTION_QUEUE_OFFSET)
}

impl std::fmt::Debug for ConnectionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionQueue")
            .field("segment", &self.segment.name())
            .field("requested", &self.requested())
            .field("accepted", &self.accepted())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::thread;

    fn unique_db() -> String {
        static NEXT: AtomicU32 = AtomicU32::new(0);
        format!(
            "ogw-conn-{}-{}",
            std::process::id(),
            NEXT.fetch_add(1, Ordering::Relaxed)
        )
    }

    fn config() -> TransportConfig {
        TransportConfig::default().with_timeout(Duration::from_millis(20))
    }

    #[test]
    fn tickets_are_admitted_in_order() {
        let db = unique_db();
        let server = ConnectionQueue::create(&db, &config()).unwrap();
        let client = ConnectionQueue::open(&db, &config()).unwrap();

        assert_eq!(server.listen(false).unwrap(), None);
        let first = client.request().unwrap();
        let second = client.request().unwrap();
        assert_eq!((first, second), (1, 2));

        assert_eq!(server.listen(false).unwrap(), Some(1));
        assert!(!client.check(first, false).unwrap());
        server.accept(1).unwrap();
        assert!(client.check(first, false).unwrap());
        assert_eq!(server.listen(true).unwrap(), Some(2));
    }

    #[test]
    fn out_of_order_accept_is_a_violation() {
        let db = unique_db();
        let server = ConnectionQueue::create(&db, &config()).unwrap();
        for _ in 0..3 {
            server.request().unwrap();
        }
        assert!(matches!(
            server.accept(2),
            Err(TransportError::ProtocolViolation(_))
        ));
        assert!(matches!(
            server.accept(4),
            Err(TransportError::ProtocolViolation(_))
        ));
        server.accept(1).unwrap();
        assert!(matches!(
            server.accept(1),
            Err(TransportError::ProtocolViolation(_))
        ));
        assert_eq!(server.accepted(), 1);
    }

    #[test]
    fn blocked_check_wakes_on_accept() {
        let db = unique_db();
        let server = ConnectionQueue::create(&db, &config()).unwrap();
        let client = ConnectionQueue::open(&db, &config()).unwrap();
        let ticket = client.request().unwrap();

        thread::scope(|s| {
            let waiting = s.spawn(|| client.check(ticket, true));
            let pending = server.listen(true).unwrap().unwrap();
            thread::sleep(Duration::from_millis(30));
            server.accept(pending).unwrap();
            assert!(waiting.join().unwrap().unwrap());
        });
    }

    #[test]
    fn terminate_stops_listener_and_waiting_clients() {
        let db = unique_db();
        let server = ConnectionQueue::create(&db, &config()).unwrap();
        let client = ConnectionQueue::open(&db, &config()).unwrap();
        let ticket = client.request().unwrap();

        thread::scope(|s| {
            let waiting = s.spawn(|| client.check(ticket + 1, true));
            thread::sleep(Duration::from_millis(30));
            server.request_terminate();
            assert!(matches!(
                waiting.join().unwrap(),
                Err(TransportError::Closed)
            ));
        });
        assert_eq!(server.listen(true).unwrap(), None);
        assert!(matches!(client.request(), Err(TransportError::Closed)));
    }

    #[test]
    fn client_sees_server_failure() {
        let db = unique_db();
        let server = ConnectionQueue::create(&db, &config()).unwrap();
        let client = ConnectionQueue::open(&db, &config()).unwrap();
        let ticket = client.request().unwrap();
        drop(server);
        assert!(matches!(
            client.check(ticket, true),
            Err(TransportError::PeerFailure)
        ));
    }
}
