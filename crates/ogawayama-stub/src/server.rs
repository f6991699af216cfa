//! Server side of the stub.
//!
//! [`Server::start`] publishes the database's server and connection segments
//! and runs a listener thread. The listener admits sessions in ticket order and
//! hands each one to a worker thread that owns the session segment and
//! forwards requests to the [`SqlEngine`]. Query rows are streamed through
//! result sets by one producer thread per query, so the worker keeps serving
//! the session's other requests while a client reads.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use ogawayama_transport::layout::{SERVER_SEGMENT_SIZE, SessionLayout};
use ogawayama_transport::{
    ConnectionQueue, PhaseKind, ResultSetWires, ResultSetWriter, SegmentKind, ServerSession,
    SharedSegment, TransportConfig, TransportError, server_segment_name,
};
use parking_lot::Mutex;

use crate::codec::{Codec, PostcardCodec};
use crate::engine::{EngineError, RecordStream, SqlEngine};
use crate::error::Result;
use crate::protocol::{ErrorCode, Request, Response, StatementId, TransactionId};

/// Default interval at which an idle session sweeps released result sets.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_millis(1_000);

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Database name; prefixes every segment name.
    pub database: String,
    pub transport: TransportConfig,
    /// How long a worker waits for a request before sweeping result sets.
    pub sweep_interval: Duration,
}

impl ServerConfig {
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            transport: TransportConfig::default(),
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }

    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}

struct SessionHandle {
    session: Arc<ServerSession>,
    thread: JoinHandle<()>,
}

struct Shared {
    config: ServerConfig,
    engine: Arc<dyn SqlEngine>,
    sessions: Mutex<HashMap<u64, SessionHandle>>,
}

/// A running server. Shuts down on drop.
pub struct Server {
    shared: Arc<Shared>,
    queue: Arc<ConnectionQueue>,
    listener: Option<JoinHandle<()>>,
    stopped: bool,
    // Last field: unlinked after everything else is torn down.
    _segment: SharedSegment,
}

impl Server {
    /// Publish the segments for `config.database` and start admitting sessions.
    pub fn start(config: ServerConfig, engine: Arc<dyn SqlEngine>) -> Result<Self> {
        config.transport.validate().map_err(TransportError::from)?;
        let db = config.database.clone();

        let segment = SharedSegment::create(
            &server_segment_name(&db),
            SERVER_SEGMENT_SIZE,
            SegmentKind::Server,
            SessionLayout::default(),
        )?;
        let queue = Arc::new(ConnectionQueue::create(&db, &config.transport)?);
        let shared = Arc::new(Shared {
            config,
            engine,
            sessions: Mutex::new(HashMap::new()),
        });

        let listener = {
            let queue = queue.clone();
            let shared = shared.clone();
            thread::Builder::new()
                .name(format!("ogawayama-listener-{db}"))
                .spawn(move || listen(queue, shared))
                .map_err(TransportError::Io)?
        };

        tracing::info!(database = %db, "server started");
        Ok(Self {
            shared,
            queue,
            listener: Some(listener),
            stopped: false,
            _segment: segment,
        })
    }

    pub fn database(&self) -> &str {
        &self.shared.config.database
    }

    /// Sessions with a running worker.
    pub fn active_sessions(&self) -> usize {
        self.shared.sessions.lock().len()
    }

    /// Stop admitting, close every session and wait for the workers.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if std::mem::replace(&mut self.stopped, true) {
            return;
        }
        self.queue.request_terminate();
        if let Some(listener) = self.listener.take()
            && listener.join().is_err()
        {
            tracing::error!("listener thread panicked");
        }

        let sessions: Vec<SessionHandle> = self
            .shared
            .sessions
            .lock()
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        for handle in &sessions {
            handle.session.close();
        }
        for handle in sessions {
            if handle.thread.join().is_err() {
                tracing::error!(session_id = handle.session.id(), "session worker panicked");
            }
        }
        tracing::info!(database = %self.shared.config.database, "server stopped");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

fn listen(queue: Arc<ConnectionQueue>, shared: Arc<Shared>) {
    let db = shared.config.database.clone();
    loop {
        let ticket = match queue.listen(true) {
            Ok(Some(ticket)) => ticket,
            Ok(None) => break,
            Err(e) => {
                tracing::error!(error = %e, "listener failed");
                break;
            }
        };

        // Accept even when the segment cannot be created: tickets are admitted
        // strictly in order, and the client then fails to open the segment.
        let session = ServerSession::create(&db, ticket, &shared.config.transport);
        if let Err(e) = queue.accept(ticket) {
            tracing::error!(session_id = ticket, error = %e, "accept failed");
            break;
        }
        let session = match session {
            Ok(session) => Arc::new(session),
            Err(e) => {
                tracing::error!(session_id = ticket, error = %e, "failed to create session segment");
                continue;
            }
        };

        let mut sessions = shared.sessions.lock();
        let worker = Worker::new(session.clone(), shared.clone());
        match thread::Builder::new()
            .name(format!("ogawayama-session-{ticket}"))
            .spawn(move || worker.run())
        {
            Ok(thread) => {
                sessions.insert(ticket, SessionHandle { session, thread });
            }
            Err(e) => {
                tracing::error!(session_id = ticket, error = %e, "failed to spawn session worker");
                session.close();
            }
        }
    }
    tracing::debug!(database = %db, "listener stopped");
}

struct Worker {
    session: Arc<ServerSession>,
    shared: Arc<Shared>,
    engine: Arc<dyn SqlEngine>,
    transactions: HashSet<TransactionId>,
    statements: HashSet<StatementId>,
    next_result_set: u64,
    producers: Vec<JoinHandle<()>>,
}

impl Worker {
    fn new(session: Arc<ServerSession>, shared: Arc<Shared>) -> Self {
        Self {
            engine: shared.engine.clone(),
            session,
            shared,
            transactions: HashSet::new(),
            statements: HashSet::new(),
            next_result_set: 0,
            producers: Vec::new(),
        }
    }

    fn id(&self) -> u64 {
        self.session.id()
    }

    fn run(mut self) {
        let session_id = self.id();
        tracing::info!(session_id, "session started");
        match self.serve() {
            Ok(()) => tracing::info!(session_id, "session ended"),
            Err(TransportError::Closed) => tracing::debug!(session_id, "session closed"),
            Err(TransportError::PeerFailure) => {
                tracing::warn!(session_id, "client is gone, dropping session")
            }
            Err(e) => tracing::error!(session_id, error = %e, "session aborted"),
        }

        // Producers blocked on a reader that went quiet fail with Closed.
        self.session.close();
        self.session.result_sets().close_all();
        self.join_producers(true);
        self.release_engine_state();
        self.session.result_sets().sweep();
        self.shared.sessions.lock().remove(&session_id);
    }

    /// Join finished producers, or all of them with `all`.
    fn join_producers(&mut self, all: bool) {
        let (done, running): (Vec<_>, Vec<_>) = self
            .producers
            .drain(..)
            .partition(|producer| all || producer.is_finished());
        self.producers = running;
        for producer in done {
            if producer.join().is_err() {
                tracing::error!(session_id = self.id(), "result set producer panicked");
            }
        }
    }

    fn serve(&mut self) -> Result<(), TransportError> {
        let sweep_interval = self.shared.config.sweep_interval;
        loop {
            let wire = self.session.request_wire();
            let Some(header) = wire.peek_for(sweep_interval)? else {
                self.join_producers(false);
                self.session.result_sets().sweep();
                continue;
            };
            let mut payload = vec![0u8; header.length as usize];
            wire.read(&mut payload)?;

            let request: Request = PostcardCodec::decode(&payload).map_err(|e| {
                TransportError::ProtocolViolation(format!("undecodable request: {e}"))
            })?;
            let disconnect = matches!(request, Request::Disconnect);
            self.handle(header.index, request)?;
            self.join_producers(false);
            self.session.result_sets().sweep();
            if disconnect {
                return Ok(());
            }
        }
    }

    fn handle(&mut self, index: u16, request: Request) -> Result<(), TransportError> {
        let session_id = self.id();
        tracing::trace!(session_id, index, verb = request.verb(), "request");

        let response = match request {
            Request::Connect { pid, label } => {
                tracing::info!(session_id, pid, %label, "client connected");
                Ok(Response::Connected { session_id })
            }
            Request::Disconnect => Ok(Response::Success),
            Request::Begin { read_only } => self.engine.begin(read_only).map(|transaction| {
                self.transactions.insert(transaction);
                Response::Begun { transaction }
            }),
            Request::Prepare { sql, placeholders } => {
                self.engine.prepare(&sql, &placeholders).map(|statement| {
                    self.statements.insert(statement);
                    Response::Prepared { statement }
                })
            }
            Request::ExecuteStatement { transaction, sql } => self
                .owned_transaction(transaction)
                .and_then(|()| self.engine.execute_statement(transaction, &sql))
                .map(|rows_affected| Response::Executed { rows_affected }),
            Request::ExecuteQuery { transaction, sql } => {
                let stream = self
                    .owned_transaction(transaction)
                    .and_then(|()| self.engine.execute_query(transaction, &sql));
                return self.stream_query(index, stream);
            }
            Request::ExecutePreparedStatement {
                transaction,
                statement,
                parameters,
            } => self
                .owned_transaction(transaction)
                .and_then(|()| self.owned_statement(statement))
                .and_then(|()| {
                    self.engine
                        .execute_prepared_statement(transaction, statement, &parameters)
                })
                .map(|rows_affected| Response::Executed { rows_affected }),
            Request::ExecutePreparedQuery {
                transaction,
                statement,
                parameters,
            } => {
                let stream = self
                    .owned_transaction(transaction)
                    .and_then(|()| self.owned_statement(statement))
                    .and_then(|()| {
                        self.engine
                            .execute_prepared_query(transaction, statement, &parameters)
                    });
                return self.stream_query(index, stream);
            }
            Request::Commit { transaction } => self
                .owned_transaction(transaction)
                .and_then(|()| self.engine.commit(transaction))
                .map(|()| Response::Success),
            Request::Rollback { transaction } => self
                .owned_transaction(transaction)
                .and_then(|()| self.engine.rollback(transaction))
                .map(|()| Response::Success),
            Request::DisposePreparedStatement { statement } => self
                .owned_statement(statement)
                .and_then(|()| self.engine.dispose_prepared_statement(statement))
                .map(|()| {
                    self.statements.remove(&statement);
                    Response::Success
                }),
            Request::DisposeTransaction { transaction } => self
                .owned_transaction(transaction)
                .and_then(|()| self.engine.dispose_transaction(transaction))
                .map(|()| {
                    self.transactions.remove(&transaction);
                    Response::Success
                }),
        };

        let response = response.unwrap_or_else(|e| Response::error(e.code, e.message));
        respond(&self.session, index, PhaseKind::Single, &response)
    }

    fn owned_transaction(&self, transaction: TransactionId) -> Result<(), EngineError> {
        if self.transactions.contains(&transaction) {
            Ok(())
        } else {
            Err(EngineError::not_found(format!("transaction {transaction}")))
        }
    }

    fn owned_statement(&self, statement: StatementId) -> Result<(), EngineError> {
        if self.statements.contains(&statement) {
            Ok(())
        } else {
            Err(EngineError::not_found(format!("statement {statement}")))
        }
    }

    /// Answer a query: head with the result-set name here, then rows and the
    /// body from a producer thread.
    fn stream_query(
        &mut self,
        index: u16,
        stream: Result<Box<dyn RecordStream>, EngineError>,
    ) -> Result<(), TransportError> {
        let session_id = self.id();
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                let response = Response::error(e.code, e.message);
                return respond(&self.session, index, PhaseKind::Single, &response);
            }
        };

        let name = format!("{session_id}-rs-{}", self.next_result_set);
        self.next_result_set += 1;
        let acquired = self
            .session
            .result_sets()
            .acquire(&name)
            .and_then(|wires| wires.acquire_writer().map(|writer| (wires, writer)));
        let (wires, writer) = match acquired {
            Ok(acquired) => acquired,
            Err(e) if e.is_exhausted() => {
                tracing::warn!(session_id, "out of result set wires");
                let response = Response::error(ErrorCode::ResourceExhausted, e.to_string());
                return respond(&self.session, index, PhaseKind::Single, &response);
            }
            Err(e) => return Err(e),
        };

        let head = Response::QueryHead {
            result_set: name.clone(),
            columns: stream.columns().to_vec(),
        };
        respond(&self.session, index, PhaseKind::Head, &head)?;

        let producer = Producer {
            session: self.session.clone(),
            index,
            wires,
            writer,
            stream,
        };
        match thread::Builder::new()
            .name(format!("ogawayama-rs-{name}"))
            .spawn(move || producer.run())
        {
            Ok(handle) => {
                self.producers.push(handle);
                Ok(())
            }
            Err(e) => {
                // The closure was dropped with the writer, ending its wire.
                tracing::error!(session_id, %name, error = %e, "failed to spawn result set producer");
                let body = Response::error(ErrorCode::Internal, e.to_string());
                respond(&self.session, index, PhaseKind::Body, &body)
            }
        }
    }

    /// Roll back and dispose whatever the client left behind.
    fn release_engine_state(&mut self) {
        let session_id = self.id();
        for transaction in self.transactions.drain() {
            if let Err(e) = self.engine.rollback(transaction) {
                tracing::debug!(session_id, transaction, error = %e, "rollback on teardown failed");
            }
            if let Err(e) = self.engine.dispose_transaction(transaction) {
                tracing::warn!(session_id, transaction, error = %e, "failed to dispose transaction");
            }
        }
        for statement in self.statements.drain() {
            if let Err(e) = self.engine.dispose_prepared_statement(statement) {
                tracing::warn!(session_id, statement, error = %e, "failed to dispose statement");
            }
        }
    }
}

fn respond(
    session: &ServerSession,
    index: u16,
    kind: PhaseKind,
    response: &Response,
) -> Result<(), TransportError> {
    let encoded = PostcardCodec::encode(response)
        .map_err(|e| TransportError::ProtocolViolation(format!("unencodable response: {e}")))?;
    session.response_wire().write_with_kind(&encoded, index, kind)
}

/// Streams the rows of one query, then answers the query's body phase.
struct Producer {
    session: Arc<ServerSession>,
    index: u16,
    wires: ResultSetWires,
    writer: ResultSetWriter,
    stream: Box<dyn RecordStream>,
}

impl Producer {
    fn run(mut self) {
        let session_id = self.session.id();
        let name = self.wires.name().to_owned();
        let status = self.stream_rows();
        if let Response::QueryDone { rows } = &status {
            tracing::debug!(session_id, %name, rows, "query streamed");
        }

        // Release before answering: the client closes the result set once it
        // sees the body, and only then can a sweep reclaim it.
        let Self {
            session,
            index,
            wires,
            writer,
            ..
        } = self;
        drop(writer);
        wires.release();
        match respond(&session, index, PhaseKind::Body, &status) {
            Ok(()) => {}
            Err(TransportError::Closed | TransportError::PeerFailure) => {
                tracing::debug!(session_id, %name, "session ended before the query body");
            }
            Err(e) => tracing::warn!(session_id, %name, error = %e, "failed to send query body"),
        }
    }

    fn stream_rows(&mut self) -> Response {
        let session_id = self.session.id();
        let mut rows = 0u64;
        loop {
            let row = match self.stream.next_row() {
                Ok(Some(row)) => row,
                Ok(None) => return Response::QueryDone { rows },
                Err(e) => return Response::error(e.code, e.message),
            };
            let encoded = match PostcardCodec::encode(&row) {
                Ok(encoded) => encoded,
                Err(e) => return Response::error(ErrorCode::Internal, e.to_string()),
            };
            match self.writer.write(&encoded).and_then(|()| self.writer.commit()) {
                Ok(()) => rows += 1,
                Err(TransportError::Closed) => {
                    tracing::debug!(session_id, rows, "client closed result set early");
                    return Response::QueryDone { rows };
                }
                Err(TransportError::MessageTooLarge { len, max }) => {
                    return Response::error(
                        ErrorCode::ResourceExhausted,
                        format!("row of {len} bytes exceeds the result set limit of {max}"),
                    );
                }
                Err(e) => {
                    tracing::warn!(session_id, error = %e, "result set stream failed");
                    return Response::error(ErrorCode::Internal, e.to_string());
                }
            }
        }
    }
}
