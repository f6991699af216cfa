//! Client side of the stub.
//!
//! A [`Connection`] is one admitted session. Requests from any thread share
//! the request wire; each carries the index of a claimed response slot, and a
//! demultiplexer thread routes response frames back into those slots. Queries
//! hand back a [`ResultSet`] that reads rows straight out of the session
//! segment.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use ogawayama_transport::{
    ClientSession, ConnectionQueue, ResponseSlotTable, ResultSetReader, SlotFailure, SlotIndex,
    TransportConfig, TransportError,
};
use parking_lot::Mutex;

use crate::codec::{Codec, PostcardCodec};
use crate::error::{Result, StubError};
use crate::protocol::{Request, Response, StatementId, TransactionId};
use crate::value::{Column, Parameter, Placeholder, Row};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct StatementKey {
    sql: String,
    placeholders: Vec<Placeholder>,
}

struct Inner {
    session: ClientSession,
    slots: ResponseSlotTable,
    config: TransportConfig,
    statements: Mutex<HashMap<StatementKey, StatementId>>,
}

impl Inner {
    /// Claim a slot and put `request` on the request wire.
    fn send(&self, request: &Request) -> Result<SlotIndex> {
        let slot = self.slots.claim_wait(self.config.timeout)?;
        let sent = PostcardCodec::encode(request)
            .map_err(StubError::from)
            .and_then(|encoded| {
                self.session
                    .request_wire()
                    .write(&encoded, slot.get())
                    .map_err(StubError::from)
            });
        if let Err(e) = sent {
            if let Err(release) = self.slots.release(slot) {
                tracing::warn!(slot = slot.get(), error = %release, "failed to free unsent request slot");
            }
            return Err(e);
        }
        tracing::trace!(session_id = self.session.id(), slot = slot.get(), verb = request.verb(), "request sent");
        Ok(slot)
    }

    /// Next phase of the response in `slot`. Server errors become [`StubError::Server`].
    fn receive(&self, slot: SlotIndex) -> Result<Response> {
        let bytes = self.slots.consume(slot)?;
        match PostcardCodec::decode(&bytes)? {
            Response::Error { code, message } => Err(StubError::Server { code, message }),
            response => Ok(response),
        }
    }

    fn call(&self, request: &Request) -> Result<Response> {
        let slot = self.send(request)?;
        self.receive(slot)
    }

    /// A verb answered with a plain acknowledgement.
    fn acknowledge(&self, request: &Request) -> Result<()> {
        match self.call(request)? {
            Response::Success => Ok(()),
            other => Err(unexpected(request.verb(), other)),
        }
    }

    fn rows_affected(&self, request: &Request) -> Result<u64> {
        match self.call(request)? {
            Response::Executed { rows_affected } => Ok(rows_affected),
            other => Err(unexpected(request.verb(), other)),
        }
    }

    /// Send a query and open the result set its head names.
    fn query(&self, request: &Request) -> Result<ResultSet<'_>> {
        let slot = self.send(request)?;
        let (name, columns) = match self.receive(slot) {
            Ok(Response::QueryHead {
                result_set,
                columns,
            }) => (result_set, columns),
            Ok(other) => {
                // A body may still be owed; the slot is freed when it lands.
                self.slots.abandon(slot);
                return Err(unexpected(request.verb(), other));
            }
            Err(e) => {
                // Unreadable head: as above. A no-op once the slot was freed.
                self.slots.abandon(slot);
                return Err(e);
            }
        };

        match self.session.open_result_set(&name) {
            Ok(reader) => Ok(ResultSet {
                inner: self,
                reader,
                columns,
                slot: Some(slot),
                rows_read: 0,
                status: None,
            }),
            Err(e) => {
                // Stop the producers so the server sends the body and can
                // sweep the entry.
                if !self.session.close_result_set(&name) {
                    tracing::warn!(%name, "result set to close was not found");
                }
                self.slots.abandon(slot);
                tracing::warn!(%name, error = %e, "failed to open result set");
                Err(e.into())
            }
        }
    }
}

fn unexpected(verb: &'static str, response: Response) -> StubError {
    StubError::Unexpected {
        verb,
        response: format!("{response:?}"),
    }
}

/// Routes response frames into their slots until the session ends.
fn demultiplex(inner: Arc<Inner>) {
    let session_id = inner.session.id();
    let failure = loop {
        let (header, payload) = match inner.session.response_wire().read_message(true) {
            Ok(Some(message)) => message,
            Ok(None) => continue,
            Err(TransportError::Closed) => break SlotFailure::Closed,
            Err(TransportError::PeerFailure) => break SlotFailure::PeerFailure,
            Err(e) => {
                tracing::error!(session_id, error = %e, "response wire failed");
                break SlotFailure::ProtocolViolation;
            }
        };
        if let Err(e) = inner
            .slots
            .note_arrival(header.index, header.kind, Bytes::from(payload))
        {
            tracing::error!(session_id, error = %e, "undeliverable response");
            inner.session.close();
            break SlotFailure::ProtocolViolation;
        }
    };
    tracing::debug!(session_id, ?failure, "demultiplexer stopped");
    inner.slots.fail_all(failure);
}

/// A client session with the server of one database.
pub struct Connection {
    inner: Arc<Inner>,
    demux: Option<JoinHandle<()>>,
    closed: bool,
}

impl Connection {
    /// Ask the server of `db` for a session and wait until it is admitted.
    pub fn connect(db: &str, config: &TransportConfig) -> Result<Self> {
        Self::connect_with_label(db, config, format!("pid-{}", std::process::id()))
    }

    /// Like [`Connection::connect`], announcing `label` to the server's logs.
    pub fn connect_with_label(
        db: &str,
        config: &TransportConfig,
        label: impl Into<String>,
    ) -> Result<Self> {
        config.validate().map_err(TransportError::from)?;
        let queue = ConnectionQueue::open(db, config)?;
        let ticket = queue.request()?;
        queue.check(ticket, true)?;
        let session = ClientSession::open(db, ticket, config)?;

        let inner = Arc::new(Inner {
            session,
            slots: ResponseSlotTable::new(config.response_slots, config.timeout),
            config: config.clone(),
            statements: Mutex::new(HashMap::new()),
        });
        let demux = {
            let inner = inner.clone();
            thread::Builder::new()
                .name(format!("ogawayama-demux-{ticket}"))
                .spawn(move || demultiplex(inner))
                .map_err(TransportError::Io)?
        };
        let mut connection = Self {
            inner,
            demux: Some(demux),
            closed: false,
        };

        let request = Request::Connect {
            pid: std::process::id(),
            label: label.into(),
        };
        match connection.inner.call(&request)? {
            Response::Connected { session_id } if session_id == ticket => {}
            other => {
                connection.shutdown();
                return Err(unexpected(request.verb(), other));
            }
        }
        tracing::info!(database = db, session_id = ticket, "connected");
        Ok(connection)
    }

    pub fn session_id(&self) -> u64 {
        self.inner.session.id()
    }

    pub fn is_server_alive(&self) -> bool {
        self.inner.session.server_alive()
    }

    pub fn begin(&self) -> Result<Transaction<'_>> {
        self.begin_with(false)
    }

    pub fn begin_read_only(&self) -> Result<Transaction<'_>> {
        self.begin_with(true)
    }

    fn begin_with(&self, read_only: bool) -> Result<Transaction<'_>> {
        let request = Request::Begin { read_only };
        match self.inner.call(&request)? {
            Response::Begun { transaction } => Ok(Transaction {
                inner: &self.inner,
                id: transaction,
                finished: false,
            }),
            other => Err(unexpected(request.verb(), other)),
        }
    }

    /// Prepare `sql`, reusing the statement when the same text and
    /// placeholders were prepared before on this connection.
    pub fn prepare(&self, sql: &str, placeholders: &[Placeholder]) -> Result<PreparedStatement> {
        let key = StatementKey {
            sql: sql.to_owned(),
            placeholders: placeholders.to_vec(),
        };
        if let Some(&id) = self.inner.statements.lock().get(&key) {
            return Ok(PreparedStatement { id, key });
        }

        let request = Request::Prepare {
            sql: key.sql.clone(),
            placeholders: key.placeholders.clone(),
        };
        let id = match self.inner.call(&request)? {
            Response::Prepared { statement } => statement,
            other => return Err(unexpected(request.verb(), other)),
        };

        let mut statements = self.inner.statements.lock();
        if let Some(&cached) = statements.get(&key) {
            // Another thread prepared the same statement meanwhile.
            drop(statements);
            if let Err(e) = self
                .inner
                .acknowledge(&Request::DisposePreparedStatement { statement: id })
            {
                tracing::debug!(statement = id, error = %e, "failed to dispose duplicate statement");
            }
            return Ok(PreparedStatement { id: cached, key });
        }
        statements.insert(key.clone(), id);
        Ok(PreparedStatement { id, key })
    }

    /// Dispose a prepared statement and drop it from the cache.
    pub fn dispose_prepared(&self, statement: &PreparedStatement) -> Result<()> {
        {
            let mut statements = self.inner.statements.lock();
            if statements.get(&statement.key) == Some(&statement.id) {
                statements.remove(&statement.key);
            }
        }
        self.inner.acknowledge(&Request::DisposePreparedStatement {
            statement: statement.id,
        })
    }

    /// Prepared statements held by the cache.
    pub fn cached_statements(&self) -> usize {
        self.inner.statements.lock().len()
    }

    /// Dispose cached statements, say goodbye and tear down the session.
    pub fn close(mut self) -> Result<()> {
        self.close_session()
    }

    fn close_session(&mut self) -> Result<()> {
        if std::mem::replace(&mut self.closed, true) {
            return Ok(());
        }
        let statements: Vec<StatementId> =
            self.inner.statements.lock().drain().map(|(_, id)| id).collect();
        let mut outcome = Ok(());
        for statement in statements {
            if let Err(e) = self
                .inner
                .acknowledge(&Request::DisposePreparedStatement { statement })
            {
                tracing::debug!(statement, error = %e, "failed to dispose statement on close");
                if e.is_server_gone() {
                    break;
                }
            }
        }
        if let Err(e) = self.inner.acknowledge(&Request::Disconnect) {
            outcome = Err(e);
        }
        self.shutdown();
        tracing::info!(session_id = self.session_id(), "disconnected");
        outcome
    }

    fn shutdown(&mut self) {
        self.closed = true;
        self.inner.session.close();
        if let Some(demux) = self.demux.take()
            && demux.join().is_err()
        {
            tracing::error!(session_id = self.session_id(), "demultiplexer panicked");
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Err(e) = self.close_session() {
            tracing::warn!(session_id = self.session_id(), error = %e, "unclean disconnect");
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("session_id", &self.session_id())
            .field("slots", &self.inner.slots)
            .field("closed", &self.closed)
            .finish()
    }
}

/// Handle on a statement prepared on the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedStatement {
    id: StatementId,
    key: StatementKey,
}

impl PreparedStatement {
    pub fn id(&self) -> StatementId {
        self.id
    }

    pub fn sql(&self) -> &str {
        &self.key.sql
    }

    pub fn placeholders(&self) -> &[Placeholder] {
        &self.key.placeholders
    }
}

/// An open transaction. Rolled back if dropped without commit or rollback.
pub struct Transaction<'c> {
    inner: &'c Inner,
    id: TransactionId,
    finished: bool,
}

impl<'c> Transaction<'c> {
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Run a statement; returns the number of affected rows.
    pub fn execute_statement(&self, sql: &str) -> Result<u64> {
        self.inner.rows_affected(&Request::ExecuteStatement {
            transaction: self.id,
            sql: sql.to_owned(),
        })
    }

    pub fn execute_query(&self, sql: &str) -> Result<ResultSet<'c>> {
        self.inner.query(&Request::ExecuteQuery {
            transaction: self.id,
            sql: sql.to_owned(),
        })
    }

    pub fn execute_prepared_statement(
        &self,
        statement: &PreparedStatement,
        parameters: &[Parameter],
    ) -> Result<u64> {
        self.inner.rows_affected(&Request::ExecutePreparedStatement {
            transaction: self.id,
            statement: statement.id,
            parameters: parameters.to_vec(),
        })
    }

    pub fn execute_prepared_query(
        &self,
        statement: &PreparedStatement,
        parameters: &[Parameter],
    ) -> Result<ResultSet<'c>> {
        self.inner.query(&Request::ExecutePreparedQuery {
            transaction: self.id,
            statement: statement.id,
            parameters: parameters.to_vec(),
        })
    }

    pub fn commit(mut self) -> Result<()> {
        self.finished = true;
        let committed = self.inner.acknowledge(&Request::Commit {
            transaction: self.id,
        });
        let disposed = self.dispose();
        committed.and(disposed)
    }

    pub fn rollback(mut self) -> Result<()> {
        self.finished = true;
        let rolled_back = self.inner.acknowledge(&Request::Rollback {
            transaction: self.id,
        });
        let disposed = self.dispose();
        rolled_back.and(disposed)
    }

    fn dispose(&self) -> Result<()> {
        self.inner.acknowledge(&Request::DisposeTransaction {
            transaction: self.id,
        })
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let rolled_back = self
            .inner
            .acknowledge(&Request::Rollback {
                transaction: self.id,
            })
            .and_then(|()| self.dispose());
        if let Err(e) = rolled_back {
            tracing::warn!(transaction = self.id, error = %e, "implicit rollback failed");
        }
    }
}

impl std::fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("finished", &self.finished)
            .finish()
    }
}

/// Rows of a query, read from the session's result set.
///
/// Dropping it before the end tells the server to stop streaming.
pub struct ResultSet<'c> {
    inner: &'c Inner,
    reader: ResultSetReader,
    columns: Vec<Column>,
    /// Slot still owed the query's body phase.
    slot: Option<SlotIndex>,
    rows_read: u64,
    /// Row count reported by the server once the body arrived.
    status: Option<u64>,
}

impl ResultSet<'_> {
    pub fn name(&self) -> &str {
        self.reader.name()
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn rows_read(&self) -> u64 {
        self.rows_read
    }

    /// Next row, `None` after the last one.
    ///
    /// Reaching the end collects the server's final status, so a query that
    /// failed midway reports its error here.
    pub fn next_row(&mut self) -> Result<Option<Row>> {
        if self.slot.is_none() {
            return Ok(None);
        }
        loop {
            let Some(handle) = self.reader.search(true)? else {
                self.finish()?;
                return Ok(None);
            };
            let decoded = match self.reader.get_chunk(handle, false)? {
                Some(chunk) if !chunk.is_empty() => PostcardCodec::decode::<Row>(chunk),
                _ => continue,
            };
            self.reader.dispose(handle);
            self.rows_read += 1;
            return Ok(Some(decoded?));
        }
    }

    /// Stop reading and wait for the server's final status.
    ///
    /// Returns the number of rows the server streamed.
    pub fn close(mut self) -> Result<u64> {
        self.finish()
    }

    fn finish(&mut self) -> Result<u64> {
        let Some(slot) = self.slot.take() else {
            return Ok(self.status.unwrap_or(self.rows_read));
        };
        self.reader.set_closed();
        match self.inner.receive(slot)? {
            Response::QueryDone { rows } => {
                self.status = Some(rows);
                Ok(rows)
            }
            other => Err(unexpected("execute_query", other)),
        }
    }
}

impl Iterator for ResultSet<'_> {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_row().transpose()
    }
}

impl Drop for ResultSet<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            tracing::debug!(name = self.reader.name(), error = %e, "result set closed with error");
        }
    }
}

impl std::fmt::Debug for ResultSet<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultSet")
            .field("name", &self.reader.name())
            .field("columns", &self.columns)
            .field("rows_read", &self.rows_read)
            .finish()
    }
}
