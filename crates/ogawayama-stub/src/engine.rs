//! The SQL engine behind the server.
//!
//! The stub does not execute SQL itself; a server is started with an
//! implementation of [`SqlEngine`] and forwards every verb to it.

use crate::protocol::{ErrorCode, StatementId, TransactionId};
use crate::value::{Column, Parameter, Placeholder, Row};

/// Failure reported by the engine. Sent back to the client as-is.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code:?}: {message}")]
pub struct EngineError {
    pub code: ErrorCode,
    pub message: String,
}

impl EngineError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn not_found(what: impl std::fmt::Display) -> Self {
        Self::new(ErrorCode::NotFound, format!("{what} not found"))
    }
}

/// Rows of one query, pulled by the session worker.
pub trait RecordStream: Send {
    fn columns(&self) -> &[Column];

    /// Next row, `None` once exhausted.
    fn next_row(&mut self) -> Result<Option<Row>, EngineError>;
}

/// Rows already materialized in memory.
pub struct VecRecordStream {
    columns: Vec<Column>,
    rows: std::vec::IntoIter<Row>,
}

impl VecRecordStream {
    pub fn new(columns: Vec<Column>, rows: Vec<Row>) -> Self {
        Self {
            columns,
            rows: rows.into_iter(),
        }
    }
}

impl RecordStream for VecRecordStream {
    fn columns(&self) -> &[Column] {
        &self.columns
    }

    fn next_row(&mut self) -> Result<Option<Row>, EngineError> {
        Ok(self.rows.next())
    }
}

/// A SQL engine shared by every session of a server.
pub trait SqlEngine: Send + Sync + 'static {
    fn begin(&self, read_only: bool) -> Result<TransactionId, EngineError>;

    fn prepare(&self, sql: &str, placeholders: &[Placeholder]) -> Result<StatementId, EngineError>;

    /// Run a statement, returning the number of affected rows.
    fn execute_statement(&self, transaction: TransactionId, sql: &str)
    -> Result<u64, EngineError>;

    fn execute_query(
        &self,
        transaction: TransactionId,
        sql: &str,
    ) -> Result<Box<dyn RecordStream>, EngineError>;

    fn execute_prepared_statement(
        &self,
        transaction: TransactionId,
        statement: StatementId,
        parameters: &[Parameter],
    ) -> Result<u64, EngineError>;

    fn execute_prepared_query(
        &self,
        transaction: TransactionId,
        statement: StatementId,
        parameters: &[Parameter],
    ) -> Result<Box<dyn RecordStream>, EngineError>;

    fn commit(&self, transaction: TransactionId) -> Result<(), EngineError>;

    fn rollback(&self, transaction: TransactionId) -> Result<(), EngineError>;

    fn dispose_prepared_statement(&self, statement: StatementId) -> Result<(), EngineError>;

    fn dispose_transaction(&self, transaction: TransactionId) -> Result<(), EngineError>;
}
