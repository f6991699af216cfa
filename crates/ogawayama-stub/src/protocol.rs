//! Request and response envelopes.
//!
//! Every request travels as one frame on the request wire, tagged with the
//! client's response slot. Queries answer in two phases on the response wire:
//! the head names the result set and its columns, the body carries the final
//! status once every row was streamed. All other verbs answer in one phase.

use serde::{Deserialize, Serialize};

use crate::value::{Column, Parameter, Placeholder};

/// Server-side transaction handle.
pub type TransactionId = u64;

/// Server-side prepared statement handle.
pub type StatementId = u64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    Connect {
        pid: u32,
        label: String,
    },
    Disconnect,
    Begin {
        read_only: bool,
    },
    Prepare {
        sql: String,
        placeholders: Vec<Placeholder>,
    },
    ExecuteStatement {
        transaction: TransactionId,
        sql: String,
    },
    ExecuteQuery {
        transaction: TransactionId,
        sql: String,
    },
    ExecutePreparedStatement {
        transaction: TransactionId,
        statement: StatementId,
        parameters: Vec<Parameter>,
    },
    ExecutePreparedQuery {
        transaction: TransactionId,
        statement: StatementId,
        parameters: Vec<Parameter>,
    },
    Commit {
        transaction: TransactionId,
    },
    Rollback {
        transaction: TransactionId,
    },
    DisposePreparedStatement {
        statement: StatementId,
    },
    DisposeTransaction {
        transaction: TransactionId,
    },
}

impl Request {
    /// Verb name, for logs and error messages.
    pub fn verb(&self) -> &'static str {
        match self {
            Request::Connect { .. } => "connect",
            Request::Disconnect => "disconnect",
            Request::Begin { .. } => "begin",
            Request::Prepare { .. } => "prepare",
            Request::ExecuteStatement { .. } => "execute_statement",
            Request::ExecuteQuery { .. } => "execute_query",
            Request::ExecutePreparedStatement { .. } => "execute_prepared_statement",
            Request::ExecutePreparedQuery { .. } => "execute_prepared_query",
            Request::Commit { .. } => "commit",
            Request::Rollback { .. } => "rollback",
            Request::DisposePreparedStatement { .. } => "dispose_prepared_statement",
            Request::DisposeTransaction { .. } => "dispose_transaction",
        }
    }

    /// Whether the response comes in two phases.
    pub fn is_query(&self) -> bool {
        matches!(
            self,
            Request::ExecuteQuery { .. } | Request::ExecutePreparedQuery { .. }
        )
    }
}

/// Category of a server-reported failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// SQL text the engine could not parse.
    Syntax,
    /// Unknown table, transaction or statement.
    NotFound,
    /// Parameter or value of the wrong type.
    TypeMismatch,
    /// Serialization conflict; the transaction was aborted.
    Conflict,
    /// Verb not valid in the current state (e.g. write in a read-only transaction).
    InvalidState,
    /// Out of result-set wires or another bounded resource.
    ResourceExhausted,
    /// Anything else.
    Internal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Connected {
        session_id: u64,
    },
    Begun {
        transaction: TransactionId,
    },
    Prepared {
        statement: StatementId,
    },
    Executed {
        rows_affected: u64,
    },
    /// First phase of a query.
    QueryHead {
        result_set: String,
        columns: Vec<Column>,
    },
    /// Second phase of a query.
    QueryDone {
        rows: u64,
    },
    /// Acknowledges disconnect, commit, rollback and disposals.
    Success,
    Error {
        code: ErrorCode,
        message: String,
    },
}

impl Response {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Response::Error {
            code,
            message: message.into(),
        }
    }
}
