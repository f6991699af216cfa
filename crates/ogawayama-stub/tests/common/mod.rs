//! A toy engine over one in-memory table `items(id INT8, name TEXT)`.
//!
//! Statements understood:
//! - `INSERT <id> <name>`
//! - `DELETE`
//! - `SELECT` (committed rows plus the transaction's own changes, by id)
//! - `SELECT RANGE <from> <to>` (generated rows, no table access)
//!
//! Prepared statements: `INSERT` with placeholders `id`/`name`, and
//! `SELECT BY ID` with placeholder `id`.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use ogawayama_stub::{
    Column, ColumnType, EngineError, ErrorCode, Parameter, Placeholder, RecordStream, Row,
    ServerConfig, SqlEngine, StatementId, TransactionId, TransportConfig, Value, VecRecordStream,
};
use parking_lot::Mutex;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

pub fn unique_db(tag: &str) -> String {
    static NEXT: AtomicU32 = AtomicU32::new(0);
    format!(
        "ogw-stub-{tag}-{}-{}",
        std::process::id(),
        NEXT.fetch_add(1, Ordering::Relaxed)
    )
}

pub fn transport() -> TransportConfig {
    TransportConfig::default()
        .with_timeout(Duration::from_millis(100))
        .with_wire_capacities(8192, 8192)
        .with_result_sets(4, 1, 1024)
}

pub fn server_config(db: &str) -> ServerConfig {
    ServerConfig::new(db)
        .with_transport(transport())
        .with_sweep_interval(Duration::from_millis(20))
}

pub fn columns() -> Vec<Column> {
    vec![
        Column::new("id", ColumnType::Int8),
        Column::new("name", ColumnType::Text),
    ]
}

pub fn item(id: i64, name: &str) -> Row {
    vec![Value::Int8(id), Value::from(name)]
}

#[derive(Default)]
struct Transaction {
    read_only: bool,
    cleared: bool,
    inserted: BTreeMap<i64, Row>,
    finished: bool,
}

#[derive(Debug, Clone)]
enum Prepared {
    Insert,
    SelectById,
}

#[derive(Default)]
struct State {
    committed: BTreeMap<i64, Row>,
    transactions: HashMap<TransactionId, Transaction>,
    statements: HashMap<StatementId, Prepared>,
}

#[derive(Default)]
pub struct MemoryEngine {
    state: Mutex<State>,
    next_id: AtomicU64,
    prepares: AtomicU64,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// How many times `prepare` reached the engine.
    pub fn prepares(&self) -> u64 {
        self.prepares.load(Ordering::Relaxed)
    }

    pub fn open_transactions(&self) -> usize {
        self.state.lock().transactions.len()
    }

    pub fn open_statements(&self) -> usize {
        self.state.lock().statements.len()
    }

    pub fn committed_rows(&self) -> usize {
        self.state.lock().committed.len()
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn with_transaction<T>(
        &self,
        transaction: TransactionId,
        f: impl FnOnce(&BTreeMap<i64, Row>, &mut Transaction) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        let mut state = self.state.lock();
        let State {
            committed,
            transactions,
            ..
        } = &mut *state;
        let tx = transactions
            .get_mut(&transaction)
            .ok_or_else(|| EngineError::not_found(format!("transaction {transaction}")))?;
        if tx.finished {
            return Err(EngineError::new(
                ErrorCode::InvalidState,
                format!("transaction {transaction} already finished"),
            ));
        }
        f(committed, tx)
    }

    fn insert(tx: &mut Transaction, id: i64, name: Value) -> Result<u64, EngineError> {
        if tx.read_only {
            return Err(EngineError::new(
                ErrorCode::InvalidState,
                "write in a read-only transaction",
            ));
        }
        tx.inserted.insert(id, vec![Value::Int8(id), name]);
        Ok(1)
    }

    fn visible(committed: &BTreeMap<i64, Row>, tx: &Transaction) -> Vec<Row> {
        let mut rows = if tx.cleared {
            BTreeMap::new()
        } else {
            committed.clone()
        };
        rows.extend(tx.inserted.iter().map(|(id, row)| (*id, row.clone())));
        rows.into_values().collect()
    }

    fn statement(&self, statement: StatementId) -> Result<Prepared, EngineError> {
        self.state
            .lock()
            .statements
            .get(&statement)
            .cloned()
            .ok_or_else(|| EngineError::not_found(format!("statement {statement}")))
    }
}

fn parameter<'a>(
    parameters: &'a [Parameter],
    name: &str,
    ty: ColumnType,
) -> Result<&'a Value, EngineError> {
    let p = parameters
        .iter()
        .find(|p| p.name == name)
        .ok_or_else(|| EngineError::not_found(format!("parameter {name}")))?;
    if !p.value.fits(ty) {
        return Err(EngineError::new(
            ErrorCode::TypeMismatch,
            format!("parameter {name} expects {ty:?}"),
        ));
    }
    Ok(&p.value)
}

fn syntax(sql: &str) -> EngineError {
    EngineError::new(ErrorCode::Syntax, format!("cannot parse `{sql}`"))
}

impl SqlEngine for MemoryEngine {
    fn begin(&self, read_only: bool) -> Result<TransactionId, EngineError> {
        let id = self.next_id();
        self.state.lock().transactions.insert(
            id,
            Transaction {
                read_only,
                ..Default::default()
            },
        );
        Ok(id)
    }

    fn prepare(&self, sql: &str, placeholders: &[Placeholder]) -> Result<StatementId, EngineError> {
        self.prepares.fetch_add(1, Ordering::Relaxed);
        let prepared = match sql {
            "INSERT" => Prepared::Insert,
            "SELECT BY ID" => Prepared::SelectById,
            _ => return Err(syntax(sql)),
        };
        if placeholders.is_empty() {
            return Err(EngineError::new(ErrorCode::Syntax, "missing placeholders"));
        }
        let id = self.next_id();
        self.state.lock().statements.insert(id, prepared);
        Ok(id)
    }

    fn execute_statement(&self, transaction: TransactionId, sql: &str) -> Result<u64, EngineError> {
        let words: Vec<&str> = sql.split_whitespace().collect();
        self.with_transaction(transaction, |committed, tx| match words.as_slice() {
            ["INSERT", id, name] => {
                let id = id.parse().map_err(|_| syntax(sql))?;
                Self::insert(tx, id, Value::from(*name))
            }
            ["DELETE"] => {
                if tx.read_only {
                    return Err(EngineError::new(ErrorCode::InvalidState, "read-only"));
                }
                let removed = Self::visible(committed, tx).len() as u64;
                tx.cleared = true;
                tx.inserted.clear();
                Ok(removed)
            }
            _ => Err(syntax(sql)),
        })
    }

    fn execute_query(
        &self,
        transaction: TransactionId,
        sql: &str,
    ) -> Result<Box<dyn RecordStream>, EngineError> {
        let words: Vec<&str> = sql.split_whitespace().collect();
        let rows = self.with_transaction(transaction, |committed, tx| match words.as_slice() {
            ["SELECT"] => Ok(Self::visible(committed, tx)),
            ["SELECT", "RANGE", from, to] => {
                let from: i64 = from.parse().map_err(|_| syntax(sql))?;
                let to: i64 = to.parse().map_err(|_| syntax(sql))?;
                Ok((from..to).map(|id| item(id, &format!("row-{id}"))).collect())
            }
            _ => Err(syntax(sql)),
        })?;
        Ok(Box::new(VecRecordStream::new(columns(), rows)))
    }

    fn execute_prepared_statement(
        &self,
        transaction: TransactionId,
        statement: StatementId,
        parameters: &[Parameter],
    ) -> Result<u64, EngineError> {
        match self.statement(statement)? {
            Prepared::Insert => {
                let id = parameter(parameters, "id", ColumnType::Int8)?
                    .as_i64()
                    .ok_or_else(|| EngineError::new(ErrorCode::TypeMismatch, "id is null"))?;
                let name = parameter(parameters, "name", ColumnType::Text)?.clone();
                self.with_transaction(transaction, |_, tx| Self::insert(tx, id, name))
            }
            Prepared::SelectById => Err(EngineError::new(
                ErrorCode::InvalidState,
                "statement is a query",
            )),
        }
    }

    fn execute_prepared_query(
        &self,
        transaction: TransactionId,
        statement: StatementId,
        parameters: &[Parameter],
    ) -> Result<Box<dyn RecordStream>, EngineError> {
        match self.statement(statement)? {
            Prepared::SelectById => {
                let id = parameter(parameters, "id", ColumnType::Int8)?.as_i64();
                let rows = self.with_transaction(transaction, |committed, tx| {
                    Ok(Self::visible(committed, tx)
                        .into_iter()
                        .filter(|row| row[0].as_i64() == id)
                        .collect())
                })?;
                Ok(Box::new(VecRecordStream::new(columns(), rows)))
            }
            Prepared::Insert => Err(EngineError::new(
                ErrorCode::InvalidState,
                "statement is not a query",
            )),
        }
    }

    fn commit(&self, transaction: TransactionId) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        let State {
            committed,
            transactions,
            ..
        } = &mut *state;
        let tx = transactions
            .get_mut(&transaction)
            .ok_or_else(|| EngineError::not_found(format!("transaction {transaction}")))?;
        if tx.cleared {
            committed.clear();
        }
        committed.append(&mut tx.inserted);
        tx.finished = true;
        Ok(())
    }

    fn rollback(&self, transaction: TransactionId) -> Result<(), EngineError> {
        self.with_transaction(transaction, |_, tx| {
            tx.inserted.clear();
            tx.cleared = false;
            tx.finished = true;
            Ok(())
        })
    }

    fn dispose_prepared_statement(&self, statement: StatementId) -> Result<(), EngineError> {
        self.state
            .lock()
            .statements
            .remove(&statement)
            .map(|_| ())
            .ok_or_else(|| EngineError::not_found(format!("statement {statement}")))
    }

    fn dispose_transaction(&self, transaction: TransactionId) -> Result<(), EngineError> {
        self.state
            .lock()
            .transactions
            .remove(&transaction)
            .map(|_| ())
            .ok_or_else(|| EngineError::not_found(format!("transaction {transaction}")))
    }
}
