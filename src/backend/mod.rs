//! Relational store abstraction
//!
//! One interface for every store the engine writes to. Each controller owns
//! exactly one boxed backend and is the only caller, so methods take
//! `&mut self`.
//!
//! Implementations:
//! - `SqliteBackend`: embedded file, supports rollover
//! - `ServerBackend`: Postgres and MySQL over sqlx (feature `server`)
//! - `SimulatedBackend`: in-memory, scripted and seeded faults for tests and DST

pub mod simulated;
pub mod sqlite;

#[cfg(feature = "server")]
pub mod server;

pub use simulated::{SimulatedBackend, SimulatedBackendConfig};
pub use sqlite::SqliteBackend;

#[cfg(feature = "server")]
pub use server::ServerBackend;

use crate::clock::Timestamp;
use crate::config::{BackendConfig, BackendKind};
use crate::error::{BackendError, ConfigError, FailureClass};
use crate::schema::{ColumnSchema, Dialect, PendingRow};
use crate::value::SqlValue;
use serde::Serialize;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

pub type BackendFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// What a batch executes for each of its rows
#[derive(Debug, Clone, PartialEq)]
pub enum BatchStatement {
    /// Prepared insert; each row binds positionally
    Insert { sql: String },
    /// Each row is one free-form SQL text in its only column
    FreeForm,
}

/// Rows drained from one statement queue, executed in one round trip
#[derive(Debug, Clone)]
pub struct Batch {
    /// Table the rows belong to, for logs and dumps
    pub table: String,
    pub statement: BatchStatement,
    pub rows: Arc<[PendingRow]>,
}

impl Batch {
    pub fn insert(table: impl Into<String>, sql: impl Into<String>, rows: Vec<PendingRow>) -> Self {
        Batch {
            table: table.into(),
            statement: BatchStatement::Insert { sql: sql.into() },
            rows: rows.into(),
        }
    }

    pub fn free_form(rows: Vec<PendingRow>) -> Self {
        Batch {
            table: String::new(),
            statement: BatchStatement::FreeForm,
            rows: rows.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// SQL to run for row `index`
    pub fn sql_for(&self, index: usize) -> Option<&str> {
        match &self.statement {
            BatchStatement::Insert { sql } => Some(sql),
            BatchStatement::FreeForm => self.rows.get(index)?.values.first()?.as_text(),
        }
    }

    /// Positional parameters for row `index`; free-form rows bind nothing
    pub fn params_for(&self, index: usize) -> &[SqlValue] {
        match (&self.statement, self.rows.get(index)) {
            (BatchStatement::Insert { .. }, Some(row)) => row.values.as_slice(),
            _ => &[],
        }
    }
}

/// Per-row result of a batch
#[derive(Debug, Clone, PartialEq)]
pub enum RowOutcome {
    Committed,
    Failed(BackendError),
}

/// Outcome of a batch, one entry per row in batch order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchOutcome {
    pub rows: Vec<RowOutcome>,
}

impl BatchOutcome {
    pub fn all_committed(len: usize) -> Self {
        BatchOutcome {
            rows: vec![RowOutcome::Committed; len],
        }
    }

    /// Every row failed for the same reason
    pub fn all_failed(len: usize, error: BackendError) -> Self {
        BatchOutcome {
            rows: vec![RowOutcome::Failed(error); len],
        }
    }

    pub fn committed(&self) -> usize {
        self.rows
            .iter()
            .filter(|r| matches!(r, RowOutcome::Committed))
            .count()
    }

    pub fn failures(&self, class: FailureClass) -> usize {
        self.rows
            .iter()
            .filter(|r| matches!(r, RowOutcome::Failed(e) if e.class == class))
            .count()
    }

    pub fn is_success(&self) -> bool {
        self.committed() == self.rows.len()
    }
}

/// Rows returned by `query`
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<SqlValue>>,
}

/// A table found on the backend by `introspect`
#[derive(Debug, Clone, PartialEq)]
pub struct IntrospectedTable {
    pub name: String,
    pub columns: Vec<ColumnSchema>,
}

/// Operations every relational store provides to its controller.
///
/// `execute_batch` never fails as a whole: connection loss and statement
/// errors are reported per row in the outcome so the caller can commit,
/// drop or requeue each row independently.
pub trait SqlBackend: Send + 'static {
    fn dialect(&self) -> Dialect;

    /// File path or address, without credentials
    fn target(&self) -> String;

    fn connect(&mut self) -> BackendFuture<'_, Result<(), BackendError>>;

    fn disconnect(&mut self) -> BackendFuture<'_, ()>;

    /// True when connected and the connection answers
    fn is_valid(&mut self) -> BackendFuture<'_, bool>;

    fn execute_batch<'a>(&'a mut self, batch: &'a Batch) -> BackendFuture<'a, BatchOutcome>;

    fn create_schema<'a>(&'a mut self, ddl: &'a str)
        -> BackendFuture<'a, Result<(), BackendError>>;

    fn query<'a>(&'a mut self, sql: &'a str) -> BackendFuture<'a, Result<QueryResult, BackendError>>;

    fn introspect(&mut self) -> BackendFuture<'_, Result<Vec<IntrospectedTable>, BackendError>>;

    /// Close the current file and open `path` instead. The old connection
    /// stays in place if the new file cannot be opened.
    fn switch_file<'a>(&'a mut self, path: &'a Path) -> BackendFuture<'a, Result<(), BackendError>> {
        let _ = path;
        let message = format!("{} does not support file rollover", self.target());
        Box::pin(async move { Err(BackendError::new(FailureClass::Connectivity, message)) })
    }
}

/// Build the production backend for a configuration entry.
///
/// SQLite backends with a rollover policy start on the file for the period
/// containing `now`.
pub fn create_backend(
    config: &BackendConfig,
    now: Timestamp,
) -> Result<Box<dyn SqlBackend>, ConfigError> {
    match config.kind {
        BackendKind::Sqlite => {
            let path = match &config.rollover {
                Some(policy) => policy.file_name(now.to_local()),
                None => PathBuf::from(&config.address),
            };
            Ok(Box::new(SqliteBackend::new(path)))
        }
        #[cfg(feature = "server")]
        BackendKind::Postgres | BackendKind::MySql => {
            Ok(Box::new(ServerBackend::from_config(config)?))
        }
        #[cfg(not(feature = "server"))]
        BackendKind::Postgres | BackendKind::MySql => Err(ConfigError::InvalidBackend {
            backend: config.id.clone(),
            reason: "built without the `server` feature".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(values: Vec<SqlValue>) -> PendingRow {
        PendingRow {
            values,
            enqueued_at: Timestamp::ZERO,
        }
    }

    #[test]
    fn test_free_form_batch_reads_sql_from_row() {
        let batch = Batch::free_form(vec![row(vec!["DELETE FROM t".into()])]);
        assert_eq!(batch.sql_for(0), Some("DELETE FROM t"));
        assert!(batch.params_for(0).is_empty());
        assert_eq!(batch.sql_for(1), None);
    }

    #[test]
    fn test_insert_batch_binds_row_values() {
        let batch = Batch::insert(
            "t",
            "INSERT INTO t (a) VALUES (?1)",
            vec![row(vec![SqlValue::Integer(4)])],
        );
        assert_eq!(batch.sql_for(0), Some("INSERT INTO t (a) VALUES (?1)"));
        assert_eq!(batch.params_for(0), &[SqlValue::Integer(4)]);
    }

    #[test]
    fn test_outcome_counts() {
        let mut outcome = BatchOutcome::all_committed(3);
        outcome.rows[1] = RowOutcome::Failed(BackendError::constraint("UNIQUE"));
        assert_eq!(outcome.committed(), 2);
        assert_eq!(outcome.failures(FailureClass::Constraint), 1);
        assert_eq!(outcome.failures(FailureClass::Connectivity), 0);
        assert!(!outcome.is_success());
    }
}
