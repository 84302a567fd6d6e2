//! Table schema: ordered columns, DDL, and the statements that buffer rows.
//!
//! Statement 0 is always the full-width insert. Extra statements bind a
//! subset of the columns. The column list is frozen the first time anything
//! depends on its shape (DDL, introspection, an enqueue, a statement), and
//! from then on `add_column` is refused.

use super::column::ColumnSchema;
use super::queue::StatementQueue;
use super::Dialect;
use crate::clock::Timestamp;
use crate::error::{ConfigError, EnqueueError};
use crate::value::{SqlValue, ValueStore};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

pub type StatementId = usize;

/// Where a table definition came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaOrigin {
    FromConfig,
    /// Discovered on the backend; the table is assumed to exist
    FromIntrospection,
}

/// One insert shape over a fixed column subset, with its own row buffer
#[derive(Debug)]
pub struct Statement {
    id: StatementId,
    columns: Vec<ColumnSchema>,
    queue: StatementQueue,
    insert_sql: OnceLock<String>,
}

impl Statement {
    fn new(id: StatementId, columns: Vec<ColumnSchema>) -> Self {
        Statement {
            id,
            queue: StatementQueue::new(columns.len()),
            columns,
            insert_sql: OnceLock::new(),
        }
    }

    pub fn id(&self) -> StatementId {
        self.id
    }

    pub fn columns(&self) -> &[ColumnSchema] {
        &self.columns
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn queue(&self) -> &StatementQueue {
        &self.queue
    }

    /// Insert SQL for this statement, built on first use.
    ///
    /// A table belongs to exactly one backend, so the first dialect asked for
    /// is the only one ever asked for.
    pub fn insert_sql(&self, table: &str, dialect: Dialect) -> &str {
        self.insert_sql.get_or_init(|| {
            let names: Vec<String> = self.columns.iter().map(|c| dialect.quote(&c.name)).collect();
            let placeholders: Vec<String> = self
                .columns
                .iter()
                .enumerate()
                .map(|(i, c)| c.placeholder(dialect, i + 1))
                .collect();
            format!(
                "INSERT INTO {} ({}) VALUES ({})",
                dialect.quote(table),
                names.join(", "),
                placeholders.join(", ")
            )
        })
    }
}

#[derive(Debug)]
pub struct TableSchema {
    name: String,
    origin: SchemaOrigin,
    columns: RwLock<Vec<ColumnSchema>>,
    statements: RwLock<Vec<Arc<Statement>>>,
    locked: AtomicBool,
    /// DDL applied to the current connection target
    created: AtomicBool,
}

impl TableSchema {
    pub fn new(name: impl Into<String>, origin: SchemaOrigin) -> Self {
        TableSchema {
            name: name.into(),
            origin,
            columns: RwLock::new(Vec::new()),
            statements: RwLock::new(Vec::new()),
            locked: AtomicBool::new(false),
            // Introspected tables already exist on the backend
            created: AtomicBool::new(origin == SchemaOrigin::FromIntrospection),
        }
    }

    /// Build a table from a column list in one step
    pub fn with_columns(
        name: impl Into<String>,
        origin: SchemaOrigin,
        columns: Vec<ColumnSchema>,
    ) -> Result<Self, ConfigError> {
        let table = TableSchema::new(name, origin);
        for column in columns {
            table.add_column(column)?;
        }
        if table.column_count() == 0 {
            return Err(ConfigError::EmptyTable(table.name));
        }
        Ok(table)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn origin(&self) -> SchemaOrigin {
        self.origin
    }

    pub fn columns(&self) -> Vec<ColumnSchema> {
        self.columns.read().clone()
    }

    pub fn column_count(&self) -> usize {
        self.columns.read().len()
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    /// Append a column, returning its binding-order index
    pub fn add_column(&self, column: ColumnSchema) -> Result<usize, ConfigError> {
        let mut columns = self.columns.write();
        if self.is_locked() {
            return Err(ConfigError::SchemaLocked(self.name.clone()));
        }
        if columns.iter().any(|c| c.name == column.name) {
            return Err(ConfigError::DuplicateColumn {
                table: self.name.clone(),
                column: column.name,
            });
        }
        columns.push(column);
        Ok(columns.len() - 1)
    }

    /// Fix the column list and create the full-width statement.
    pub fn freeze(&self) {
        if self.is_locked() {
            return;
        }
        let mut statements = self.statements.write();
        // Held across the flag flip so no column slips in after the snapshot
        let columns = self.columns.write();
        if statements.is_empty() {
            statements.push(Arc::new(Statement::new(0, columns.clone())));
        }
        self.locked.store(true, Ordering::Release);
    }

    /// Declare an insert over a column subset. Freezes the table.
    pub fn add_statement(&self, column_names: &[String]) -> Result<StatementId, ConfigError> {
        self.freeze();
        // Frozen: the snapshot stays valid once the read guard is gone
        let known = self.columns();
        let mut picked = Vec::with_capacity(column_names.len());
        for name in column_names {
            match known.iter().find(|c| &c.name == name) {
                Some(column) => picked.push(column.clone()),
                None => {
                    return Err(ConfigError::UnknownStatementColumn {
                        table: self.name.clone(),
                        column: name.clone(),
                    })
                }
            }
        }
        if picked.is_empty() {
            return Err(ConfigError::EmptyTable(self.name.clone()));
        }
        let mut statements = self.statements.write();
        let id = statements.len();
        statements.push(Arc::new(Statement::new(id, picked)));
        Ok(id)
    }

    /// Merge another definition of the same table into this one.
    ///
    /// Known columns are never dropped. Unknown columns are appended while the
    /// column list is still open; the names actually added are returned.
    pub fn reconcile(&self, other: &[ColumnSchema]) -> Vec<String> {
        let mut added = Vec::new();
        for column in other {
            let name = column.name.clone();
            if self.add_column(column.clone()).is_ok() {
                added.push(name);
            }
        }
        added
    }

    pub fn statement(&self, id: StatementId) -> Result<Arc<Statement>, EnqueueError> {
        self.freeze();
        self.statements
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| EnqueueError::UnknownStatement {
                table: self.name.clone(),
                statement: id,
            })
    }

    /// Snapshot of all statements, for the flush path
    pub fn statements(&self) -> Vec<Arc<Statement>> {
        self.statements.read().clone()
    }

    /// CREATE TABLE text for this table on the given dialect
    pub fn build_create_statement(&self, dialect: Dialect) -> String {
        let columns = self.columns.read();
        let mut parts: Vec<String> = columns.iter().map(|c| c.render_ddl(dialect)).collect();
        let keys: Vec<String> = columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| dialect.quote(&c.name))
            .collect();
        if !keys.is_empty() {
            parts.push(format!("PRIMARY KEY ({})", keys.join(", ")));
        }
        let guard = match self.origin {
            SchemaOrigin::FromConfig => "IF NOT EXISTS ",
            SchemaOrigin::FromIntrospection => "",
        };
        format!(
            "CREATE TABLE {}{} ({})",
            guard,
            dialect.quote(&self.name),
            parts.join(", ")
        )
    }

    /// Buffer a positional row. NULLs in auto-time columns take `now`.
    pub fn enqueue(
        &self,
        statement: StatementId,
        values: Vec<SqlValue>,
        now: Timestamp,
    ) -> Result<(), EnqueueError> {
        let statement = self.statement(statement)?;
        if values.len() != statement.queue.width() {
            return Err(EnqueueError::WidthMismatch {
                expected: statement.queue.width(),
                actual: values.len(),
            });
        }
        let values = values
            .into_iter()
            .zip(&statement.columns)
            .map(|(value, column)| column.fill_auto(value, now))
            .collect();
        statement.queue.enqueue(values, now)
    }

    /// Build a full-width row from the value store without enqueueing it
    pub fn materialize_row(
        &self,
        lookup: &dyn ValueStore,
        now: Timestamp,
    ) -> Result<Vec<SqlValue>, EnqueueError> {
        let statement = self.statement(0)?;
        statement
            .columns
            .iter()
            .map(|c| c.materialize(lookup, now))
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.statements
            .read()
            .iter()
            .map(|s| s.queue.pending_count())
            .sum()
    }

    /// Age of the oldest queued row across all statements
    pub fn oldest_age(&self, now: Timestamp) -> Option<Duration> {
        self.statements
            .read()
            .iter()
            .filter_map(|s| s.queue.oldest_age(now))
            .max()
    }

    pub fn is_created(&self) -> bool {
        self.created.load(Ordering::Acquire)
    }

    pub fn mark_created(&self) {
        self.created.store(true, Ordering::Release);
    }

    /// Forget that DDL was applied, so it runs again on the next connect
    pub fn clear_created(&self) {
        self.created.store(false, Ordering::Release);
    }
}
