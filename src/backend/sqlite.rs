//! Embedded SQLite backend
//!
//! rusqlite is synchronous, so every call runs on tokio's blocking pool with
//! the connection behind a mutex that only the owning worker ever contends
//! for. Batches run inside one transaction; a statement error only aborts
//! its own row, so per-row outcomes fall out of executing rows one by one.

use super::{Batch, BackendFuture, BatchOutcome, IntrospectedTable, QueryResult, RowOutcome, SqlBackend};
use crate::error::{BackendError, FailureClass};
use crate::schema::{ColumnSchema, ColumnType, Dialect};
use crate::value::SqlValue;
use parking_lot::Mutex;
use rusqlite::{params_from_iter, Connection, ErrorCode};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SqliteBackend {
    path: PathBuf,
    conn: Option<Arc<Mutex<Connection>>>,
}

impl SqliteBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        SqliteBackend {
            path: path.into(),
            conn: None,
        }
    }

    fn connection(&self) -> Result<Arc<Mutex<Connection>>, BackendError> {
        self.conn
            .clone()
            .ok_or_else(|| BackendError::connectivity("not connected"))
    }
}

/// Map a rusqlite error to the class the controller acts on
pub fn classify(err: &rusqlite::Error) -> FailureClass {
    match err.sqlite_error_code() {
        Some(
            ErrorCode::DatabaseBusy
            | ErrorCode::DatabaseLocked
            | ErrorCode::SystemIoFailure
            | ErrorCode::CannotOpen
            | ErrorCode::DiskFull
            | ErrorCode::ReadOnly
            | ErrorCode::NotADatabase
            | ErrorCode::DatabaseCorrupt
            | ErrorCode::OutOfMemory
            | ErrorCode::FileLockingProtocolFailed
            | ErrorCode::OperationInterrupted,
        ) => FailureClass::Connectivity,
        Some(ErrorCode::PermissionDenied | ErrorCode::AuthorizationForStatementDenied) => {
            FailureClass::Auth
        }
        Some(_) => FailureClass::Constraint,
        None => match err {
            rusqlite::Error::InvalidPath(_) => FailureClass::Connectivity,
            _ => FailureClass::Constraint,
        },
    }
}

fn to_backend_error(err: rusqlite::Error) -> BackendError {
    BackendError::new(classify(&err), err.to_string())
}

fn open(path: &Path) -> Result<Connection, BackendError> {
    let conn = Connection::open(path).map_err(to_backend_error)?;
    conn.busy_timeout(BUSY_TIMEOUT).map_err(to_backend_error)?;
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
        .map_err(to_backend_error)?;
    conn.pragma_update(None, "synchronous", "NORMAL")
        .map_err(to_backend_error)?;
    Ok(conn)
}

async fn blocking<T, F>(f: F) -> Result<T, BackendError>
where
    F: FnOnce() -> Result<T, BackendError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| BackendError::connectivity(format!("blocking task failed: {}", e)))?
}

fn run_batch(conn: &mut Connection, batch: &Batch) -> BatchOutcome {
    let tx = match conn.transaction() {
        Ok(tx) => tx,
        Err(e) => return BatchOutcome::all_failed(batch.len(), to_backend_error(e)),
    };

    let mut rows = Vec::with_capacity(batch.len());
    for index in 0..batch.len() {
        let result = match batch.sql_for(index) {
            None => Err(BackendError::constraint("row carries no SQL text")),
            Some(sql) => tx
                .prepare_cached(sql)
                .and_then(|mut stmt| stmt.execute(params_from_iter(batch.params_for(index))))
                .map(|_| ())
                .map_err(to_backend_error),
        };
        match result {
            Ok(()) => rows.push(RowOutcome::Committed),
            Err(e) if e.class == FailureClass::Constraint => rows.push(RowOutcome::Failed(e)),
            Err(e) => {
                // The file is unusable; nothing after this row can succeed
                rows.resize(batch.len(), RowOutcome::Failed(e));
                break;
            }
        }
    }

    if let Err(e) = tx.commit() {
        let e = to_backend_error(e);
        for row in rows.iter_mut() {
            if *row == RowOutcome::Committed {
                *row = RowOutcome::Failed(BackendError::connectivity(e.message.clone()));
            }
        }
    }
    BatchOutcome { rows }
}

fn run_query(conn: &Connection, sql: &str) -> Result<QueryResult, rusqlite::Error> {
    let mut stmt = conn.prepare(sql)?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let width = columns.len();
    let rows = stmt
        .query_map([], |row| {
            (0..width)
                .map(|i| row.get_ref(i).map(SqlValue::from))
                .collect::<Result<Vec<_>, _>>()
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(QueryResult { columns, rows })
}

fn run_introspect(conn: &Connection) -> Result<Vec<IntrospectedTable>, rusqlite::Error> {
    let names: Vec<String> = conn
        .prepare("SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name")?
        .query_map([], |row| row.get(0))?
        .collect::<Result<_, _>>()?;

    let mut tables = Vec::with_capacity(names.len());
    for name in names {
        let pragma = format!("PRAGMA table_info({})", Dialect::Sqlite.quote(&name));
        let columns = conn
            .prepare(&pragma)?
            .query_map([], |row| {
                let name: String = row.get(1)?;
                let declared: String = row.get(2)?;
                let not_null: bool = row.get(3)?;
                let pk: i64 = row.get(5)?;
                let mut column = ColumnSchema::new(name, ColumnType::from_declared(&declared));
                column.nullable = !not_null;
                column.primary_key = pk > 0;
                Ok(column)
            })?
            .collect::<Result<Vec<_>, _>>()?;
        tables.push(IntrospectedTable { name, columns });
    }
    Ok(tables)
}

impl SqlBackend for SqliteBackend {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn target(&self) -> String {
        self.path.display().to_string()
    }

    fn connect(&mut self) -> BackendFuture<'_, Result<(), BackendError>> {
        Box::pin(async move {
            if self.conn.is_some() {
                return Ok(());
            }
            let path = self.path.clone();
            let conn = blocking(move || open(&path)).await?;
            debug!(path = %self.path.display(), "Opened SQLite file");
            self.conn = Some(Arc::new(Mutex::new(conn)));
            Ok(())
        })
    }

    fn disconnect(&mut self) -> BackendFuture<'_, ()> {
        Box::pin(async move {
            if let Some(conn) = self.conn.take() {
                // Closing checkpoints the WAL, keep it off the runtime threads
                let _ = blocking(move || {
                    drop(conn);
                    Ok(())
                })
                .await;
            }
        })
    }

    fn is_valid(&mut self) -> BackendFuture<'_, bool> {
        Box::pin(async move {
            let Ok(conn) = self.connection() else {
                return false;
            };
            blocking(move || {
                conn.lock()
                    .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                    .map_err(to_backend_error)
            })
            .await
            .is_ok()
        })
    }

    fn execute_batch<'a>(&'a mut self, batch: &'a Batch) -> BackendFuture<'a, BatchOutcome> {
        Box::pin(async move {
            let conn = match self.connection() {
                Ok(conn) => conn,
                Err(e) => return BatchOutcome::all_failed(batch.len(), e),
            };
            let owned = batch.clone();
            let len = batch.len();
            blocking(move || Ok(run_batch(&mut conn.lock(), &owned)))
                .await
                .unwrap_or_else(|e| BatchOutcome::all_failed(len, e))
        })
    }

    fn create_schema<'a>(
        &'a mut self,
        ddl: &'a str,
    ) -> BackendFuture<'a, Result<(), BackendError>> {
        Box::pin(async move {
            let conn = self.connection()?;
            let ddl = ddl.to_string();
            blocking(move || conn.lock().execute_batch(&ddl).map_err(to_backend_error)).await
        })
    }

    fn query<'a>(&'a mut self, sql: &'a str) -> BackendFuture<'a, Result<QueryResult, BackendError>> {
        Box::pin(async move {
            let conn = self.connection()?;
            let sql = sql.to_string();
            blocking(move || run_query(&conn.lock(), &sql).map_err(to_backend_error)).await
        })
    }

    fn introspect(&mut self) -> BackendFuture<'_, Result<Vec<IntrospectedTable>, BackendError>> {
        Box::pin(async move {
            let conn = self.connection()?;
            blocking(move || run_introspect(&conn.lock()).map_err(to_backend_error)).await
        })
    }

    fn switch_file<'a>(&'a mut self, path: &'a Path) -> BackendFuture<'a, Result<(), BackendError>> {
        Box::pin(async move {
            let new_path = path.to_path_buf();
            let opened = blocking(move || open(&new_path)).await?;
            // Only now let go of the old file
            self.disconnect().await;
            self.conn = Some(Arc::new(Mutex::new(opened)));
            self.path = path.to_path_buf();
            Ok(())
        })
    }
}
