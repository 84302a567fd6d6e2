//! Networked server backend (Postgres, MySQL) over sqlx
//!
//! One exclusively owned `AnyConnection` per backend, no pool: the controller
//! already serializes all work for a backend through its worker. Rows are
//! executed with autocommit so each row's outcome is its own.

use super::{BackendFuture, Batch, BatchOutcome, IntrospectedTable, QueryResult, RowOutcome, SqlBackend};
use crate::config::{BackendConfig, BackendKind};
use crate::error::{BackendError, ConfigError, FailureClass};
use crate::schema::{ColumnSchema, ColumnType, Dialect};
use crate::value::SqlValue;
use sqlx::any::{AnyArguments, AnyRow};
use sqlx::AnyConnection;
use sqlx::query::Query;
use sqlx::{Any, Column, Connection, Row, ValueRef};
use std::time::Duration;
use tracing::debug;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ServerBackend {
    dialect: Dialect,
    url: String,
    /// Address shown in logs and status, never carries credentials
    display: String,
    conn: Option<AnyConnection>,
}

impl ServerBackend {
    pub fn new(dialect: Dialect, url: impl Into<String>, display: impl Into<String>) -> Self {
        ServerBackend {
            dialect,
            url: url.into(),
            display: display.into(),
            conn: None,
        }
    }

    pub fn from_config(config: &BackendConfig) -> Result<Self, ConfigError> {
        let dialect = match config.kind {
            BackendKind::Postgres => Dialect::Postgres,
            BackendKind::MySql => Dialect::MySql,
            BackendKind::Sqlite => {
                return Err(ConfigError::InvalidBackend {
                    backend: config.id.clone(),
                    reason: "sqlite is not a server engine".to_string(),
                })
            }
        };
        Ok(ServerBackend::new(
            dialect,
            config.connection_url()?,
            config.address.clone(),
        ))
    }
}

/// Map a sqlx error to the class the controller acts on.
///
/// Database errors go by SQLSTATE class: 28 is invalid authorization,
/// 08 connection exceptions, 53 insufficient resources, 57 operator
/// intervention. Everything else the server rejected is the row's fault.
pub fn classify(err: &sqlx::Error) -> FailureClass {
    match err {
        sqlx::Error::Database(db) => match db.code().as_deref() {
            Some(code) if code.starts_with("28") => FailureClass::Auth,
            Some(code) if ["08", "53", "57"].iter().any(|p| code.starts_with(p)) => {
                FailureClass::Connectivity
            }
            _ => FailureClass::Constraint,
        },
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => FailureClass::Connectivity,
        // Retrying cannot fix a malformed URL or an unknown driver
        sqlx::Error::Configuration(_) | sqlx::Error::AnyDriverError(_) => FailureClass::Auth,
        _ => FailureClass::Constraint,
    }
}

fn to_backend_error(err: sqlx::Error) -> BackendError {
    BackendError::new(classify(&err), err.to_string())
}

fn bind<'q>(query: Query<'q, Any, AnyArguments<'q>>, value: &SqlValue) -> Query<'q, Any, AnyArguments<'q>> {
    match value {
        SqlValue::Null => query.bind(Option::<String>::None),
        SqlValue::Integer(v) => query.bind(*v),
        SqlValue::Real(v) => query.bind(*v),
        SqlValue::Text(s) => query.bind(s.clone()),
    }
}

fn decode(row: &AnyRow, index: usize) -> SqlValue {
    match row.try_get_raw(index) {
        Ok(raw) if raw.is_null() => return SqlValue::Null,
        Err(_) => return SqlValue::Null,
        Ok(_) => {}
    }
    if let Ok(v) = row.try_get::<i64, _>(index) {
        return SqlValue::Integer(v);
    }
    if let Ok(v) = row.try_get::<i32, _>(index) {
        return SqlValue::Integer(v as i64);
    }
    if let Ok(v) = row.try_get::<i16, _>(index) {
        return SqlValue::Integer(v as i64);
    }
    if let Ok(v) = row.try_get::<f64, _>(index) {
        return SqlValue::Real(v);
    }
    if let Ok(v) = row.try_get::<f32, _>(index) {
        return SqlValue::Real(v as f64);
    }
    if let Ok(v) = row.try_get::<bool, _>(index) {
        return SqlValue::Integer(v as i64);
    }
    row.try_get::<String, _>(index)
        .map(SqlValue::Text)
        .unwrap_or(SqlValue::Null)
}

impl ServerBackend {
    fn introspect_sql(&self) -> &'static str {
        match self.dialect {
            Dialect::MySql => {
                "SELECT CAST(table_name AS CHAR), CAST(column_name AS CHAR), \
                 CAST(data_type AS CHAR), CAST(is_nullable AS CHAR) \
                 FROM information_schema.columns WHERE table_schema = DATABASE() \
                 ORDER BY table_name, ordinal_position"
            }
            _ => {
                "SELECT CAST(table_name AS TEXT), CAST(column_name AS TEXT), \
                 CAST(data_type AS TEXT), CAST(is_nullable AS TEXT) \
                 FROM information_schema.columns WHERE table_schema = current_schema() \
                 ORDER BY table_name, ordinal_position"
            }
        }
    }

    fn connection(&mut self) -> Result<&mut AnyConnection, BackendError> {
        self.conn
            .as_mut()
            .ok_or_else(|| BackendError::connectivity("not connected"))
    }
}

impl SqlBackend for ServerBackend {
    fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn target(&self) -> String {
        self.display.clone()
    }

    fn connect(&mut self) -> BackendFuture<'_, Result<(), BackendError>> {
        Box::pin(async move {
            if self.conn.is_some() {
                return Ok(());
            }
            sqlx::any::install_default_drivers();
            let conn = tokio::time::timeout(CONNECT_TIMEOUT, AnyConnection::connect(&self.url))
                .await
                .map_err(|_| {
                    BackendError::connectivity(format!(
                        "connect to {} timed out after {:?}",
                        self.display, CONNECT_TIMEOUT
                    ))
                })?
                .map_err(to_backend_error)?;
            debug!(target_addr = %self.display, "Server connection established");
            self.conn = Some(conn);
            Ok(())
        })
    }

    fn disconnect(&mut self) -> BackendFuture<'_, ()> {
        Box::pin(async move {
            if let Some(conn) = self.conn.take() {
                let _ = conn.close().await;
            }
        })
    }

    fn is_valid(&mut self) -> BackendFuture<'_, bool> {
        Box::pin(async move {
            match self.conn.as_mut() {
                Some(conn) => conn.ping().await.is_ok(),
                None => false,
            }
        })
    }

    fn execute_batch<'a>(&'a mut self, batch: &'a Batch) -> BackendFuture<'a, BatchOutcome> {
        Box::pin(async move {
            let mut rows = Vec::with_capacity(batch.len());
            for index in 0..batch.len() {
                let conn = match self.connection() {
                    Ok(conn) => conn,
                    Err(e) => {
                        rows.resize(batch.len(), RowOutcome::Failed(e));
                        break;
                    }
                };
                let Some(sql) = batch.sql_for(index) else {
                    rows.push(RowOutcome::Failed(BackendError::constraint(
                        "row carries no SQL text",
                    )));
                    continue;
                };
                let query = batch
                    .params_for(index)
                    .iter()
                    .fold(sqlx::query::<Any>(sql), bind);
                match query.execute(&mut *conn).await.map_err(to_backend_error) {
                    Ok(_) => rows.push(RowOutcome::Committed),
                    Err(e) if e.class == FailureClass::Constraint => {
                        rows.push(RowOutcome::Failed(e))
                    }
                    Err(e) => {
                        // A broken connection is not reused
                        self.conn = None;
                        rows.resize(batch.len(), RowOutcome::Failed(e));
                        break;
                    }
                }
            }
            BatchOutcome { rows }
        })
    }

    fn create_schema<'a>(
        &'a mut self,
        ddl: &'a str,
    ) -> BackendFuture<'a, Result<(), BackendError>> {
        Box::pin(async move {
            let conn = self.connection()?;
            sqlx::Executor::execute(&mut *conn, sqlx::raw_sql(ddl))
                .await
                .map_err(to_backend_error)?;
            Ok(())
        })
    }

    fn query<'a>(&'a mut self, sql: &'a str) -> BackendFuture<'a, Result<QueryResult, BackendError>> {
        Box::pin(async move {
            let conn = self.connection()?;
            let fetched = sqlx::query::<Any>(sql)
                .fetch_all(&mut *conn)
                .await
                .map_err(to_backend_error)?;
            let columns = fetched
                .first()
                .map(|row| row.columns().iter().map(|c| c.name().to_string()).collect())
                .unwrap_or_default();
            let rows = fetched
                .iter()
                .map(|row| (0..row.len()).map(|i| decode(row, i)).collect())
                .collect();
            Ok(QueryResult { columns, rows })
        })
    }

    fn introspect(&mut self) -> BackendFuture<'_, Result<Vec<IntrospectedTable>, BackendError>> {
        Box::pin(async move {
            let sql = self.introspect_sql();
            let conn = self.connection()?;
            let fetched = sqlx::query::<Any>(sql)
                .fetch_all(&mut *conn)
                .await
                .map_err(to_backend_error)?;

            let mut tables: Vec<IntrospectedTable> = Vec::new();
            for row in &fetched {
                let table: String = row.try_get(0).map_err(to_backend_error)?;
                let name: String = row.try_get(1).map_err(to_backend_error)?;
                let declared: String = row.try_get(2).map_err(to_backend_error)?;
                let nullable: String = row.try_get(3).map_err(to_backend_error)?;

                let mut column = ColumnSchema::new(name, ColumnType::from_declared(&declared));
                column.nullable = nullable.eq_ignore_ascii_case("YES");
                match tables.last_mut() {
                    Some(last) if last.name == table => last.columns.push(column),
                    _ => tables.push(IntrospectedTable {
                        name: table,
                        columns: vec![column],
                    }),
                }
            }
            Ok(tables)
        })
    }
}
