//! Error types for every layer of the engine.
//!
//! Row-level failures (`EnqueueError`, per-row `BackendError`s inside a batch)
//! never cross the batch boundary; they are counted and logged. Backend-level
//! failures surface through `ControllerError` and the status snapshot.

use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Malformed table, column, rollover or backend configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown column type '{0}'")]
    InvalidColumnType(String),

    #[error("table '{table}' declares column '{column}' twice")]
    DuplicateColumn { table: String, column: String },

    #[error("table '{0}' has no columns")]
    EmptyTable(String),

    #[error("statement on table '{table}' names unknown column '{column}'")]
    UnknownStatementColumn { table: String, column: String },

    #[error("column list of table '{0}' is frozen")]
    SchemaLocked(String),

    #[error("invalid rollover policy: {0}")]
    InvalidRollover(String),

    #[error("tick_interval must be greater than zero")]
    ZeroTickInterval,

    #[error("duplicate backend id '{0}'")]
    DuplicateBackend(String),

    #[error("backend '{backend}': {reason}")]
    InvalidBackend { backend: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Why a row was refused before it reached a queue
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EnqueueError {
    #[error("unknown table '{0}'")]
    UnknownTable(String),

    #[error("table '{table}' has no statement {statement}")]
    UnknownStatement { table: String, statement: usize },

    #[error("row width {actual} does not match statement width {expected}")]
    WidthMismatch { expected: usize, actual: usize },

    #[error("no value for bound column '{column}' and no default")]
    MissingValue { column: String },
}

/// Classification of a failed operation, decided per backend kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// The row itself is bad; retrying cannot help
    Constraint,
    /// The backend is unreachable or the connection broke; retry later
    Connectivity,
    /// Credentials were rejected; stop retrying
    Auth,
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("{class:?} failure: {message}")]
pub struct BackendError {
    pub class: FailureClass,
    pub message: String,
}

impl BackendError {
    pub fn new(class: FailureClass, message: impl Into<String>) -> Self {
        BackendError {
            class,
            message: message.into(),
        }
    }

    pub fn connectivity(message: impl Into<String>) -> Self {
        Self::new(FailureClass::Connectivity, message)
    }

    pub fn constraint(message: impl Into<String>) -> Self {
        Self::new(FailureClass::Constraint, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(FailureClass::Auth, message)
    }
}

/// Failures of a backend's controller or its worker
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("backend '{0}' rejected its credentials; reconfigure to retry")]
    AccessDenied(String),

    #[error("operation did not finish within {0:?}")]
    Timeout(Duration),

    #[error("backend worker for '{0}' has stopped")]
    WorkerStopped(String),

    #[error("rollover aborted: {0}")]
    RolloverAborted(String),

    #[error("failed to write recovery dump {path:?}: {source}")]
    Dump {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{remaining} rows still pending after drain")]
    Incomplete { remaining: usize },
}

/// Errors returned by the manager's public entry points
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("unknown backend '{0}'")]
    UnknownBackend(String),

    #[error("backend '{0}' is already registered")]
    DuplicateBackend(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Enqueue(#[from] EnqueueError),

    #[error(transparent)]
    Controller(#[from] ControllerError),
}
