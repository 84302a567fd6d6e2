//! Buffered multi-backend SQL persistence.
//!
//! Producers hand rows to a [`PersistenceManager`]; each registered backend
//! buffers them per table and statement, and a [`ConnectionController`]
//! flushes them in batches when a size or age threshold trips. Failed rows are
//! classified per row: constraint violations are dropped and counted,
//! connectivity failures are retried, and rejected credentials stop the
//! backend until it is reset. Embedded SQLite backends can roll over to a new
//! file on a fixed period.

pub mod admin;
pub mod backend;
pub mod clock;
pub mod config;
pub mod controller;
pub mod dst;
pub mod error;
pub mod manager;
pub mod observability;
pub mod rollover;
pub mod schema;
pub mod value;

pub use backend::{create_backend, SimulatedBackend, SimulatedBackendConfig, SqlBackend, SqliteBackend};
pub use clock::{Clock, ProductionClock, SimulatedClock, Timestamp};
pub use config::{load_config, BackendConfig, BackendKind, FlushPolicy, PersistenceConfig};
pub use controller::{ConnectionController, ConnectionState, ControllerStatus};
pub use error::{BackendError, ConfigError, ControllerError, EnqueueError, FailureClass, ManagerError};
pub use manager::{ManagerSettings, PersistenceManager};
pub use rollover::{RolloverPolicy, RolloverScheduler, RolloverUnit};
pub use schema::{ColumnSchema, ColumnType, Dialect, SchemaOrigin, TableSchema};
pub use value::{InMemoryValueStore, SqlValue, ValueStore};
