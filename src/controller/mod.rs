//! Connection Controller - one per backend
//!
//! The controller owns a backend's tables and row queues and runs a small
//! state machine over its connection. Producers only ever touch the queues;
//! everything that talks to the backend runs on a dedicated worker task, so
//! a slow or unreachable server never blocks `enqueue` or the tick driver.
//!
//! ## Architecture
//!
//! ```text
//! add_row ──► StatementQueue ◄── drain ── Worker ──► SqlBackend
//!                    ▲                      ▲
//!   tick ──► check_state ── WorkerCommand ──┘
//! ```
//!
//! ## States
//!
//! - **Idle**: no connection, nothing pending
//! - **NeedConnection**: rows arrived or a retry is due
//! - **Connecting**: a connect attempt is in flight
//! - **Connected**: connection open, rows accumulating
//! - **FlushRequested**: a flush pass is queued on the worker
//! - **AccessDenied**: credentials rejected; terminal until reset

pub mod dump;
mod worker;

use crate::backend::{QueryResult, SqlBackend};
use crate::clock::{Clock, Timestamp};
use crate::config::{BackendConfig, BackendKind, FlushPolicy};
use crate::error::{ControllerError, EnqueueError};
use crate::schema::{Dialect, StatementId, StatementQueue, TableSchema};
use crate::value::{SqlValue, ValueStore};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use worker::{ControllerWorker, WorkerCommand};

/// Connection state of one backend
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Idle = 0,
    NeedConnection = 1,
    Connecting = 2,
    Connected = 3,
    FlushRequested = 4,
    AccessDenied = 5,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::NeedConnection,
            2 => ConnectionState::Connecting,
            3 => ConnectionState::Connected,
            4 => ConnectionState::FlushRequested,
            5 => ConnectionState::AccessDenied,
            _ => ConnectionState::Idle,
        }
    }
}

/// Lifetime counters, read lock-free by `status`
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) connection_attempts: AtomicU64,
    pub(crate) insert_errors: AtomicU64,
    pub(crate) consecutive_errors: AtomicU64,
    pub(crate) committed: AtomicU64,
    pub(crate) dumped: AtomicU64,
    /// Milliseconds timestamp of the last committed row, 0 for never
    pub(crate) last_success_ms: AtomicU64,
}

/// State shared between the controller handle and its worker
pub(crate) struct ControllerShared {
    pub(crate) config: BackendConfig,
    pub(crate) policy: FlushPolicy,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) dialect: Dialect,
    state: AtomicU8,
    pub(crate) tables: RwLock<BTreeMap<String, Arc<TableSchema>>>,
    /// Free-form statements; each row holds one SQL text
    pub(crate) adhoc: StatementQueue,
    pub(crate) counters: Counters,
    pub(crate) connected: AtomicBool,
    idle_ms: AtomicU64,
    force_flush: AtomicBool,
    removed: AtomicBool,
    pub(crate) target: RwLock<String>,
}

impl ControllerShared {
    pub(crate) fn id(&self) -> &str {
        &self.config.id
    }

    pub(crate) fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Compare-and-set transition; false if the state moved underneath
    pub(crate) fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Move to `to` unless access was denied in the meantime
    pub(crate) fn settle(&self, to: ConnectionState) -> bool {
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current != ConnectionState::AccessDenied as u8).then_some(to as u8)
            })
            .is_ok()
    }

    pub(crate) fn deny_access(&self) {
        self.state
            .store(ConnectionState::AccessDenied as u8, Ordering::Release);
    }

    pub(crate) fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    pub(crate) fn reset_idle(&self) {
        self.idle_ms.store(0, Ordering::Relaxed);
    }

    pub(crate) fn table_snapshot(&self) -> Vec<Arc<TableSchema>> {
        self.tables.read().values().cloned().collect()
    }

    pub(crate) fn pending_count(&self) -> usize {
        let tables: usize = self.tables.read().values().map(|t| t.pending_count()).sum();
        tables + self.adhoc.pending_count()
    }

    fn oldest_age(&self, now: Timestamp) -> Option<Duration> {
        let tables = self
            .tables
            .read()
            .values()
            .filter_map(|t| t.oldest_age(now))
            .max();
        tables.max(self.adhoc.oldest_age(now))
    }

    pub(crate) fn now(&self) -> Timestamp {
        self.clock.now()
    }
}

/// Point-in-time view of one backend, serialized for the admin surface
#[derive(Debug, Clone, Serialize)]
pub struct ControllerStatus {
    pub id: String,
    pub kind: BackendKind,
    pub state: ConnectionState,
    pub connected: bool,
    pub pending_rows: usize,
    pub max_batch_size: usize,
    /// `None` until the first row commits
    pub seconds_since_last_success: Option<f64>,
    pub consecutive_errors: u64,
    pub connection_attempts: u64,
    pub insert_errors: u64,
    pub committed_rows: u64,
    pub dumped_rows: u64,
    /// Current database file, embedded backends only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_file: Option<String>,
    pub tables: Vec<String>,
}

/// Handle to one backend's controller. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionController {
    shared: Arc<ControllerShared>,
    tx: mpsc::UnboundedSender<WorkerCommand>,
}

impl ConnectionController {
    /// Start the worker for `backend` and return the handle and worker task
    pub fn spawn(
        config: BackendConfig,
        backend: Box<dyn SqlBackend>,
        clock: Arc<dyn Clock>,
        tables: Vec<TableSchema>,
    ) -> (Self, JoinHandle<()>) {
        let initial = if config.introspect {
            ConnectionState::NeedConnection
        } else {
            ConnectionState::Idle
        };
        let tables = tables
            .into_iter()
            .map(|t| (t.name().to_string(), Arc::new(t)))
            .collect();
        let shared = Arc::new(ControllerShared {
            policy: config.flush_policy(),
            config,
            clock,
            dialect: backend.dialect(),
            state: AtomicU8::new(initial as u8),
            tables: RwLock::new(tables),
            adhoc: StatementQueue::new(1),
            counters: Counters::default(),
            connected: AtomicBool::new(false),
            idle_ms: AtomicU64::new(0),
            force_flush: AtomicBool::new(false),
            removed: AtomicBool::new(false),
            target: RwLock::new(backend.target()),
        });
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = ControllerWorker::new(shared.clone(), backend, rx);
        let handle = tokio::spawn(worker.run());
        (ConnectionController { shared, tx }, handle)
    }

    pub fn id(&self) -> &str {
        self.shared.id()
    }

    pub fn config(&self) -> &BackendConfig {
        &self.shared.config
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn pending_count(&self) -> usize {
        self.shared.pending_count()
    }

    pub fn table(&self, name: &str) -> Option<Arc<TableSchema>> {
        self.shared.tables.read().get(name).cloned()
    }

    pub fn table_names(&self) -> Vec<String> {
        self.shared.tables.read().keys().cloned().collect()
    }

    /// Register a table at runtime.
    ///
    /// If the table is already known (from config or introspection) the two
    /// definitions are reconciled and the names of any added columns returned.
    pub fn add_table(&self, table: TableSchema) -> Vec<String> {
        let mut tables = self.shared.tables.write();
        match tables.get(table.name()) {
            Some(existing) => {
                let added = existing.reconcile(&table.columns());
                if added.len() < table.column_count() && existing.is_locked() {
                    debug!(
                        backend = %self.id(),
                        table = %table.name(),
                        "Table already frozen, new columns ignored"
                    );
                }
                added
            }
            None => {
                tables.insert(table.name().to_string(), Arc::new(table));
                Vec::new()
            }
        }
    }

    /// Buffer a positional row for `statement` of `table`
    pub fn enqueue(
        &self,
        table: &str,
        statement: StatementId,
        values: Vec<SqlValue>,
    ) -> Result<(), EnqueueError> {
        let schema = self
            .table(table)
            .ok_or_else(|| EnqueueError::UnknownTable(table.to_string()))?;
        schema.enqueue(statement, values, self.shared.now())?;
        self.wake();
        Ok(())
    }

    /// Build a full-width row from the value store and buffer it.
    ///
    /// A missing value without a default aborts the row and counts as an
    /// insert error.
    pub fn insert_from_bound_values(
        &self,
        table: &str,
        store: &dyn ValueStore,
    ) -> Result<(), EnqueueError> {
        let schema = self
            .table(table)
            .ok_or_else(|| EnqueueError::UnknownTable(table.to_string()))?;
        let now = self.shared.now();
        let row = match schema.materialize_row(store, now) {
            Ok(row) => row,
            Err(e) => {
                self.shared
                    .counters
                    .insert_errors
                    .fetch_add(1, Ordering::Relaxed);
                warn!(backend = %self.id(), table = %table, error = %e, "Row from bound values aborted");
                return Err(e);
            }
        };
        schema.enqueue(0, row, now)?;
        self.wake();
        Ok(())
    }

    /// Queue a free-form SQL statement
    pub fn execute(&self, sql: impl Into<String>) -> Result<(), EnqueueError> {
        self.shared
            .adhoc
            .enqueue(vec![SqlValue::Text(sql.into())], self.shared.now())?;
        self.wake();
        Ok(())
    }

    /// Rows arrived on an idle backend: ask for a connection
    fn wake(&self) {
        self.shared
            .transition(ConnectionState::Idle, ConnectionState::NeedConnection);
    }

    fn send(&self, command: WorkerCommand) -> bool {
        self.tx.send(command).is_ok()
    }

    fn dispatch_connect(&self) {
        if self
            .shared
            .transition(ConnectionState::NeedConnection, ConnectionState::Connecting)
            && !self.send(WorkerCommand::Connect)
        {
            self.shared.settle(ConnectionState::NeedConnection);
        }
    }

    /// Advance the state machine by one tick. Never blocks.
    pub fn check_state(&self, elapsed: Duration) {
        let s = &self.shared;
        if s.is_removed() {
            return;
        }
        match s.state() {
            ConnectionState::Idle => {
                if s.pending_count() > 0
                    && s.transition(ConnectionState::Idle, ConnectionState::NeedConnection)
                {
                    self.dispatch_connect();
                }
            }
            ConnectionState::NeedConnection => self.dispatch_connect(),
            ConnectionState::Connected => {
                let pending = s.pending_count();
                if pending > 0 {
                    s.reset_idle();
                    let forced = s.force_flush.load(Ordering::Acquire);
                    let due = forced || s.policy.is_due(pending, s.oldest_age(s.now()));
                    if due
                        && s.transition(ConnectionState::Connected, ConnectionState::FlushRequested)
                    {
                        s.force_flush.store(false, Ordering::Release);
                        self.send(WorkerCommand::Flush);
                    }
                } else {
                    let step = elapsed.as_millis() as u64;
                    let idle = s.idle_ms.fetch_add(step, Ordering::Relaxed) + step;
                    if idle >= s.config.idle_time.as_millis() as u64
                        && s.transition(ConnectionState::Connected, ConnectionState::Idle)
                    {
                        s.reset_idle();
                        self.send(WorkerCommand::Disconnect);
                    }
                }
            }
            ConnectionState::Connecting
            | ConnectionState::FlushRequested
            | ConnectionState::AccessDenied => {}
        }
    }

    /// Flush on the next tick regardless of batch size and age
    pub fn request_flush(&self) {
        self.shared.force_flush.store(true, Ordering::Release);
        self.wake();
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> WorkerCommand,
    ) -> Result<T, ControllerError> {
        let (tx, rx) = oneshot::channel();
        if !self.send(make(tx)) {
            return Err(ControllerError::WorkerStopped(self.id().to_string()));
        }
        rx.await
            .map_err(|_| ControllerError::WorkerStopped(self.id().to_string()))
    }

    /// Flush until nothing is pending or `wait` runs out
    pub async fn drain(&self, wait: Duration) -> Result<(), ControllerError> {
        self.request(|respond| WorkerCommand::Drain { wait, respond })
            .await?
    }

    /// Run a query on the worker's connection, behind any queued work
    pub async fn query(&self, sql: impl Into<String>) -> Result<QueryResult, ControllerError> {
        let sql = sql.into();
        self.request(|respond| WorkerCommand::Query { sql, respond })
            .await?
    }

    /// Drain the current file, then continue on `path`
    pub async fn rollover_to(&self, path: PathBuf) -> Result<(), ControllerError> {
        self.request(|respond| WorkerCommand::Rollover { path, respond })
            .await?
    }

    /// Wait until every command sent before this one has been handled
    pub async fn sync(&self) -> Result<(), ControllerError> {
        self.request(|respond| WorkerCommand::Sync { respond }).await
    }

    pub fn status(&self) -> ControllerStatus {
        let s = &self.shared;
        let c = &s.counters;
        let last = c.last_success_ms.load(Ordering::Relaxed);
        let seconds_since_last_success = (last > 0)
            .then(|| s.now().duration_since(Timestamp(last)).as_secs_f64());
        ControllerStatus {
            id: s.id().to_string(),
            kind: s.config.kind,
            state: s.state(),
            connected: s.connected.load(Ordering::Acquire),
            pending_rows: s.pending_count(),
            max_batch_size: s.policy.max_batch_size,
            seconds_since_last_success,
            consecutive_errors: c.consecutive_errors.load(Ordering::Relaxed),
            connection_attempts: c.connection_attempts.load(Ordering::Relaxed),
            insert_errors: c.insert_errors.load(Ordering::Relaxed),
            committed_rows: c.committed.load(Ordering::Relaxed),
            dumped_rows: c.dumped.load(Ordering::Relaxed),
            active_file: s
                .config
                .kind
                .is_embedded()
                .then(|| s.target.read().clone()),
            tables: self.table_names(),
        }
    }

    /// Leave `AccessDenied` so the next tick retries. False if not denied.
    pub fn reset_access(&self) -> bool {
        let reset = self
            .shared
            .transition(ConnectionState::AccessDenied, ConnectionState::Idle);
        if reset {
            self.shared
                .counters
                .consecutive_errors
                .store(0, Ordering::Relaxed);
            info!(backend = %self.id(), "Access state reset, retrying on next tick");
        }
        reset
    }

    /// Drain for up to `wait`, close the connection and stop the worker.
    ///
    /// The controller ignores ticks afterwards. Rows that could not be
    /// stored in time stay counted as pending.
    pub async fn shutdown(&self, wait: Duration) -> Result<(), ControllerError> {
        let result = self
            .request(|respond| WorkerCommand::Shutdown { wait, respond })
            .await;
        self.shared.removed.store(true, Ordering::Release);
        result?
    }
}
