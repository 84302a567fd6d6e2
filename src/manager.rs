//! Persistence Manager
//!
//! Registry of named backends and the single entry point for producers.
//! Registering the first backend starts a shared tick driver that calls
//! `check_state` on every controller at a fixed interval; the driver stops
//! by itself once the registry is empty.

use crate::backend::{create_backend, QueryResult, SqlBackend};
use crate::clock::{Clock, ProductionClock};
use crate::config::{BackendConfig, PersistenceConfig};
use crate::controller::{ConnectionController, ConnectionState, ControllerStatus};
use crate::error::{ControllerError, ManagerError};
use crate::rollover::RolloverScheduler;
use crate::schema::{StatementId, TableSchema};
use crate::value::{SqlValue, ValueStore};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Extra time allowed on top of `drain_wait` for the worker to close
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub tick_interval: Duration,
    /// Run the tick driver and rollover timers as background tasks.
    /// Disabled in tests that drive `tick` by hand.
    pub run_background: bool,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        ManagerSettings {
            tick_interval: Duration::from_secs(1),
            run_background: true,
        }
    }
}

impl ManagerSettings {
    pub fn from_config(config: &PersistenceConfig) -> Self {
        ManagerSettings {
            tick_interval: config.tick_interval,
            run_background: true,
        }
    }

    /// No background tasks; the caller ticks
    pub fn manual() -> Self {
        ManagerSettings {
            run_background: false,
            ..Default::default()
        }
    }
}

/// What a reload changed
#[derive(Debug, Default, Clone, Serialize)]
pub struct ReloadSummary {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub replaced: Vec<String>,
    pub reset: Vec<String>,
}

struct BackendEntry {
    config: BackendConfig,
    controller: ConnectionController,
    rollover: Option<Arc<RolloverScheduler>>,
}

struct Driver {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

struct ManagerInner {
    settings: ManagerSettings,
    clock: Arc<dyn Clock>,
    values: Arc<dyn ValueStore>,
    backends: RwLock<BTreeMap<String, BackendEntry>>,
    driver: Mutex<Option<Driver>>,
}

/// Handle to the engine. Cheap to clone.
#[derive(Clone)]
pub struct PersistenceManager {
    inner: Arc<ManagerInner>,
}

impl PersistenceManager {
    pub fn new(settings: ManagerSettings, clock: Arc<dyn Clock>, values: Arc<dyn ValueStore>) -> Self {
        PersistenceManager {
            inner: Arc::new(ManagerInner {
                settings,
                clock,
                values,
                backends: RwLock::new(BTreeMap::new()),
                driver: Mutex::new(None),
            }),
        }
    }

    /// Production manager for `config`, every backend registered
    pub fn from_config(
        config: &PersistenceConfig,
        values: Arc<dyn ValueStore>,
    ) -> Result<Self, ManagerError> {
        config.validate()?;
        let manager = PersistenceManager::new(
            ManagerSettings::from_config(config),
            Arc::new(ProductionClock::new()),
            values,
        );
        for backend in &config.backends {
            manager.register_backend(backend.clone())?;
        }
        Ok(manager)
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    /// Register a backend, building its driver from the config
    pub fn register_backend(&self, config: BackendConfig) -> Result<(), ManagerError> {
        config.validate()?;
        let backend = create_backend(&config, self.inner.clock.now())?;
        self.register_with_backend(config, backend)
    }

    /// Register a backend over an already constructed driver
    pub fn register_with_backend(
        &self,
        config: BackendConfig,
        backend: Box<dyn SqlBackend>,
    ) -> Result<(), ManagerError> {
        config.validate()?;
        let tables = config.build_tables()?;
        let mut backends = self.inner.backends.write();
        if backends.contains_key(&config.id) {
            return Err(ManagerError::DuplicateBackend(config.id.clone()));
        }

        let (controller, _worker) = ConnectionController::spawn(
            config.clone(),
            backend,
            self.inner.clock.clone(),
            tables,
        );
        let rollover = match (&config.rollover, config.kind.is_embedded()) {
            (Some(policy), true) => {
                let scheduler = Arc::new(RolloverScheduler::new(
                    policy.clone(),
                    controller.clone(),
                    self.inner.clock.clone(),
                ));
                if self.inner.settings.run_background {
                    scheduler.clone().start();
                }
                Some(scheduler)
            }
            _ => None,
        };
        info!(
            backend = %config.id,
            kind = ?config.kind,
            address = %config.address,
            tables = config.tables.len(),
            "Backend registered"
        );
        backends.insert(
            config.id.clone(),
            BackendEntry {
                config,
                controller,
                rollover,
            },
        );
        drop(backends);
        self.ensure_driver();
        Ok(())
    }

    /// Drain and close a backend, then forget it
    pub async fn remove_backend(&self, id: &str) -> Result<(), ManagerError> {
        let entry = self
            .inner
            .backends
            .write()
            .remove(id)
            .ok_or_else(|| ManagerError::UnknownBackend(id.to_string()))?;
        Self::close_entry(entry).await
    }

    async fn close_entry(entry: BackendEntry) -> Result<(), ManagerError> {
        if let Some(scheduler) = &entry.rollover {
            scheduler.cancel();
        }
        let wait = entry.config.drain_wait;
        let id = entry.config.id.clone();
        let result = match tokio::time::timeout(wait + SHUTDOWN_GRACE, entry.controller.shutdown(wait)).await {
            Ok(result) => result,
            Err(_) => Err(ControllerError::Timeout(wait + SHUTDOWN_GRACE)),
        };
        match result {
            Ok(()) => {
                info!(backend = %id, "Backend removed");
                Ok(())
            }
            Err(e) => {
                warn!(backend = %id, error = %e, "Backend removed without a full drain");
                Err(e.into())
            }
        }
    }

    /// Apply a new configuration.
    ///
    /// Backends that disappeared or whose config changed are drained and
    /// closed; new and changed ones are registered. Unchanged backends stay
    /// as they are, except that `AccessDenied` is cleared.
    pub async fn reload(&self, config: PersistenceConfig) -> Result<ReloadSummary, ManagerError> {
        config.validate()?;
        for backend in &config.backends {
            backend.validate()?;
        }
        let mut summary = ReloadSummary::default();
        let wanted: BTreeMap<String, BackendConfig> = config
            .backends
            .into_iter()
            .map(|b| (b.id.clone(), b))
            .collect();

        let mut stale = Vec::new();
        {
            let mut backends = self.inner.backends.write();
            let ids: Vec<String> = backends.keys().cloned().collect();
            for id in ids {
                match wanted.get(&id) {
                    Some(next) if backends.get(&id).is_some_and(|e| &e.config == next) => {
                        if let Some(entry) = backends.get(&id) {
                            if entry.controller.reset_access() {
                                summary.reset.push(id.clone());
                            }
                        }
                    }
                    Some(_) => {
                        if let Some(entry) = backends.remove(&id) {
                            summary.replaced.push(id.clone());
                            stale.push(entry);
                        }
                    }
                    None => {
                        if let Some(entry) = backends.remove(&id) {
                            summary.removed.push(id.clone());
                            stale.push(entry);
                        }
                    }
                }
            }
        }

        for entry in stale {
            // A failed drain is already logged; the backend goes either way
            let _ = Self::close_entry(entry).await;
        }

        for (id, backend) in wanted {
            if self.inner.backends.read().contains_key(&id) {
                continue;
            }
            if !summary.replaced.contains(&id) {
                summary.added.push(id.clone());
            }
            self.register_backend(backend)?;
        }
        info!(
            added = summary.added.len(),
            removed = summary.removed.len(),
            replaced = summary.replaced.len(),
            reset = summary.reset.len(),
            "Configuration reloaded"
        );
        Ok(summary)
    }

    pub fn controller(&self, id: &str) -> Result<ConnectionController, ManagerError> {
        self.inner
            .backends
            .read()
            .get(id)
            .map(|e| e.controller.clone())
            .ok_or_else(|| ManagerError::UnknownBackend(id.to_string()))
    }

    pub fn backend_ids(&self) -> Vec<String> {
        self.inner.backends.read().keys().cloned().collect()
    }

    /// Buffer a full-width positional row. Never blocks.
    pub fn add_row(&self, backend: &str, table: &str, values: Vec<SqlValue>) -> Result<(), ManagerError> {
        self.add_row_to(backend, table, 0, values)
    }

    /// Buffer a positional row for a specific statement
    pub fn add_row_to(
        &self,
        backend: &str,
        table: &str,
        statement: StatementId,
        values: Vec<SqlValue>,
    ) -> Result<(), ManagerError> {
        Ok(self.controller(backend)?.enqueue(table, statement, values)?)
    }

    /// Build a row from the manager's value store and buffer it
    pub fn insert_from_bound_values(&self, backend: &str, table: &str) -> Result<(), ManagerError> {
        let controller = self.controller(backend)?;
        Ok(controller.insert_from_bound_values(table, self.inner.values.as_ref())?)
    }

    /// Buffer a free-form statement
    pub fn execute(&self, backend: &str, sql: impl Into<String>) -> Result<(), ManagerError> {
        Ok(self.controller(backend)?.execute(sql)?)
    }

    /// Declare a table at runtime; returns columns merged into an existing one
    pub fn add_table(&self, backend: &str, table: TableSchema) -> Result<Vec<String>, ManagerError> {
        Ok(self.controller(backend)?.add_table(table))
    }

    pub async fn run_query(&self, backend: &str, sql: &str) -> Result<QueryResult, ManagerError> {
        Ok(self.controller(backend)?.query(sql).await?)
    }

    /// Flush `backend` on its next tick
    pub fn flush(&self, backend: &str) -> Result<(), ManagerError> {
        self.controller(backend)?.request_flush();
        Ok(())
    }

    /// Drain every backend in parallel, each bounded by `wait`.
    ///
    /// Returns the ids of backends that could not be fully drained.
    pub async fn flush_all(&self, wait: Duration) -> Vec<(String, ControllerError)> {
        let controllers: Vec<ConnectionController> = self
            .inner
            .backends
            .read()
            .values()
            .map(|e| e.controller.clone())
            .collect();
        let results = join_all(controllers.iter().map(|c| c.drain(wait))).await;
        controllers
            .iter()
            .zip(results)
            .filter_map(|(c, result)| {
                result.err().map(|e| {
                    error!(backend = %c.id(), error = %e, "Flush incomplete");
                    (c.id().to_string(), e)
                })
            })
            .collect()
    }

    pub fn status(&self) -> Vec<ControllerStatus> {
        self.inner
            .backends
            .read()
            .values()
            .map(|e| e.controller.status())
            .collect()
    }

    pub fn backend_status(&self, backend: &str) -> Result<ControllerStatus, ManagerError> {
        Ok(self.controller(backend)?.status())
    }

    /// Clear `AccessDenied` on a backend; false if it was not denied
    pub fn reset_access(&self, backend: &str) -> Result<bool, ManagerError> {
        Ok(self.controller(backend)?.reset_access())
    }

    pub fn tables(&self, backend: &str) -> Result<Vec<String>, ManagerError> {
        Ok(self.controller(backend)?.table_names())
    }

    /// Roll an embedded backend over to the file for the current period
    pub async fn roll_over(&self, backend: &str) -> Result<PathBuf, ManagerError> {
        let scheduler = self
            .inner
            .backends
            .read()
            .get(backend)
            .ok_or_else(|| ManagerError::UnknownBackend(backend.to_string()))?
            .rollover
            .clone();
        match scheduler {
            Some(scheduler) => Ok(scheduler.roll_over_now().await?),
            None => Err(ControllerError::RolloverAborted(format!(
                "backend '{}' has no rollover policy",
                backend
            ))
            .into()),
        }
    }

    /// One tick over every backend. Never blocks.
    pub fn tick(&self, elapsed: Duration) {
        for entry in self.inner.backends.read().values() {
            entry.controller.check_state(elapsed);
        }
    }

    /// Backends currently refusing automatic retries
    pub fn denied_backends(&self) -> Vec<String> {
        self.inner
            .backends
            .read()
            .values()
            .filter(|e| e.controller.state() == ConnectionState::AccessDenied)
            .map(|e| e.config.id.clone())
            .collect()
    }

    /// Drain and close every backend, then stop the tick driver
    pub async fn shutdown(&self, wait: Duration) -> Vec<(String, ControllerError)> {
        let failed = self.flush_all(wait).await;
        let entries: Vec<BackendEntry> = {
            let mut backends = self.inner.backends.write();
            std::mem::take(&mut *backends).into_values().collect()
        };
        for entry in entries {
            let _ = Self::close_entry(entry).await;
        }
        if let Some(driver) = self.inner.driver.lock().take() {
            driver.cancel.cancel();
            driver.handle.abort();
        }
        info!("Persistence manager stopped");
        failed
    }

    /// Start the tick driver if it is not running
    fn ensure_driver(&self) {
        if !self.inner.settings.run_background {
            return;
        }
        let mut slot = self.inner.driver.lock();
        if slot.as_ref().is_some_and(|d| !d.handle.is_finished()) {
            return;
        }
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_driver(
            Arc::downgrade(&self.inner),
            self.inner.settings.tick_interval,
            cancel.clone(),
        ));
        debug!("Tick driver started");
        *slot = Some(Driver { handle, cancel });
    }
}

/// Periodic tick over all backends; exits when the registry is empty
async fn run_driver(inner: Weak<ManagerInner>, period: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = interval.tick() => {}
        }
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let backends = inner.backends.read();
        if backends.is_empty() {
            drop(backends);
            // Re-checked under the slot lock so a concurrent registration
            // either sees this driver running or starts a new one
            let mut slot = inner.driver.lock();
            if inner.backends.read().is_empty() {
                *slot = None;
                debug!("Tick driver stopped, no backends registered");
                return;
            }
            continue;
        }
        for entry in backends.values() {
            entry.controller.check_state(period);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SimulatedBackend;
    use crate::clock::SimulatedClock;
    use crate::config::{BackendKind, ColumnConfig, TableConfig};
    use crate::error::ConfigError;
    use crate::value::InMemoryValueStore;

    fn config(id: &str) -> BackendConfig {
        BackendConfig::new(id, BackendKind::Sqlite, format!("{}.db", id)).with_table(
            TableConfig::new("temp")
                .column(ColumnConfig::new("ts", "epochmillis"))
                .column(ColumnConfig::new("value", "real")),
        )
    }

    fn manager() -> (PersistenceManager, Arc<InMemoryValueStore>) {
        let values = Arc::new(InMemoryValueStore::new());
        let manager = PersistenceManager::new(
            ManagerSettings::manual(),
            Arc::new(SimulatedClock::new(1_000)),
            values.clone(),
        );
        (manager, values)
    }

    #[tokio::test]
    async fn test_register_and_duplicate() {
        let (manager, _) = manager();
        manager
            .register_with_backend(config("a"), Box::new(SimulatedBackend::new("a.db")))
            .unwrap();
        let err = manager
            .register_with_backend(config("a"), Box::new(SimulatedBackend::new("a.db")))
            .unwrap_err();
        assert!(matches!(err, ManagerError::DuplicateBackend(_)));
        assert_eq!(manager.backend_ids(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_from_config_rejects_zero_tick_interval() {
        let config = PersistenceConfig {
            tick_interval: Duration::ZERO,
            backends: vec![config("a")],
        };
        let err = PersistenceManager::from_config(&config, Arc::new(InMemoryValueStore::new()))
            .err()
            .unwrap();
        assert!(matches!(err, ManagerError::Config(ConfigError::ZeroTickInterval)));
    }

    #[tokio::test]
    async fn test_unknown_backend() {
        let (manager, _) = manager();
        let err = manager.add_row("nope", "temp", vec![]).unwrap_err();
        assert!(matches!(err, ManagerError::UnknownBackend(_)));
    }

    #[tokio::test]
    async fn test_flush_all_drains_every_backend() {
        let (manager, values) = manager();
        let a = SimulatedBackend::new("a.db");
        let b = SimulatedBackend::new("b.db");
        manager
            .register_with_backend(config("a"), Box::new(a.clone()))
            .unwrap();
        manager
            .register_with_backend(config("b"), Box::new(b.clone()))
            .unwrap();

        manager
            .add_row("a", "temp", vec![SqlValue::Null, 1.5.into()])
            .unwrap();
        values.set("value", 2.5);
        manager.insert_from_bound_values("b", "temp").unwrap();

        let failed = manager.flush_all(Duration::from_secs(1)).await;
        assert!(failed.is_empty());
        assert_eq!(a.rows("temp").len(), 1);
        assert_eq!(b.rows("temp"), vec![vec![SqlValue::Integer(1_000), SqlValue::Real(2.5)]]);
    }

    #[tokio::test]
    async fn test_remove_backend_drains_first() {
        let (manager, _) = manager();
        let a = SimulatedBackend::new("a.db");
        manager
            .register_with_backend(config("a"), Box::new(a.clone()))
            .unwrap();
        manager
            .add_row("a", "temp", vec![1.into(), 1.0.into()])
            .unwrap();
        manager.remove_backend("a").await.unwrap();
        assert_eq!(a.rows("temp").len(), 1);
        assert!(manager.backend_ids().is_empty());
        assert!(matches!(
            manager.remove_backend("a").await,
            Err(ManagerError::UnknownBackend(_))
        ));
    }

    #[tokio::test]
    async fn test_reload_resets_access_denied() {
        let (manager, _) = manager();
        let a = SimulatedBackend::new("a.db");
        a.set_reject_credentials(true);
        manager
            .register_with_backend(config("a"), Box::new(a.clone()))
            .unwrap();
        manager
            .add_row("a", "temp", vec![1.into(), 1.0.into()])
            .unwrap();
        manager.tick(Duration::from_secs(1));
        manager.controller("a").unwrap().sync().await.unwrap();
        assert_eq!(manager.denied_backends(), vec!["a".to_string()]);

        let mut next = PersistenceConfig::default();
        next.backends.push(config("a"));
        let summary = manager.reload(next).await.unwrap();
        assert_eq!(summary.reset, vec!["a".to_string()]);
        assert!(manager.denied_backends().is_empty());
    }

    #[tokio::test]
    async fn test_run_query_goes_through_worker() {
        let (manager, _) = manager();
        let a = SimulatedBackend::new("a.db");
        a.set_query_result(QueryResult {
            columns: vec!["n".to_string()],
            rows: vec![vec![SqlValue::Integer(3)]],
        });
        manager
            .register_with_backend(config("a"), Box::new(a.clone()))
            .unwrap();
        let result = manager.run_query("a", "SELECT COUNT(*) AS n FROM temp").await.unwrap();
        assert_eq!(result.rows[0][0], SqlValue::Integer(3));
    }
}
