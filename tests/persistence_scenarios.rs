//! Persistence scenario tests
//!
//! End-to-end behaviour through the manager: flush triggers, per-row failure
//! classification, credential rejection, idle disconnect and recovery dumps.
//! Time is virtual and ticks are driven by hand.

use sqlsink::config::{ColumnConfig, TableConfig};
use sqlsink::{
    BackendConfig, BackendKind, ConnectionState, FailureClass, InMemoryValueStore, ManagerError,
    ManagerSettings, PersistenceManager, SimulatedBackend, SimulatedClock, SqlValue,
};
use std::sync::Arc;
use std::time::Duration;

const TICK: Duration = Duration::from_secs(1);

struct Harness {
    manager: PersistenceManager,
    backend: SimulatedBackend,
    clock: Arc<SimulatedClock>,
}

impl Harness {
    fn new(config: BackendConfig) -> Self {
        let clock = Arc::new(SimulatedClock::new(1_700_000_000_000));
        let manager = PersistenceManager::new(
            ManagerSettings::manual(),
            clock.clone(),
            Arc::new(InMemoryValueStore::new()),
        );
        let backend = SimulatedBackend::new(config.address.clone());
        manager
            .register_with_backend(config, Box::new(backend.clone()))
            .unwrap();
        Harness {
            manager,
            backend,
            clock,
        }
    }

    async fn tick(&self) {
        self.manager.tick(TICK);
        for id in self.manager.backend_ids() {
            self.manager.controller(&id).unwrap().sync().await.unwrap();
        }
    }

    fn state(&self) -> ConnectionState {
        self.manager.backend_status("sensors").unwrap().state
    }

    fn pending(&self) -> usize {
        self.manager.backend_status("sensors").unwrap().pending_rows
    }

    fn add(&self, value: f64) {
        self.manager
            .add_row("sensors", "temp", vec![SqlValue::Null, value.into()])
            .unwrap();
    }
}

fn sensors() -> BackendConfig {
    let mut config = BackendConfig::new("sensors", BackendKind::Sqlite, "sensors.db").with_table(
        TableConfig::new("temp")
            .column(ColumnConfig::new("ts", "epochmillis"))
            .column(ColumnConfig::new("value", "real")),
    );
    config.max_batch_size = 3;
    config.max_buffered_age = Duration::from_secs(30);
    config
}

#[tokio::test]
async fn test_batch_size_threshold_flushes_on_next_tick() {
    let h = Harness::new(sensors());
    h.add(20.5);
    h.add(20.6);
    h.tick().await;
    h.tick().await;
    assert_eq!(h.backend.rows("temp").len(), 0);
    assert_eq!(h.pending(), 2);

    h.add(20.7);
    h.tick().await;
    assert_eq!(h.backend.rows("temp").len(), 3);
    assert_eq!(h.pending(), 0);
}

#[tokio::test]
async fn test_age_threshold_flushes_single_row() {
    let h = Harness::new(sensors());
    h.add(19.0);
    h.tick().await;
    assert_eq!(h.state(), ConnectionState::Connected);
    assert_eq!(h.pending(), 1);

    h.clock.advance(Duration::from_secs(31));
    h.tick().await;
    assert_eq!(h.pending(), 0);
    let rows = h.backend.rows("temp");
    assert_eq!(rows.len(), 1);
    // Auto-time column filled at enqueue, before the clock moved
    assert_eq!(rows[0][0], SqlValue::Integer(1_700_000_000_000));
}

#[tokio::test]
async fn test_connectivity_failure_requeues_exactly_that_row() {
    let h = Harness::new(sensors());
    h.add(1.0);
    h.tick().await;
    h.backend
        .fail_rows_in_next_batch(vec![(1, FailureClass::Connectivity)]);
    h.add(2.0);
    h.add(3.0);
    h.tick().await;

    assert_eq!(h.pending(), 1);
    let committed: Vec<SqlValue> = h.backend.rows("temp").into_iter().map(|r| r[1].clone()).collect();
    assert_eq!(committed, vec![SqlValue::Real(1.0), SqlValue::Real(3.0)]);

    // Reconnect, then the forced flush delivers the survivor
    h.tick().await;
    h.manager.flush("sensors").unwrap();
    h.tick().await;
    assert_eq!(h.pending(), 0);
    assert_eq!(h.backend.rows("temp").len(), 3);
}

#[tokio::test]
async fn test_constraint_failure_drops_row_and_counts() {
    let h = Harness::new(sensors());
    h.add(1.0);
    h.tick().await;
    h.backend
        .fail_rows_in_next_batch(vec![(1, FailureClass::Constraint)]);
    h.add(2.0);
    h.add(3.0);
    h.tick().await;

    let status = h.manager.backend_status("sensors").unwrap();
    assert_eq!(status.pending_rows, 0);
    assert_eq!(status.insert_errors, 1);
    assert_eq!(status.consecutive_errors, 1);
    assert_eq!(status.committed_rows, 2);
    assert_eq!(status.state, ConnectionState::Connected);
}

#[tokio::test]
async fn test_auth_failure_stops_connection_attempts() {
    let h = Harness::new(sensors());
    h.backend.set_reject_credentials(true);
    h.add(1.0);
    h.tick().await;
    assert_eq!(h.state(), ConnectionState::AccessDenied);
    let attempts = h.backend.connect_attempts();

    for _ in 0..10 {
        h.clock.advance(TICK);
        h.tick().await;
    }
    assert_eq!(h.backend.connect_attempts(), attempts);
    assert_eq!(h.manager.denied_backends(), vec!["sensors".to_string()]);
    assert_eq!(h.pending(), 1);
}

#[tokio::test]
async fn test_idle_backend_disconnects_and_reconnects() {
    let mut config = sensors();
    config.idle_time = Duration::from_secs(3);
    let h = Harness::new(config);
    h.add(1.0);
    h.manager.flush("sensors").unwrap();
    h.tick().await;
    assert_eq!(h.backend.rows("temp").len(), 1);

    for _ in 0..3 {
        h.tick().await;
    }
    assert_eq!(h.state(), ConnectionState::Idle);
    assert!(!h.backend.is_connected());

    h.add(2.0);
    assert_eq!(h.state(), ConnectionState::NeedConnection);
    h.tick().await;
    assert!(h.backend.is_connected());
    assert_eq!(h.pending(), 1);
    let failed = h.manager.flush_all(Duration::from_secs(1)).await;
    assert!(failed.is_empty());
    assert_eq!(h.backend.rows("temp").len(), 2);
}

#[tokio::test]
async fn test_width_mismatch_is_rejected() {
    let h = Harness::new(sensors());
    let err = h
        .manager
        .add_row("sensors", "temp", vec![SqlValue::Null])
        .unwrap_err();
    assert!(matches!(err, ManagerError::Enqueue(_)));
    assert_eq!(h.pending(), 0);
    assert_eq!(h.state(), ConnectionState::Idle);
}

#[tokio::test]
async fn test_consecutive_failures_dump_pending_rows() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = sensors();
    config.max_consecutive_errors = 3;
    config.dump_dir = dir.path().to_path_buf();
    let h = Harness::new(config);
    h.backend.fail_next_connects(10);

    h.add(1.0);
    h.add(2.0);
    for _ in 0..3 {
        h.tick().await;
    }

    let status = h.manager.backend_status("sensors").unwrap();
    assert_eq!(status.dumped_rows, 2);
    assert_eq!(status.pending_rows, 0);
    assert_eq!(status.consecutive_errors, 0);

    let dumps: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
    assert_eq!(dumps.len(), 1);
    let path = dumps[0].as_ref().unwrap().path();
    let text = std::fs::read_to_string(&path).unwrap();
    assert!(path.file_name().unwrap().to_string_lossy().starts_with("sensors_temp_"));
    assert_eq!(text.lines().next(), Some("ts,value"));
    assert_eq!(text.lines().count(), 3);
}

#[tokio::test]
async fn test_free_form_statements_share_the_flush_path() {
    let h = Harness::new(sensors());
    h.manager
        .execute("sensors", "DELETE FROM temp WHERE value < 0")
        .unwrap();
    assert_eq!(h.state(), ConnectionState::NeedConnection);
    h.manager.flush("sensors").unwrap();
    h.tick().await;
    assert_eq!(h.pending(), 0);
    assert_eq!(
        h.backend.statements(),
        vec!["DELETE FROM temp WHERE value < 0".to_string()]
    );
}

#[tokio::test]
async fn test_removal_drains_then_closes() {
    let h = Harness::new(sensors());
    h.add(1.0);
    h.manager.remove_backend("sensors").await.unwrap();
    assert_eq!(h.backend.rows("temp").len(), 1);
    assert!(!h.backend.is_connected());
    assert!(h.manager.backend_status("sensors").is_err());
}
