//! SQLite rollover tests
//!
//! Real database files in a temp directory. Rows buffered before a rollover
//! must land in the old file, never the new one.

use chrono::{NaiveDate, NaiveDateTime};
use sqlsink::config::{ColumnConfig, TableConfig};
use sqlsink::{
    BackendConfig, BackendKind, ConnectionController, ControllerError, RolloverPolicy,
    RolloverScheduler, RolloverUnit, SimulatedBackend, SimulatedClock, SqlValue, SqliteBackend,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn at(h: u32, mi: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 3, 1)
        .unwrap()
        .and_hms_opt(h, mi, 0)
        .unwrap()
}

fn config(template: &str) -> BackendConfig {
    let mut config = BackendConfig::new("sensors", BackendKind::Sqlite, template).with_table(
        TableConfig::new("temp")
            .column(ColumnConfig::new("ts", "epochmillis"))
            .column(ColumnConfig::new("value", "real")),
    );
    config.rollover = Some(RolloverPolicy::new(1, RolloverUnit::Hour, template));
    config.max_batch_size = 1000;
    config.drain_wait = Duration::from_secs(5);
    config
}

fn count_rows(path: &Path) -> i64 {
    let conn = rusqlite::Connection::open(path).unwrap();
    conn.query_row("SELECT COUNT(*) FROM temp", [], |row| row.get(0))
        .unwrap()
}

#[tokio::test]
async fn test_rollover_flushes_everything_into_old_file() {
    let dir = tempfile::tempdir().unwrap();
    let template = dir.path().join("sensors_{ts}.db").display().to_string();
    let config = config(&template);
    let policy = config.rollover.clone().unwrap();
    let old_path = policy.file_name(at(10, 30));

    let clock = Arc::new(SimulatedClock::new(0));
    let tables = config.build_tables().unwrap();
    let (controller, _worker) = ConnectionController::spawn(
        config,
        Box::new(SqliteBackend::new(&old_path)),
        clock.clone(),
        tables,
    );
    let scheduler = RolloverScheduler::new(policy, controller.clone(), clock);

    const N: i64 = 25;
    for i in 0..N {
        controller
            .enqueue("temp", 0, vec![SqlValue::Null, (i as f64).into()])
            .unwrap();
    }
    assert_eq!(controller.pending_count(), N as usize);

    let new_path = scheduler.roll_over(at(11, 0)).await.unwrap();
    assert_ne!(new_path, old_path);
    assert!(new_path.to_string_lossy().ends_with("sensors_20240301_11.db"));
    assert_eq!(controller.pending_count(), 0);

    assert_eq!(count_rows(&old_path), N);
    assert_eq!(count_rows(&new_path), 0);

    let status = controller.status();
    assert_eq!(status.active_file.as_deref(), Some(new_path.to_string_lossy().as_ref()));
    assert_eq!(status.committed_rows, N as u64);

    // Rows after the switch go to the new file
    controller
        .enqueue("temp", 0, vec![SqlValue::Null, 99.0.into()])
        .unwrap();
    controller.drain(Duration::from_secs(5)).await.unwrap();
    assert_eq!(count_rows(&new_path), 1);
    assert_eq!(count_rows(&old_path), N);
    controller.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn test_failed_switch_keeps_old_target() {
    let config = config("sensors_{ts}.db");
    let policy = config.rollover.clone().unwrap();
    let backend = SimulatedBackend::new("sensors_20240301_10.db");
    let clock = Arc::new(SimulatedClock::new(0));
    let tables = config.build_tables().unwrap();
    let (controller, _worker) =
        ConnectionController::spawn(config, Box::new(backend.clone()), clock.clone(), tables);
    let scheduler = RolloverScheduler::new(policy, controller.clone(), clock);

    controller
        .enqueue("temp", 0, vec![SqlValue::Null, 1.0.into()])
        .unwrap();
    backend.fail_next_switch();
    let err = scheduler.roll_over(at(11, 0)).await.unwrap_err();
    assert!(matches!(err, ControllerError::RolloverAborted(_)));

    assert_eq!(backend.current_target(), "sensors_20240301_10.db");
    assert_eq!(backend.rows_in("sensors_20240301_10.db", "temp").len(), 1);
    assert_eq!(
        controller.status().active_file.as_deref(),
        Some("sensors_20240301_10.db")
    );
}

#[tokio::test]
async fn test_rollover_aborts_when_old_file_cannot_be_drained() {
    let mut config = config("sensors_{ts}.db");
    config.drain_wait = Duration::from_millis(50);
    let policy = config.rollover.clone().unwrap();
    let backend = SimulatedBackend::new("sensors_20240301_10.db");
    backend.fail_next_connects(1_000);
    let clock = Arc::new(SimulatedClock::new(0));
    let tables = config.build_tables().unwrap();
    let (controller, _worker) =
        ConnectionController::spawn(config, Box::new(backend.clone()), clock.clone(), tables);
    let scheduler = RolloverScheduler::new(policy, controller.clone(), clock);

    controller
        .enqueue("temp", 0, vec![SqlValue::Null, 1.0.into()])
        .unwrap();
    let err = scheduler.roll_over(at(11, 0)).await.unwrap_err();
    assert!(matches!(err, ControllerError::RolloverAborted(_)));
    assert_eq!(backend.current_target(), "sensors_20240301_10.db");
    assert!(backend.ddl_in("sensors_20240301_11.db").is_empty());
}
