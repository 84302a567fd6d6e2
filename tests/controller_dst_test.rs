//! Controller DST Integration Tests
//!
//! Multi-seed deterministic simulation of one controller under backend fault
//! injection. Every enqueued row must end up committed, dropped, dumped or
//! still pending, and no row may be committed twice.

use sqlsink::backend::SimulatedBackendConfig;
use sqlsink::dst::{run_controller_dst_batch, summarize_controller_dst_batch, ControllerDSTConfig};

fn assert_all_passed(results: &[sqlsink::dst::ControllerDSTResult]) {
    for r in results {
        assert!(
            r.passed,
            "Seed {} failed: {}",
            r.seed,
            r.error_message.as_deref().unwrap_or("unknown")
        );
    }
}

#[test]
fn test_controller_dst_50_seeds_baseline() {
    let results = run_controller_dst_batch(0..50, ControllerDSTConfig::baseline());
    assert_all_passed(&results);
    for r in &results {
        assert_eq!(r.dropped, 0, "Seed {}: rows dropped without faults", r.seed);
        assert_eq!(r.dumped, 0, "Seed {}: rows dumped without faults", r.seed);
    }
    println!("{}", summarize_controller_dst_batch(&results));
}

#[test]
fn test_controller_dst_100_seeds_default_faults() {
    let results = run_controller_dst_batch(0..100, ControllerDSTConfig::default());
    assert_all_passed(&results);
    println!("{}", summarize_controller_dst_batch(&results));
}

#[test]
fn test_controller_dst_50_seeds_chaos() {
    let results = run_controller_dst_batch(1000..1050, ControllerDSTConfig::chaos());
    assert_all_passed(&results);
    let dropped: u64 = results.iter().map(|r| r.dropped).sum();
    assert!(dropped > 0, "chaos run should exercise constraint drops");
    println!("{}", summarize_controller_dst_batch(&results));
}

#[test]
fn test_controller_dst_connect_failures_only() {
    // Unreachable backend most of the time: rows pile up and get dumped
    let config = ControllerDSTConfig {
        backend_config: SimulatedBackendConfig {
            connect_fail_prob: 0.9,
            row_constraint_prob: 0.0,
            row_connectivity_prob: 0.0,
        },
        ..ControllerDSTConfig::baseline()
    };
    let results = run_controller_dst_batch(0..20, config);
    assert_all_passed(&results);
    let dumped: u64 = results.iter().map(|r| r.dumped).sum();
    assert!(dumped > 0, "persistent connect failures should trigger dumps");
    for r in &results {
        assert_eq!(r.dropped, 0);
    }
}
