//! Controller Deterministic Simulation Testing Harness
//!
//! Drives one controller over a fault-injecting `SimulatedBackend` with a
//! seeded random workload of enqueues, ticks, forced flushes and credential
//! outages, then checks row accounting:
//!
//! - **Conservation**: `committed + dropped + dumped + pending == enqueued`
//! - **No duplicates**: no row id is committed twice
//! - **Agreement**: rows the backend stored match the controller's count
//!
//! Virtual time comes from `SimulatedClock`; each seed runs on its own
//! current-thread runtime so a run is reproducible from its seed alone.

use crate::backend::{SimulatedBackend, SimulatedBackendConfig};
use crate::clock::SimulatedClock;
use crate::config::{BackendConfig, BackendKind, ColumnConfig, TableConfig};
use crate::controller::ConnectionController;
use crate::value::SqlValue;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const TABLE: &str = "samples";
const TICK: Duration = Duration::from_secs(1);

/// Result of a single DST run
#[derive(Debug)]
pub struct ControllerDSTResult {
    pub seed: u64,
    pub enqueued: u64,
    pub rejected: u64,
    pub committed: u64,
    pub dropped: u64,
    pub dumped: u64,
    pub pending: u64,
    pub connection_attempts: u64,
    pub passed: bool,
    pub error_message: Option<String>,
}

/// Configuration for the controller DST harness
#[derive(Debug, Clone)]
pub struct ControllerDSTConfig {
    /// Workload steps per run
    pub num_steps: usize,
    pub max_batch_size: usize,
    pub max_consecutive_errors: u32,
    pub backend_config: SimulatedBackendConfig,
    /// Probability per step of a credential outage (then reset)
    pub auth_outage_prob: f64,
}

impl Default for ControllerDSTConfig {
    fn default() -> Self {
        ControllerDSTConfig {
            num_steps: 300,
            max_batch_size: 8,
            max_consecutive_errors: 5,
            backend_config: SimulatedBackendConfig::default(),
            auth_outage_prob: 0.0,
        }
    }
}

impl ControllerDSTConfig {
    /// No faults - baseline correctness
    pub fn baseline() -> Self {
        ControllerDSTConfig {
            backend_config: SimulatedBackendConfig::no_faults(),
            ..Default::default()
        }
    }

    /// High fault rates and credential outages
    pub fn chaos() -> Self {
        ControllerDSTConfig {
            backend_config: SimulatedBackendConfig::high_chaos(),
            auth_outage_prob: 0.01,
            ..Default::default()
        }
    }
}

/// Controller DST Harness
pub struct ControllerDSTHarness {
    seed: u64,
    rng: ChaCha8Rng,
    config: ControllerDSTConfig,
}

impl ControllerDSTHarness {
    pub fn new(seed: u64, config: ControllerDSTConfig) -> Self {
        ControllerDSTHarness {
            seed,
            rng: ChaCha8Rng::seed_from_u64(seed),
            config,
        }
    }

    fn failed(&self, message: String) -> ControllerDSTResult {
        ControllerDSTResult {
            seed: self.seed,
            enqueued: 0,
            rejected: 0,
            committed: 0,
            dropped: 0,
            dumped: 0,
            pending: 0,
            connection_attempts: 0,
            passed: false,
            error_message: Some(message),
        }
    }

    /// Run a single DST scenario on a fresh current-thread runtime
    pub fn run(&mut self) -> ControllerDSTResult {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => rt,
            Err(e) => return self.failed(format!("Failed to build runtime: {}", e)),
        };
        let dump_dir = std::env::temp_dir().join(format!(
            "sqlsink-dst-{}-{}",
            std::process::id(),
            self.seed
        ));
        let result = runtime.block_on(self.run_scenario(dump_dir.clone()));
        let _ = std::fs::remove_dir_all(&dump_dir);
        result
    }

    async fn run_scenario(&mut self, dump_dir: PathBuf) -> ControllerDSTResult {
        let mut backend_config = BackendConfig::new("dst", BackendKind::Sqlite, "dst.db").with_table(
            TableConfig::new(TABLE)
                .column(ColumnConfig::new("id", "integer"))
                .column(ColumnConfig::new("value", "real")),
        );
        backend_config.max_batch_size = self.config.max_batch_size;
        backend_config.max_consecutive_errors = self.config.max_consecutive_errors;
        backend_config.idle_time = Duration::from_secs(20);
        backend_config.dump_dir = dump_dir;
        let tables = match backend_config.build_tables() {
            Ok(tables) => tables,
            Err(e) => return self.failed(format!("Invalid harness config: {}", e)),
        };

        let backend = SimulatedBackend::with_faults(
            "dst.db",
            self.rng.gen(),
            self.config.backend_config.clone(),
        );
        let clock = Arc::new(SimulatedClock::new(1_700_000_000_000));
        let (controller, worker) = ConnectionController::spawn(
            backend_config,
            Box::new(backend.clone()),
            clock.clone(),
            tables,
        );

        let mut next_id: i64 = 0;
        let mut enqueued = 0u64;
        let mut rejected = 0u64;
        let mut outage = false;

        for _ in 0..self.config.num_steps {
            let roll: f64 = self.rng.gen();
            if outage {
                if roll < 0.2 {
                    backend.set_reject_credentials(false);
                    controller.reset_access();
                    outage = false;
                }
            } else if roll < self.config.auth_outage_prob {
                backend.set_reject_credentials(true);
                backend.break_connection();
                outage = true;
            }

            match self.rng.gen_range(0..10) {
                0..=4 => {
                    let burst = self.rng.gen_range(1..=4);
                    for _ in 0..burst {
                        next_id += 1;
                        let row = vec![SqlValue::Integer(next_id), SqlValue::Real(self.rng.gen())];
                        match controller.enqueue(TABLE, 0, row) {
                            Ok(()) => enqueued += 1,
                            Err(e) => return self.failed(format!("Valid row refused: {}", e)),
                        }
                    }
                }
                5 => {
                    if controller.enqueue(TABLE, 0, vec![SqlValue::Null]).is_ok() {
                        return self.failed("Short row accepted".to_string());
                    }
                    rejected += 1;
                }
                6 => controller.request_flush(),
                _ => {
                    clock.advance(TICK * self.rng.gen_range(1..=15));
                }
            }

            controller.check_state(TICK);
            if let Err(e) = controller.sync().await {
                return self.failed(format!("Worker stopped: {}", e));
            }
        }

        let status = controller.status();
        let stored = backend.rows(TABLE);
        let _ = controller.shutdown(Duration::ZERO).await;
        let _ = worker.await;

        let mut seen = HashSet::new();
        let mut duplicate = None;
        for row in &stored {
            if let Some(SqlValue::Integer(id)) = row.first() {
                if !seen.insert(*id) {
                    duplicate = Some(*id);
                }
            }
        }

        let committed = status.committed_rows;
        let dropped = status.insert_errors;
        let dumped = status.dumped_rows;
        let pending = status.pending_rows as u64;
        let accounted = committed + dropped + dumped + pending;

        let error_message = if let Some(id) = duplicate {
            Some(format!("Row {} committed twice", id))
        } else if accounted != enqueued {
            Some(format!(
                "Accounting mismatch: committed {} + dropped {} + dumped {} + pending {} != enqueued {}",
                committed, dropped, dumped, pending, enqueued
            ))
        } else if stored.len() as u64 != committed {
            Some(format!(
                "Backend stored {} rows, controller counted {}",
                stored.len(),
                committed
            ))
        } else {
            None
        };

        ControllerDSTResult {
            seed: self.seed,
            enqueued,
            rejected,
            committed,
            dropped,
            dumped,
            pending,
            connection_attempts: status.connection_attempts,
            passed: error_message.is_none(),
            error_message,
        }
    }
}

/// Run the harness over every seed in `seeds`
pub fn run_controller_dst_batch(
    seeds: impl IntoIterator<Item = u64>,
    config: ControllerDSTConfig,
) -> Vec<ControllerDSTResult> {
    seeds
        .into_iter()
        .map(|seed| ControllerDSTHarness::new(seed, config.clone()).run())
        .collect()
}

/// One-paragraph summary of a batch for test output
pub fn summarize_controller_dst_batch(results: &[ControllerDSTResult]) -> String {
    let passed = results.iter().filter(|r| r.passed).count();
    let enqueued: u64 = results.iter().map(|r| r.enqueued).sum();
    let committed: u64 = results.iter().map(|r| r.committed).sum();
    let dropped: u64 = results.iter().map(|r| r.dropped).sum();
    let dumped: u64 = results.iter().map(|r| r.dumped).sum();
    let mut summary = format!(
        "Controller DST: {}/{} seeds passed; {} rows enqueued, {} committed, {} dropped, {} dumped",
        passed,
        results.len(),
        enqueued,
        committed,
        dropped,
        dumped
    );
    for r in results.iter().filter(|r| !r.passed) {
        summary.push_str(&format!(
            "\n  seed {}: {}",
            r.seed,
            r.error_message.as_deref().unwrap_or("unknown")
        ));
    }
    summary
}
