//! Simulated backend with fault injection
//!
//! An in-memory store for unit tests and deterministic simulation. Clones
//! share state, so a test keeps one handle for inspection while the
//! controller owns another. Faults come from two sources: scripted ones
//! (exact row, exact class, next batch only) and seeded random ones driven
//! by `SimulatedBackendConfig`.

use super::{BackendFuture, Batch, BatchOutcome, BatchStatement, IntrospectedTable, QueryResult, RowOutcome, SqlBackend};
use crate::error::{BackendError, FailureClass};
use crate::schema::{ColumnSchema, Dialect};
use crate::value::SqlValue;
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;

/// Probabilities for seeded random faults
#[derive(Debug, Clone)]
pub struct SimulatedBackendConfig {
    /// Probability that a connect attempt fails transiently
    pub connect_fail_prob: f64,
    /// Probability that a single row violates a constraint
    pub row_constraint_prob: f64,
    /// Probability that the connection breaks while executing a row
    pub row_connectivity_prob: f64,
}

impl Default for SimulatedBackendConfig {
    fn default() -> Self {
        SimulatedBackendConfig {
            connect_fail_prob: 0.05,      // 5%
            row_constraint_prob: 0.01,    // 1%
            row_connectivity_prob: 0.005, // 0.5%
        }
    }
}

impl SimulatedBackendConfig {
    /// High chaos configuration for stress testing
    pub fn high_chaos() -> Self {
        SimulatedBackendConfig {
            connect_fail_prob: 0.3,
            row_constraint_prob: 0.05,
            row_connectivity_prob: 0.03,
        }
    }

    /// No faults - for baseline testing
    pub fn no_faults() -> Self {
        SimulatedBackendConfig {
            connect_fail_prob: 0.0,
            row_constraint_prob: 0.0,
            row_connectivity_prob: 0.0,
        }
    }
}

/// Contents of one simulated database file or server
#[derive(Debug, Default, Clone)]
struct SimDatabase {
    tables: BTreeMap<String, Vec<Vec<SqlValue>>>,
    existing: BTreeMap<String, Vec<ColumnSchema>>,
    statements: Vec<String>,
    ddl: Vec<String>,
}

struct SimulatedState {
    config: SimulatedBackendConfig,
    rng: ChaCha8Rng,
    target: String,
    databases: HashMap<String, SimDatabase>,
    connected: bool,
    connect_attempts: u64,
    batches: u64,
    reject_credentials: bool,
    fail_connects: usize,
    fail_switch: bool,
    scripted: VecDeque<Vec<(usize, FailureClass)>>,
    query_result: QueryResult,
}

impl SimulatedState {
    fn database(&mut self) -> &mut SimDatabase {
        self.databases.entry(self.target.clone()).or_default()
    }
}

#[derive(Clone)]
pub struct SimulatedBackend {
    dialect: Dialect,
    state: Arc<Mutex<SimulatedState>>,
}

impl SimulatedBackend {
    /// Fault-free backend
    pub fn new(target: impl Into<String>) -> Self {
        Self::with_faults(target, 0, SimulatedBackendConfig::no_faults())
    }

    pub fn with_faults(target: impl Into<String>, seed: u64, config: SimulatedBackendConfig) -> Self {
        SimulatedBackend {
            dialect: Dialect::Sqlite,
            state: Arc::new(Mutex::new(SimulatedState {
                config,
                rng: ChaCha8Rng::seed_from_u64(seed),
                target: target.into(),
                databases: HashMap::new(),
                connected: false,
                connect_attempts: 0,
                batches: 0,
                reject_credentials: false,
                fail_connects: 0,
                fail_switch: false,
                scripted: VecDeque::new(),
                query_result: QueryResult::default(),
            })),
        }
    }

    pub fn with_dialect(mut self, dialect: Dialect) -> Self {
        self.dialect = dialect;
        self
    }

    pub fn connect_attempts(&self) -> u64 {
        self.state.lock().connect_attempts
    }

    pub fn batches_executed(&self) -> u64 {
        self.state.lock().batches
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    pub fn current_target(&self) -> String {
        self.state.lock().target.clone()
    }

    /// Committed rows of `table` on the current target
    pub fn rows(&self, table: &str) -> Vec<Vec<SqlValue>> {
        let target = self.current_target();
        self.rows_in(&target, table)
    }

    pub fn rows_in(&self, target: &str, table: &str) -> Vec<Vec<SqlValue>> {
        self.state
            .lock()
            .databases
            .get(target)
            .and_then(|db| db.tables.get(table).cloned())
            .unwrap_or_default()
    }

    /// Free-form statements that committed on the current target
    pub fn statements(&self) -> Vec<String> {
        let mut state = self.state.lock();
        state.database().statements.clone()
    }

    /// DDL applied to `target`, in order
    pub fn ddl_in(&self, target: &str) -> Vec<String> {
        self.state
            .lock()
            .databases
            .get(target)
            .map(|db| db.ddl.clone())
            .unwrap_or_default()
    }

    /// Make a table visible to introspection on the current target
    pub fn add_existing_table(&self, name: impl Into<String>, columns: Vec<ColumnSchema>) {
        let mut state = self.state.lock();
        state.database().existing.insert(name.into(), columns);
    }

    pub fn set_reject_credentials(&self, reject: bool) {
        self.state.lock().reject_credentials = reject;
    }

    pub fn fail_next_connects(&self, count: usize) {
        self.state.lock().fail_connects = count;
    }

    pub fn fail_next_switch(&self) {
        self.state.lock().fail_switch = true;
    }

    /// Script failures for the next executed batch
    pub fn fail_rows_in_next_batch(&self, failures: Vec<(usize, FailureClass)>) {
        self.state.lock().scripted.push_back(failures);
    }

    /// Drop the connection as if the server went away
    pub fn break_connection(&self) {
        self.state.lock().connected = false;
    }

    pub fn set_query_result(&self, result: QueryResult) {
        self.state.lock().query_result = result;
    }
}

impl SqlBackend for SimulatedBackend {
    fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn target(&self) -> String {
        self.current_target()
    }

    fn connect(&mut self) -> BackendFuture<'_, Result<(), BackendError>> {
        Box::pin(async move {
            let mut state = self.state.lock();
            state.connect_attempts += 1;
            if state.reject_credentials {
                return Err(BackendError::auth("password authentication failed"));
            }
            if state.fail_connects > 0 {
                state.fail_connects -= 1;
                return Err(BackendError::connectivity("connection refused"));
            }
            let prob = state.config.connect_fail_prob;
            if prob > 0.0 && state.rng.gen_bool(prob) {
                return Err(BackendError::connectivity("simulated connect timeout"));
            }
            state.connected = true;
            Ok(())
        })
    }

    fn disconnect(&mut self) -> BackendFuture<'_, ()> {
        Box::pin(async move {
            self.state.lock().connected = false;
        })
    }

    fn is_valid(&mut self) -> BackendFuture<'_, bool> {
        Box::pin(async move { self.state.lock().connected })
    }

    fn execute_batch<'a>(&'a mut self, batch: &'a Batch) -> BackendFuture<'a, BatchOutcome> {
        Box::pin(async move {
            let mut state = self.state.lock();
            if !state.connected {
                return BatchOutcome::all_failed(batch.len(), BackendError::connectivity("not connected"));
            }
            state.batches += 1;
            let scripted: HashMap<usize, FailureClass> =
                state.scripted.pop_front().unwrap_or_default().into_iter().collect();
            let constraint_prob = state.config.row_constraint_prob;
            let connectivity_prob = state.config.row_connectivity_prob;

            let mut rows = Vec::with_capacity(batch.len());
            for (index, row) in batch.rows.iter().enumerate() {
                if let Some(class) = scripted.get(&index) {
                    rows.push(RowOutcome::Failed(BackendError::new(
                        *class,
                        format!("scripted failure on row {}", index),
                    )));
                    continue;
                }
                if connectivity_prob > 0.0 && state.rng.gen_bool(connectivity_prob) {
                    state.connected = false;
                    rows.resize(
                        batch.len(),
                        RowOutcome::Failed(BackendError::connectivity("simulated connection reset")),
                    );
                    break;
                }
                if constraint_prob > 0.0 && state.rng.gen_bool(constraint_prob) {
                    rows.push(RowOutcome::Failed(BackendError::constraint(
                        "simulated UNIQUE constraint failed",
                    )));
                    continue;
                }
                let db = state.database();
                match &batch.statement {
                    BatchStatement::Insert { .. } => db
                        .tables
                        .entry(batch.table.clone())
                        .or_default()
                        .push(row.values.clone()),
                    BatchStatement::FreeForm => db
                        .statements
                        .push(row.values.first().map(|v| v.to_string()).unwrap_or_default()),
                }
                rows.push(RowOutcome::Committed);
            }
            BatchOutcome { rows }
        })
    }

    fn create_schema<'a>(
        &'a mut self,
        ddl: &'a str,
    ) -> BackendFuture<'a, Result<(), BackendError>> {
        Box::pin(async move {
            let mut state = self.state.lock();
            if !state.connected {
                return Err(BackendError::connectivity("not connected"));
            }
            state.database().ddl.push(ddl.to_string());
            Ok(())
        })
    }

    fn query<'a>(&'a mut self, sql: &'a str) -> BackendFuture<'a, Result<QueryResult, BackendError>> {
        Box::pin(async move {
            let mut state = self.state.lock();
            if !state.connected {
                return Err(BackendError::connectivity("not connected"));
            }
            state.database().statements.push(sql.to_string());
            Ok(state.query_result.clone())
        })
    }

    fn introspect(&mut self) -> BackendFuture<'_, Result<Vec<IntrospectedTable>, BackendError>> {
        Box::pin(async move {
            let mut state = self.state.lock();
            if !state.connected {
                return Err(BackendError::connectivity("not connected"));
            }
            Ok(state
                .database()
                .existing
                .iter()
                .map(|(name, columns)| IntrospectedTable {
                    name: name.clone(),
                    columns: columns.clone(),
                })
                .collect())
        })
    }

    fn switch_file<'a>(&'a mut self, path: &'a Path) -> BackendFuture<'a, Result<(), BackendError>> {
        Box::pin(async move {
            let mut state = self.state.lock();
            if std::mem::take(&mut state.fail_switch) {
                return Err(BackendError::connectivity(format!(
                    "unable to open database file {}",
                    path.display()
                )));
            }
            state.target = path.display().to_string();
            state.connected = true;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Timestamp;
    use crate::schema::PendingRow;

    fn batch(n: i64) -> Batch {
        let rows = (0..n)
            .map(|i| PendingRow {
                values: vec![SqlValue::Integer(i)],
                enqueued_at: Timestamp::ZERO,
            })
            .collect();
        Batch::insert("t", "INSERT", rows)
    }

    #[tokio::test]
    async fn test_no_faults_commits_everything() {
        let handle = SimulatedBackend::new("mem");
        let mut backend = handle.clone();
        backend.connect().await.unwrap();
        let outcome = backend.execute_batch(&batch(5)).await;
        assert!(outcome.is_success());
        assert_eq!(handle.rows("t").len(), 5);
        assert_eq!(handle.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn test_scripted_row_failure_hits_only_that_row() {
        let handle = SimulatedBackend::new("mem");
        let mut backend = handle.clone();
        backend.connect().await.unwrap();
        handle.fail_rows_in_next_batch(vec![(1, FailureClass::Connectivity)]);

        let outcome = backend.execute_batch(&batch(3)).await;
        assert_eq!(outcome.committed(), 2);
        assert_eq!(outcome.failures(FailureClass::Connectivity), 1);
        assert_eq!(
            handle.rows("t"),
            vec![vec![SqlValue::Integer(0)], vec![SqlValue::Integer(2)]]
        );

        // Scripts apply to one batch only
        assert!(backend.execute_batch(&batch(3)).await.is_success());
    }

    #[tokio::test]
    async fn test_rejected_credentials() {
        let handle = SimulatedBackend::new("mem");
        let mut backend = handle.clone();
        handle.set_reject_credentials(true);
        let err = backend.connect().await.unwrap_err();
        assert_eq!(err.class, FailureClass::Auth);
        assert!(!handle.is_connected());
    }

    #[tokio::test]
    async fn test_random_faults_are_deterministic() {
        async fn run(seed: u64) -> Vec<bool> {
            let mut backend = SimulatedBackend::with_faults(
                "mem",
                seed,
                SimulatedBackendConfig {
                    connect_fail_prob: 0.5,
                    ..SimulatedBackendConfig::no_faults()
                },
            );
            let mut results = Vec::new();
            for _ in 0..20 {
                results.push(backend.connect().await.is_ok());
                backend.disconnect().await;
            }
            results
        }
        assert_eq!(run(7).await, run(7).await);
    }

    #[tokio::test]
    async fn test_switch_file_separates_contents() {
        let handle = SimulatedBackend::new("a.db");
        let mut backend = handle.clone();
        backend.connect().await.unwrap();
        backend.execute_batch(&batch(2)).await;
        backend.switch_file(Path::new("b.db")).await.unwrap();
        backend.execute_batch(&batch(1)).await;

        assert_eq!(handle.rows_in("a.db", "t").len(), 2);
        assert_eq!(handle.rows_in("b.db", "t").len(), 1);

        handle.fail_next_switch();
        assert!(backend.switch_file(Path::new("c.db")).await.is_err());
        assert_eq!(handle.current_target(), "b.db");
    }
}
