//! Controller worker
//!
//! Owns the backend and processes commands one at a time, so at most one
//! batch per backend is ever in flight. Every blocking or slow call
//! (connect, execute, DDL, rollover) happens here and never on the tick path.

use super::dump::{dump_path, write_dump};
use super::{ConnectionState, ControllerShared};
use crate::backend::{Batch, BatchOutcome, QueryResult, RowOutcome, SqlBackend};
use crate::error::{BackendError, ControllerError, FailureClass};
use crate::schema::{PendingRow, SchemaOrigin, StatementQueue, TableSchema};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Pause between drain passes while the backend is unreachable
const RETRY_PAUSE: Duration = Duration::from_millis(100);

/// Table name used in dump files for free-form statements
const ADHOC_TABLE: &str = "adhoc";

/// Messages for the controller worker
pub(crate) enum WorkerCommand {
    /// One connection attempt
    Connect,
    /// One flush pass over every queue
    Flush,
    /// Idle timeout reached
    Disconnect,
    Drain {
        wait: Duration,
        respond: oneshot::Sender<Result<(), ControllerError>>,
    },
    Query {
        sql: String,
        respond: oneshot::Sender<Result<QueryResult, ControllerError>>,
    },
    Rollover {
        path: PathBuf,
        respond: oneshot::Sender<Result<(), ControllerError>>,
    },
    /// Barrier: answered once everything before it is handled
    Sync { respond: oneshot::Sender<()> },
    /// Drain, close and stop
    Shutdown {
        wait: Duration,
        respond: oneshot::Sender<Result<(), ControllerError>>,
    },
}

/// Which queued rows a failed batch came from
enum Source<'a> {
    Table(&'a TableSchema),
    Adhoc,
}

pub(crate) struct ControllerWorker {
    shared: Arc<ControllerShared>,
    backend: Box<dyn SqlBackend>,
    rx: mpsc::UnboundedReceiver<WorkerCommand>,
    introspected: bool,
}

impl ControllerWorker {
    pub(crate) fn new(
        shared: Arc<ControllerShared>,
        backend: Box<dyn SqlBackend>,
        rx: mpsc::UnboundedReceiver<WorkerCommand>,
    ) -> Self {
        ControllerWorker {
            shared,
            backend,
            rx,
            introspected: false,
        }
    }

    /// Run the worker loop until shutdown or until every handle is dropped
    pub(crate) async fn run(mut self) {
        while let Some(command) = self.rx.recv().await {
            match command {
                WorkerCommand::Connect => {
                    if self.connect().await {
                        self.flush_if_due().await;
                    }
                }
                WorkerCommand::Flush => {
                    let open = self.check_open().await || self.connect().await;
                    let next = if open && self.flush_pass().await {
                        ConnectionState::Connected
                    } else {
                        ConnectionState::NeedConnection
                    };
                    self.shared
                        .transition(ConnectionState::FlushRequested, next);
                }
                WorkerCommand::Disconnect => self.disconnect_idle().await,
                WorkerCommand::Drain { wait, respond } => {
                    let result = self.drain(wait).await;
                    let _ = respond.send(result);
                }
                WorkerCommand::Query { sql, respond } => {
                    let result = self.query(&sql).await;
                    let _ = respond.send(result);
                }
                WorkerCommand::Rollover { path, respond } => {
                    let result = self.rollover(path).await;
                    let _ = respond.send(result);
                }
                WorkerCommand::Sync { respond } => {
                    let _ = respond.send(());
                }
                WorkerCommand::Shutdown { wait, respond } => {
                    let result = self.drain(wait).await;
                    if let Err(e) = &result {
                        warn!(
                            backend = %self.shared.id(),
                            error = %e,
                            "Shutting down with rows still pending"
                        );
                    }
                    self.close().await;
                    let _ = respond.send(result);
                    return;
                }
            }
        }
        self.close().await;
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    /// Probe an open connection. A stale one is closed so that the next
    /// attempt reopens it instead of failing a batch.
    async fn check_open(&mut self) -> bool {
        if !self.is_connected() {
            return false;
        }
        if self.backend.is_valid().await {
            return true;
        }
        warn!(
            backend = %self.shared.id(),
            target = %self.backend.target(),
            "Connection no longer valid, reopening"
        );
        self.close().await;
        false
    }

    /// One connection attempt. Returns true when a connection is open.
    async fn connect(&mut self) -> bool {
        let shared = self.shared.clone();
        if shared.is_removed() || shared.state() == ConnectionState::AccessDenied {
            return false;
        }
        if self.check_open().await {
            shared.settle(ConnectionState::Connected);
            return true;
        }

        shared
            .counters
            .connection_attempts
            .fetch_add(1, Ordering::Relaxed);
        match self.backend.connect().await {
            Ok(()) => {
                if shared.is_removed() || shared.state() == ConnectionState::AccessDenied {
                    debug!(backend = %shared.id(), "Discarding connection opened after removal");
                    self.backend.disconnect().await;
                    return false;
                }
                shared.connected.store(true, Ordering::Release);
                shared
                    .counters
                    .consecutive_errors
                    .store(0, Ordering::Relaxed);
                info!(
                    backend = %shared.id(),
                    target = %self.backend.target(),
                    "Connected"
                );
                if shared.config.introspect && !self.introspected {
                    self.introspect().await;
                }
                if !self.ensure_schema().await {
                    return false;
                }
                shared.reset_idle();
                shared.settle(ConnectionState::Connected)
            }
            Err(e) if e.class == FailureClass::Auth => {
                shared.deny_access();
                error!(
                    backend = %shared.id(),
                    error = %e.message,
                    "Backend rejected credentials, retries stopped until reset"
                );
                false
            }
            Err(e) => {
                shared.settle(ConnectionState::NeedConnection);
                let failures = shared
                    .counters
                    .consecutive_errors
                    .fetch_add(1, Ordering::Relaxed)
                    + 1;
                warn!(
                    backend = %shared.id(),
                    error = %e.message,
                    consecutive = failures,
                    "Connection attempt failed, retrying"
                );
                if failures >= u64::from(shared.config.max_consecutive_errors) {
                    self.dump_everything();
                }
                false
            }
        }
    }

    async fn introspect(&mut self) {
        let shared = self.shared.clone();
        match self.backend.introspect().await {
            Ok(found) => {
                let mut tables = shared.tables.write();
                for discovered in found {
                    if let Some(existing) = tables.get(&discovered.name) {
                        // Configured columns stay authoritative; none are dropped
                        existing.freeze();
                        let known = existing.columns();
                        let extra: Vec<&str> = discovered
                            .columns
                            .iter()
                            .filter(|c| known.iter().all(|k| k.name != c.name))
                            .map(|c| c.name.as_str())
                            .collect();
                        if !extra.is_empty() {
                            info!(
                                backend = %shared.id(),
                                table = %discovered.name,
                                columns = ?extra,
                                "Existing table has columns not in config, they stay unbound"
                            );
                        }
                        continue;
                    }
                    match TableSchema::with_columns(
                        discovered.name.clone(),
                        SchemaOrigin::FromIntrospection,
                        discovered.columns,
                    ) {
                        Ok(table) => {
                            table.freeze();
                            tables.insert(discovered.name, Arc::new(table));
                        }
                        Err(e) => debug!(
                            backend = %shared.id(),
                            table = %discovered.name,
                            error = %e,
                            "Skipping introspected table"
                        ),
                    }
                }
                self.introspected = true;
                info!(backend = %shared.id(), tables = tables.len(), "Schema introspected");
            }
            Err(e) => warn!(
                backend = %shared.id(),
                error = %e.message,
                "Introspection failed, will retry on next connect"
            ),
        }
    }

    /// Apply DDL for tables not yet created on the current target.
    /// Returns false when the connection was lost.
    async fn ensure_schema(&mut self) -> bool {
        for table in self.shared.table_snapshot() {
            if table.is_created() {
                continue;
            }
            table.freeze();
            let ddl = table.build_create_statement(self.shared.dialect);
            match self.backend.create_schema(&ddl).await {
                Ok(()) => {
                    table.mark_created();
                    debug!(backend = %self.shared.id(), table = %table.name(), "Schema created");
                }
                Err(e) if e.class == FailureClass::Constraint => {
                    // Not retried; inserts into the table will fail row by row
                    table.mark_created();
                    error!(
                        backend = %self.shared.id(),
                        table = %table.name(),
                        error = %e.message,
                        "Schema creation failed"
                    );
                }
                Err(e) => {
                    self.lose_connection(&e).await;
                    return false;
                }
            }
        }
        true
    }

    async fn flush_if_due(&mut self) {
        let shared = self.shared.clone();
        let pending = shared.pending_count();
        if pending == 0 {
            return;
        }
        let forced = shared.force_flush.swap(false, Ordering::AcqRel);
        if forced || shared.policy.is_due(pending, shared.oldest_age(shared.now())) {
            self.flush_pass().await;
        }
    }

    /// Execute every non-empty queue once.
    /// Returns false when the connection was lost on the way.
    async fn flush_pass(&mut self) -> bool {
        if !self.is_connected() || !self.ensure_schema().await {
            return false;
        }
        let shared = self.shared.clone();
        for table in shared.table_snapshot() {
            for statement in table.statements() {
                let rows = statement.queue().drain();
                if rows.is_empty() {
                    continue;
                }
                let sql = statement.insert_sql(table.name(), shared.dialect);
                let batch = Batch::insert(table.name(), sql, rows);
                let outcome = self.backend.execute_batch(&batch).await;
                let source = Source::Table(&table);
                if !self.apply_outcome(source, statement.queue(), &batch, outcome).await {
                    return false;
                }
            }
        }
        let rows = shared.adhoc.drain();
        if !rows.is_empty() {
            let batch = Batch::free_form(rows);
            let outcome = self.backend.execute_batch(&batch).await;
            if !self
                .apply_outcome(Source::Adhoc, &shared.adhoc, &batch, outcome)
                .await
            {
                return false;
            }
        }
        true
    }

    /// Resolve every row of a batch against its queue.
    /// Returns false when the connection was lost.
    async fn apply_outcome(
        &mut self,
        source: Source<'_>,
        queue: &StatementQueue,
        batch: &Batch,
        outcome: BatchOutcome,
    ) -> bool {
        let shared = self.shared.clone();
        let mut committed = 0;
        let mut dropped = 0;
        let mut first_drop: Option<String> = None;
        let mut requeue: Vec<PendingRow> = Vec::new();
        let mut lost: Option<BackendError> = None;

        let mut results = outcome.rows.into_iter();
        for row in batch.rows.iter() {
            match results.next() {
                Some(RowOutcome::Committed) => committed += 1,
                Some(RowOutcome::Failed(e)) if e.class == FailureClass::Constraint => {
                    dropped += 1;
                    first_drop.get_or_insert(e.message);
                }
                Some(RowOutcome::Failed(e)) => {
                    requeue.push(row.clone());
                    lost.get_or_insert(e);
                }
                None => {
                    requeue.push(row.clone());
                    lost.get_or_insert_with(|| BackendError::connectivity("batch ended early"));
                }
            }
        }

        queue.mark_committed(committed);
        queue.mark_dropped(dropped);
        queue.requeue_front(requeue);

        let counters = &shared.counters;
        if committed > 0 {
            counters
                .committed
                .fetch_add(committed as u64, Ordering::Relaxed);
            counters
                .last_success_ms
                .store(shared.now().as_millis(), Ordering::Relaxed);
        }
        if dropped > 0 {
            counters
                .insert_errors
                .fetch_add(dropped as u64, Ordering::Relaxed);
            warn!(
                backend = %shared.id(),
                table = %batch.table,
                dropped,
                error = %first_drop.unwrap_or_default(),
                "Rows rejected by backend and dropped"
            );
        }
        let failures = dropped as u64 + u64::from(lost.is_some());
        let consecutive = if failures == 0 {
            counters.consecutive_errors.store(0, Ordering::Relaxed);
            0
        } else {
            counters
                .consecutive_errors
                .fetch_add(failures, Ordering::Relaxed)
                + failures
        };

        let connected = match &lost {
            Some(e) => {
                self.lose_connection(e).await;
                false
            }
            None => true,
        };

        if consecutive >= u64::from(shared.config.max_consecutive_errors) {
            match source {
                Source::Table(table) => self.dump_table(table),
                Source::Adhoc => self.dump_adhoc(),
            }
            counters.consecutive_errors.store(0, Ordering::Relaxed);
        }
        connected
    }

    async fn lose_connection(&mut self, error: &BackendError) {
        self.backend.disconnect().await;
        self.shared.connected.store(false, Ordering::Release);
        if error.class == FailureClass::Auth {
            self.shared.deny_access();
            error!(
                backend = %self.shared.id(),
                error = %error.message,
                "Backend rejected credentials, retries stopped until reset"
            );
        } else {
            self.shared.settle(ConnectionState::NeedConnection);
            warn!(
                backend = %self.shared.id(),
                error = %error.message,
                "Connection lost, pending rows kept for retry"
            );
        }
    }

    /// Write every queued row of `table` to recovery dumps
    fn dump_table(&self, table: &TableSchema) {
        for statement in table.statements() {
            let columns = statement.column_names();
            self.dump_queue(table.name(), statement.id(), &columns, statement.queue());
        }
    }

    fn dump_adhoc(&self) {
        let columns = vec!["sql".to_string()];
        self.dump_queue(ADHOC_TABLE, 0, &columns, &self.shared.adhoc);
    }

    fn dump_everything(&self) {
        for table in self.shared.table_snapshot() {
            self.dump_table(&table);
        }
        self.dump_adhoc();
        self.shared
            .counters
            .consecutive_errors
            .store(0, Ordering::Relaxed);
    }

    fn dump_queue(&self, table: &str, statement: usize, columns: &[String], queue: &StatementQueue) {
        let rows = queue.drain();
        if rows.is_empty() {
            return;
        }
        let shared = &self.shared;
        let path = dump_path(
            &shared.config.dump_dir,
            shared.id(),
            table,
            statement,
            shared.now(),
        );
        match write_dump(&path, columns, &rows) {
            Ok(()) => {
                queue.mark_dumped(rows.len());
                shared
                    .counters
                    .dumped
                    .fetch_add(rows.len() as u64, Ordering::Relaxed);
                error!(
                    backend = %shared.id(),
                    table = %table,
                    rows = rows.len(),
                    path = %path.display(),
                    "Too many consecutive failures, pending rows dumped"
                );
            }
            Err(e) => {
                error!(
                    backend = %shared.id(),
                    table = %table,
                    error = %e,
                    "Recovery dump failed, rows kept in memory"
                );
                queue.requeue_front(rows);
            }
        }
    }

    /// Flush until nothing is pending or `wait` runs out
    async fn drain(&mut self, wait: Duration) -> Result<(), ControllerError> {
        let deadline = Instant::now() + wait;
        loop {
            if self.shared.pending_count() == 0 {
                return Ok(());
            }
            if self.shared.state() == ConnectionState::AccessDenied {
                return Err(ControllerError::AccessDenied(self.shared.id().to_string()));
            }
            if self.connect().await && self.flush_pass().await {
                self.shared.settle(ConnectionState::Connected);
                if self.shared.pending_count() == 0 {
                    return Ok(());
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ControllerError::Incomplete {
                    remaining: self.shared.pending_count(),
                });
            }
            tokio::time::sleep(RETRY_PAUSE.min(deadline - now)).await;
        }
    }

    async fn query(&mut self, sql: &str) -> Result<QueryResult, ControllerError> {
        if self.shared.state() == ConnectionState::AccessDenied {
            return Err(ControllerError::AccessDenied(self.shared.id().to_string()));
        }
        if !self.connect().await {
            return Err(match self.shared.state() {
                ConnectionState::AccessDenied => {
                    ControllerError::AccessDenied(self.shared.id().to_string())
                }
                _ => BackendError::connectivity("backend unreachable").into(),
            });
        }
        self.shared.reset_idle();
        match self.backend.query(sql).await {
            Ok(result) => Ok(result),
            Err(e) => {
                if e.class != FailureClass::Constraint {
                    self.lose_connection(&e).await;
                }
                Err(e.into())
            }
        }
    }

    /// Drain the active file, then switch to `path`.
    ///
    /// Nothing moves unless the drain completes and the new file opens; on
    /// either failure the old file stays active.
    async fn rollover(&mut self, path: PathBuf) -> Result<(), ControllerError> {
        let shared = self.shared.clone();
        let old = self.backend.target();
        if let Err(e) = self.drain(shared.config.drain_wait).await {
            warn!(
                backend = %shared.id(),
                file = %old,
                error = %e,
                "Rollover aborted, rows still buffered for the active file"
            );
            return Err(ControllerError::RolloverAborted(format!(
                "drain of {} incomplete: {}",
                old, e
            )));
        }
        if let Err(e) = self.backend.switch_file(&path).await {
            error!(
                backend = %shared.id(),
                file = %path.display(),
                error = %e.message,
                "Rollover aborted, new file could not be opened"
            );
            return Err(ControllerError::RolloverAborted(format!(
                "cannot open {}: {}",
                path.display(),
                e.message
            )));
        }

        for table in shared.table_snapshot() {
            table.clear_created();
        }
        *shared.target.write() = self.backend.target();
        shared.connected.store(true, Ordering::Release);
        shared.reset_idle();
        shared.settle(ConnectionState::Connected);
        info!(
            backend = %shared.id(),
            from = %old,
            to = %path.display(),
            "Rolled over to new file"
        );
        self.ensure_schema().await;
        Ok(())
    }

    async fn disconnect_idle(&mut self) {
        if self.shared.pending_count() > 0 && self.is_connected() {
            self.flush_pass().await;
        }
        if self.shared.state() != ConnectionState::Idle {
            return;
        }
        if self.is_connected() {
            self.close().await;
            info!(backend = %self.shared.id(), "Idle timeout reached, connection released");
        }
    }

    async fn close(&mut self) {
        if self.shared.connected.swap(false, Ordering::AcqRel) {
            self.backend.disconnect().await;
        }
    }
}
