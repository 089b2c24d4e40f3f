// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! A dynamically sized pool of long-lived database transactions draining a
//! shared FIFO task queue.
//!
//! Each worker owns one connection with one open transaction for its entire
//! life. Write pools are usually sized (1, 1) since there is no cross-worker
//! ordering guarantee; read pools fan out up to `max_workers` for parallel
//! scans of one snapshot. Workers beyond the initial set are spawned while
//! the queue backs up and exit after an idle timeout; initial workers instead
//! issue periodic keep-alive queries and only exit on `set_done` / `fail`.
//!
//! The database is synchronous, so workers run on blocking threads and tasks
//! execute their returned statements eagerly instead of awaiting a pipelined
//! dispatch at commit time.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Condvar, Mutex as StdMutex,
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use rusqlite::Connection;
use tokio::sync::{oneshot, watch};
use tracing::{debug, warn};

use crate::{
    context::Context,
    error::{ReplicationError, ReplicationResult},
    store::ChangeDb,
};

/// Transaction mode of every worker in a pool.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransactionMode {
    /// Deferred `BEGIN` on a read-write connection. The snapshot pins at the
    /// first read, and a write after a conflicting commit fails busy, which
    /// is this engine's serializable conflict detection.
    Write,
    /// Deferred `BEGIN` on a read-only connection. The snapshot materializes
    /// at the first read.
    ReadOnly,
}

/// A statement produced by a write task, executed on the worker's open
/// transaction in the order returned.
pub struct Statement {
    pub sql: String,
    pub params: Vec<rusqlite::types::Value>,
}

impl Statement {
    pub fn new(sql: impl Into<String>, params: Vec<rusqlite::types::Value>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

/// A task executed inside a worker's transaction. Write tasks return the
/// statements to run; their failure fails the whole pool. Read tasks route
/// their result to the caller only.
pub(crate) enum Task {
    Write(Box<dyn FnOnce(&Connection) -> ReplicationResult<Vec<Statement>> + Send>),
    Read(Box<dyn FnOnce(&Connection) + Send>),
}

enum QueueEntry {
    Task(Task),
    /// No further tasks will arrive; drain, clean up, commit.
    Done,
    /// The pool failed; roll back without cleanup. The error itself lives in
    /// the pool state and is surfaced by the completion future.
    Failed,
}

/// Per-worker hook run right after the transaction opens (init) or right
/// before it commits (cleanup). Receives the worker index.
pub type WorkerHook = Arc<dyn Fn(&Connection, usize) -> ReplicationResult<()> + Send + Sync>;

struct PoolState {
    workers: usize,
    working: usize,
    outstanding: usize,
    total_spawned: usize,
    ref_count: usize,
    done: bool,
    failed: bool,
    aborted: bool,
    failure: Option<ReplicationError>,
}

struct PoolShared {
    context: Arc<Context>,
    name: String,
    mode: TransactionMode,
    db: ChangeDb,
    initial_workers: usize,
    max_workers: usize,
    sender: Sender<QueueEntry>,
    receiver: Receiver<QueueEntry>,
    init: Option<WorkerHook>,
    cleanup: Option<WorkerHook>,
    state: Mutex<PoolState>,
    started: AtomicBool,
    /// Set once the initial workers are spawned; adaptive resizing before
    /// that would overshoot the configured sizes.
    workers_started: AtomicBool,
    exited_tx: watch::Sender<usize>,
}

/// Handle to a transaction pool. Clones share the same pool.
#[derive(Clone)]
pub struct TransactionPool {
    shared: Arc<PoolShared>,
}

impl TransactionPool {
    pub fn new(
        context: Arc<Context>,
        name: impl Into<String>,
        mode: TransactionMode,
        db: ChangeDb,
        initial_workers: usize,
        max_workers: usize,
        init: Option<WorkerHook>,
        cleanup: Option<WorkerHook>,
    ) -> Self {
        assert!(initial_workers >= 1);
        assert!(max_workers >= initial_workers);
        let (sender, receiver) = crossbeam_channel::unbounded();
        let (exited_tx, _) = watch::channel(0usize);
        Self {
            shared: Arc::new(PoolShared {
                context,
                name: name.into(),
                mode,
                db,
                initial_workers,
                max_workers,
                sender,
                receiver,
                init,
                cleanup,
                state: Mutex::new(PoolState {
                    workers: 0,
                    working: 0,
                    outstanding: 0,
                    total_spawned: 0,
                    ref_count: 1,
                    done: false,
                    failed: false,
                    aborted: false,
                    failure: None,
                }),
                started: AtomicBool::new(false),
                workers_started: AtomicBool::new(false),
                exited_tx,
            }),
        }
    }

    /// Start the workers and resolve when all of them have exited, i.e. after
    /// `set_done`, `abort` or a failure. May be called once.
    pub async fn run(&self) -> ReplicationResult<()> {
        if self.shared.started.swap(true, Ordering::SeqCst) {
            return Err(ReplicationError::Internal(format!(
                "transaction pool {} is already running",
                self.shared.name
            )));
        }
        let mut exited_rx = self.shared.exited_tx.subscribe();
        for _ in 0..self.shared.initial_workers {
            self.spawn_worker(true);
        }
        self.shared.workers_started.store(true, Ordering::SeqCst);
        loop {
            if self.shared.state.lock().workers == 0 {
                break;
            }
            if exited_rx.changed().await.is_err() {
                break;
            }
        }
        let mut state = self.shared.state.lock();
        match state.failure.take() {
            Some(err) => Err(err),
            None if state.aborted => Err(ReplicationError::Aborted),
            None => Ok(()),
        }
    }

    /// Enqueue a write-producing task. A write task's failure fails the pool.
    pub fn process<F>(&self, task: F) -> ReplicationResult<()>
    where
        F: FnOnce(&Connection) -> ReplicationResult<Vec<Statement>> + Send + 'static,
    {
        self.enqueue(Task::Write(Box::new(task)))
    }

    /// Enqueue a read task and await its value. A read task's error fails
    /// only this caller, never the pool or its siblings.
    pub async fn process_read_task<T, F>(&self, task: F) -> ReplicationResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> ReplicationResult<T> + Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        self.enqueue(Task::Read(Box::new(move |conn| {
            let _ = result_tx.send(task(conn));
        })))?;
        result_rx.await.map_err(|_| ReplicationError::Shutdown)?
    }

    fn enqueue(&self, task: Task) -> ReplicationResult<()> {
        {
            let mut state = self.shared.state.lock();
            if state.failed || state.done {
                return Err(ReplicationError::Shutdown);
            }
            state.outstanding += 1;
            // Resize while the queue backs up beyond what idle workers can
            // absorb.
            if self.shared.workers_started.load(Ordering::SeqCst)
                && state.outstanding > state.workers.saturating_sub(state.working)
                && state.workers < self.shared.max_workers
            {
                drop(state);
                self.spawn_worker(false);
                self.shared
                    .context
                    .metrics
                    .node_metrics
                    .pool_workers_spawned
                    .inc();
            }
        }
        self.shared
            .sender
            .send(QueueEntry::Task(task))
            .map_err(|_| ReplicationError::Shutdown)
    }

    /// Signal that no further tasks will be enqueued. Workers drain the
    /// queue, run their cleanup hook and commit their transactions.
    pub fn set_done(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.done || state.failed {
                return;
            }
            state.done = true;
        }
        let _ = self.shared.sender.send(QueueEntry::Done);
    }

    /// Roll back all open transactions. Pending tasks are rejected.
    pub fn abort(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.done || state.failed {
                return;
            }
            state.failed = true;
            state.aborted = true;
        }
        let _ = self.shared.sender.send(QueueEntry::Failed);
    }

    /// Propagate an error to all workers and the completion future. The first
    /// failure wins; later ones are logged and dropped.
    pub fn fail(&self, err: ReplicationError) {
        {
            let mut state = self.shared.state.lock();
            if state.failed || state.done {
                debug!("pool {} already closed, dropping {err}", self.shared.name);
                return;
            }
            state.failed = true;
            state.failure = Some(err);
        }
        let _ = self.shared.sender.send(QueueEntry::Failed);
    }

    /// Reference-counted shutdown: the pool starts with a count of 1 and
    /// `set_done` runs implicitly when the count drops to zero.
    pub fn acquire(&self) {
        self.shared.state.lock().ref_count += 1;
    }

    pub fn release(&self) {
        let drained = {
            let mut state = self.shared.state.lock();
            state.ref_count = state.ref_count.saturating_sub(1);
            state.ref_count == 0
        };
        if drained {
            self.set_done();
        }
    }

    fn spawn_worker(&self, is_initial: bool) {
        let worker_index = {
            let mut state = self.shared.state.lock();
            state.workers += 1;
            state.total_spawned += 1;
            state.total_spawned - 1
        };
        self.shared.context.metrics.node_metrics.pool_workers.inc();
        let shared = self.shared.clone();
        tokio::task::spawn_blocking(move || {
            let result = worker_loop(&shared, worker_index, is_initial);
            if let Err(err) = result {
                let pool = TransactionPool {
                    shared: shared.clone(),
                };
                if matches!(err, ReplicationError::Aborted) {
                    debug!("worker {} of pool {} aborted", worker_index, shared.name);
                } else {
                    warn!(
                        "worker {} of pool {} failed: {err}",
                        worker_index, shared.name
                    );
                    pool.fail(err);
                }
            }
            shared.context.metrics.node_metrics.pool_workers.dec();
            let remaining = {
                let mut state = shared.state.lock();
                state.workers -= 1;
                state.workers
            };
            let _ = shared.exited_tx.send(remaining);
        });
    }
}

fn worker_loop(shared: &PoolShared, worker_index: usize, is_initial: bool) -> ReplicationResult<()> {
    let conn = match shared.mode {
        TransactionMode::Write => shared.db.connect()?,
        TransactionMode::ReadOnly => shared.db.connect_read_only()?,
    };
    conn.execute_batch("BEGIN")?;
    debug!(
        "worker {} of pool {} opened its transaction",
        worker_index, shared.name
    );
    if let Some(init) = &shared.init {
        if let Err(err) = init(&conn, worker_index) {
            let _ = conn.execute_batch("ROLLBACK");
            return Err(err);
        }
    }
    let timeout = if is_initial {
        shared.context.parameters.keepalive_interval
    } else {
        shared.context.parameters.idle_timeout
    };
    loop {
        match shared.receiver.recv_timeout(timeout) {
            Ok(QueueEntry::Task(task)) => {
                let failed = {
                    let mut state = shared.state.lock();
                    state.outstanding = state.outstanding.saturating_sub(1);
                    if !state.failed {
                        state.working += 1;
                    }
                    state.failed
                };
                if failed {
                    // Reject without executing; read callers observe their
                    // oneshot dropping.
                    continue;
                }
                let result = execute_task(&conn, task);
                shared
                    .context
                    .metrics
                    .node_metrics
                    .pool_tasks_processed
                    .inc();
                shared.state.lock().working -= 1;
                if let Err(err) = result {
                    let _ = conn.execute_batch("ROLLBACK");
                    return Err(err);
                }
            }
            Ok(QueueEntry::Done) => {
                // Leave the sentinel for the siblings.
                let _ = shared.sender.send(QueueEntry::Done);
                return finish_worker(shared, &conn, worker_index);
            }
            Ok(QueueEntry::Failed) => {
                let _ = shared.sender.send(QueueEntry::Failed);
                let _ = conn.execute_batch("ROLLBACK");
                return Err(ReplicationError::Aborted);
            }
            Err(RecvTimeoutError::Timeout) => {
                if is_initial {
                    // Keep the connection and transaction warm.
                    conn.query_row("SELECT 1", [], |_| Ok(()))?;
                    continue;
                }
                debug!(
                    "extra worker {} of pool {} idled out",
                    worker_index, shared.name
                );
                return finish_worker(shared, &conn, worker_index);
            }
            Err(RecvTimeoutError::Disconnected) => {
                return finish_worker(shared, &conn, worker_index);
            }
        }
    }
}

fn execute_task(conn: &Connection, task: Task) -> ReplicationResult<()> {
    match task {
        Task::Write(task) => {
            let statements = task(conn)?;
            for statement in statements {
                conn.execute(
                    &statement.sql,
                    rusqlite::params_from_iter(statement.params.iter()),
                )?;
            }
            Ok(())
        }
        Task::Read(task) => {
            task(conn);
            Ok(())
        }
    }
}

fn finish_worker(
    shared: &PoolShared,
    conn: &Connection,
    worker_index: usize,
) -> ReplicationResult<()> {
    if let Some(cleanup) = &shared.cleanup {
        if let Err(err) = cleanup(conn, worker_index) {
            let _ = conn.execute_batch("ROLLBACK");
            return Err(err);
        }
    }
    conn.execute_batch("COMMIT")?;
    debug!(
        "worker {} of pool {} committed and exited",
        worker_index, shared.name
    );
    Ok(())
}

/// Coordination for a snapshot shared between an exporting worker and a set
/// of consuming workers, possibly in different pools. The embedded engine has
/// no exportable snapshot token; equivalence of the views is guaranteed by
/// ordering (the single writer stays paused until every consumer has opened
/// its read transaction), and the token is carried for observability.
pub struct SnapshotExchange {
    token: StdMutex<Option<String>>,
    captured: StdMutex<usize>,
    signal: Condvar,
    expected: usize,
}

impl SnapshotExchange {
    pub fn new(expected: usize) -> Arc<Self> {
        Arc::new(Self {
            token: StdMutex::new(None),
            captured: StdMutex::new(0),
            signal: Condvar::new(),
            expected,
        })
    }

    fn publish(&self, token: String) {
        *self.token.lock().unwrap() = Some(token);
        self.signal.notify_all();
    }

    fn wait_for_token(&self) -> String {
        let mut token = self.token.lock().unwrap();
        while token.is_none() {
            token = self.signal.wait(token).unwrap();
        }
        token.clone().unwrap()
    }

    fn capture(&self) {
        let mut captured = self.captured.lock().unwrap();
        *captured += 1;
        self.signal.notify_all();
    }

    fn wait_captured(&self) {
        let mut captured = self.captured.lock().unwrap();
        while *captured < self.expected {
            captured = self.signal.wait(captured).unwrap();
        }
    }
}

/// Materialize the connection's read snapshot and derive its token. The last
/// archived watermark doubles as the token since it identifies the view.
fn materialize_snapshot(conn: &Connection) -> ReplicationResult<String> {
    let token: Option<String> = conn
        .query_row("SELECT MAX(watermark) FROM change_log", [], |row| row.get(0))
        .unwrap_or(None);
    Ok(token.unwrap_or_default())
}

/// Init/cleanup hooks for an exporter worker: the snapshot is exported on
/// init and the worker does not close its transaction until every consumer
/// has captured the view.
pub fn synchronized_snapshots(exchange: Arc<SnapshotExchange>) -> (WorkerHook, WorkerHook) {
    let init_exchange = exchange.clone();
    let init: WorkerHook = Arc::new(move |conn, _worker| {
        let token = materialize_snapshot(conn)?;
        debug!("exported snapshot at '{token}'");
        init_exchange.publish(token);
        Ok(())
    });
    let cleanup: WorkerHook = Arc::new(move |_conn, _worker| {
        exchange.wait_captured();
        Ok(())
    });
    (init, cleanup)
}

/// Init hook importing a snapshot exposed by an exporter.
pub fn import_snapshot(exchange: Arc<SnapshotExchange>) -> WorkerHook {
    Arc::new(move |conn, worker| {
        let token = exchange.wait_for_token();
        let seen = materialize_snapshot(conn)?;
        debug!("worker {worker} imported snapshot '{token}' (sees '{seen}')");
        exchange.capture();
        Ok(())
    })
}

/// Init hook making all `workers` initial workers of a read pool observe one
/// snapshot: the first worker to arrive exports, everyone opens their read
/// transaction, and nobody proceeds to the queue until all are open. Workers
/// spawned beyond the initial set skip the setup; by then the snapshot phase
/// is over.
pub fn shared_snapshot(workers: usize) -> (WorkerHook, Arc<SnapshotExchange>) {
    let exchange = SnapshotExchange::new(workers);
    let barrier = Arc::new(std::sync::Barrier::new(workers));
    let hook_exchange = exchange.clone();
    let hook: WorkerHook = Arc::new(move |conn, worker| {
        if worker >= workers {
            return Ok(());
        }
        let token = materialize_snapshot(conn)?;
        if worker == 0 {
            hook_exchange.publish(token);
        }
        hook_exchange.capture();
        barrier.wait();
        Ok(())
    });
    (hook, exchange)
}
