// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The sole writer of the change log.
//!
//! The storer sequences the incoming downstream into one database
//! transaction per upstream commit, acknowledges upstream only after the
//! commit is durable, and opens a read-only snapshot immediately after each
//! commit to catch up queued subscribers. Its queue is strict FIFO; only one
//! transaction is ever open.

use std::sync::{atomic::AtomicBool, Arc};

use itertools::Itertools as _;
use parking_lot::Mutex;
use rusqlite::types::Value as SqlValue;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::{
    catchup,
    change::{Change, Watermark},
    context::Context,
    error::{is_serialization_failure, ReplicationError, ReplicationResult},
    protocol::{Ack, Downstream, SubscriberMode, WatermarkedFrame},
    store::{self, ChangeDb, ReplicationState, StartStreamParameters},
    subscriber::Subscriber,
    transaction_pool::{shared_snapshot, Statement, TransactionMode, TransactionPool},
};

/// Callback invoked when the storer hits a non-recoverable condition that the
/// process supervisor must handle, e.g. a backup subscriber that can no
/// longer be caught up.
pub type FatalCallback = Box<dyn Fn(&ReplicationError) + Send + Sync>;

enum StorerEntry {
    Change { entry: WatermarkedFrame, bytes: usize },
    /// Barrier: resolves once every entry enqueued before it was processed.
    Ready(oneshot::Sender<()>),
    Subscriber(Arc<Subscriber>),
    Status { watermark: Watermark },
    Abort,
    Stop,
}

struct StorerShared {
    context: Arc<Context>,
    db: ChangeDb,
    sender: mpsc::UnboundedSender<StorerEntry>,
    acks: mpsc::UnboundedSender<Ack>,
    queued_bytes: watch::Sender<usize>,
    fatal: Option<FatalCallback>,
    reset_required: AtomicBool,
}

/// Handle to the storer. Clones share the same queue.
#[derive(Clone)]
pub struct Storer {
    shared: Arc<StorerShared>,
}

/// The storer's run loop, driven by the owner of the queue receiver.
pub struct StorerTask {
    shared: Arc<StorerShared>,
    receiver: mpsc::UnboundedReceiver<StorerEntry>,
}

impl Storer {
    /// Create the storer and its run loop. Acks flow out of the returned
    /// receiver; `fatal` is invoked on conditions the supervisor must act on.
    pub fn new(
        context: Arc<Context>,
        db: ChangeDb,
        fatal: Option<FatalCallback>,
    ) -> (Self, StorerTask, mpsc::UnboundedReceiver<Ack>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (acks, ack_receiver) = mpsc::unbounded_channel();
        let shared = Arc::new(StorerShared {
            context,
            db,
            sender,
            acks,
            queued_bytes: watch::Sender::new(0),
            fatal,
            reset_required: AtomicBool::new(false),
        });
        (
            Self {
                shared: shared.clone(),
            },
            StorerTask { shared, receiver },
            ack_receiver,
        )
    }

    /// Claim the change log for this task: only the owner may append, and a
    /// takeover invalidates any in-flight transaction of the previous owner.
    pub async fn assume_ownership(&self) -> ReplicationResult<()> {
        let db = self.shared.db.clone();
        let task_id = self.shared.context.task_id.clone();
        let address = self.shared.context.address.clone();
        tokio::task::spawn_blocking(move || {
            let conn = db.connect()?;
            store::set_owner(&conn, &task_id, &address)
        })
        .await
        .map_err(|_| ReplicationError::Shutdown)??;
        info!("assumed change log ownership as {}", self.shared.context.task_id);
        Ok(())
    }

    /// Drain pending enqueued work, then read the resume point and the
    /// backfills the previous session left in flight.
    pub async fn get_start_stream_initialization_parameters(
        &self,
    ) -> ReplicationResult<StartStreamParameters> {
        let (ready_tx, ready_rx) = oneshot::channel();
        self.send(StorerEntry::Ready(ready_tx))?;
        ready_rx.await.map_err(|_| ReplicationError::Shutdown)?;

        let db = self.shared.db.clone();
        let parameters: StartStreamParameters = tokio::task::spawn_blocking(move || {
            let conn = db.connect()?;
            let state = store::read_replication_state(&conn)?;
            let backfill_requests = store::list_backfill_requests(&conn)?;
            Ok::<_, ReplicationError>(StartStreamParameters {
                last_watermark: state.last_watermark,
                backfill_requests,
            })
        })
        .await
        .map_err(|_| ReplicationError::Shutdown)??;
        info!(
            "resuming stream after {} with {} pending backfills: [{}]",
            parameters.last_watermark,
            parameters.backfill_requests.len(),
            parameters
                .backfill_requests
                .iter()
                .map(|b| format!("{}.{}.{}", b.schema, b.table, b.column))
                .join(", "),
        );
        Ok(parameters)
    }

    /// Enqueue a watermarked change for archival.
    pub fn store(&self, entry: WatermarkedFrame) -> ReplicationResult<()> {
        let bytes = serde_json::to_vec(&entry.frame)
            .map_err(|e| ReplicationError::Malformed(e.to_string()))?
            .len();
        self.shared.queued_bytes.send_modify(|b| *b += bytes);
        self.shared
            .context
            .metrics
            .node_metrics
            .storer_queued_bytes
            .set(*self.shared.queued_bytes.borrow() as i64);
        self.send(StorerEntry::Change { entry, bytes })
    }

    /// Enqueue a status message; it is acked as soon as it is dequeued, after
    /// all previously enqueued commits.
    pub fn status(&self, watermark: Watermark) -> ReplicationResult<()> {
        self.send(StorerEntry::Status { watermark })
    }

    /// Enqueue a catch-up request. It is served on a snapshot taken right
    /// after the next commit, or immediately if no transaction is open.
    pub fn catchup(&self, subscriber: Arc<Subscriber>) -> ReplicationResult<()> {
        self.send(StorerEntry::Subscriber(subscriber))
    }

    /// Roll back the open transaction, if any.
    pub fn abort(&self) -> ReplicationResult<()> {
        self.send(StorerEntry::Abort)
    }

    /// Enqueue the stop sentinel; the loop drains up to it and exits.
    pub fn stop(&self) -> ReplicationResult<()> {
        self.send(StorerEntry::Stop)
    }

    /// Back-pressure: `None` while the queued-byte estimate is under the
    /// configured budget, otherwise a future that resolves once usage falls
    /// below 80% of it.
    pub fn ready_for_more(&self) -> Option<impl std::future::Future<Output = ()> + Send + 'static> {
        let limit = self.shared.context.parameters.back_pressure_limit_bytes;
        if *self.shared.queued_bytes.borrow() <= limit {
            return None;
        }
        self.shared
            .context
            .metrics
            .node_metrics
            .storer_backpressure_events
            .inc();
        let release = limit - limit / 5;
        let mut watcher = self.shared.queued_bytes.subscribe();
        Some(async move {
            loop {
                if *watcher.borrow_and_update() <= release {
                    return;
                }
                if watcher.changed().await.is_err() {
                    return;
                }
            }
        })
    }

    /// Delete change-log rows before `watermark`. A no-op returning 0 when
    /// this task is not the owner.
    pub async fn purge_records_before(&self, watermark: Watermark) -> ReplicationResult<usize> {
        let db = self.shared.db.clone();
        let task_id = self.shared.context.task_id.clone();
        let metrics = self.shared.context.metrics.clone();
        tokio::task::spawn_blocking(move || {
            let conn = db.connect()?;
            conn.execute_batch("BEGIN")?;
            let owner = store::read_owner(&conn)?;
            if owner.as_deref() != Some(task_id.as_str()) {
                conn.execute_batch("ROLLBACK")?;
                debug!("skipping purge: change log is owned by {owner:?}");
                return Ok(0);
            }
            let deleted = store::purge_before(&conn, &watermark)?;
            conn.execute_batch("COMMIT")?;
            metrics
                .node_metrics
                .purged_change_log_rows
                .inc_by(deleted as u64);
            Ok(deleted)
        })
        .await
        .map_err(|_| ReplicationError::Shutdown)?
    }

    /// Whether a fatal auto-reset condition was observed.
    pub fn reset_required(&self) -> bool {
        self.shared
            .reset_required
            .load(std::sync::atomic::Ordering::SeqCst)
    }

    fn send(&self, entry: StorerEntry) -> ReplicationResult<()> {
        self.shared
            .sender
            .send(entry)
            .map_err(|_| ReplicationError::Shutdown)
    }
}

/// State of the one open archive transaction.
struct OpenTransaction {
    pool: TransactionPool,
    run: tokio::task::JoinHandle<ReplicationResult<()>>,
    pre_commit: Watermark,
    pos: i64,
    rows_since_flush: usize,
    state_read: Arc<Mutex<Option<ReplicationState>>>,
}

impl StorerTask {
    pub async fn run(mut self) -> ReplicationResult<()> {
        let result = self.run_inner().await;
        match &result {
            Ok(()) => info!("storer stopped"),
            Err(err) if err.is_expected_control_flow() => debug!("storer closed: {err}"),
            Err(err) => warn!("storer failed: {err}"),
        }
        result
    }

    async fn run_inner(&mut self) -> ReplicationResult<()> {
        let mut open: Option<OpenTransaction> = None;
        let mut pending_catchups: Vec<Arc<Subscriber>> = Vec::new();
        while let Some(entry) = self.receiver.recv().await {
            match entry {
                StorerEntry::Change { entry, bytes } => {
                    let result = self.process_change(&mut open, entry).await;
                    self.shared.queued_bytes.send_modify(|b| {
                        *b = b.saturating_sub(bytes);
                    });
                    self.shared
                        .context
                        .metrics
                        .node_metrics
                        .storer_queued_bytes
                        .set(*self.shared.queued_bytes.borrow() as i64);
                    match result {
                        Ok(committed) => {
                            if committed && !pending_catchups.is_empty() {
                                self.serve_catchups(std::mem::take(&mut pending_catchups)).await;
                            }
                        }
                        Err(err) => {
                            // Catch-ups parked on this transaction are served
                            // after the rollback; the snapshot is consistent
                            // either way.
                            if !pending_catchups.is_empty() {
                                self.serve_catchups(std::mem::take(&mut pending_catchups)).await;
                            }
                            return Err(err);
                        }
                    }
                }
                StorerEntry::Ready(done) => {
                    let _ = done.send(());
                }
                StorerEntry::Subscriber(subscriber) => {
                    if open.is_some() {
                        pending_catchups.push(subscriber);
                    } else {
                        self.serve_catchups(vec![subscriber]).await;
                    }
                }
                StorerEntry::Status { watermark } => {
                    // Status acks carry no durability obligation.
                    let _ = self.shared.acks.send(Ack::Status { watermark });
                    self.shared.context.metrics.node_metrics.acks_sent.inc();
                }
                StorerEntry::Abort => {
                    if let Some(tx) = open.take() {
                        Self::abort_transaction(tx).await;
                        self.shared
                            .context
                            .metrics
                            .node_metrics
                            .transactions_rolled_back
                            .inc();
                    }
                }
                StorerEntry::Stop => {
                    if let Some(tx) = open.take() {
                        Self::abort_transaction(tx).await;
                    }
                    if !pending_catchups.is_empty() {
                        self.serve_catchups(std::mem::take(&mut pending_catchups)).await;
                    }
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Apply one change entry. Returns `Ok(true)` when the entry durably
    /// committed a transaction.
    async fn process_change(
        &self,
        open: &mut Option<OpenTransaction>,
        entry: WatermarkedFrame,
    ) -> ReplicationResult<bool> {
        let WatermarkedFrame { watermark, frame } = entry;
        match frame {
            Downstream::Begin { .. } => {
                if open.is_some() {
                    return Err(ReplicationError::Malformed(format!(
                        "begin at {watermark} inside an open transaction"
                    )));
                }
                *open = Some(self.begin_transaction(watermark)?);
                Ok(false)
            }
            Downstream::Data(change) => {
                if open.is_none() {
                    return Err(ReplicationError::Malformed(format!(
                        "data change at {watermark} outside a transaction"
                    )));
                }
                let (enqueue, flush_pool) = {
                    let tx = open.as_mut().expect("transaction is open");
                    tx.pos += 1;
                    let statement = insert_change_statement(
                        &tx.pre_commit,
                        tx.pos,
                        None,
                        &Change::Data(change.clone()),
                    )?;
                    let enqueue = if change.is_schema_change() {
                        tx.pool.process(move |conn| {
                            apply_schema_side_effects(conn, &change)?;
                            Ok(vec![statement])
                        })
                    } else {
                        tx.pool.process(move |_conn| Ok(vec![statement]))
                    };
                    // Yield to the worker periodically so queued statements
                    // stay bounded inside one large transaction.
                    tx.rows_since_flush += 1;
                    let flush_pool = if tx.rows_since_flush
                        >= self.shared.context.parameters.commit_flush_every_n
                    {
                        tx.rows_since_flush = 0;
                        Some(tx.pool.clone())
                    } else {
                        None
                    };
                    (enqueue, flush_pool)
                };
                if let Err(err) = enqueue {
                    let tx = open.take().expect("transaction is open");
                    return Err(self.resolve_failed_transaction(tx, err).await);
                }
                self.shared.context.metrics.node_metrics.changes_stored.inc();
                if let Some(pool) = flush_pool {
                    if let Err(err) = pool.process_read_task(|_conn| Ok(())).await {
                        let tx = open.take().expect("transaction is open");
                        return Err(self.resolve_failed_transaction(tx, err).await);
                    }
                }
                Ok(false)
            }
            Downstream::Commit {
                watermark: commit_watermark,
            } => {
                let Some(mut tx) = open.take() else {
                    return Err(ReplicationError::Malformed(format!(
                        "commit at {commit_watermark} outside a transaction"
                    )));
                };
                tx.pos += 1;
                let task_id = self.shared.context.task_id.clone();
                let state_read = tx.state_read.clone();
                let commit_statement = insert_change_statement(
                    &commit_watermark,
                    tx.pos,
                    Some(&tx.pre_commit),
                    &Change::Commit,
                )?;
                let last_watermark_statement = Statement::new(
                    "UPDATE replication_state SET last_watermark = ?1 WHERE lock = 1",
                    vec![SqlValue::Text(commit_watermark.clone())],
                );
                let enqueue = tx.pool.process(move |_conn| {
                    let state = state_read.lock().take().ok_or_else(|| {
                        ReplicationError::Internal(
                            "replication state was not read at begin".to_string(),
                        )
                    })?;
                    let owner = state.owner.unwrap_or_default();
                    if owner != task_id {
                        return Err(ReplicationError::OwnershipLost(owner));
                    }
                    Ok(vec![commit_statement, last_watermark_statement])
                });
                if let Err(err) = enqueue {
                    return Err(self.resolve_failed_transaction(tx, err).await);
                }
                tx.pool.set_done();
                match await_pool(tx.run).await {
                    Ok(()) => {
                        self.shared.context.metrics.node_metrics.commits_stored.inc();
                        self.shared.context.metrics.node_metrics.acks_sent.inc();
                        let _ = self.shared.acks.send(Ack::Commit {
                            watermark: commit_watermark.clone(),
                        });
                        debug!("committed transaction at {commit_watermark}");
                        Ok(true)
                    }
                    Err(err) => Err(self.map_commit_failure(err).await),
                }
            }
            Downstream::Rollback => {
                let Some(tx) = open.take() else {
                    return Err(ReplicationError::Malformed(format!(
                        "rollback at {watermark} outside a transaction"
                    )));
                };
                Self::abort_transaction(tx).await;
                self.shared
                    .context
                    .metrics
                    .node_metrics
                    .transactions_rolled_back
                    .inc();
                // The change log is unaffected, but parked catch-ups can now
                // be served; report this like a completed transaction.
                Ok(true)
            }
            Downstream::Status {
                watermark: status_watermark,
                ..
            } => {
                let _ = self.shared.acks.send(Ack::Status {
                    watermark: status_watermark,
                });
                self.shared.context.metrics.node_metrics.acks_sent.inc();
                Ok(false)
            }
            Downstream::Control(_) | Downstream::Error(_) => Err(ReplicationError::Malformed(
                format!("unexpected frame offered for archival at {watermark}"),
            )),
        }
    }

    fn begin_transaction(&self, pre_commit: Watermark) -> ReplicationResult<OpenTransaction> {
        let pool = TransactionPool::new(
            self.shared.context.clone(),
            format!("storer-{pre_commit}"),
            TransactionMode::Write,
            self.shared.db.clone(),
            1,
            1,
            None,
            None,
        );
        let run = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.run().await })
        };
        // Pipeline the replication-state read; its owner is verified when the
        // commit entry arrives.
        let state_read = Arc::new(Mutex::new(None));
        let slot = state_read.clone();
        pool.process(move |conn| {
            *slot.lock() = Some(store::read_replication_state(conn)?);
            Ok(vec![])
        })?;
        let begin_statement = insert_change_statement(&pre_commit, 0, None, &Change::Begin)?;
        pool.process(move |_conn| Ok(vec![begin_statement]))?;
        self.shared.context.metrics.node_metrics.changes_stored.inc();
        Ok(OpenTransaction {
            pool,
            run,
            pre_commit,
            pos: 0,
            rows_since_flush: 0,
            state_read,
        })
    }

    async fn abort_transaction(tx: OpenTransaction) {
        tx.pool.abort();
        let _ = await_pool(tx.run).await;
    }

    /// An enqueue failed because the pool already failed underneath us; fetch
    /// the pool's own error and translate it.
    async fn resolve_failed_transaction(
        &self,
        tx: OpenTransaction,
        enqueue_err: ReplicationError,
    ) -> ReplicationError {
        match await_pool(tx.run).await {
            Ok(()) => enqueue_err,
            Err(err) => self.map_commit_failure(err).await,
        }
    }

    /// Ownership changes race the open transaction through the engine's
    /// conflict detection. On a serialization failure, re-read the current
    /// owner on a fresh connection to report who took over.
    async fn map_commit_failure(&self, err: ReplicationError) -> ReplicationError {
        let serialization = matches!(
            &err,
            ReplicationError::Database(db_err) if is_serialization_failure(db_err)
        );
        if !serialization {
            return err;
        }
        let db = self.shared.db.clone();
        let owner = tokio::task::spawn_blocking(move || {
            let conn = db.connect()?;
            store::read_owner(&conn)
        })
        .await
        .unwrap_or(Err(ReplicationError::Shutdown));
        match owner {
            Ok(Some(owner)) if owner != self.shared.context.task_id => {
                ReplicationError::OwnershipLost(format!("{owner} (serialization failure)"))
            }
            Ok(_) => err,
            Err(_) => ReplicationError::OwnershipLost(
                "another task (serialization failure; owner could not be read)".to_string(),
            ),
        }
    }

    /// Open a read pool on a snapshot of the database as of this moment
    /// (i.e. right after the last commit) and replay the archive to each
    /// waiting subscriber. The snapshot must be established before this
    /// returns: the loop may not write the next transaction until every
    /// reader's view is pinned. The replays themselves run detached, since
    /// WAL readers do not block the writer and each subscriber fails
    /// independently.
    async fn serve_catchups(&self, subscribers: Vec<Arc<Subscriber>>) {
        let workers = subscribers
            .len()
            .min(self.shared.context.parameters.max_workers)
            .max(1);
        let (snapshot_hook, _exchange) = shared_snapshot(workers);
        let pool = TransactionPool::new(
            self.shared.context.clone(),
            "catchup",
            TransactionMode::ReadOnly,
            self.shared.db.clone(),
            workers,
            workers,
            Some(snapshot_hook),
            None,
        );
        let run = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.run().await })
        };
        // A no-op read task resolves only after the snapshot barrier, i.e.
        // once every worker has its read transaction open.
        if let Err(err) = pool.process_read_task(|_conn| Ok(())).await {
            warn!("catch-up snapshot was not established: {err}");
            for subscriber in subscribers {
                close_subscriber(subscriber, ReplicationError::Shutdown).await;
            }
            pool.release();
            return;
        }
        for subscriber in subscribers {
            pool.acquire();
            let pool = pool.clone();
            let shared = self.shared.clone();
            tokio::spawn(async move {
                let context = shared.context.clone();
                let task_subscriber = subscriber.clone();
                let result = pool
                    .process_read_task(move |conn| {
                        catchup::catch_up(conn, &context, &task_subscriber)
                    })
                    .await;
                if let Err(err) = result {
                    handle_catchup_failure(&shared, subscriber, err).await;
                }
                pool.release();
            });
        }
        pool.release();
        tokio::spawn(async move {
            if let Ok(Err(err)) = run.await {
                if !err.is_expected_control_flow() {
                    warn!("catch-up pool failed: {err}");
                }
            }
        });
    }
}

async fn await_pool(
    run: tokio::task::JoinHandle<ReplicationResult<()>>,
) -> ReplicationResult<()> {
    run.await
        .map_err(|e| ReplicationError::Internal(format!("pool task panicked: {e}")))?
}

/// A failed catch-up closes only the affected subscriber, except that a
/// backup replica too far behind is a fatal auto-reset condition.
async fn handle_catchup_failure(
    shared: &Arc<StorerShared>,
    subscriber: Arc<Subscriber>,
    err: ReplicationError,
) {
    let err = match (&err, subscriber.mode()) {
        (ReplicationError::WatermarkTooOld { .. }, SubscriberMode::Backup) => {
            let reset = ReplicationError::AutoReset(format!(
                "backup subscriber {} is irrecoverably behind: {err}",
                subscriber.id()
            ));
            shared
                .reset_required
                .store(true, std::sync::atomic::Ordering::SeqCst);
            let db = shared.db.clone();
            let marked = tokio::task::spawn_blocking(move || {
                let conn = db.connect()?;
                store::mark_reset_required(&conn)
            })
            .await
            .unwrap_or(Err(ReplicationError::Shutdown));
            if let Err(mark_err) = marked {
                warn!("failed to mark reset-required: {mark_err}");
            }
            if let Some(fatal) = &shared.fatal {
                fatal(&reset);
            }
            reset
        }
        _ => err,
    };
    if err.is_expected_control_flow() {
        info!("closing subscriber {}: {err}", subscriber.id());
    } else {
        warn!("catch-up of subscriber {} failed: {err}", subscriber.id());
    }
    close_subscriber(subscriber, err).await;
}

async fn close_subscriber(subscriber: Arc<Subscriber>, err: ReplicationError) {
    // The terminal frame is a blocking send; keep it off the async workers.
    let _ = tokio::task::spawn_blocking(move || subscriber.close_with_error(&err)).await;
}

fn insert_change_statement(
    watermark: &str,
    pos: i64,
    precommit: Option<&str>,
    change: &Change,
) -> ReplicationResult<Statement> {
    let encoded =
        serde_json::to_string(change).map_err(|e| ReplicationError::Malformed(e.to_string()))?;
    Ok(Statement::new(
        "INSERT INTO change_log (watermark, pos, precommit, change) VALUES (?1, ?2, ?3, ?4)",
        vec![
            SqlValue::Text(watermark.to_string()),
            SqlValue::Integer(pos),
            precommit
                .map(|p| SqlValue::Text(p.to_string()))
                .unwrap_or(SqlValue::Null),
            SqlValue::Text(encoded),
        ],
    ))
}

/// Schema changes co-write auxiliary rows in the same transaction, so a
/// restarted session can re-request backfills that were cut short.
fn apply_schema_side_effects(
    conn: &rusqlite::Connection,
    change: &crate::change::DataChange,
) -> ReplicationResult<()> {
    use crate::change::DataChange;
    match change {
        DataChange::CreateTable { spec } => {
            let metadata = serde_json::to_value(spec)
                .map_err(|e| ReplicationError::Malformed(e.to_string()))?;
            store::upsert_table_metadata(conn, &spec.schema, &spec.name, &metadata)?;
        }
        DataChange::UpdateTableMetadata { table, metadata } => {
            store::upsert_table_metadata(conn, &table.schema, &table.name, metadata)?;
        }
        DataChange::RenameTable { old, new } => {
            store::rename_tracked_table(conn, &old.schema, &old.name, &new.schema, &new.name)?;
        }
        DataChange::DropTable { table } => {
            store::delete_table_metadata(conn, &table.schema, &table.name)?;
            store::delete_backfills_for_table(conn, &table.schema, &table.name)?;
        }
        DataChange::AddColumn { table, column } => {
            // A freshly added column starts backfilling until the source
            // reports completion.
            let backfill = serde_json::json!({ "column": column });
            store::upsert_backfill(conn, &table.schema, &table.name, &column.name, &backfill)?;
        }
        DataChange::UpdateColumn { table, old, new } => {
            store::rename_tracked_column(conn, &table.schema, &table.name, &old.name, &new.name)?;
        }
        DataChange::DropColumn { table, column }
        | DataChange::BackfillCompleted { table, column, .. } => {
            store::delete_backfill(conn, &table.schema, &table.name, column)?;
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::{DataChange, Relation};
    use crate::protocol::{SubscriberMode, SubscriptionRequest, PROTOCOL_VERSION};
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn issue_relation() -> Relation {
        Relation {
            schema: "public".into(),
            name: "issue".into(),
            key_columns: vec!["id".into()],
        }
    }

    fn insert_foo() -> Downstream {
        Downstream::Data(DataChange::Insert {
            relation: issue_relation(),
            new: json!({"id": "foo"}).as_object().unwrap().clone(),
        })
    }

    /// A shard initial-synced at 02 with transactions archived at 03 and 06,
    /// owned by task-0.
    fn seeded_storer() -> (
        Storer,
        StorerTask,
        UnboundedReceiver<Ack>,
        ChangeDb,
        tempfile::TempDir,
    ) {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let (context, dir) = Context::new_for_test();
        let db = ChangeDb::new(context.parameters.db_path.clone().unwrap());
        let conn = db.connect().unwrap();
        store::init_replication_state(&conn, "02", &[]).unwrap();
        store::set_owner(&conn, "task-0", "localhost:3000").unwrap();
        for watermark in ["03", "06"] {
            store::insert_change_log_row(&conn, watermark, 0, None, &Change::Begin).unwrap();
            store::insert_change_log_row(
                &conn,
                watermark,
                1,
                None,
                &Change::Data(DataChange::Truncate { relations: vec![] }),
            )
            .unwrap();
            store::insert_change_log_row(&conn, watermark, 2, Some(watermark), &Change::Commit)
                .unwrap();
        }
        drop(conn);
        let (storer, task, acks) = Storer::new(Arc::new(context), db.clone(), None);
        (storer, task, acks, db, dir)
    }

    fn store_transaction(storer: &Storer) {
        storer
            .store(WatermarkedFrame::new(
                "07",
                Downstream::Begin {
                    commit_watermark: "08".into(),
                },
            ))
            .unwrap();
        storer
            .store(WatermarkedFrame::new("07", insert_foo()))
            .unwrap();
        storer
            .store(WatermarkedFrame::new(
                "08",
                Downstream::Commit {
                    watermark: "08".into(),
                },
            ))
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn fresh_storer_archives_one_transaction() {
        let (storer, task, mut acks, db, _dir) = seeded_storer();
        let run = tokio::spawn(task.run());

        store_transaction(&storer);
        assert_eq!(
            acks.recv().await.unwrap(),
            Ack::Commit {
                watermark: "08".into()
            }
        );

        let conn = db.connect().unwrap();
        let rows = store::scan_batch(&conn, "06", i64::MAX, 10).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!((rows[0].watermark.as_str(), rows[0].pos), ("07", 0));
        assert_eq!(rows[0].change, Change::Begin);
        assert_eq!((rows[1].watermark.as_str(), rows[1].pos), ("07", 1));
        assert!(matches!(rows[1].change, Change::Data(_)));
        assert_eq!((rows[2].watermark.as_str(), rows[2].pos), ("08", 2));
        assert_eq!(rows[2].precommit.as_deref(), Some("07"));
        assert_eq!(
            store::read_replication_state(&conn).unwrap().last_watermark,
            "08"
        );

        storer.stop().unwrap();
        run.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn rollback_discards_the_transaction() {
        let (storer, task, _acks, db, _dir) = seeded_storer();
        let run = tokio::spawn(task.run());

        storer
            .store(WatermarkedFrame::new(
                "07",
                Downstream::Begin {
                    commit_watermark: "08".into(),
                },
            ))
            .unwrap();
        storer
            .store(WatermarkedFrame::new("07", insert_foo()))
            .unwrap();
        storer
            .store(WatermarkedFrame::new("07", Downstream::Rollback))
            .unwrap();
        storer.stop().unwrap();
        run.await.unwrap().unwrap();

        let conn = db.connect().unwrap();
        let rows = store::scan_batch(&conn, "06", i64::MAX, 10).unwrap();
        assert!(rows.is_empty());
        assert_eq!(
            store::read_replication_state(&conn).unwrap().last_watermark,
            "02"
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn ownership_change_fails_commit_with_serialization_failure() {
        let (storer, task, _acks, db, _dir) = seeded_storer();

        // Another task takes ownership while the storer's transaction is in
        // flight: the handover holds the write lock so the storer's first
        // insert waits, then fails on its stale snapshot.
        let blocker = db.connect().unwrap();
        blocker.execute_batch("BEGIN IMMEDIATE").unwrap();
        store::set_owner(&blocker, "other-task", "elsewhere:3000").unwrap();
        let handover = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(500));
            blocker.execute_batch("COMMIT").unwrap();
        });

        let run = tokio::spawn(task.run());
        store_transaction(&storer);

        let err = run.await.unwrap().unwrap_err();
        assert_eq!(
            err.to_string(),
            "changeLog ownership was concurrently assumed by other-task (serialization failure)"
        );
        handover.join().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn stale_owner_fails_commit() {
        let (storer, task, _acks, db, _dir) = seeded_storer();
        let conn = db.connect().unwrap();
        store::set_owner(&conn, "other-task", "elsewhere:3000").unwrap();
        drop(conn);

        let run = tokio::spawn(task.run());
        store_transaction(&storer);

        let err = run.await.unwrap().unwrap_err();
        assert_eq!(
            err.to_string(),
            "changeLog ownership was concurrently assumed by other-task"
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn purge_respects_watermark_and_ownership() {
        let (storer, task, _acks, db, _dir) = seeded_storer();
        let run = tokio::spawn(task.run());

        assert_eq!(storer.purge_records_before("04".into()).await.unwrap(), 3);
        assert_eq!(storer.purge_records_before("06".into()).await.unwrap(), 0);

        // A non-owner purge is a no-op.
        let conn = db.connect().unwrap();
        store::set_owner(&conn, "other-task", "elsewhere:3000").unwrap();
        drop(conn);
        assert_eq!(storer.purge_records_before("09".into()).await.unwrap(), 0);
        let conn = db.connect().unwrap();
        assert_eq!(store::earliest_watermark(&conn).unwrap().as_deref(), Some("06"));

        storer.stop().unwrap();
        run.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn status_entries_ack_immediately() {
        let (storer, task, mut acks, _db, _dir) = seeded_storer();
        let run = tokio::spawn(task.run());

        storer.status("06".into()).unwrap();
        assert_eq!(
            acks.recv().await.unwrap(),
            Ack::Status {
                watermark: "06".into()
            }
        );

        storer.stop().unwrap();
        run.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn start_stream_parameters_drain_the_queue() {
        let (storer, task, mut acks, db, _dir) = seeded_storer();
        let conn = db.connect().unwrap();
        store::upsert_table_metadata(&conn, "public", "issue", &json!({"pk": ["id"]})).unwrap();
        store::upsert_backfill(&conn, "public", "issue", "labels", &json!({"id": "bf1"})).unwrap();
        drop(conn);
        let run = tokio::spawn(task.run());

        // Work enqueued before the call is visible in the answer.
        store_transaction(&storer);
        let parameters = storer
            .get_start_stream_initialization_parameters()
            .await
            .unwrap();
        assert_eq!(parameters.last_watermark, "08");
        assert_eq!(parameters.backfill_requests.len(), 1);
        assert_eq!(parameters.backfill_requests[0].column, "labels");
        let _ = acks.recv().await.unwrap();

        storer.stop().unwrap();
        run.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn ready_for_more_gates_on_byte_budget() {
        let (context, dir) = Context::new_for_test();
        let mut parameters = context.parameters.clone();
        parameters.back_pressure_limit_bytes = 8;
        let context = context.with_parameters(parameters);
        let db = ChangeDb::new(context.parameters.db_path.clone().unwrap());
        store::init_replication_state(&db.connect().unwrap(), "02", &[]).unwrap();
        store::set_owner(&db.connect().unwrap(), "task-0", "localhost:3000").unwrap();
        let (storer, task, _acks) = Storer::new(Arc::new(context), db, None);

        storer
            .store(WatermarkedFrame::new(
                "07",
                Downstream::Begin {
                    commit_watermark: "08".into(),
                },
            ))
            .unwrap();
        let throttle = storer.ready_for_more();
        assert!(throttle.is_some());

        // Intake resumes once the loop has drained the queued bytes.
        let run = tokio::spawn(task.run());
        tokio::time::timeout(Duration::from_secs(5), throttle.unwrap())
            .await
            .unwrap();
        assert!(storer.ready_for_more().is_none());

        storer.stop().unwrap();
        run.await.unwrap().unwrap();
        drop(dir);
    }

    fn subscriber_at(
        watermark: &str,
        mode: SubscriberMode,
    ) -> (Arc<Subscriber>, tokio::sync::mpsc::Receiver<Downstream>) {
        Subscriber::new(
            SubscriptionRequest {
                protocol_version: PROTOCOL_VERSION,
                id: format!("sub-{watermark}"),
                mode,
                replica_version: "02".into(),
                watermark: watermark.into(),
                initial: false,
            },
            64,
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn catchup_waits_for_the_open_transaction() {
        let (storer, task, mut acks, _db, _dir) = seeded_storer();
        let run = tokio::spawn(task.run());

        storer
            .store(WatermarkedFrame::new(
                "07",
                Downstream::Begin {
                    commit_watermark: "08".into(),
                },
            ))
            .unwrap();
        let (subscriber, mut receiver) = subscriber_at("06", SubscriberMode::Serving);
        storer.catchup(subscriber).unwrap();

        storer
            .store(WatermarkedFrame::new("07", insert_foo()))
            .unwrap();
        storer
            .store(WatermarkedFrame::new(
                "08",
                Downstream::Commit {
                    watermark: "08".into(),
                },
            ))
            .unwrap();
        let _ = acks.recv().await.unwrap();

        // The snapshot was taken after the commit, so catch-up includes the
        // transaction at 08.
        let mut watermarks = Vec::new();
        for _ in 0..3 {
            match receiver.recv().await.unwrap() {
                Downstream::Begin { commit_watermark } => watermarks.push(commit_watermark),
                Downstream::Commit { watermark } => watermarks.push(watermark),
                Downstream::Data(_) => {}
                other => panic!("unexpected frame {other:?}"),
            }
        }
        assert_eq!(watermarks, vec!["08", "08"]);

        storer.stop().unwrap();
        run.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn too_old_serving_subscriber_gets_error_frame() {
        let (storer, task, _acks, _db, _dir) = seeded_storer();
        let run = tokio::spawn(task.run());

        let (subscriber, mut receiver) = subscriber_at("01", SubscriberMode::Serving);
        storer.catchup(subscriber).unwrap();

        match receiver.recv().await.unwrap() {
            Downstream::Error(body) => {
                assert_eq!(
                    body.message,
                    "earliest supported watermark is 03 (requested 01)"
                );
            }
            other => panic!("expected error frame, got {other:?}"),
        }
        assert!(receiver.recv().await.is_none());
        assert!(!storer.reset_required());

        storer.stop().unwrap();
        run.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn too_old_backup_subscriber_is_fatal() {
        let (context, _dir) = Context::new_for_test();
        let db = ChangeDb::new(context.parameters.db_path.clone().unwrap());
        let conn = db.connect().unwrap();
        store::init_replication_state(&conn, "02", &[]).unwrap();
        store::set_owner(&conn, "task-0", "localhost:3000").unwrap();
        store::insert_change_log_row(&conn, "03", 0, None, &Change::Begin).unwrap();
        store::insert_change_log_row(&conn, "03", 1, Some("03"), &Change::Commit).unwrap();
        drop(conn);

        let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel();
        let fatal: FatalCallback = Box::new(move |err| {
            let _ = fatal_tx.send(err.to_string());
        });
        let (storer, task, _acks) = Storer::new(Arc::new(context), db.clone(), Some(fatal));
        let run = tokio::spawn(task.run());

        let (subscriber, mut receiver) = subscriber_at("01", SubscriberMode::Backup);
        storer.catchup(subscriber).unwrap();

        let reported = fatal_rx.recv().await.unwrap();
        assert!(reported.contains("auto reset required"));
        match receiver.recv().await.unwrap() {
            Downstream::Error(body) => assert_eq!(body.kind, crate::protocol::ErrorKind::AutoReset),
            other => panic!("expected error frame, got {other:?}"),
        }
        assert!(storer.reset_required());
        for _ in 0..100 {
            let conn = db.connect().unwrap();
            if store::read_replication_state(&conn).unwrap().reset_required {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let conn = db.connect().unwrap();
        assert!(store::read_replication_state(&conn).unwrap().reset_required);

        storer.stop().unwrap();
        run.await.unwrap().unwrap();
    }
}
