// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Consumer of the downstream stream (live + catch-up), applying it to the
//! embedded replica.
//!
//! The syncer subscribes with the replica's own version and last applied
//! commit, applies transactions as they arrive, echoes status acks upstream,
//! and notifies view drivers through a coalescing watch channel: consumers
//! only ever need the latest applied state version.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    change::Watermark,
    context::Context,
    error::{ReplicationError, ReplicationResult},
    protocol::{Ack, Downstream, ErrorKind, SubscriberMode, SubscriptionRequest, PROTOCOL_VERSION},
    replica::Replica,
};

const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(250);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Where the syncer gets its stream from. The production implementation sits
/// on the websocket transport; tests wire it straight to a streamer.
#[async_trait]
pub trait ChangeSource: Send + Sync + 'static {
    async fn subscribe(&self, request: SubscriptionRequest)
        -> ReplicationResult<ChangeSubscription>;
}

/// A live subscription: frames in, acks out.
pub struct ChangeSubscription {
    pub frames: mpsc::Receiver<Downstream>,
    pub acks: mpsc::UnboundedSender<Ack>,
}

/// What view drivers observe. `schema_epoch` increments whenever an applied
/// commit changed the replica's shape, surviving coalescing of the version
/// itself.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StateVersionNotification {
    pub state_version: Watermark,
    pub schema_epoch: u64,
}

pub type StateVersionReceiver = watch::Receiver<StateVersionNotification>;

pub struct IncrementalSyncer {
    context: Arc<Context>,
    source: Arc<dyn ChangeSource>,
    id: String,
    mode: SubscriberMode,
    notify: watch::Sender<StateVersionNotification>,
    cancel: CancellationToken,
}

impl IncrementalSyncer {
    pub fn new(context: Arc<Context>, source: Arc<dyn ChangeSource>, mode: SubscriberMode) -> Self {
        let id = context.task_id.clone();
        Self {
            context,
            source,
            id,
            mode,
            notify: watch::Sender::new(StateVersionNotification::default()),
            cancel: CancellationToken::new(),
        }
    }

    /// Notifications of newly applied state versions, coalesced to the
    /// latest.
    pub fn subscribe(&self) -> StateVersionReceiver {
        self.notify.subscribe()
    }

    /// Cancel the subscription and stop retrying.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Subscribe and apply until stopped. Transport interruptions reconnect
    /// with exponential backoff from the last applied commit; malformed input
    /// and reset signals are fatal and surface to the supervisor.
    pub async fn run(&self) -> ReplicationResult<()> {
        let mut attempt: u32 = 0;
        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            let path = self
                .context
                .parameters
                .replica_path
                .clone()
                .ok_or_else(|| {
                    ReplicationError::Internal("replica path is not set".to_string())
                })?;
            let replica = Replica::open(&path)?;
            let (replica_version, state_version) = replica.state()?;
            let request = SubscriptionRequest {
                protocol_version: PROTOCOL_VERSION,
                id: self.id.clone(),
                mode: self.mode,
                replica_version: replica_version.clone(),
                watermark: state_version.clone(),
                initial: state_version == replica_version,
            };
            info!(
                "subscribing at watermark {state_version} (replica version {replica_version})"
            );
            let mut progressed = false;
            let outcome = match self.source.subscribe(request).await {
                Ok(subscription) => self.consume(replica, subscription, &mut progressed).await,
                Err(err) => Err(err),
            };
            match outcome {
                Ok(()) => return Ok(()),
                Err(err) if is_fatal(&err) => {
                    error!("replication stream is unrecoverable: {err}");
                    return Err(err);
                }
                Err(err) => {
                    if progressed {
                        attempt = 0;
                    }
                    attempt += 1;
                    let delay = retry_delay(attempt);
                    warn!("replication stream interrupted ({err}), retrying in {delay:?}");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.cancel.cancelled() => return Ok(()),
                    }
                }
            }
        }
    }

    async fn consume(
        &self,
        mut replica: Replica,
        mut subscription: ChangeSubscription,
        progressed: &mut bool,
    ) -> ReplicationResult<()> {
        loop {
            let frame = tokio::select! {
                frame = subscription.frames.recv() => frame,
                _ = self.cancel.cancelled() => {
                    replica.rollback()?;
                    return Ok(());
                }
            };
            let Some(frame) = frame else {
                replica.rollback()?;
                return Err(ReplicationError::Transport(
                    "change stream closed".to_string(),
                ));
            };
            match frame {
                Downstream::Begin { commit_watermark } => {
                    debug!("transaction opening towards {commit_watermark}");
                    replica.begin()?;
                }
                Downstream::Data(change) => {
                    replica.apply(&change)?;
                }
                Downstream::Commit { watermark } => {
                    let outcome = replica.commit(&watermark)?;
                    *progressed = true;
                    let metrics = &self.context.metrics.node_metrics;
                    metrics.replica_commits_applied.inc();
                    metrics
                        .replica_rows_versioned
                        .inc_by(outcome.changed_rows as u64);
                    if outcome.schema_changed {
                        metrics.replica_schema_changes.inc();
                    }
                    if outcome.notify {
                        self.notify.send_modify(|notification| {
                            notification.state_version = outcome.state_version.clone();
                            if outcome.schema_changed {
                                notification.schema_epoch += 1;
                            }
                        });
                    }
                    let _ = subscription.acks.send(Ack::Status { watermark });
                }
                Downstream::Rollback => {
                    replica.rollback()?;
                }
                Downstream::Status { watermark, .. } => {
                    // Prior commits are applied before this point by queue
                    // order, so the echo is immediate.
                    let _ = subscription.acks.send(Ack::Status { watermark });
                }
                Downstream::Control(signal) => {
                    replica.rollback()?;
                    return Err(ReplicationError::AutoReset(format!(
                        "upstream requires a replica reset: {signal:?}"
                    )));
                }
                Downstream::Error(body) => {
                    replica.rollback()?;
                    return Err(map_error_frame(body.kind, body.message));
                }
            }
        }
    }
}

fn map_error_frame(kind: ErrorKind, message: String) -> ReplicationError {
    match kind {
        // Conditions that require re-initial-syncing the replica.
        ErrorKind::WatermarkTooOld | ErrorKind::WrongReplicaVersion | ErrorKind::AutoReset => {
            ReplicationError::AutoReset(message)
        }
        ErrorKind::Protocol => ReplicationError::Protocol(message),
        ErrorKind::Internal => ReplicationError::Transport(message),
    }
}

fn is_fatal(err: &ReplicationError) -> bool {
    !matches!(
        err,
        ReplicationError::Transport(_) | ReplicationError::Shutdown
    )
}

fn retry_delay(attempt: u32) -> Duration {
    let exponential = INITIAL_RETRY_DELAY
        .saturating_mul(1u32 << attempt.min(8))
        .min(MAX_RETRY_DELAY);
    let jitter = rand::thread_rng().gen_range(0..=exponential.as_millis() as u64 / 2);
    exponential + Duration::from_millis(jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::{ColumnSpec, DataChange, Relation, TableSpec};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::VecDeque;

    struct ScriptedSource {
        requests: Mutex<Vec<SubscriptionRequest>>,
        subscriptions: Mutex<VecDeque<ChangeSubscription>>,
    }

    impl ScriptedSource {
        fn new(subscriptions: Vec<ChangeSubscription>) -> Arc<Self> {
            Arc::new(Self {
                requests: Mutex::new(Vec::new()),
                subscriptions: Mutex::new(subscriptions.into()),
            })
        }
    }

    #[async_trait]
    impl ChangeSource for ScriptedSource {
        async fn subscribe(
            &self,
            request: SubscriptionRequest,
        ) -> ReplicationResult<ChangeSubscription> {
            self.requests.lock().push(request);
            self.subscriptions
                .lock()
                .pop_front()
                .ok_or_else(|| ReplicationError::Protocol("no scripted subscription".to_string()))
        }
    }

    fn issue_spec() -> TableSpec {
        TableSpec {
            schema: "public".into(),
            name: "issue".into(),
            columns: vec![
                ColumnSpec {
                    name: "id".into(),
                    data_type: "TEXT".into(),
                    not_null: true,
                },
                ColumnSpec {
                    name: "title".into(),
                    data_type: "TEXT".into(),
                    not_null: false,
                },
            ],
            primary_key: vec!["id".into()],
        }
    }

    fn issue_relation() -> Relation {
        Relation {
            schema: "public".into(),
            name: "issue".into(),
            key_columns: vec!["id".into()],
        }
    }

    fn transaction_frames(commit: &str) -> Vec<Downstream> {
        vec![
            Downstream::Begin {
                commit_watermark: commit.into(),
            },
            Downstream::Data(DataChange::CreateTable { spec: issue_spec() }),
            Downstream::Data(DataChange::Insert {
                relation: issue_relation(),
                new: json!({"id": commit, "title": "hi"})
                    .as_object()
                    .unwrap()
                    .clone(),
            }),
            Downstream::Commit {
                watermark: commit.into(),
            },
        ]
    }

    fn syncer_context() -> (Arc<Context>, tempfile::TempDir) {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let (context, dir) = Context::new_for_test();
        let replica_path = context.parameters.replica_path.clone().unwrap();
        Replica::open(&replica_path).unwrap().initial_sync("02").unwrap();
        (Arc::new(context), dir)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn applies_stream_and_notifies() {
        let (context, _dir) = syncer_context();
        let (frame_tx, frames) = mpsc::channel(64);
        let (ack_tx, mut ack_rx) = mpsc::unbounded_channel();
        let source = ScriptedSource::new(vec![ChangeSubscription {
            frames,
            acks: ack_tx,
        }]);
        let syncer = Arc::new(IncrementalSyncer::new(
            context,
            source.clone(),
            SubscriberMode::Serving,
        ));
        let mut notifications = syncer.subscribe();

        let run_syncer = syncer.clone();
        let run = tokio::spawn(async move { run_syncer.run().await });

        for frame in transaction_frames("03") {
            frame_tx.send(frame).await.unwrap();
        }

        notifications.changed().await.unwrap();
        let notification = notifications.borrow_and_update().clone();
        assert_eq!(notification.state_version, "03");
        assert_eq!(notification.schema_epoch, 1);
        assert_eq!(
            ack_rx.recv().await.unwrap(),
            Ack::Status {
                watermark: "03".into()
            }
        );
        assert_eq!(
            source.requests.lock()[0],
            SubscriptionRequest {
                protocol_version: PROTOCOL_VERSION,
                id: "task-0".into(),
                mode: SubscriberMode::Serving,
                replica_version: "02".into(),
                watermark: "02".into(),
                initial: true,
            }
        );

        syncer.stop();
        run.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn reconnects_from_last_applied_commit() {
        let (context, _dir) = syncer_context();
        let (first_tx, first_frames) = mpsc::channel(64);
        let (second_tx, second_frames) = mpsc::channel(64);
        let (ack_tx, _ack_rx) = mpsc::unbounded_channel();
        let source = ScriptedSource::new(vec![
            ChangeSubscription {
                frames: first_frames,
                acks: ack_tx.clone(),
            },
            ChangeSubscription {
                frames: second_frames,
                acks: ack_tx,
            },
        ]);
        let syncer = Arc::new(IncrementalSyncer::new(
            context,
            source.clone(),
            SubscriberMode::Serving,
        ));
        let mut notifications = syncer.subscribe();

        let run_syncer = syncer.clone();
        let run = tokio::spawn(async move { run_syncer.run().await });

        for frame in transaction_frames("03") {
            first_tx.send(frame).await.unwrap();
        }
        notifications.changed().await.unwrap();
        assert_eq!(notifications.borrow_and_update().state_version, "03");

        // The transport drops; the syncer reconnects from watermark 03.
        drop(first_tx);
        for _ in 0..100 {
            if source.requests.lock().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let request = source.requests.lock()[1].clone();
        assert_eq!(request.watermark, "03");
        assert_eq!(request.replica_version, "02");
        assert!(!request.initial);

        let _ = second_tx;
        syncer.stop();
        run.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn reset_required_is_fatal() {
        let (context, _dir) = syncer_context();
        let (frame_tx, frames) = mpsc::channel(64);
        let (ack_tx, _ack_rx) = mpsc::unbounded_channel();
        let source = ScriptedSource::new(vec![ChangeSubscription {
            frames,
            acks: ack_tx,
        }]);
        let syncer = IncrementalSyncer::new(context, source, SubscriberMode::Serving);

        frame_tx
            .send(Downstream::Control(
                crate::change::ControlSignal::ResetRequired {
                    message: Some("backup diverged".into()),
                },
            ))
            .await
            .unwrap();
        let err = syncer.run().await.unwrap_err();
        assert!(matches!(err, ReplicationError::AutoReset(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn data_outside_transaction_is_fatal() {
        let (context, _dir) = syncer_context();
        let (frame_tx, frames) = mpsc::channel(64);
        let (ack_tx, _ack_rx) = mpsc::unbounded_channel();
        let source = ScriptedSource::new(vec![ChangeSubscription {
            frames,
            acks: ack_tx,
        }]);
        let syncer = IncrementalSyncer::new(context, source, SubscriberMode::Serving);

        frame_tx
            .send(Downstream::Data(DataChange::Truncate { relations: vec![] }))
            .await
            .unwrap();
        let err = syncer.run().await.unwrap_err();
        assert!(matches!(err, ReplicationError::Malformed(_)));
    }
}
