// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The forward-store-ACK pipeline.
//!
//! The streamer consumes the upstream change stream and, for every frame,
//! first forwards it to the connected subscribers (caught-up ones receive it
//! immediately, catching-up ones buffer it), then hands it to the storer for
//! durable archival. Acks surface on the storer's ack channel only after the
//! commit is durable. New subscribers enter through `subscribe`, which
//! validates the request, emits the handshake and queues a catch-up with the
//! storer.

use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    change::Watermark,
    context::Context,
    error::{ReplicationError, ReplicationResult},
    protocol::{check_protocol_version, Downstream, SubscriptionRequest, WatermarkedFrame},
    store::{self, ChangeDb},
    storer::Storer,
    subscriber::Subscriber,
};

/// Frames the upstream forwarder can have in flight before it is suspended
/// on the channel, independent of the storer's byte budget.
const UPSTREAM_CHANNEL_SIZE: usize = 128;

struct StreamerShared {
    context: Arc<Context>,
    storer: Storer,
    replica_version: Watermark,
    subscribers: Mutex<Vec<Arc<Subscriber>>>,
}

/// Handle for registering subscribers. Clones share the same streamer.
#[derive(Clone)]
pub struct ChangeStreamer {
    shared: Arc<StreamerShared>,
}

/// The streamer's run loop, consuming the upstream channel.
pub struct StreamerTask {
    shared: Arc<StreamerShared>,
    changes: mpsc::Receiver<WatermarkedFrame>,
}

impl ChangeStreamer {
    /// Wire the streamer to its storer. Returns the sender the upstream
    /// source feeds and the run loop to drive.
    pub fn new(
        context: Arc<Context>,
        db: &ChangeDb,
        storer: Storer,
    ) -> ReplicationResult<(Self, mpsc::Sender<WatermarkedFrame>, StreamerTask)> {
        let conn = db.connect()?;
        let replica_version = store::read_replication_state(&conn)?.replica_version;
        let (sender, changes) = mpsc::channel(UPSTREAM_CHANNEL_SIZE);
        let shared = Arc::new(StreamerShared {
            context,
            storer,
            replica_version,
            subscribers: Mutex::new(Vec::new()),
        });
        let streamer = Self {
            shared: shared.clone(),
        };
        Ok((streamer, sender, StreamerTask { shared, changes }))
    }

    /// Register a subscriber and queue its catch-up. The stream always starts
    /// with a status handshake; a subscriber synced against a different
    /// replica version gets a terminal error frame instead and must
    /// re-initial-sync.
    pub async fn subscribe(
        &self,
        request: SubscriptionRequest,
    ) -> ReplicationResult<mpsc::Receiver<Downstream>> {
        check_protocol_version(request.protocol_version)?;
        let capacity = 2 * self.shared.context.parameters.catchup_batch_size;
        let (subscriber, receiver) = Subscriber::new(request, capacity);
        if subscriber.replica_version() != &self.shared.replica_version {
            let err = ReplicationError::WrongReplicaVersion {
                ours: self.shared.replica_version.clone(),
                theirs: subscriber.replica_version().clone(),
            };
            info!("rejecting subscriber {}: {err}", subscriber.id());
            let _ = tokio::task::spawn_blocking(move || subscriber.close_with_error(&err)).await;
            return Ok(receiver);
        }
        debug!(
            "subscriber {} connecting at watermark {} ({:?}, initial: {})",
            subscriber.id(),
            subscriber.watermark(),
            subscriber.mode(),
            subscriber.initial(),
        );
        let handshake = subscriber.clone();
        tokio::task::spawn_blocking(move || handshake.send_handshake())
            .await
            .map_err(|_| ReplicationError::Shutdown)??;
        {
            let mut subscribers = self.shared.subscribers.lock();
            subscribers.push(subscriber.clone());
            self.shared
                .context
                .metrics
                .node_metrics
                .subscribers_active
                .set(subscribers.len() as i64);
        }
        self.shared.storer.catchup(subscriber)?;
        Ok(receiver)
    }
}

impl StreamerTask {
    /// Forward and archive upstream frames until the channel closes or the
    /// storer rejects an entry.
    pub async fn run(mut self) -> ReplicationResult<()> {
        while let Some(entry) = self.changes.recv().await {
            self.forward(&entry.frame).await;
            match &entry.frame {
                Downstream::Begin { .. }
                | Downstream::Data(_)
                | Downstream::Commit { .. }
                | Downstream::Rollback => {
                    self.shared.storer.store(entry)?;
                }
                Downstream::Status { watermark, .. } => {
                    self.shared.storer.status(watermark.clone())?;
                }
                Downstream::Control(signal) => {
                    warn!("forwarded control signal from upstream: {signal:?}");
                }
                Downstream::Error(body) => {
                    return Err(ReplicationError::Malformed(format!(
                        "upstream sent an error frame: {}",
                        body.message
                    )));
                }
            }
            // The storer's byte budget throttles intake, not the forwarding.
            if let Some(ready) = self.shared.storer.ready_for_more() {
                ready.await;
            }
        }
        info!("upstream change stream closed");
        Ok(())
    }

    async fn forward(&self, frame: &Downstream) {
        let subscribers = self.shared.subscribers.lock().clone();
        let deliveries = join_all(subscribers.iter().map(|subscriber| {
            let frame = frame.clone();
            async move {
                if subscriber.is_closed() {
                    return false;
                }
                match subscriber.send_live(frame).await {
                    Ok(()) => true,
                    Err(err) => {
                        debug!("dropping subscriber {}: {err}", subscriber.id());
                        false
                    }
                }
            }
        }))
        .await;
        if deliveries.iter().any(|delivered| !delivered) {
            let mut subscribers = self.shared.subscribers.lock();
            subscribers.retain(|subscriber| !subscriber.is_closed());
            self.shared
                .context
                .metrics
                .node_metrics
                .subscribers_active
                .set(subscribers.len() as i64);
        }
    }
}
