// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

mod catchup;
mod change;
mod context;
mod error;
mod metrics;
mod protocol;
mod replica;
mod store;
mod storer;
mod streamer;
mod subscriber;
mod syncer;
mod transaction_pool;

pub use change::{
    BackfillRow, Change, ColumnSpec, ControlSignal, DataChange, IndexSpec, Relation, Row,
    TableSpec, Watermark,
};
pub use context::Context;
pub use error::{ReplicationError, ReplicationResult};
pub use metrics::{initialise_metrics, test_metrics, Metrics};
pub use protocol::{
    Ack, Downstream, ErrorBody, ErrorKind, SubscriberMode, SubscriptionRequest, WatermarkedFrame,
    MIN_PROTOCOL_VERSION, PROTOCOL_VERSION,
};
pub use replica::{CommitOutcome, Replica};
pub use store::{BackfillRequest, ChangeDb, ReplicationState, StartStreamParameters};
pub use storer::{FatalCallback, Storer, StorerTask};
pub use streamer::{ChangeStreamer, StreamerTask};
pub use subscriber::Subscriber;
pub use syncer::{
    ChangeSource, ChangeSubscription, IncrementalSyncer, StateVersionNotification,
    StateVersionReceiver,
};
pub use transaction_pool::{
    import_snapshot, shared_snapshot, synchronized_snapshots, SnapshotExchange, Statement,
    TransactionMode, TransactionPool, WorkerHook,
};
