// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use prometheus::{
    register_histogram_with_registry, register_int_counter_with_registry,
    register_int_gauge_with_registry, Histogram, IntCounter, IntGauge, Registry,
};

pub(crate) struct NodeMetrics {
    pub changes_stored: IntCounter,
    pub commits_stored: IntCounter,
    pub transactions_rolled_back: IntCounter,
    pub acks_sent: IntCounter,
    pub storer_queued_bytes: IntGauge,
    pub storer_backpressure_events: IntCounter,
    pub catchup_rows_streamed: IntCounter,
    pub catchup_batches: IntCounter,
    pub catchup_duration: Histogram,
    pub subscribers_active: IntGauge,
    pub subscribers_caught_up: IntCounter,
    pub pool_workers: IntGauge,
    pub pool_tasks_processed: IntCounter,
    pub pool_workers_spawned: IntCounter,
    pub replica_commits_applied: IntCounter,
    pub replica_rows_versioned: IntCounter,
    pub replica_schema_changes: IntCounter,
    pub purged_change_log_rows: IntCounter,
}

impl NodeMetrics {
    fn new(registry: &Registry) -> Self {
        Self {
            changes_stored: register_int_counter_with_registry!(
                "changes_stored",
                "Number of change rows appended to the change log",
                registry,
            )
            .unwrap(),
            commits_stored: register_int_counter_with_registry!(
                "commits_stored",
                "Number of upstream transactions durably committed",
                registry,
            )
            .unwrap(),
            transactions_rolled_back: register_int_counter_with_registry!(
                "transactions_rolled_back",
                "Number of upstream transactions rolled back before commit",
                registry,
            )
            .unwrap(),
            acks_sent: register_int_counter_with_registry!(
                "acks_sent",
                "Number of acknowledgements emitted to the upstream source",
                registry,
            )
            .unwrap(),
            storer_queued_bytes: register_int_gauge_with_registry!(
                "storer_queued_bytes",
                "Estimated bytes of changes queued in the storer",
                registry,
            )
            .unwrap(),
            storer_backpressure_events: register_int_counter_with_registry!(
                "storer_backpressure_events",
                "Times upstream intake was paused on the byte budget",
                registry,
            )
            .unwrap(),
            catchup_rows_streamed: register_int_counter_with_registry!(
                "catchup_rows_streamed",
                "Archived change rows streamed to catching-up subscribers",
                registry,
            )
            .unwrap(),
            catchup_batches: register_int_counter_with_registry!(
                "catchup_batches",
                "Batches fetched from the change log during catch-up",
                registry,
            )
            .unwrap(),
            catchup_duration: register_histogram_with_registry!(
                "catchup_duration",
                "Seconds spent catching up one subscriber",
                registry,
            )
            .unwrap(),
            subscribers_active: register_int_gauge_with_registry!(
                "subscribers_active",
                "Currently connected subscribers",
                registry,
            )
            .unwrap(),
            subscribers_caught_up: register_int_counter_with_registry!(
                "subscribers_caught_up",
                "Subscribers transitioned from catch-up to live forwarding",
                registry,
            )
            .unwrap(),
            pool_workers: register_int_gauge_with_registry!(
                "pool_workers",
                "Live transaction-pool workers across all pools",
                registry,
            )
            .unwrap(),
            pool_tasks_processed: register_int_counter_with_registry!(
                "pool_tasks_processed",
                "Tasks executed by transaction-pool workers",
                registry,
            )
            .unwrap(),
            pool_workers_spawned: register_int_counter_with_registry!(
                "pool_workers_spawned",
                "Extra transaction-pool workers spawned on backlog",
                registry,
            )
            .unwrap(),
            replica_commits_applied: register_int_counter_with_registry!(
                "replica_commits_applied",
                "Upstream commits applied to the embedded replica",
                registry,
            )
            .unwrap(),
            replica_rows_versioned: register_int_counter_with_registry!(
                "replica_rows_versioned",
                "Replica rows stamped with a new row version",
                registry,
            )
            .unwrap(),
            replica_schema_changes: register_int_counter_with_registry!(
                "replica_schema_changes",
                "Schema changes applied structurally to the replica",
                registry,
            )
            .unwrap(),
            purged_change_log_rows: register_int_counter_with_registry!(
                "purged_change_log_rows",
                "Change-log rows deleted by purges",
                registry,
            )
            .unwrap(),
        }
    }
}

pub struct Metrics {
    pub(crate) node_metrics: NodeMetrics,
}

pub fn initialise_metrics(registry: Registry) -> Arc<Metrics> {
    let node_metrics = NodeMetrics::new(&registry);
    Arc::new(Metrics { node_metrics })
}

pub fn test_metrics() -> Arc<Metrics> {
    initialise_metrics(Registry::new())
}
