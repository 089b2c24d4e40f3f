// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

/// Operational configurations of a replication task.
///
/// All fields affect resource usage and latency only, never the correctness of
/// the archived change log, so replicas of the same shard may run with
/// different values.
///
/// NOTE: default values should make sense, so most operators should not need to specify any field.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Parameters {
    /// Number of transaction-pool workers started upfront. Write pools should
    /// keep this at 1 to preserve statement ordering.
    #[serde(default = "Parameters::default_initial_workers")]
    pub initial_workers: usize,

    /// Upper bound on transaction-pool workers. Extra workers beyond
    /// `initial_workers` are spawned while the task queue backs up.
    #[serde(default = "Parameters::default_max_workers")]
    pub max_workers: usize,

    /// How long an extra worker waits for a task before closing its
    /// transaction and exiting.
    #[serde(default = "Parameters::default_idle_timeout")]
    pub idle_timeout: Duration,

    /// Interval at which initial workers run a keep-alive query, to avoid
    /// connection churn on long-idle pools.
    #[serde(default = "Parameters::default_keepalive_interval")]
    pub keepalive_interval: Duration,

    /// Page size used by catch-up readers when scanning the change log.
    #[serde(default = "Parameters::default_catchup_batch_size")]
    pub catchup_batch_size: usize,

    /// Number of row inserts the storer lets accumulate inside one commit
    /// before yielding to bound memory.
    #[serde(default = "Parameters::default_commit_flush_every_n")]
    pub commit_flush_every_n: usize,

    /// Byte budget of changes queued in the storer before upstream intake is
    /// throttled. Intake resumes once usage falls below 80% of this limit.
    #[serde(default = "Parameters::default_back_pressure_limit_bytes")]
    pub back_pressure_limit_bytes: usize,

    /// Path of the durable change database. Must be provided for the task to boot.
    pub db_path: Option<PathBuf>,

    /// Path of the embedded replica maintained by the incremental syncer.
    pub replica_path: Option<PathBuf>,
}

impl Parameters {
    pub fn default_initial_workers() -> usize {
        1
    }

    pub fn default_max_workers() -> usize {
        5
    }

    pub fn default_idle_timeout() -> Duration {
        Duration::from_secs(5)
    }

    pub fn default_keepalive_interval() -> Duration {
        Duration::from_secs(60)
    }

    pub fn default_catchup_batch_size() -> usize {
        2000
    }

    pub fn default_commit_flush_every_n() -> usize {
        100
    }

    pub fn default_back_pressure_limit_bytes() -> usize {
        64 * 1024 * 1024
    }
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            initial_workers: Parameters::default_initial_workers(),
            max_workers: Parameters::default_max_workers(),
            idle_timeout: Parameters::default_idle_timeout(),
            keepalive_interval: Parameters::default_keepalive_interval(),
            catchup_batch_size: Parameters::default_catchup_batch_size(),
            commit_flush_every_n: Parameters::default_commit_flush_every_n(),
            back_pressure_limit_bytes: Parameters::default_back_pressure_limit_bytes(),
            db_path: None,
            replica_path: None,
        }
    }
}
