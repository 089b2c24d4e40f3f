// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use replication_config::Parameters;

use crate::metrics::Metrics;
#[cfg(test)]
use crate::metrics::test_metrics;

/// Context contains the per-task configuration and metrics shared by all
/// components of this replication task.
#[derive(Clone)]
pub struct Context {
    /// Identifier of this task; only the task named by the replication-state
    /// `owner` column may append to the change log.
    pub task_id: String,
    /// Address subscribers can reach this task at, recorded next to the owner.
    pub address: String,
    /// Parameters of this task.
    pub parameters: Parameters,
    /// Metrics of this task.
    pub metrics: Arc<Metrics>,
}

impl Context {
    pub fn new(
        task_id: String,
        address: String,
        parameters: Parameters,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            task_id,
            address,
            parameters,
            metrics,
        }
    }

    /// Create a test context with tempdir-backed database paths. The returned
    /// guard must be kept alive for the duration of the test.
    #[cfg(test)]
    pub(crate) fn new_for_test() -> (Self, tempfile::TempDir) {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let parameters = Parameters {
            db_path: Some(temp_dir.path().join("change.db")),
            replica_path: Some(temp_dir.path().join("replica.db")),
            ..Default::default()
        };
        let context = Context::new(
            "task-0".to_string(),
            "localhost:3000".to_string(),
            parameters,
            test_metrics(),
        );
        (context, temp_dir)
    }

    #[cfg(test)]
    pub(crate) fn with_parameters(mut self, parameters: Parameters) -> Self {
        self.parameters = parameters;
        self
    }
}
