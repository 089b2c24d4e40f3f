// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

use crate::change::Watermark;

/// Errors produced by the replication core.
#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The replication-state owner no longer names this task. Non-retryable:
    /// the losing process must exit and be replaced.
    #[error("changeLog ownership was concurrently assumed by {0}")]
    OwnershipLost(String),

    /// The requested starting watermark predates the earliest archived commit.
    #[error("earliest supported watermark is {earliest} (requested {requested})")]
    WatermarkTooOld {
        earliest: Watermark,
        requested: Watermark,
    },

    /// The subscriber was initial-synced at a different replica version and
    /// must re-sync before it can follow this stream.
    #[error("replica version mismatch: this task is at {ours}, subscriber is at {theirs}")]
    WrongReplicaVersion { ours: Watermark, theirs: Watermark },

    /// The replica is irrecoverably behind and must be re-initialized from a
    /// fresh backup.
    #[error("auto reset required: {0}")]
    AutoReset(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("transport error: {0}")]
    Transport(String),

    /// The component's queue was closed underneath the caller.
    #[error("shutting down")]
    Shutdown,

    /// The operation was cancelled by an explicit abort.
    #[error("aborted")]
    Aborted,

    #[error("{0}")]
    Internal(String),
}

impl ReplicationError {
    /// Errors that are part of normal control flow (shutdown, abort, a
    /// subscriber connecting too far behind). These are logged at lowered
    /// severity and never escalate to the process supervisor.
    pub fn is_expected_control_flow(&self) -> bool {
        matches!(
            self,
            ReplicationError::Shutdown
                | ReplicationError::Aborted
                | ReplicationError::WatermarkTooOld { .. }
                | ReplicationError::WrongReplicaVersion { .. }
        )
    }

    /// Whether retrying against a fresh connection can succeed. Ownership
    /// loss and reset signals are terminal for this process.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ReplicationError::Transport(_) | ReplicationError::Database(_)
        )
    }
}

pub type ReplicationResult<T> = Result<T, ReplicationError>;

/// SQLITE_BUSY / SQLITE_LOCKED at begin or commit time signal that another
/// connection raced this one, the embedded engine's equivalent of a
/// serialization failure.
pub(crate) fn is_serialization_failure(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked)
    )
}
