// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Replay of archived changes to a lagging subscriber.
//!
//! Runs as a read task on a pool worker whose transaction was opened
//! immediately after a storer commit, so the snapshot never contains rows of
//! a later transaction. Rows are fetched in keyset-paginated batches and the
//! next batch is fetched before the previous one is pushed to the subscriber,
//! keeping at most about two batches in memory while the transport drains.

use std::sync::Arc;
use std::time::Instant;

use rusqlite::Connection;
use tracing::{debug, info};

use crate::{
    change::Change,
    context::Context,
    error::{ReplicationError, ReplicationResult},
    protocol::Downstream,
    store::{self, LogRow},
    subscriber::Subscriber,
};

/// Stream all archived changes after the subscriber's watermark, then flip it
/// to live forwarding.
pub(crate) fn catch_up(
    conn: &Connection,
    context: &Context,
    subscriber: &Arc<Subscriber>,
) -> ReplicationResult<()> {
    let started = Instant::now();
    let state = store::read_replication_state(conn)?;
    let watermark = subscriber.watermark().clone();

    // The starting point is confirmed by the commit row archived at the
    // subscriber's watermark. A missing commit row is only valid at the
    // replica version itself, e.g. a subscriber that just restored a backup
    // taken at initial sync, before anything was archived.
    let after_pos = match store::commit_pos_at(conn, &watermark)? {
        Some(pos) => pos,
        None if watermark == state.replica_version => i64::MAX,
        None => {
            let earliest = store::earliest_watermark(conn)?
                .unwrap_or_else(|| state.replica_version.clone());
            return Err(ReplicationError::WatermarkTooOld {
                earliest,
                requested: watermark,
            });
        }
    };

    let batch_size = context.parameters.catchup_batch_size;
    let mut cursor = (watermark, after_pos);
    let mut rows_streamed: u64 = 0;
    let mut batch = store::scan_batch(conn, &cursor.0, cursor.1, batch_size)?;
    loop {
        context.metrics.node_metrics.catchup_batches.inc();
        if batch.is_empty() {
            break;
        }
        let last = batch.last().expect("non-empty batch");
        cursor = (last.watermark.clone(), last.pos);
        // Fetch the next page before pushing this one, so the read overlaps
        // with the subscriber consuming the previous sends.
        let next = store::scan_batch(conn, &cursor.0, cursor.1, batch_size)?;
        for row in batch {
            let frame = rewrite(row)?;
            subscriber.send_catchup(frame)?;
            rows_streamed += 1;
        }
        batch = next;
    }
    context
        .metrics
        .node_metrics
        .catchup_rows_streamed
        .inc_by(rows_streamed);

    subscriber.set_caught_up()?;
    context.metrics.node_metrics.subscribers_caught_up.inc();
    context
        .metrics
        .node_metrics
        .catchup_duration
        .observe(started.elapsed().as_secs_f64());
    info!(
        "subscriber {} caught up: {} archived rows in {:?}",
        subscriber.id(),
        rows_streamed,
        started.elapsed(),
    );
    Ok(())
}

/// Turn an archived row back into the frame a live subscriber would have
/// seen. Begin rows recover the commit watermark of their transaction from
/// the commit row association computed by the scan.
fn rewrite(row: LogRow) -> ReplicationResult<Downstream> {
    match row.change {
        Change::Begin => {
            let commit_watermark = row.commit_watermark.ok_or_else(|| {
                ReplicationError::Internal(format!(
                    "archived begin at ({}, {}) has no commit row",
                    row.watermark, row.pos
                ))
            })?;
            Ok(Downstream::Begin { commit_watermark })
        }
        Change::Data(change) => Ok(Downstream::Data(change)),
        Change::Commit => Ok(Downstream::Commit {
            watermark: row.watermark,
        }),
        // Rollbacks are not archived today, but the wire schema has them.
        Change::Rollback => {
            debug!("archived rollback at ({}, {})", row.watermark, row.pos);
            Ok(Downstream::Rollback)
        }
        Change::Status | Change::Control(_) => Err(ReplicationError::Internal(format!(
            "unexpected archived change at ({}, {})",
            row.watermark, row.pos
        ))),
    }
}
