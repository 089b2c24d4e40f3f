// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Persistent layout of the change database: the append-only change log, the
//! singleton replication-state row and the auxiliary tables tracking table
//! metadata and in-progress column backfills. All helpers borrow a connection
//! so callers control transaction boundaries.

use std::path::PathBuf;

use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde_json::Value as JsonValue;

use crate::{
    change::{Change, Watermark},
    error::{ReplicationError, ReplicationResult},
};

/// Handle to the change database file. Cheap to clone; every component opens
/// its own connections so readers never share a transaction with the writer.
#[derive(Clone, Debug)]
pub struct ChangeDb {
    path: PathBuf,
}

impl ChangeDb {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Open a read-write connection and make sure the schema exists.
    pub fn connect(&self) -> ReplicationResult<Connection> {
        let conn = Connection::open(&self.path)?;
        Self::configure(&conn)?;
        ensure_schema(&conn)?;
        Ok(conn)
    }

    /// Open a read-only connection. WAL mode gives each read transaction a
    /// stable snapshot of the database as of its first read.
    pub fn connect_read_only(&self) -> ReplicationResult<Connection> {
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Self::configure(&conn)?;
        Ok(conn)
    }

    /// Create the replication-state row of a freshly synced shard. A no-op on
    /// a shard that already has one.
    pub fn initial_sync(
        &self,
        replica_version: &str,
        publications: &[String],
    ) -> ReplicationResult<()> {
        let conn = self.connect()?;
        init_replication_state(&conn, replica_version, publications)
    }

    fn configure(conn: &Connection) -> ReplicationResult<()> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(())
    }
}

pub(crate) fn ensure_schema(conn: &Connection) -> ReplicationResult<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS change_log (
            watermark TEXT NOT NULL,
            pos INTEGER NOT NULL,
            precommit TEXT,
            change TEXT NOT NULL,
            PRIMARY KEY (watermark, pos)
        );
        CREATE UNIQUE INDEX IF NOT EXISTS change_log_one_commit
            ON change_log (watermark) WHERE precommit IS NOT NULL;
        CREATE TABLE IF NOT EXISTS replication_state (
            lock INTEGER PRIMARY KEY CHECK (lock = 1),
            last_watermark TEXT NOT NULL,
            owner TEXT,
            owner_address TEXT,
            replica_version TEXT NOT NULL,
            publications TEXT NOT NULL,
            reset_required INTEGER NOT NULL DEFAULT 0
        );
        CREATE TABLE IF NOT EXISTS table_metadata (
            schema TEXT NOT NULL,
            "table" TEXT NOT NULL,
            metadata TEXT NOT NULL,
            PRIMARY KEY (schema, "table")
        );
        CREATE TABLE IF NOT EXISTS backfilling (
            schema TEXT NOT NULL,
            "table" TEXT NOT NULL,
            "column" TEXT NOT NULL,
            backfill TEXT NOT NULL,
            PRIMARY KEY (schema, "table", "column")
        );
        "#,
    )?;
    Ok(())
}

/// The singleton replication-state row of a shard.
#[derive(Clone, Debug, PartialEq)]
pub struct ReplicationState {
    pub last_watermark: Watermark,
    pub owner: Option<String>,
    pub owner_address: Option<String>,
    pub replica_version: Watermark,
    pub publications: Vec<String>,
    pub reset_required: bool,
}

/// What a restarting upstream session needs to resume streaming: the resume
/// point and the backfills that were in flight when the previous session
/// ended.
#[derive(Clone, Debug, PartialEq)]
pub struct StartStreamParameters {
    pub last_watermark: Watermark,
    pub backfill_requests: Vec<BackfillRequest>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct BackfillRequest {
    pub schema: String,
    pub table: String,
    pub column: String,
    pub backfill: JsonValue,
    pub metadata: Option<JsonValue>,
}

/// Create the replication-state row at initial sync. The replica version is
/// the watermark the replica was synced at and never changes afterwards.
pub(crate) fn init_replication_state(
    conn: &Connection,
    replica_version: &str,
    publications: &[String],
) -> ReplicationResult<()> {
    conn.execute(
        "INSERT OR IGNORE INTO replication_state
            (lock, last_watermark, replica_version, publications)
            VALUES (1, ?1, ?1, ?2)",
        params![replica_version, serde_json::to_string(publications).map_err(malformed)?],
    )?;
    Ok(())
}

pub(crate) fn read_replication_state(conn: &Connection) -> ReplicationResult<ReplicationState> {
    let state = conn
        .query_row(
            "SELECT last_watermark, owner, owner_address, replica_version, publications,
                    reset_required
             FROM replication_state WHERE lock = 1",
            [],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, i64>(5)?,
                ))
            },
        )
        .optional()?;
    let Some((last_watermark, owner, owner_address, replica_version, publications, reset)) = state
    else {
        return Err(ReplicationError::Internal(
            "replication state has not been initialized".to_string(),
        ));
    };
    Ok(ReplicationState {
        last_watermark,
        owner,
        owner_address,
        replica_version,
        publications: serde_json::from_str(&publications).map_err(malformed)?,
        reset_required: reset != 0,
    })
}

pub(crate) fn read_owner(conn: &Connection) -> ReplicationResult<Option<String>> {
    Ok(conn
        .query_row("SELECT owner FROM replication_state WHERE lock = 1", [], |row| {
            row.get::<_, Option<String>>(0)
        })
        .optional()?
        .flatten())
}

pub(crate) fn set_owner(conn: &Connection, task_id: &str, address: &str) -> ReplicationResult<()> {
    let updated = conn.execute(
        "UPDATE replication_state SET owner = ?1, owner_address = ?2 WHERE lock = 1",
        params![task_id, address],
    )?;
    if updated == 0 {
        return Err(ReplicationError::Internal(
            "replication state has not been initialized".to_string(),
        ));
    }
    Ok(())
}

pub(crate) fn update_last_watermark(conn: &Connection, watermark: &str) -> ReplicationResult<()> {
    conn.execute(
        "UPDATE replication_state SET last_watermark = ?1 WHERE lock = 1",
        params![watermark],
    )?;
    Ok(())
}

pub(crate) fn mark_reset_required(conn: &Connection) -> ReplicationResult<()> {
    conn.execute("UPDATE replication_state SET reset_required = 1 WHERE lock = 1", [])?;
    Ok(())
}

pub(crate) fn insert_change_log_row(
    conn: &Connection,
    watermark: &str,
    pos: i64,
    precommit: Option<&str>,
    change: &Change,
) -> ReplicationResult<()> {
    conn.execute(
        "INSERT INTO change_log (watermark, pos, precommit, change) VALUES (?1, ?2, ?3, ?4)",
        params![watermark, pos, precommit, serde_json::to_string(change).map_err(malformed)?],
    )?;
    Ok(())
}

/// Position of the commit row archived at `watermark`, if one exists.
pub(crate) fn commit_pos_at(conn: &Connection, watermark: &str) -> ReplicationResult<Option<i64>> {
    Ok(conn
        .query_row(
            "SELECT pos FROM change_log WHERE watermark = ?1 AND precommit IS NOT NULL",
            params![watermark],
            |row| row.get(0),
        )
        .optional()?)
}

/// The earliest archived watermark, i.e. the earliest point a subscriber can
/// be caught up from once the archive is non-empty.
pub(crate) fn earliest_watermark(conn: &Connection) -> ReplicationResult<Option<Watermark>> {
    Ok(conn
        .query_row("SELECT MIN(watermark) FROM change_log", [], |row| row.get(0))
        .optional()?
        .flatten())
}

/// One scanned change-log row, joined with the commit watermark of its
/// transaction: a commit row's own watermark, or for begin/data rows the
/// watermark of the commit row whose `precommit` equals theirs.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct LogRow {
    pub watermark: Watermark,
    pub pos: i64,
    pub precommit: Option<Watermark>,
    pub change: Change,
    pub commit_watermark: Option<Watermark>,
}

/// Fetch the next page of change-log rows strictly after `(watermark, pos)`,
/// in `(watermark, pos)` order.
pub(crate) fn scan_batch(
    conn: &Connection,
    after_watermark: &str,
    after_pos: i64,
    limit: usize,
) -> ReplicationResult<Vec<LogRow>> {
    let mut statement = conn.prepare_cached(
        "SELECT c.watermark, c.pos, c.precommit, c.change,
                CASE WHEN c.precommit IS NOT NULL THEN c.watermark
                     ELSE (SELECT k.watermark FROM change_log k WHERE k.precommit = c.watermark)
                END AS commit_watermark
         FROM change_log c
         WHERE c.watermark > ?1 OR (c.watermark = ?1 AND c.pos > ?2)
         ORDER BY c.watermark, c.pos
         LIMIT ?3",
    )?;
    let rows = statement.query_map(params![after_watermark, after_pos, limit as i64], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, i64>(1)?,
            row.get::<_, Option<String>>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, Option<String>>(4)?,
        ))
    })?;
    let mut batch = Vec::new();
    for row in rows {
        let (watermark, pos, precommit, change, commit_watermark) = row?;
        batch.push(LogRow {
            watermark,
            pos,
            precommit,
            change: serde_json::from_str(&change).map_err(malformed)?,
            commit_watermark,
        });
    }
    Ok(batch)
}

/// Delete change-log rows strictly before `watermark`, returning the count.
/// Ownership is checked by the caller inside the same transaction.
pub(crate) fn purge_before(conn: &Connection, watermark: &str) -> ReplicationResult<usize> {
    Ok(conn.execute("DELETE FROM change_log WHERE watermark < ?1", params![watermark])?)
}

pub(crate) fn upsert_table_metadata(
    conn: &Connection,
    schema: &str,
    table: &str,
    metadata: &JsonValue,
) -> ReplicationResult<()> {
    conn.execute(
        "INSERT INTO table_metadata (schema, \"table\", metadata) VALUES (?1, ?2, ?3)
         ON CONFLICT (schema, \"table\") DO UPDATE SET metadata = excluded.metadata",
        params![schema, table, serde_json::to_string(metadata).map_err(malformed)?],
    )?;
    Ok(())
}

pub(crate) fn delete_table_metadata(
    conn: &Connection,
    schema: &str,
    table: &str,
) -> ReplicationResult<()> {
    conn.execute(
        "DELETE FROM table_metadata WHERE schema = ?1 AND \"table\" = ?2",
        params![schema, table],
    )?;
    Ok(())
}

pub(crate) fn upsert_backfill(
    conn: &Connection,
    schema: &str,
    table: &str,
    column: &str,
    backfill: &JsonValue,
) -> ReplicationResult<()> {
    conn.execute(
        "INSERT INTO backfilling (schema, \"table\", \"column\", backfill) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT (schema, \"table\", \"column\") DO UPDATE SET backfill = excluded.backfill",
        params![schema, table, column, serde_json::to_string(backfill).map_err(malformed)?],
    )?;
    Ok(())
}

pub(crate) fn delete_backfill(
    conn: &Connection,
    schema: &str,
    table: &str,
    column: &str,
) -> ReplicationResult<()> {
    conn.execute(
        "DELETE FROM backfilling WHERE schema = ?1 AND \"table\" = ?2 AND \"column\" = ?3",
        params![schema, table, column],
    )?;
    Ok(())
}

pub(crate) fn rename_tracked_column(
    conn: &Connection,
    schema: &str,
    table: &str,
    old_column: &str,
    new_column: &str,
) -> ReplicationResult<()> {
    conn.execute(
        "UPDATE backfilling SET \"column\" = ?4
         WHERE schema = ?1 AND \"table\" = ?2 AND \"column\" = ?3",
        params![schema, table, old_column, new_column],
    )?;
    Ok(())
}

pub(crate) fn delete_backfills_for_table(
    conn: &Connection,
    schema: &str,
    table: &str,
) -> ReplicationResult<()> {
    conn.execute(
        "DELETE FROM backfilling WHERE schema = ?1 AND \"table\" = ?2",
        params![schema, table],
    )?;
    Ok(())
}

pub(crate) fn rename_tracked_table(
    conn: &Connection,
    old_schema: &str,
    old_table: &str,
    new_schema: &str,
    new_table: &str,
) -> ReplicationResult<()> {
    conn.execute(
        "UPDATE table_metadata SET schema = ?3, \"table\" = ?4
         WHERE schema = ?1 AND \"table\" = ?2",
        params![old_schema, old_table, new_schema, new_table],
    )?;
    conn.execute(
        "UPDATE backfilling SET schema = ?3, \"table\" = ?4
         WHERE schema = ?1 AND \"table\" = ?2",
        params![old_schema, old_table, new_schema, new_table],
    )?;
    Ok(())
}

/// In-flight backfills joined with the metadata of their tables, so a
/// restarted session can re-request them.
pub(crate) fn list_backfill_requests(conn: &Connection) -> ReplicationResult<Vec<BackfillRequest>> {
    let mut statement = conn.prepare(
        "SELECT b.schema, b.\"table\", b.\"column\", b.backfill, m.metadata
         FROM backfilling b
         LEFT JOIN table_metadata m ON m.schema = b.schema AND m.\"table\" = b.\"table\"
         ORDER BY b.schema, b.\"table\", b.\"column\"",
    )?;
    let rows = statement.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, Option<String>>(4)?,
        ))
    })?;
    let mut requests = Vec::new();
    for row in rows {
        let (schema, table, column, backfill, metadata) = row?;
        requests.push(BackfillRequest {
            schema,
            table,
            column,
            backfill: serde_json::from_str(&backfill).map_err(malformed)?,
            metadata: metadata
                .map(|m| serde_json::from_str(&m))
                .transpose()
                .map_err(malformed)?,
        });
    }
    Ok(requests)
}

fn malformed(err: serde_json::Error) -> ReplicationError {
    ReplicationError::Malformed(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::DataChange;
    use serde_json::json;

    fn test_db() -> (ChangeDb, tempfile::TempDir) {
        let dir = tempfile::TempDir::new().unwrap();
        let db = ChangeDb::new(dir.path().join("change.db"));
        (db, dir)
    }

    #[test]
    fn replication_state_lifecycle() {
        let (db, _dir) = test_db();
        let conn = db.connect().unwrap();
        init_replication_state(&conn, "02", &["zero_all".to_string()]).unwrap();

        let state = read_replication_state(&conn).unwrap();
        assert_eq!(state.last_watermark, "02");
        assert_eq!(state.replica_version, "02");
        assert_eq!(state.owner, None);
        assert!(!state.reset_required);

        set_owner(&conn, "task-0", "localhost:3000").unwrap();
        assert_eq!(read_owner(&conn).unwrap().as_deref(), Some("task-0"));

        update_last_watermark(&conn, "08").unwrap();
        let state = read_replication_state(&conn).unwrap();
        assert_eq!(state.last_watermark, "08");
        assert_eq!(state.replica_version, "02");

        // A second initial sync is a no-op on an initialized shard.
        init_replication_state(&conn, "09", &[]).unwrap();
        assert_eq!(read_replication_state(&conn).unwrap().replica_version, "02");
    }

    #[test]
    fn change_log_rows_and_scan() {
        let (db, _dir) = test_db();
        let conn = db.connect().unwrap();
        insert_change_log_row(&conn, "07", 0, None, &Change::Begin).unwrap();
        insert_change_log_row(
            &conn,
            "07",
            1,
            None,
            &Change::Data(DataChange::Truncate { relations: vec![] }),
        )
        .unwrap();
        insert_change_log_row(&conn, "08", 2, Some("07"), &Change::Commit).unwrap();

        assert_eq!(commit_pos_at(&conn, "08").unwrap(), Some(2));
        assert_eq!(commit_pos_at(&conn, "07").unwrap(), None);
        assert_eq!(earliest_watermark(&conn).unwrap().as_deref(), Some("07"));

        let batch = scan_batch(&conn, "", 0, 10).unwrap();
        assert_eq!(batch.len(), 3);
        // Non-commit rows resolve their commit watermark through the commit
        // row whose precommit matches theirs.
        assert_eq!(batch[0].commit_watermark.as_deref(), Some("08"));
        assert_eq!(batch[2].commit_watermark.as_deref(), Some("08"));
        assert_eq!(batch[2].precommit.as_deref(), Some("07"));

        // Keyset pagination resumes strictly after the cursor.
        let rest = scan_batch(&conn, "07", 1, 10).unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].watermark, "08");
    }

    #[test]
    fn one_commit_row_per_watermark() {
        let (db, _dir) = test_db();
        let conn = db.connect().unwrap();
        insert_change_log_row(&conn, "08", 1, Some("07"), &Change::Commit).unwrap();
        let duplicate = insert_change_log_row(&conn, "08", 2, Some("07x"), &Change::Commit);
        assert!(duplicate.is_err());
    }

    #[test]
    fn purge_deletes_strictly_before() {
        let (db, _dir) = test_db();
        let conn = db.connect().unwrap();
        for (watermark, pos, precommit) in
            [("03", 0, None), ("03", 1, None), ("03", 2, Some("03")), ("06", 0, None)]
        {
            insert_change_log_row(&conn, watermark, pos, precommit, &Change::Begin).unwrap();
        }
        assert_eq!(purge_before(&conn, "04").unwrap(), 3);
        assert_eq!(purge_before(&conn, "04").unwrap(), 0);
        assert_eq!(earliest_watermark(&conn).unwrap().as_deref(), Some("06"));
    }

    #[test]
    fn backfill_tracking() {
        let (db, _dir) = test_db();
        let conn = db.connect().unwrap();
        upsert_table_metadata(&conn, "public", "issue", &json!({"pk": ["id"]})).unwrap();
        upsert_backfill(&conn, "public", "issue", "labels", &json!({"id": "bf1"})).unwrap();

        let requests = list_backfill_requests(&conn).unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].column, "labels");
        assert_eq!(requests[0].metadata, Some(json!({"pk": ["id"]})));

        rename_tracked_table(&conn, "public", "issue", "public", "ticket").unwrap();
        let requests = list_backfill_requests(&conn).unwrap();
        assert_eq!(requests[0].table, "ticket");

        delete_backfill(&conn, "public", "ticket", "labels").unwrap();
        assert!(list_backfill_requests(&conn).unwrap().is_empty());
    }
}
