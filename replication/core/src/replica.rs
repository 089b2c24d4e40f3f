// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The embedded replica maintained by the incremental syncer.
//!
//! Every replicated row carries a `_0_version` column naming the commit that
//! last touched it, and `"_zero.changeLog2"` records one row-level event per
//! affected row per applied commit, which is what materialized-view drivers
//! consume. Data operations apply directly into an open transaction; row
//! versions are stamped and the change log appended at commit.

use std::collections::HashMap;
use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::{
    change::{DataChange, Relation, Row, TableSpec, Watermark},
    error::{ReplicationError, ReplicationResult},
};

/// Row-level operation recorded in the local change log.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum RowOp {
    Set,
    Delete,
    Truncate,
}

impl RowOp {
    fn code(self) -> &'static str {
        match self {
            RowOp::Set => "s",
            RowOp::Delete => "d",
            RowOp::Truncate => "t",
        }
    }
}

#[derive(Clone, Debug)]
struct LogEntry {
    table: String,
    row_key: Option<String>,
    op: RowOp,
}

/// Bookkeeping of one open apply transaction.
#[derive(Default)]
struct OpenTransaction {
    entries: Vec<Option<LogEntry>>,
    index: HashMap<(String, Option<String>), usize>,
    schema_changed: bool,
    data_changed: bool,
    completed_backfills: Vec<String>,
}

/// Result of applying one upstream commit.
#[derive(Clone, Debug, PartialEq)]
pub struct CommitOutcome {
    pub state_version: Watermark,
    /// Whether view drivers should be notified. Commits carrying only
    /// incomplete backfill chunks stay silent.
    pub notify: bool,
    pub schema_changed: bool,
    pub changed_rows: usize,
}

pub struct Replica {
    conn: Connection,
    open: Option<OpenTransaction>,
}

impl Replica {
    pub fn open(path: impl AsRef<Path>) -> ReplicationResult<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS "_zero.replicationState" (
                lock INTEGER PRIMARY KEY CHECK (lock = 1),
                replicaVersion TEXT NOT NULL,
                stateVersion TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS "_zero.changeLog2" (
                stateVersion TEXT NOT NULL,
                pos INTEGER NOT NULL,
                "table" TEXT NOT NULL,
                op TEXT NOT NULL,
                rowKey TEXT,
                backfillingColumnVersions TEXT,
                PRIMARY KEY (stateVersion, pos)
            );
            CREATE TABLE IF NOT EXISTS "_zero.backfilling" (
                id TEXT NOT NULL,
                "table" TEXT NOT NULL,
                "column" TEXT NOT NULL,
                rowKey TEXT NOT NULL,
                PRIMARY KEY (id, rowKey)
            );
            "#,
        )?;
        Ok(Self { conn, open: None })
    }

    /// Record the version this replica was initial-synced at. A no-op if the
    /// replica is already initialized.
    pub fn initial_sync(&self, replica_version: &str) -> ReplicationResult<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO \"_zero.replicationState\"
                (lock, replicaVersion, stateVersion) VALUES (1, ?1, ?1)",
            params![replica_version],
        )?;
        Ok(())
    }

    /// `(replica_version, state_version)`: where the replica was synced and
    /// the last commit applied to it.
    pub fn state(&self) -> ReplicationResult<(Watermark, Watermark)> {
        self.conn
            .query_row(
                "SELECT replicaVersion, stateVersion FROM \"_zero.replicationState\" WHERE lock = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?
            .ok_or_else(|| {
                ReplicationError::Internal("replica has not been initial-synced".to_string())
            })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn begin(&mut self) -> ReplicationResult<()> {
        if self.open.is_some() {
            return Err(ReplicationError::Malformed(
                "begin inside an open replica transaction".to_string(),
            ));
        }
        self.conn.execute_batch("BEGIN")?;
        self.open = Some(OpenTransaction::default());
        Ok(())
    }

    pub fn rollback(&mut self) -> ReplicationResult<()> {
        if self.open.take().is_some() {
            self.conn.execute_batch("ROLLBACK")?;
        }
        Ok(())
    }

    pub fn in_transaction(&self) -> bool {
        self.open.is_some()
    }

    /// Apply one data operation into the open transaction.
    pub fn apply(&mut self, change: &DataChange) -> ReplicationResult<()> {
        if self.open.is_none() {
            return Err(ReplicationError::Malformed(format!(
                "data change outside a transaction: {change:?}"
            )));
        }
        match change {
            DataChange::Insert { relation, new } => {
                self.write_row(relation, new)?;
                let key = encode_row_key(relation, new)?;
                self.record(relation, Some(key), RowOp::Set);
            }
            DataChange::Update { relation, new, key } => {
                // A primary-key change is a delete of the old key plus a set
                // of the new one.
                if let Some(old_key) = key {
                    let old = encode_row_key(relation, old_key)?;
                    self.delete_row(relation, old_key)?;
                    self.record(relation, Some(old), RowOp::Delete);
                }
                self.write_row(relation, new)?;
                let new_key = encode_row_key(relation, new)?;
                self.record(relation, Some(new_key), RowOp::Set);
            }
            DataChange::Delete { relation, key } => {
                self.delete_row(relation, key)?;
                let encoded = encode_row_key(relation, key)?;
                self.record(relation, Some(encoded), RowOp::Delete);
            }
            DataChange::Truncate { relations } => {
                for relation in relations {
                    let table = replica_table(&relation.schema, &relation.name);
                    self.conn
                        .execute(&format!("DELETE FROM {}", quote_ident(&table)), [])?;
                    self.record_truncate(&table);
                }
            }
            DataChange::CreateTable { spec } => {
                self.create_table(spec)?;
                self.mark_schema_changed();
            }
            DataChange::RenameTable { old, new } => {
                let old_table = replica_table(&old.schema, &old.name);
                let new_table = replica_table(&new.schema, &new.name);
                self.conn.execute(
                    &format!(
                        "ALTER TABLE {} RENAME TO {}",
                        quote_ident(&old_table),
                        quote_ident(&new_table)
                    ),
                    [],
                )?;
                self.conn.execute(
                    "UPDATE \"_zero.backfilling\" SET \"table\" = ?2 WHERE \"table\" = ?1",
                    params![old_table, new_table],
                )?;
                self.mark_schema_changed();
            }
            DataChange::DropTable { table } => {
                let name = replica_table(&table.schema, &table.name);
                self.conn
                    .execute(&format!("DROP TABLE IF EXISTS {}", quote_ident(&name)), [])?;
                self.conn.execute(
                    "DELETE FROM \"_zero.backfilling\" WHERE \"table\" = ?1",
                    params![name],
                )?;
                self.mark_schema_changed();
            }
            DataChange::AddColumn { table, column } => {
                let name = replica_table(&table.schema, &table.name);
                self.conn.execute(
                    &format!(
                        "ALTER TABLE {} ADD COLUMN {} {}",
                        quote_ident(&name),
                        quote_ident(&column.name),
                        column.data_type
                    ),
                    [],
                )?;
                self.mark_schema_changed();
            }
            DataChange::UpdateColumn { table, old, new } => {
                if old.name != new.name {
                    let name = replica_table(&table.schema, &table.name);
                    self.conn.execute(
                        &format!(
                            "ALTER TABLE {} RENAME COLUMN {} TO {}",
                            quote_ident(&name),
                            quote_ident(&old.name),
                            quote_ident(&new.name)
                        ),
                        [],
                    )?;
                }
                self.mark_schema_changed();
            }
            DataChange::DropColumn { table, column } => {
                let name = replica_table(&table.schema, &table.name);
                self.conn.execute(
                    &format!(
                        "ALTER TABLE {} DROP COLUMN {}",
                        quote_ident(&name),
                        quote_ident(column)
                    ),
                    [],
                )?;
                self.mark_schema_changed();
            }
            DataChange::CreateIndex { spec } => {
                let table = replica_table(&spec.schema, &spec.table);
                let columns = spec
                    .columns
                    .iter()
                    .map(|c| quote_ident(c))
                    .collect::<Vec<_>>()
                    .join(", ");
                let unique = if spec.unique { "UNIQUE " } else { "" };
                self.conn.execute(
                    &format!(
                        "CREATE {}INDEX IF NOT EXISTS {} ON {} ({})",
                        unique,
                        quote_ident(&spec.name),
                        quote_ident(&table),
                        columns
                    ),
                    [],
                )?;
                self.mark_schema_changed();
            }
            DataChange::DropIndex { index } => {
                self.conn.execute(
                    &format!("DROP INDEX IF EXISTS {}", quote_ident(&index.name)),
                    [],
                )?;
                self.mark_schema_changed();
            }
            DataChange::UpdateTableMetadata { .. } => {
                // Metadata is tracked upstream in the change database; the
                // replica has no structural work to do.
            }
            DataChange::Backfill {
                table,
                column,
                id,
                rows,
            } => {
                let name = replica_table(&table.schema, &table.name);
                for backfill_row in rows {
                    let (clause, mut values) = key_clause(&backfill_row.key, 2);
                    let mut params_vec = vec![json_to_sql(&backfill_row.value)];
                    params_vec.append(&mut values);
                    self.conn.execute(
                        &format!(
                            "UPDATE {} SET {} = ?1 WHERE {}",
                            quote_ident(&name),
                            quote_ident(column),
                            clause
                        ),
                        rusqlite::params_from_iter(params_vec.iter()),
                    )?;
                    self.conn.execute(
                        "INSERT OR IGNORE INTO \"_zero.backfilling\"
                            (id, \"table\", \"column\", rowKey) VALUES (?1, ?2, ?3, ?4)",
                        params![id, name, column, encode_key(&backfill_row.key)?],
                    )?;
                }
            }
            DataChange::BackfillCompleted { id, .. } => {
                let tx = self.open.as_mut().expect("transaction is open");
                tx.completed_backfills.push(id.clone());
            }
        }
        Ok(())
    }

    /// Stamp affected rows with the commit watermark, append the change-log
    /// entries and advance the state version.
    pub fn commit(&mut self, commit_watermark: &str) -> ReplicationResult<CommitOutcome> {
        let Some(mut tx) = self.open.take() else {
            return Err(ReplicationError::Malformed(format!(
                "commit at {commit_watermark} outside a transaction"
            )));
        };

        // A completed backfill promotes exactly the rows its chunks touched:
        // they finally get a row version and a change-log entry.
        for id in std::mem::take(&mut tx.completed_backfills) {
            let rows: Vec<(String, String)> = {
                let mut statement = self.conn.prepare(
                    "SELECT \"table\", rowKey FROM \"_zero.backfilling\" WHERE id = ?1",
                )?;
                let mapped = statement.query_map(params![&id], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?;
                mapped.collect::<Result<_, _>>()?
            };
            for (table, row_key) in rows {
                record_entry(&mut tx, table, Some(row_key), RowOp::Set);
            }
            self.conn.execute(
                "DELETE FROM \"_zero.backfilling\" WHERE id = ?1",
                params![id],
            )?;
            tx.data_changed = true;
        }

        let entries: Vec<LogEntry> = tx.entries.into_iter().flatten().collect();
        for entry in &entries {
            if entry.op != RowOp::Set {
                continue;
            }
            let key: Row = serde_json::from_str(
                entry.row_key.as_deref().expect("set entries carry a key"),
            )
            .map_err(|e| ReplicationError::Malformed(e.to_string()))?;
            let (clause, values) = key_clause(&key, 2);
            let mut params_vec = vec![rusqlite::types::Value::Text(commit_watermark.to_string())];
            params_vec.extend(values);
            self.conn.execute(
                &format!(
                    "UPDATE {} SET \"_0_version\" = ?1 WHERE {}",
                    quote_ident(&entry.table),
                    clause
                ),
                rusqlite::params_from_iter(params_vec.iter()),
            )?;
        }
        for (pos, entry) in entries.iter().enumerate() {
            self.conn.execute(
                "INSERT INTO \"_zero.changeLog2\"
                    (stateVersion, pos, \"table\", op, rowKey, backfillingColumnVersions)
                    VALUES (?1, ?2, ?3, ?4, ?5, NULL)",
                params![
                    commit_watermark,
                    pos as i64,
                    entry.table,
                    entry.op.code(),
                    entry.row_key
                ],
            )?;
        }
        self.conn.execute(
            "UPDATE \"_zero.replicationState\" SET stateVersion = ?1 WHERE lock = 1",
            params![commit_watermark],
        )?;
        self.conn.execute_batch("COMMIT")?;

        let outcome = CommitOutcome {
            state_version: commit_watermark.to_string(),
            notify: tx.data_changed || tx.schema_changed || !entries.is_empty(),
            schema_changed: tx.schema_changed,
            changed_rows: entries.len(),
        };
        debug!(
            "applied commit {commit_watermark}: {} rows, notify={}",
            outcome.changed_rows, outcome.notify
        );
        Ok(outcome)
    }

    fn mark_schema_changed(&mut self) {
        self.open
            .as_mut()
            .expect("transaction is open")
            .schema_changed = true;
    }

    fn record(&mut self, relation: &Relation, row_key: Option<String>, op: RowOp) {
        let table = replica_table(&relation.schema, &relation.name);
        let tx = self.open.as_mut().expect("transaction is open");
        tx.data_changed = true;
        record_entry(tx, table, row_key, op);
    }

    /// Truncate records a single `t` entry and supersedes earlier row-level
    /// entries of the table. Repeats within one transaction are idempotent.
    fn record_truncate(&mut self, table: &str) {
        let tx = self.open.as_mut().expect("transaction is open");
        tx.data_changed = true;
        for slot in tx.entries.iter_mut() {
            if let Some(entry) = slot {
                if entry.table == table && entry.row_key.is_some() {
                    tx.index
                        .remove(&(entry.table.clone(), entry.row_key.clone()));
                    *slot = None;
                }
            }
        }
        record_entry(tx, table.to_string(), None, RowOp::Truncate);
    }

    fn create_table(&self, spec: &TableSpec) -> ReplicationResult<()> {
        let name = replica_table(&spec.schema, &spec.name);
        let mut columns = spec
            .columns
            .iter()
            .map(|column| {
                let not_null = if column.not_null { " NOT NULL" } else { "" };
                format!(
                    "{} {}{}",
                    quote_ident(&column.name),
                    column.data_type,
                    not_null
                )
            })
            .collect::<Vec<_>>();
        columns.push("\"_0_version\" TEXT".to_string());
        if !spec.primary_key.is_empty() {
            let key = spec
                .primary_key
                .iter()
                .map(|c| quote_ident(c))
                .collect::<Vec<_>>()
                .join(", ");
            columns.push(format!("PRIMARY KEY ({key})"));
        }
        self.conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {} ({})",
                quote_ident(&name),
                columns.join(", ")
            ),
            [],
        )?;
        Ok(())
    }

    fn write_row(&self, relation: &Relation, row: &Row) -> ReplicationResult<()> {
        let table = replica_table(&relation.schema, &relation.name);
        let mut columns = Vec::with_capacity(row.len());
        let mut placeholders = Vec::with_capacity(row.len());
        let mut values = Vec::with_capacity(row.len());
        for (i, (column, value)) in row.iter().enumerate() {
            columns.push(quote_ident(column));
            placeholders.push(format!("?{}", i + 1));
            values.push(json_to_sql(value));
        }
        self.conn.execute(
            &format!(
                "INSERT OR REPLACE INTO {} ({}) VALUES ({})",
                quote_ident(&table),
                columns.join(", "),
                placeholders.join(", ")
            ),
            rusqlite::params_from_iter(values.iter()),
        )?;
        Ok(())
    }

    fn delete_row(&self, relation: &Relation, key: &Row) -> ReplicationResult<()> {
        let table = replica_table(&relation.schema, &relation.name);
        let (clause, values) = key_clause(key, 1);
        self.conn.execute(
            &format!("DELETE FROM {} WHERE {}", quote_ident(&table), clause),
            rusqlite::params_from_iter(values.iter()),
        )?;
        Ok(())
    }
}

fn record_entry(
    tx: &mut OpenTransaction,
    table: String,
    row_key: Option<String>,
    op: RowOp,
) {
    let key = (table.clone(), row_key.clone());
    if let Some(&at) = tx.index.get(&key) {
        if let Some(entry) = tx.entries[at].as_mut() {
            entry.op = op;
            return;
        }
    }
    tx.index.insert(key, tx.entries.len());
    tx.entries.push(Some(LogEntry { table, row_key, op }));
}

/// Replica-side table name: the `public` schema maps to the bare name, other
/// schemas keep a qualified name.
fn replica_table(schema: &str, name: &str) -> String {
    if schema == "public" {
        name.to_string()
    } else {
        format!("{schema}.{name}")
    }
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// The canonical row key: key columns in declaration order, JSON-encoded.
fn encode_row_key(relation: &Relation, row: &Row) -> ReplicationResult<String> {
    let mut key = Row::new();
    for column in &relation.key_columns {
        let value = row.get(column).ok_or_else(|| {
            ReplicationError::Malformed(format!(
                "row for {}.{} is missing key column {column}",
                relation.schema, relation.name
            ))
        })?;
        key.insert(column.clone(), value.clone());
    }
    encode_key(&key)
}

fn encode_key(key: &Row) -> ReplicationResult<String> {
    serde_json::to_string(key).map_err(|e| ReplicationError::Malformed(e.to_string()))
}

/// `("a" = ?N AND "b" = ?N+1, values)` for a key map, with placeholders
/// numbered from `first` so callers can prepend their own parameters.
fn key_clause(key: &Row, first: usize) -> (String, Vec<rusqlite::types::Value>) {
    let mut clauses = Vec::with_capacity(key.len());
    let mut values = Vec::with_capacity(key.len());
    for (i, (column, value)) in key.iter().enumerate() {
        clauses.push(format!("{} = ?{}", quote_ident(column), first + i));
        values.push(json_to_sql(value));
    }
    (clauses.join(" AND "), values)
}

fn json_to_sql(value: &JsonValue) -> rusqlite::types::Value {
    use rusqlite::types::Value as SqlValue;
    match value {
        JsonValue::Null => SqlValue::Null,
        JsonValue::Bool(b) => SqlValue::Integer(*b as i64),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                SqlValue::Integer(i)
            } else {
                SqlValue::Real(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        JsonValue::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::{BackfillRow, ColumnSpec};
    use serde_json::json;

    fn issue_relation() -> Relation {
        Relation {
            schema: "public".into(),
            name: "issue".into(),
            key_columns: vec!["id".into()],
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

    fn row(value: serde_json::Value) -> Row {
        value.as_object().unwrap().clone()
    }

    fn test_replica() -> (Replica, tempfile::TempDir) {
        let dir = tempfile::TempDir::new().unwrap();
        let replica = Replica::open(dir.path().join("replica.db")).unwrap();
        replica.initial_sync("02").unwrap();
        (replica, dir)
    }

    fn change_log(replica: &Replica, state_version: &str) -> Vec<(i64, String, String, Option<String>)> {
        let mut statement = replica
            .connection()
            .prepare(
                "SELECT pos, \"table\", op, rowKey FROM \"_zero.changeLog2\"
                 WHERE stateVersion = ?1 ORDER BY pos",
            )
            .unwrap();
        let rows = statement
            .query_map(params![state_version], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })
            .unwrap();
        rows.collect::<Result<_, _>>().unwrap()
    }

    #[test]
    fn commit_stamps_versions_and_logs_rows() {
        let (mut replica, _dir) = test_replica();
        replica.begin().unwrap();
        replica
            .apply(&DataChange::CreateTable { spec: issue_spec() })
            .unwrap();
        replica
            .apply(&DataChange::Insert {
                relation: issue_relation(),
                new: row(json!({"id": "foo", "title": "hi"})),
            })
            .unwrap();
        replica
            .apply(&DataChange::Insert {
                relation: issue_relation(),
                new: row(json!({"id": "bar", "title": "lo"})),
            })
            .unwrap();
        let outcome = replica.commit("08").unwrap();
        assert!(outcome.notify);
        assert!(outcome.schema_changed);
        assert_eq!(outcome.changed_rows, 2);

        let version: String = replica
            .connection()
            .query_row(
                "SELECT \"_0_version\" FROM issue WHERE id = 'foo'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(version, "08");

        let log = change_log(&replica, "08");
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].2, "s");
        assert_eq!(log[0].3.as_deref(), Some(r#"{"id":"foo"}"#));
        assert_eq!((replica.state().unwrap()).1, "08");
    }

    #[test]
    fn truncate_is_idempotent_and_supersedes_rows() {
        let (mut replica, _dir) = test_replica();
        replica.begin().unwrap();
        replica
            .apply(&DataChange::CreateTable { spec: issue_spec() })
            .unwrap();
        replica
            .apply(&DataChange::Insert {
                relation: issue_relation(),
                new: row(json!({"id": "foo", "title": "hi"})),
            })
            .unwrap();
        replica
            .apply(&DataChange::Truncate {
                relations: vec![issue_relation()],
            })
            .unwrap();
        replica
            .apply(&DataChange::Truncate {
                relations: vec![issue_relation()],
            })
            .unwrap();
        replica.commit("05").unwrap();

        let log = change_log(&replica, "05");
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].2, "t");
        assert_eq!(log[0].3, None);
        let rows: i64 = replica
            .connection()
            .query_row("SELECT COUNT(*) FROM issue", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 0);
    }

    #[test]
    fn key_changing_update_expands_to_delete_and_set() {
        let (mut replica, _dir) = test_replica();
        replica.begin().unwrap();
        replica
            .apply(&DataChange::CreateTable { spec: issue_spec() })
            .unwrap();
        replica
            .apply(&DataChange::Insert {
                relation: issue_relation(),
                new: row(json!({"id": "foo", "title": "hi"})),
            })
            .unwrap();
        replica.commit("05").unwrap();

        replica.begin().unwrap();
        replica
            .apply(&DataChange::Update {
                relation: issue_relation(),
                new: row(json!({"id": "foo2", "title": "hi"})),
                key: Some(row(json!({"id": "foo"}))),
            })
            .unwrap();
        replica.commit("06").unwrap();

        let log = change_log(&replica, "06");
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].2, "d");
        assert_eq!(log[0].3.as_deref(), Some(r#"{"id":"foo"}"#));
        assert_eq!(log[1].2, "s");
        assert_eq!(log[1].3.as_deref(), Some(r#"{"id":"foo2"}"#));

        let version: String = replica
            .connection()
            .query_row(
                "SELECT \"_0_version\" FROM issue WHERE id = 'foo2'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(version, "06");
    }

    #[test]
    fn backfill_defers_versions_until_completion() {
        let (mut replica, _dir) = test_replica();
        replica.begin().unwrap();
        replica
            .apply(&DataChange::CreateTable { spec: issue_spec() })
            .unwrap();
        replica
            .apply(&DataChange::Insert {
                relation: issue_relation(),
                new: row(json!({"id": "foo", "title": "hi"})),
            })
            .unwrap();
        replica.commit("05").unwrap();

        // A backfill chunk fills the column but keeps the old row version and
        // stays out of the change log, so drivers are not notified.
        replica.begin().unwrap();
        replica
            .apply(&DataChange::AddColumn {
                table: issue_spec(),
                column: ColumnSpec {
                    name: "labels".into(),
                    data_type: "TEXT".into(),
                    not_null: false,
                },
            })
            .unwrap();
        replica.commit("06").unwrap();

        replica.begin().unwrap();
        replica
            .apply(&DataChange::Backfill {
                table: issue_spec(),
                column: "labels".into(),
                id: "bf1".into(),
                rows: vec![BackfillRow {
                    key: row(json!({"id": "foo"})),
                    value: json!("bug"),
                }],
            })
            .unwrap();
        let outcome = replica.commit("07").unwrap();
        assert!(!outcome.notify);
        assert!(change_log(&replica, "07").is_empty());
        let (labels, version): (String, String) = replica
            .connection()
            .query_row(
                "SELECT labels, \"_0_version\" FROM issue WHERE id = 'foo'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(labels, "bug");
        assert_eq!(version, "05");

        // Completion promotes exactly the touched rows to the completion's
        // commit watermark and notifies.
        replica.begin().unwrap();
        replica
            .apply(&DataChange::BackfillCompleted {
                table: issue_spec(),
                column: "labels".into(),
                id: "bf1".into(),
            })
            .unwrap();
        let outcome = replica.commit("08").unwrap();
        assert!(outcome.notify);
        let log = change_log(&replica, "08");
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].2, "s");
        let version: String = replica
            .connection()
            .query_row(
                "SELECT \"_0_version\" FROM issue WHERE id = 'foo'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(version, "08");
        let tracked: i64 = replica
            .connection()
            .query_row("SELECT COUNT(*) FROM \"_zero.backfilling\"", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(tracked, 0);
    }

    #[test]
    fn rollback_discards_everything() {
        let (mut replica, _dir) = test_replica();
        replica.begin().unwrap();
        replica
            .apply(&DataChange::CreateTable { spec: issue_spec() })
            .unwrap();
        replica.rollback().unwrap();

        let exists: i64 = replica
            .connection()
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE name = 'issue'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(exists, 0);
        assert_eq!(replica.state().unwrap().1, "02");
    }
}
