// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Position of a commit in the upstream replication stream. Watermarks are
/// opaque strings whose lexicographic order matches commit order: for commits
/// A before B, `watermark(A) < watermark(B)`.
pub type Watermark = String;

/// Row values keyed by column name. Stored and shipped as JSON objects.
pub type Row = serde_json::Map<String, JsonValue>;

/// Identity of an upstream table as it appears in row changes.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Relation {
    pub schema: String,
    pub name: String,
    /// Columns forming the row key, in key order.
    pub key_columns: Vec<String>,
}

/// Column definition carried by schema changes.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnSpec {
    pub name: String,
    pub data_type: String,
    #[serde(default)]
    pub not_null: bool,
}

/// Table definition carried by `create-table` and metadata updates.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableSpec {
    pub schema: String,
    pub name: String,
    pub columns: Vec<ColumnSpec>,
    pub primary_key: Vec<String>,
}

/// Index definition carried by `create-index` / `drop-index`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexSpec {
    pub schema: String,
    pub name: String,
    pub table: String,
    pub columns: Vec<String>,
    #[serde(default)]
    pub unique: bool,
}

/// One backfilled row: the key it applies to and the value of the column
/// being backfilled.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackfillRow {
    pub key: Row,
    pub value: JsonValue,
}

/// Administrative signals delivered on the `control` channel.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tag", rename_all = "kebab-case")]
pub enum ControlSignal {
    ResetRequired {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

/// A row-level or schema-level operation inside one upstream transaction.
///
/// The tag names are the wire names; payload fields are camelCase JSON.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tag", rename_all = "kebab-case")]
pub enum DataChange {
    #[serde(rename_all = "camelCase")]
    Insert { relation: Relation, new: Row },
    /// `key` is the previous row key, present when primary-key columns changed.
    #[serde(rename_all = "camelCase")]
    Update {
        relation: Relation,
        new: Row,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        key: Option<Row>,
    },
    #[serde(rename_all = "camelCase")]
    Delete { relation: Relation, key: Row },
    #[serde(rename_all = "camelCase")]
    Truncate { relations: Vec<Relation> },
    #[serde(rename_all = "camelCase")]
    CreateTable { spec: TableSpec },
    #[serde(rename_all = "camelCase")]
    RenameTable { old: TableSpec, new: TableSpec },
    #[serde(rename_all = "camelCase")]
    DropTable { table: TableSpec },
    #[serde(rename_all = "camelCase")]
    AddColumn { table: TableSpec, column: ColumnSpec },
    #[serde(rename_all = "camelCase")]
    UpdateColumn {
        table: TableSpec,
        old: ColumnSpec,
        new: ColumnSpec,
    },
    #[serde(rename_all = "camelCase")]
    DropColumn { table: TableSpec, column: String },
    #[serde(rename_all = "camelCase")]
    UpdateTableMetadata { table: TableSpec, metadata: JsonValue },
    #[serde(rename_all = "camelCase")]
    CreateIndex { spec: IndexSpec },
    #[serde(rename_all = "camelCase")]
    DropIndex { index: IndexSpec },
    /// A chunk of values for one column being backfilled out of band.
    #[serde(rename_all = "camelCase")]
    Backfill {
        table: TableSpec,
        column: String,
        id: String,
        rows: Vec<BackfillRow>,
    },
    #[serde(rename_all = "camelCase")]
    BackfillCompleted {
        table: TableSpec,
        column: String,
        id: String,
    },
}

impl DataChange {
    /// Whether this operation changes the shape of a table (as opposed to its
    /// rows) and therefore has table-metadata / backfill side effects in the
    /// change database.
    pub fn is_schema_change(&self) -> bool {
        matches!(
            self,
            DataChange::CreateTable { .. }
                | DataChange::RenameTable { .. }
                | DataChange::DropTable { .. }
                | DataChange::AddColumn { .. }
                | DataChange::UpdateColumn { .. }
                | DataChange::DropColumn { .. }
                | DataChange::UpdateTableMetadata { .. }
                | DataChange::BackfillCompleted { .. }
        )
    }
}

/// A single element of the change stream, as archived in the change log.
///
/// Transaction markers (`begin`, `commit`, `rollback`, `status`) and control
/// signals carry a `tag` of their own; data payloads are tagged by operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tag", rename_all = "kebab-case")]
pub enum Change {
    Begin,
    Commit,
    Rollback,
    Status,
    #[serde(untagged)]
    Control(ControlSignal),
    #[serde(untagged)]
    Data(DataChange),
}
