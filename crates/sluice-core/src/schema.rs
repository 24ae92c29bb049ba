//! Schema snapshots and structural drift classification.
//!
//! A table's shape is an ordered list of [`ColumnDescriptor`]s. Diffing keys
//! columns by name, so reordering alone is never reported as drift.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

use crate::TableName;

// ─── Shapes ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
  pub name:      String,
  /// Declared type, lowercased with internal whitespace collapsed.
  pub data_type: String,
  pub nullable:  bool,
}

impl ColumnDescriptor {
  pub fn new(name: impl Into<String>, data_type: &str, nullable: bool) -> Self {
    Self {
      name: name.into(),
      data_type: normalize_type(data_type),
      nullable,
    }
  }
}

fn normalize_type(raw: &str) -> String {
  raw.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

/// Live column metadata for one table, in declaration order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
  pub table_name: TableName,
  pub columns:    Vec<ColumnDescriptor>,
}

impl TableSchema {
  pub fn column(&self, name: &str) -> Option<&ColumnDescriptor> {
    self.columns.iter().find(|c| c.name == name)
  }

  /// Names from `required` that this table lacks.
  pub fn missing_columns<'a>(&self, required: &[&'a str]) -> Vec<&'a str> {
    required
      .iter()
      .copied()
      .filter(|name| self.column(name).is_none())
      .collect()
  }
}

/// SHA-256 over the name-sorted column list; order-independent.
pub fn fingerprint(columns: &[ColumnDescriptor]) -> String {
  let mut hasher = Sha256::new();
  for column in by_name(columns).values() {
    hasher.update(column.name.as_bytes());
    hasher.update([0]);
    hasher.update(column.data_type.as_bytes());
    hasher.update([0, u8::from(column.nullable), 0xff]);
  }
  hex::encode(hasher.finalize())
}

fn by_name(columns: &[ColumnDescriptor]) -> BTreeMap<&str, &ColumnDescriptor> {
  columns.iter().map(|c| (c.name.as_str(), c)).collect()
}

// ─── Snapshots ───────────────────────────────────────────────────────────────

/// One table's shape at one capture. Append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaSnapshot {
  pub table_name:  TableName,
  /// `false` records that the table was looked for and not found.
  pub present:     bool,
  pub columns:     Vec<ColumnDescriptor>,
  pub fingerprint: String,
  pub captured_at: DateTime<Utc>,
}

impl SchemaSnapshot {
  pub fn capture(
    table_name: TableName,
    live: Option<&TableSchema>,
    captured_at: DateTime<Utc>,
  ) -> Self {
    let columns = live.map(|s| s.columns.clone()).unwrap_or_default();
    Self {
      table_name,
      present: live.is_some(),
      fingerprint: fingerprint(&columns),
      columns,
      captured_at,
    }
  }
}

// ─── Changes ─────────────────────────────────────────────────────────────────

#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  PartialOrd,
  Ord,
  Serialize,
  Deserialize,
  Display,
  EnumString,
  AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ChangeKind {
  TableAdded,
  TableMissing,
  ColumnAdded,
  ColumnRemoved,
  ColumnChanged,
}

/// A classified difference, before it is stamped and stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaChange {
  pub table_name: TableName,
  pub kind:       ChangeKind,
  pub detail:     Value,
}

/// A stored row of the schema change log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaChangeEvent {
  pub change_id:   i64,
  pub table_name:  TableName,
  pub change_kind: ChangeKind,
  pub detail:      Value,
  pub detected_at: DateTime<Utc>,
  pub run_id:      Option<Uuid>,
}

/// Classify the difference between the prior snapshot of a table and its
/// live shape.
///
/// `known_universe` is whether any snapshot generation exists at all. On the
/// very first capture nothing is reported; afterwards, a table without a
/// prior snapshot that is present now is `table_added`.
pub fn diff_table(
  table_name: &TableName,
  prior: Option<&SchemaSnapshot>,
  live: Option<&TableSchema>,
  known_universe: bool,
) -> Vec<SchemaChange> {
  let change = |kind, detail| SchemaChange {
    table_name: table_name.clone(),
    kind,
    detail,
  };

  match (prior, live) {
    (None, None) => vec![],
    (None, Some(_)) if !known_universe => vec![],
    (Some(p), None) if !p.present => vec![],
    (None, Some(now)) => vec![change(ChangeKind::TableAdded, table_detail(now))],
    (Some(p), Some(now)) if !p.present => {
      vec![change(ChangeKind::TableAdded, table_detail(now))]
    }
    (Some(p), None) => vec![change(
      ChangeKind::TableMissing,
      json!({
        "table_name": table_name,
        "last_seen_at": p.captured_at,
        "columns": p.columns.iter().map(|c| &c.name).collect::<Vec<_>>(),
      }),
    )],
    (Some(p), Some(now)) => diff_columns(&p.columns, &now.columns)
      .into_iter()
      .map(|(kind, detail)| change(kind, detail))
      .collect(),
  }
}

fn table_detail(now: &TableSchema) -> Value {
  json!({
    "table_name": now.table_name,
    "columns": now.columns.iter().map(|c| &c.name).collect::<Vec<_>>(),
  })
}

/// Added, then removed, then changed; each group in column-name order.
pub fn diff_columns(
  before: &[ColumnDescriptor],
  after: &[ColumnDescriptor],
) -> Vec<(ChangeKind, Value)> {
  let before = by_name(before);
  let after = by_name(after);
  let mut changes = Vec::new();

  for (name, column) in &after {
    if !before.contains_key(name) {
      changes.push((
        ChangeKind::ColumnAdded,
        json!({ "column": name, "after": column }),
      ));
    }
  }

  for (name, column) in &before {
    if !after.contains_key(name) {
      changes.push((
        ChangeKind::ColumnRemoved,
        json!({ "column": name, "before": column }),
      ));
    }
  }

  for (name, old) in &before {
    if let Some(new) = after.get(name)
      && old != new
    {
      changes.push((
        ChangeKind::ColumnChanged,
        json!({ "column": name, "before": old, "after": new }),
      ));
    }
  }

  changes
}
