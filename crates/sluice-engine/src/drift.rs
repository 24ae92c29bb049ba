//! The schema drift job: snapshot live table shapes and log what changed.

use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;
use serde::Serialize;
use sluice_core::{
  TableName,
  metrics::{self, Metrics},
  schema::{SchemaChangeEvent, SchemaSnapshot, diff_table},
  store::PipelineStore,
};
use uuid::Uuid;

use crate::{Error, Result, curated::SkippedTable, recorder::Bounded};

#[derive(Debug, Clone, Serialize)]
pub struct DriftSummary {
  pub tables:           Vec<TableName>,
  /// `false` on the very first snapshot generation, which reports nothing.
  pub baseline_existed: bool,
  pub changes:          Vec<SchemaChangeEvent>,
  /// Tables that could not be described. They keep their previous snapshot.
  pub skipped:          Vec<SkippedTable>,
}

/// Snapshot `tables` (or the default universe when empty) and record every
/// difference from the previous generation.
///
/// The default universe is every live table plus every table that was ever
/// snapshotted, so a dropped table is still looked for. A store error on one
/// table skips that table only; a timeout still fails the run.
pub async fn run_drift<S: PipelineStore>(
  db: Bounded<'_, S>,
  run_id: Uuid,
  tables: &[TableName],
) -> Result<(DriftSummary, Metrics)> {
  let latest = db.call(|s| s.latest_snapshots()).await?;
  let baseline_existed = !latest.is_empty();

  let tables = if tables.is_empty() {
    let live = db.call(|s| s.list_tables()).await?;
    live
      .into_iter()
      .chain(latest.keys().cloned())
      .collect::<BTreeSet<_>>()
      .into_iter()
      .collect::<Vec<_>>()
  } else {
    tables.iter().cloned().collect::<BTreeSet<_>>().into_iter().collect()
  };

  let captured_at = Utc::now();
  let mut snapshots = Vec::with_capacity(tables.len());
  let mut changes = Vec::new();
  let mut skipped = Vec::new();

  for table in &tables {
    let name = table.clone();
    let live = match db.call(|s| s.describe_table(name)).await {
      Ok(live) => live,
      Err(err @ Error::Store(_)) => {
        tracing::warn!(%table, error = %err, "cannot describe table, skipping");
        skipped.push(SkippedTable { table: table.clone(), reason: err.to_string() });
        continue;
      }
      Err(err) => return Err(err),
    };
    changes.extend(diff_table(table, latest.get(table), live.as_ref(), baseline_existed));
    snapshots.push(SchemaSnapshot::capture(table.clone(), live.as_ref(), captured_at));
  }

  let snapshots_taken = snapshots.len() as u64;
  let events = db
    .call(|s| s.record_schema_generation(snapshots, changes, Some(run_id)))
    .await?;

  let mut by_kind: BTreeMap<String, u64> = BTreeMap::new();
  for event in &events {
    tracing::info!(
      table = %event.table_name,
      kind = %event.change_kind,
      detail = %event.detail,
      "schema change"
    );
    *by_kind.entry(event.change_kind.to_string()).or_default() += 1;
  }

  let mut metrics = Metrics::new()
    .with(metrics::TABLES_SNAPSHOTTED, snapshots_taken)
    .with(metrics::TABLES_SKIPPED, skipped.len() as u64)
    .with(metrics::CHANGES_DETECTED, events.len() as u64);
  for (kind, n) in by_kind {
    metrics.set(format!("changes.{kind}"), n);
  }

  let tables = tables
    .into_iter()
    .filter(|t| !skipped.iter().any(|s: &SkippedTable| &s.table == t))
    .collect();
  Ok((DriftSummary { tables, baseline_existed, changes: events, skipped }, metrics))
}
