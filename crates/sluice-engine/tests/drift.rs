mod common;

use std::collections::BTreeSet;

use common::*;
use serde_json::json;
use sluice_core::{metrics, run::RunStatus, schema::ChangeKind, store::PipelineStore};
use sluice_engine::{Pipeline, drift::DriftSummary};
use sluice_store_sqlite::SqliteStore;
use tempfile::{TempDir, tempdir};

fn kinds(summary: &DriftSummary) -> BTreeSet<(String, ChangeKind)> {
  summary
    .changes
    .iter()
    .map(|c| (c.table_name.to_string(), c.change_kind))
    .collect()
}

fn exec(dir: &TempDir, sql: &str) {
  let conn = rusqlite::Connection::open(db_path(dir)).unwrap();
  conn.execute_batch(sql).unwrap();
}

#[tokio::test]
async fn every_structural_change_is_reported_once() {
  let dir = tempdir().unwrap();
  let p = file_pipeline(&dir).await;
  let users = write_jsonl(&dir, "users.jsonl", &[json!({ "id": 1 })]);
  p.ingest(request("canvas_users", &users, false)).await.unwrap();

  // First generation is the baseline.
  let first = p.snapshot_schema(vec![]).await.unwrap();
  assert!(!first.output.baseline_existed);
  assert!(first.output.changes.is_empty());
  assert!(first.output.tables.contains(&table("raw_users")));
  assert!(first.output.tables.contains(&table("runs")));

  // A column appears and a new raw table arrives.
  exec(&dir, "ALTER TABLE raw_users ADD COLUMN extra TEXT;");
  let courses = write_jsonl(&dir, "courses.jsonl", &[json!({ "id": 7 })]);
  p.ingest(request("canvas_courses", &courses, false)).await.unwrap();

  let second = p.snapshot_schema(vec![]).await.unwrap();
  assert_eq!(
    kinds(&second.output),
    BTreeSet::from([
      ("raw_courses".to_owned(), ChangeKind::TableAdded),
      ("raw_users".to_owned(), ChangeKind::ColumnAdded),
    ])
  );
  assert!(second.output.changes.iter().all(|c| c.run_id == Some(second.run.run_id)));
  assert_eq!(second.run.metrics.count(metrics::CHANGES_DETECTED), Some(2));

  // A column is dropped and another changes type.
  exec(
    &dir,
    "DROP TABLE raw_users;
     CREATE TABLE raw_users (
       source_name       TEXT NOT NULL,
       record_id         TEXT NOT NULL,
       payload           TEXT NOT NULL,
       record_updated_at TIMESTAMP,
       ingested_at       TEXT NOT NULL,
       PRIMARY KEY (source_name, record_id)
     );",
  );
  let third = p.snapshot_schema(vec![]).await.unwrap();
  assert_eq!(
    kinds(&third.output),
    BTreeSet::from([
      ("raw_users".to_owned(), ChangeKind::ColumnChanged),
      ("raw_users".to_owned(), ChangeKind::ColumnRemoved),
    ])
  );
  let changed = third
    .output
    .changes
    .iter()
    .find(|c| c.change_kind == ChangeKind::ColumnChanged)
    .unwrap();
  assert_eq!(changed.detail["column"], "record_updated_at");
  assert_eq!(changed.detail["after"]["data_type"], "timestamp");

  // A dropped table is reported once, then stays quiet.
  exec(&dir, "DROP TABLE raw_courses;");
  let fourth = p.snapshot_schema(vec![]).await.unwrap();
  assert_eq!(
    kinds(&fourth.output),
    BTreeSet::from([("raw_courses".to_owned(), ChangeKind::TableMissing)])
  );
  let fifth = p.snapshot_schema(vec![]).await.unwrap();
  assert!(fifth.output.changes.is_empty());
  assert!(fifth.output.tables.contains(&table("raw_courses")));

  let logged = p.store().recent_schema_changes(10).await.unwrap();
  assert_eq!(logged.len(), 5);
  assert_eq!(logged[0].change_kind, ChangeKind::TableMissing);
}

#[tokio::test]
async fn an_explicit_table_list_limits_the_snapshot() {
  let dir = tempdir().unwrap();
  let p = file_pipeline(&dir).await;
  let users = write_jsonl(&dir, "users.jsonl", &[json!({ "id": 1 })]);
  p.ingest(request("canvas_users", &users, false)).await.unwrap();

  p.snapshot_schema(vec![table("raw_users")]).await.unwrap();
  exec(&dir, "ALTER TABLE raw_users ADD COLUMN extra TEXT;");
  let report = p.snapshot_schema(vec![table("raw_users")]).await.unwrap();

  assert_eq!(report.output.tables, vec![table("raw_users")]);
  assert_eq!(report.run.metrics.count(metrics::TABLES_SNAPSHOTTED), Some(1));
  assert_eq!(
    kinds(&report.output),
    BTreeSet::from([("raw_users".to_owned(), ChangeKind::ColumnAdded)])
  );

  let latest = p.store().latest_snapshots().await.unwrap();
  assert_eq!(latest.keys().collect::<Vec<_>>(), vec![&table("raw_users")]);
}

#[tokio::test]
async fn a_table_that_cannot_be_described_is_skipped_alone() {
  let dir = tempdir().unwrap();
  let inner = SqliteStore::open(db_path(&dir)).await.unwrap();
  let p = Pipeline::new(FaultyStore::failing_describe(inner, table("raw_courses")), config()).unwrap();
  let users = write_jsonl(&dir, "users.jsonl", &[json!({ "id": 1 })]);
  let courses = write_jsonl(&dir, "courses.jsonl", &[json!({ "id": 7 })]);
  p.ingest(request("canvas_users", &users, false)).await.unwrap();
  p.ingest(request("canvas_courses", &courses, false)).await.unwrap();

  let report = p.snapshot_schema(vec![]).await.unwrap();
  assert_eq!(report.run.status, RunStatus::Success);
  assert_eq!(report.output.skipped.len(), 1);
  assert_eq!(report.output.skipped[0].table, table("raw_courses"));
  assert!(report.output.tables.contains(&table("raw_users")));
  assert!(!report.output.tables.contains(&table("raw_courses")));
  assert_eq!(report.run.metrics.count(metrics::TABLES_SKIPPED), Some(1));

  let latest = p.store().latest_snapshots().await.unwrap();
  assert!(latest.contains_key(&table("raw_users")));
  assert!(!latest.contains_key(&table("raw_courses")));
}
