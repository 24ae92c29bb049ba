mod common;

use std::time::Duration;

use chrono::{TimeZone, Utc};
use common::*;
use serde_json::json;
use sluice_core::{
  metrics,
  record::RawRecord,
  run::{RunStatus, Severity},
  source::MissingTimestampPolicy,
  store::PipelineStore,
};
use sluice_engine::{Error, Pipeline, ingest::MALFORMED_CHECK};
use sluice_store_sqlite::SqliteStore;
use tempfile::tempdir;

fn users() -> Vec<serde_json::Value> {
  vec![
    json!({ "id": 1, "email": "a@x.edu", "updated_at": "2024-01-01T09:00:00Z" }),
    json!({ "id": 2, "email": "b@x.edu", "updated_at": "2024-01-02T09:00:00Z" }),
    json!({ "id": 3, "email": "c@x.edu", "updated_at": "2024-01-03T09:00:00Z" }),
  ]
}

async fn course(p: &Pipeline<SqliteStore>, id: &str) -> Option<RawRecord> {
  p.store()
    .get_raw(table("raw_courses"), "canvas_courses".into(), id.into())
    .await
    .unwrap()
}

#[tokio::test]
async fn reingesting_the_same_input_keeps_one_row_per_record() {
  let dir = tempdir().unwrap();
  let input = write_jsonl(&dir, "users.jsonl", &users());
  let p = pipeline().await;

  let first = p.ingest(request("canvas_users", &input, false)).await.unwrap();
  assert_eq!(first.output.counts.inserted, 3);
  assert_eq!(first.run.status, RunStatus::Success);

  let second = p.ingest(request("canvas_users", &input, false)).await.unwrap();
  assert_eq!(second.output.counts.inserted, 0);
  assert_eq!(second.output.counts.updated, 3);

  let rows = p.store().raw_window(table("raw_users"), None).await.unwrap();
  assert_eq!(rows.len(), 3);
  assert_eq!(second.run.metrics.count(metrics::RECORDS_UPSERTED), Some(3));
}

#[tokio::test]
async fn an_incremental_rerun_of_the_same_input_changes_nothing() {
  let dir = tempdir().unwrap();
  let input = write_jsonl(&dir, "users.jsonl", &users());
  let p = pipeline().await;
  p.ingest(request("canvas_users", &input, true)).await.unwrap();

  let t = table("raw_users");
  let before = p.store().raw_window(t.clone(), None).await.unwrap();
  let mark_before = p.store().read_watermark("canvas_users".into()).await.unwrap();

  let again = p.ingest(request("canvas_users", &input, true)).await.unwrap();
  assert_eq!(again.output.counts.upserted, 0);
  assert_eq!(again.output.counts.skipped, 3);
  assert_eq!(again.run.metrics.count(metrics::RECORDS_UPSERTED), Some(0));

  for row in &before {
    let now = p
      .store()
      .get_raw(t.clone(), row.source_name.clone(), row.record_id.clone())
      .await
      .unwrap()
      .unwrap();
    assert_eq!(&now, row);
  }
  let mark_after = p.store().read_watermark("canvas_users".into()).await.unwrap();
  assert_eq!(
    mark_after.map(|w| w.last_updated_at),
    mark_before.map(|w| w.last_updated_at)
  );
}

#[tokio::test]
async fn only_records_past_the_watermark_are_upserted() {
  let dir = tempdir().unwrap();
  let p = pipeline().await;
  let a = json!({ "id": "A", "updated_at": "2024-01-01T00:00:00Z" });
  let b = json!({ "id": "B", "updated_at": "2024-01-02T00:00:00Z" });
  let c = json!({ "id": "C", "updated_at": "2024-01-03T00:00:00Z" });

  let first = write_jsonl(&dir, "first.jsonl", &[a.clone(), b.clone()]);
  p.ingest(request("canvas_courses", &first, true)).await.unwrap();
  let a_before = course(&p, "A").await.unwrap();
  let b_before = course(&p, "B").await.unwrap();

  let second = write_jsonl(&dir, "second.jsonl", &[a, b, c]);
  let report = p.ingest(request("canvas_courses", &second, true)).await.unwrap();
  let counts = report.output.counts;
  assert_eq!((counts.read, counts.skipped, counts.inserted, counts.updated), (3, 2, 1, 0));
  assert_eq!(
    report.output.watermark_after,
    Some(Utc.with_ymd_and_hms(2024, 1, 3, 0, 0, 0).unwrap())
  );

  assert_eq!(course(&p, "A").await, Some(a_before));
  assert_eq!(course(&p, "B").await, Some(b_before));
  assert!(course(&p, "C").await.is_some());
}

#[tokio::test]
async fn incremental_runs_skip_records_at_or_below_the_watermark() {
  let dir = tempdir().unwrap();
  let p = pipeline().await;

  let first = write_jsonl(&dir, "day1.jsonl", &users());
  let report = p.ingest(request("canvas_users", &first, true)).await.unwrap();
  let mark = Utc.with_ymd_and_hms(2024, 1, 3, 9, 0, 0).unwrap();
  assert_eq!(report.output.watermark_after, Some(mark));

  // Record 3 unchanged, record 2 edited, record 4 new.
  let second = write_jsonl(&dir, "day2.jsonl", &[
    json!({ "id": 3, "email": "c@x.edu", "updated_at": "2024-01-03T09:00:00Z" }),
    json!({ "id": 2, "email": "b2@x.edu", "updated_at": "2024-01-04T09:00:00Z" }),
    json!({ "id": 4, "email": "d@x.edu", "updated_at": "2024-01-05T09:00:00Z" }),
  ]);
  let report = p.ingest(request("canvas_users", &second, true)).await.unwrap();
  let counts = report.output.counts;
  assert_eq!((counts.read, counts.skipped, counts.inserted, counts.updated), (3, 1, 1, 1));
  assert_eq!(
    report.output.watermark_after,
    Some(Utc.with_ymd_and_hms(2024, 1, 5, 9, 0, 0).unwrap())
  );

  let edited = p
    .store()
    .get_raw(table("raw_users"), "canvas_users".into(), "2".into())
    .await
    .unwrap()
    .unwrap();
  assert_eq!(edited.payload["email"], "b2@x.edu");
}

#[tokio::test]
async fn the_watermark_never_moves_backwards() {
  let dir = tempdir().unwrap();
  let p = pipeline().await;

  let late = write_jsonl(&dir, "late.jsonl", &[
    json!({ "id": 9, "updated_at": "2024-06-01T00:00:00Z" }),
  ]);
  p.ingest(request("canvas_courses", &late, true)).await.unwrap();

  // Non-incremental replay of older data leaves the mark alone.
  let early = write_jsonl(&dir, "early.jsonl", &[
    json!({ "id": 1, "updated_at": "2023-01-01T00:00:00Z" }),
  ]);
  p.ingest(request("canvas_courses", &early, false)).await.unwrap();

  let mark = p.store().read_watermark("canvas_courses".into()).await.unwrap().unwrap();
  assert_eq!(mark.last_updated_at, Some(Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()));
}

#[tokio::test]
async fn malformed_lines_are_isolated_and_reported() {
  let dir = tempdir().unwrap();
  let input = write_lines(
    &dir,
    "mixed.jsonl",
    concat!(
      "{\"id\": 1, \"user_id\": 1, \"course_id\": 7}\n",
      "{not json\n",
      "\n",
      "{\"user_id\": 1, \"course_id\": 7}\n",
      "{\"id\": 4, \"course_id\": 7}\n",
      "{\"id\": 5, \"user_id\": 2, \"course_id\": 7}\n",
    ),
  );
  let p = pipeline().await;

  let report = p.ingest(request("canvas_submissions", &input, false)).await.unwrap();
  assert_eq!(report.run.status, RunStatus::Success);
  assert_eq!(report.output.counts.read, 5);
  assert_eq!(report.output.counts.malformed, 3);
  assert_eq!(report.output.counts.upserted, 2);
  assert_eq!(report.output.malformed_lines, vec![2, 4, 5]);

  let checks = p.store().quality_results(report.run.run_id).await.unwrap();
  let check = checks.iter().find(|c| c.check_name == MALFORMED_CHECK).unwrap();
  assert_eq!(check.severity, Severity::Warn);
  assert_eq!(check.sample_keys.as_slice(), ["2", "4", "5"]);
  assert_eq!(check.table_name, "raw_submissions");
}

#[tokio::test]
async fn a_line_of_invalid_utf8_is_malformed_not_fatal() {
  let dir = tempdir().unwrap();
  let path = dir.path().join("users.jsonl");
  let mut body = b"{\"id\": 1}\n".to_vec();
  body.extend_from_slice(b"{\"id\": \"\xff\xfe\"}\r\n");
  body.extend_from_slice(b"{\"id\": 3}\n");
  std::fs::write(&path, body).unwrap();
  let p = pipeline().await;

  let report = p.ingest(request("canvas_users", &path, false)).await.unwrap();
  assert_eq!(report.run.status, RunStatus::Success);
  assert_eq!(report.output.counts.read, 3);
  assert_eq!(report.output.counts.malformed, 1);
  assert_eq!(report.output.counts.upserted, 2);
  assert_eq!(report.output.malformed_lines, vec![2]);

  let landed = p
    .store()
    .get_raw(table("raw_users"), "canvas_users".into(), "3".into())
    .await
    .unwrap();
  assert!(landed.is_some());
}

#[tokio::test]
async fn missing_timestamps_follow_the_configured_policy() {
  let dir = tempdir().unwrap();
  let input = write_jsonl(&dir, "users.jsonl", &[
    json!({ "id": 1, "updated_at": "2024-01-01T00:00:00Z" }),
    json!({ "id": 2 }),
    json!({ "id": 3, "updated_at": "not a date" }),
  ]);
  let p = pipeline().await;

  let mut req = request("canvas_users", &input, true);
  req.missing_timestamp = Some(MissingTimestampPolicy::Quarantine);
  let report = p.ingest(req).await.unwrap();
  assert_eq!(report.output.counts.missing_timestamp, 2);
  assert_eq!(report.output.counts.quarantined, 2);
  assert_eq!(report.output.counts.upserted, 1);

  let quarantined = p.store().quarantined("canvas_users".into()).await.unwrap();
  assert_eq!(quarantined.len(), 2);

  // The default policy processes them without moving the watermark.
  let report = p.ingest(request("canvas_users", &input, true)).await.unwrap();
  assert_eq!(report.output.counts.upserted, 2);
  assert_eq!(report.output.counts.skipped, 1);
  assert_eq!(
    report.output.watermark_after,
    Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
  );
}

#[tokio::test]
async fn dotted_update_fields_and_custom_tables() {
  let dir = tempdir().unwrap();
  let input = write_jsonl(&dir, "events.jsonl", &[
    json!({ "key": "a", "meta": { "modified": "2024-02-01T00:00:00+02:00" } }),
  ]);
  let p = pipeline().await;

  let mut req = request("lms_events", &input, true);
  req.id_field = Some("key".into());
  req.updated_field = Some("meta.modified".into());
  let report = p.ingest(req).await.unwrap();
  assert_eq!(report.output.table.as_str(), "raw_lms_events");
  assert_eq!(
    report.output.watermark_after,
    Some(Utc.with_ymd_and_hms(2024, 1, 31, 22, 0, 0).unwrap())
  );
}

#[tokio::test]
async fn an_unreadable_source_fails_the_run() {
  let dir = tempdir().unwrap();
  let p = pipeline().await;

  let err = p
    .ingest(request("canvas_users", &dir.path().join("nope.jsonl"), true))
    .await
    .unwrap_err();
  assert!(matches!(err, Error::SourceUnreadable { .. }));

  let runs = p.store().latest_runs().await.unwrap();
  assert_eq!(runs.len(), 1);
  assert_eq!(runs[0].status, RunStatus::Failed);
  assert!(runs[0].error_detail.as_deref().unwrap().contains("nope.jsonl"));
  assert!(p.store().read_watermark("canvas_users".into()).await.unwrap().is_none());
}

#[tokio::test]
async fn a_store_timeout_fails_the_run_and_keeps_the_watermark() {
  let dir = tempdir().unwrap();
  let input = write_jsonl(&dir, "users.jsonl", &users());
  let store =
    FaultyStore::stalling(SqliteStore::open_in_memory().await.unwrap(), Duration::from_secs(30));
  let config = sluice_engine::PipelineConfig { store_timeout_secs: 1, ..config() };
  let p = Pipeline::new(store, config).unwrap();

  let err = p.ingest(request("canvas_users", &input, true)).await.unwrap_err();
  assert!(matches!(err, Error::Timeout(_)));

  let runs = p.store().latest_runs().await.unwrap();
  assert_eq!(runs[0].status, RunStatus::Failed);
  assert!(runs[0].end_time.is_some());
  assert!(p.store().read_watermark("canvas_users".into()).await.unwrap().is_none());
}

#[tokio::test]
async fn a_write_lock_held_elsewhere_fails_the_run_without_moving_the_watermark() {
  let dir = tempdir().unwrap();
  let input = write_jsonl(&dir, "users.jsonl", &[
    json!({ "id": 1, "updated_at": "2024-01-05T00:00:00Z" }),
  ]);
  let timeout = Duration::from_secs(1);
  let inner = SqliteStore::open_with_call_timeout(db_path(&dir), timeout).await.unwrap();
  let store = FaultyStore::locking(inner, db_path(&dir), Duration::from_millis(1200));
  let config = sluice_engine::PipelineConfig { store_timeout_secs: 1, ..config() };
  let p = Pipeline::new(store, config).unwrap();

  let err = p.ingest(request("canvas_users", &input, true)).await.unwrap_err();
  assert!(matches!(err, Error::Store(_) | Error::Timeout(_)), "{err}");

  // Give any abandoned work longer than its budget to land.
  tokio::time::sleep(Duration::from_secs(2)).await;

  assert!(p.store().read_watermark("canvas_users".into()).await.unwrap().is_none());
  let runs = p.store().latest_runs().await.unwrap();
  assert_eq!(runs.len(), 1);
  assert_eq!(runs[0].status, RunStatus::Failed);
  assert!(runs[0].end_time.is_some());
}
