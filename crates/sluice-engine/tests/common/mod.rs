#![allow(dead_code)]

use std::{
  collections::{BTreeMap, HashMap},
  future::Future,
  path::{Path, PathBuf},
  time::Duration,
};

use chrono::{DateTime, Utc};
use serde_json::Value;
use sluice_core::{
  TableName,
  curated::{CourseRow, MergeCounts, StudentRow, SubmissionRow},
  identity::{IdentityException, IdentityMapping, IdentityWriteSummary, Resolution},
  metrics::Metrics,
  quality::{ProbeOutcome, QualityProbe},
  record::{NewRawRecord, QuarantinedRecord, RawRecord, UpsertOutcome},
  run::{NewQualityCheck, QualityCheckResult, RunRecord, RunStatus},
  schema::{SchemaChange, SchemaChangeEvent, SchemaSnapshot, TableSchema},
  store::PipelineStore,
  watermark::Watermark,
};
use sluice_engine::{IngestRequest, Pipeline, PipelineConfig};
use sluice_store_sqlite::SqliteStore;
use tempfile::TempDir;
use uuid::Uuid;

pub fn config() -> PipelineConfig {
  PipelineConfig { store_timeout_secs: 5, ..PipelineConfig::default() }
}

pub async fn pipeline() -> Pipeline<SqliteStore> {
  let store = SqliteStore::open_in_memory().await.unwrap();
  Pipeline::new(store, config()).unwrap()
}

/// A pipeline over a store file inside `dir`, so tests can reach the same
/// database from a second connection.
pub async fn file_pipeline(dir: &TempDir) -> Pipeline<SqliteStore> {
  let store = SqliteStore::open(db_path(dir)).await.unwrap();
  Pipeline::new(store, config()).unwrap()
}

pub fn db_path(dir: &TempDir) -> PathBuf { dir.path().join("sluice.db") }

/// Write one JSON value per line.
pub fn write_jsonl(dir: &TempDir, name: &str, records: &[Value]) -> PathBuf {
  let body = records.iter().map(Value::to_string).collect::<Vec<_>>().join("\n");
  write_lines(dir, name, &body)
}

pub fn write_lines(dir: &TempDir, name: &str, body: &str) -> PathBuf {
  let path = dir.path().join(name);
  std::fs::write(&path, body).unwrap();
  path
}

pub fn request(source: &str, input: &Path, incremental: bool) -> IngestRequest {
  IngestRequest {
    source_name: source.to_owned(),
    input: input.to_path_buf(),
    incremental,
    ..IngestRequest::default()
  }
}

pub fn table(name: &str) -> TableName { TableName::new(name).unwrap() }

// ─── Faulty store ────────────────────────────────────────────────────────────

/// Delegates to an inner store, injecting one kind of fault:
/// - `stall` is slept before every raw upsert;
/// - with `lock_on_advance`, a second connection to that file takes the
///   write lock for the given time just before each watermark advance;
/// - describing `fail_describe` returns an error.
#[derive(Clone)]
pub struct FaultyStore {
  pub inner:           SqliteStore,
  pub stall:           Duration,
  pub lock_on_advance: Option<(PathBuf, Duration)>,
  pub fail_describe:   Option<TableName>,
}

impl FaultyStore {
  fn wrap(inner: SqliteStore) -> Self {
    Self { inner, stall: Duration::ZERO, lock_on_advance: None, fail_describe: None }
  }

  pub fn stalling(inner: SqliteStore, stall: Duration) -> Self {
    Self { stall, ..Self::wrap(inner) }
  }

  pub fn locking(inner: SqliteStore, path: PathBuf, hold: Duration) -> Self {
    Self { lock_on_advance: Some((path, hold)), ..Self::wrap(inner) }
  }

  pub fn failing_describe(inner: SqliteStore, table: TableName) -> Self {
    Self { fail_describe: Some(table), ..Self::wrap(inner) }
  }
}

/// Take the write lock on `path` from a fresh connection and release it
/// after `hold`, on a separate thread.
pub fn hold_write_lock(path: &Path, hold: Duration) {
  let conn = rusqlite::Connection::open(path).unwrap();
  conn.execute_batch("BEGIN IMMEDIATE").unwrap();
  std::thread::spawn(move || {
    std::thread::sleep(hold);
    conn.execute_batch("COMMIT").unwrap();
  });
}

impl PipelineStore for FaultyStore {
  type Error = sluice_store_sqlite::Error;

  // ── Raw records ───────────────────────────────────────────────────────

  fn ensure_raw_table(
    &self,
    table: TableName,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_ {
    self.inner.ensure_raw_table(table)
  }

  fn upsert_raw(
    &self,
    table: TableName,
    record: NewRawRecord,
  ) -> impl Future<Output = Result<UpsertOutcome, Self::Error>> + Send + '_ {
    async move {
      tokio::time::sleep(self.stall).await;
      self.inner.upsert_raw(table, record).await
    }
  }

  fn get_raw(
    &self,
    table: TableName,
    source_name: String,
    record_id: String,
  ) -> impl Future<Output = Result<Option<RawRecord>, Self::Error>> + Send + '_ {
    self.inner.get_raw(table, source_name, record_id)
  }

  fn raw_window(
    &self,
    table: TableName,
    after: Option<DateTime<Utc>>,
  ) -> impl Future<Output = Result<Vec<RawRecord>, Self::Error>> + Send + '_ {
    self.inner.raw_window(table, after)
  }

  fn quarantine(
    &self,
    record: NewRawRecord,
    reason: String,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_ {
    self.inner.quarantine(record, reason)
  }

  fn quarantined(
    &self,
    source_name: String,
  ) -> impl Future<Output = Result<Vec<QuarantinedRecord>, Self::Error>> + Send + '_ {
    self.inner.quarantined(source_name)
  }

  // ── Watermarks ────────────────────────────────────────────────────────

  fn read_watermark(
    &self,
    source_name: String,
  ) -> impl Future<Output = Result<Option<Watermark>, Self::Error>> + Send + '_ {
    self.inner.read_watermark(source_name)
  }

  fn advance_watermark(
    &self,
    source_name: String,
    candidate: DateTime<Utc>,
  ) -> impl Future<Output = Result<Watermark, Self::Error>> + Send + '_ {
    if let Some((path, hold)) = &self.lock_on_advance {
      hold_write_lock(path, *hold);
    }
    self.inner.advance_watermark(source_name, candidate)
  }

  // ── Identity ──────────────────────────────────────────────────────────

  fn apply_identity(
    &self,
    resolution: Resolution,
  ) -> impl Future<Output = Result<IdentityWriteSummary, Self::Error>> + Send + '_ {
    self.inner.apply_identity(resolution)
  }

  fn active_mappings(
    &self,
  ) -> impl Future<Output = Result<Vec<IdentityMapping>, Self::Error>> + Send + '_ {
    self.inner.active_mappings()
  }

  fn mappings_for(
    &self,
    source_user_id: String,
  ) -> impl Future<Output = Result<Vec<IdentityMapping>, Self::Error>> + Send + '_ {
    self.inner.mappings_for(source_user_id)
  }

  fn identity_exceptions(
    &self,
  ) -> impl Future<Output = Result<Vec<IdentityException>, Self::Error>> + Send + '_ {
    self.inner.identity_exceptions()
  }

  // ── Curated tables ────────────────────────────────────────────────────

  fn merge_students(
    &self,
    rows: Vec<StudentRow>,
  ) -> impl Future<Output = Result<MergeCounts, Self::Error>> + Send + '_ {
    self.inner.merge_students(rows)
  }

  fn merge_courses(
    &self,
    rows: Vec<CourseRow>,
  ) -> impl Future<Output = Result<MergeCounts, Self::Error>> + Send + '_ {
    self.inner.merge_courses(rows)
  }

  fn merge_submissions(
    &self,
    rows: Vec<SubmissionRow>,
  ) -> impl Future<Output = Result<MergeCounts, Self::Error>> + Send + '_ {
    self.inner.merge_submissions(rows)
  }

  fn student_keys(
    &self,
  ) -> impl Future<Output = Result<HashMap<String, i64>, Self::Error>> + Send + '_ {
    self.inner.student_keys()
  }

  fn course_keys(
    &self,
  ) -> impl Future<Output = Result<HashMap<String, i64>, Self::Error>> + Send + '_ {
    self.inner.course_keys()
  }

  fn curated_boundary(
    &self,
  ) -> impl Future<Output = Result<Option<DateTime<Utc>>, Self::Error>> + Send + '_ {
    self.inner.curated_boundary()
  }

  fn advance_curated_boundary(
    &self,
    boundary: DateTime<Utc>,
  ) -> impl Future<Output = Result<DateTime<Utc>, Self::Error>> + Send + '_ {
    self.inner.advance_curated_boundary(boundary)
  }

  // ── Schema ────────────────────────────────────────────────────────────

  fn list_tables(
    &self,
  ) -> impl Future<Output = Result<Vec<TableName>, Self::Error>> + Send + '_ {
    self.inner.list_tables()
  }

  fn describe_table(
    &self,
    table: TableName,
  ) -> impl Future<Output = Result<Option<TableSchema>, Self::Error>> + Send + '_ {
    let fail = self.fail_describe.as_ref() == Some(&table);
    async move {
      if fail {
        return Err(sluice_store_sqlite::Error::Decode {
          column: "type",
          value:  table.to_string(),
        });
      }
      self.inner.describe_table(table).await
    }
  }

  fn latest_snapshots(
    &self,
  ) -> impl Future<Output = Result<BTreeMap<TableName, SchemaSnapshot>, Self::Error>>
  + Send
  + '_ {
    self.inner.latest_snapshots()
  }

  fn record_schema_generation(
    &self,
    snapshots: Vec<SchemaSnapshot>,
    changes: Vec<SchemaChange>,
    run_id: Option<Uuid>,
  ) -> impl Future<Output = Result<Vec<SchemaChangeEvent>, Self::Error>> + Send + '_ {
    self.inner.record_schema_generation(snapshots, changes, run_id)
  }

  fn recent_schema_changes(
    &self,
    limit: usize,
  ) -> impl Future<Output = Result<Vec<SchemaChangeEvent>, Self::Error>> + Send + '_ {
    self.inner.recent_schema_changes(limit)
  }

  // ── Runs & quality ────────────────────────────────────────────────────

  fn start_run(
    &self,
    job_name: String,
  ) -> impl Future<Output = Result<RunRecord, Self::Error>> + Send + '_ {
    self.inner.start_run(job_name)
  }

  fn finish_run(
    &self,
    run_id: Uuid,
    status: RunStatus,
    metrics: Metrics,
    error_detail: Option<String>,
  ) -> impl Future<Output = Result<RunRecord, Self::Error>> + Send + '_ {
    self.inner.finish_run(run_id, status, metrics, error_detail)
  }

  fn get_run(
    &self,
    run_id: Uuid,
  ) -> impl Future<Output = Result<Option<RunRecord>, Self::Error>> + Send + '_ {
    self.inner.get_run(run_id)
  }

  fn latest_runs(&self) -> impl Future<Output = Result<Vec<RunRecord>, Self::Error>> + Send + '_ {
    self.inner.latest_runs()
  }

  fn record_quality(
    &self,
    run_id: Uuid,
    check: NewQualityCheck,
  ) -> impl Future<Output = Result<QualityCheckResult, Self::Error>> + Send + '_ {
    self.inner.record_quality(run_id, check)
  }

  fn quality_results(
    &self,
    run_id: Uuid,
  ) -> impl Future<Output = Result<Vec<QualityCheckResult>, Self::Error>> + Send + '_ {
    self.inner.quality_results(run_id)
  }

  fn latest_quality(
    &self,
  ) -> impl Future<Output = Result<Vec<QualityCheckResult>, Self::Error>> + Send + '_ {
    self.inner.latest_quality()
  }

  fn probe(
    &self,
    probe: QualityProbe,
  ) -> impl Future<Output = Result<Option<ProbeOutcome>, Self::Error>> + Send + '_ {
    self.inner.probe(probe)
  }
}
