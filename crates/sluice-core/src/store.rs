//! The `PipelineStore` trait.
//!
//! The trait is implemented by storage backends (e.g. `sluice-store-sqlite`).
//! The engine and the CLI depend on this abstraction, not on any concrete
//! backend.

use std::{
  collections::{BTreeMap, HashMap},
  future::Future,
};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
  TableName,
  curated::{CourseRow, MergeCounts, StudentRow, SubmissionRow},
  identity::{IdentityException, IdentityMapping, IdentityWriteSummary, Resolution},
  metrics::Metrics,
  quality::{ProbeOutcome, QualityProbe},
  record::{NewRawRecord, QuarantinedRecord, RawRecord, UpsertOutcome},
  run::{NewQualityCheck, QualityCheckResult, RunRecord, RunStatus},
  schema::{SchemaChange, SchemaChangeEvent, SchemaSnapshot, TableSchema},
  watermark::Watermark,
};

/// Abstraction over a Sluice store backend.
///
/// Every mutating method is one independently committed unit. Raw records,
/// snapshots, change events and quality results are never deleted.
///
/// All methods return `Send` futures so the engine can bound them with a
/// timeout on a multi-threaded runtime.
pub trait PipelineStore: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  // ── Raw records ───────────────────────────────────────────────────────

  /// Create the raw table if it does not exist yet.
  fn ensure_raw_table(
    &self,
    table: TableName,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  /// Insert or replace the record keyed by `(source_name, record_id)`.
  /// `ingested_at` is assigned by the store and strictly increases across
  /// calls on the same handle.
  fn upsert_raw(
    &self,
    table: TableName,
    record: NewRawRecord,
  ) -> impl Future<Output = Result<UpsertOutcome, Self::Error>> + Send + '_;

  fn get_raw(
    &self,
    table: TableName,
    source_name: String,
    record_id: String,
  ) -> impl Future<Output = Result<Option<RawRecord>, Self::Error>> + Send + '_;

  /// Rows with `ingested_at` strictly after `after` (all rows when `None`),
  /// ordered by `ingested_at`.
  fn raw_window(
    &self,
    table: TableName,
    after: Option<DateTime<Utc>>,
  ) -> impl Future<Output = Result<Vec<RawRecord>, Self::Error>> + Send + '_;

  fn quarantine(
    &self,
    record: NewRawRecord,
    reason: String,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  fn quarantined(
    &self,
    source_name: String,
  ) -> impl Future<Output = Result<Vec<QuarantinedRecord>, Self::Error>> + Send + '_;

  // ── Watermarks ────────────────────────────────────────────────────────

  fn read_watermark(
    &self,
    source_name: String,
  ) -> impl Future<Output = Result<Option<Watermark>, Self::Error>> + Send + '_;

  /// Set the watermark to `max(current, candidate)` in one transaction.
  fn advance_watermark(
    &self,
    source_name: String,
    candidate: DateTime<Utc>,
  ) -> impl Future<Output = Result<Watermark, Self::Error>> + Send + '_;

  // ── Identity ──────────────────────────────────────────────────────────

  /// Persist a resolution: upsert mappings by source user, deactivate
  /// mappings whose key moved or that lost a duplicate contest, and make the
  /// stored exception set equal to `resolution.exceptions`.
  fn apply_identity(
    &self,
    resolution: Resolution,
  ) -> impl Future<Output = Result<IdentityWriteSummary, Self::Error>> + Send + '_;

  fn active_mappings(
    &self,
  ) -> impl Future<Output = Result<Vec<IdentityMapping>, Self::Error>> + Send + '_;

  /// Every mapping row for a source user, active or not, oldest first.
  fn mappings_for(
    &self,
    source_user_id: String,
  ) -> impl Future<Output = Result<Vec<IdentityMapping>, Self::Error>> + Send + '_;

  fn identity_exceptions(
    &self,
  ) -> impl Future<Output = Result<Vec<IdentityException>, Self::Error>> + Send + '_;

  // ── Curated tables ────────────────────────────────────────────────────

  /// Stage rows and merge them into `dim_student` by `internal_id`.
  fn merge_students(
    &self,
    rows: Vec<StudentRow>,
  ) -> impl Future<Output = Result<MergeCounts, Self::Error>> + Send + '_;

  /// Stage rows and merge them into `dim_course` by `course_id`.
  fn merge_courses(
    &self,
    rows: Vec<CourseRow>,
  ) -> impl Future<Output = Result<MergeCounts, Self::Error>> + Send + '_;

  /// Stage rows and merge them into `fact_submission` by `submission_id`.
  fn merge_submissions(
    &self,
    rows: Vec<SubmissionRow>,
  ) -> impl Future<Output = Result<MergeCounts, Self::Error>> + Send + '_;

  /// `source_user_id → student_key` through active mappings.
  fn student_keys(
    &self,
  ) -> impl Future<Output = Result<HashMap<String, i64>, Self::Error>> + Send + '_;

  /// `course_id → course_key`.
  fn course_keys(
    &self,
  ) -> impl Future<Output = Result<HashMap<String, i64>, Self::Error>> + Send + '_;

  fn curated_boundary(
    &self,
  ) -> impl Future<Output = Result<Option<DateTime<Utc>>, Self::Error>> + Send + '_;

  /// Move the boundary to `max(current, boundary)`.
  fn advance_curated_boundary(
    &self,
    boundary: DateTime<Utc>,
  ) -> impl Future<Output = Result<DateTime<Utc>, Self::Error>> + Send + '_;

  // ── Schema ────────────────────────────────────────────────────────────

  /// Every user table, excluding the backend's own internals.
  fn list_tables(
    &self,
  ) -> impl Future<Output = Result<Vec<TableName>, Self::Error>> + Send + '_;

  /// Live column metadata, or `None` when the table does not exist.
  fn describe_table(
    &self,
    table: TableName,
  ) -> impl Future<Output = Result<Option<TableSchema>, Self::Error>> + Send + '_;

  /// Most recent snapshot per table ever snapshotted.
  fn latest_snapshots(
    &self,
  ) -> impl Future<Output = Result<BTreeMap<TableName, SchemaSnapshot>, Self::Error>>
  + Send
  + '_;

  /// Append one generation of snapshots and the changes it produced.
  fn record_schema_generation(
    &self,
    snapshots: Vec<SchemaSnapshot>,
    changes: Vec<SchemaChange>,
    run_id: Option<Uuid>,
  ) -> impl Future<Output = Result<Vec<SchemaChangeEvent>, Self::Error>> + Send + '_;

  /// Newest first.
  fn recent_schema_changes(
    &self,
    limit: usize,
  ) -> impl Future<Output = Result<Vec<SchemaChangeEvent>, Self::Error>> + Send + '_;

  // ── Runs & quality ────────────────────────────────────────────────────

  fn start_run(
    &self,
    job_name: String,
  ) -> impl Future<Output = Result<RunRecord, Self::Error>> + Send + '_;

  /// Move a `running` run to a terminal status. A second terminal update is
  /// rejected.
  fn finish_run(
    &self,
    run_id: Uuid,
    status: RunStatus,
    metrics: Metrics,
    error_detail: Option<String>,
  ) -> impl Future<Output = Result<RunRecord, Self::Error>> + Send + '_;

  fn get_run(
    &self,
    run_id: Uuid,
  ) -> impl Future<Output = Result<Option<RunRecord>, Self::Error>> + Send + '_;

  /// Latest run per job name.
  fn latest_runs(
    &self,
  ) -> impl Future<Output = Result<Vec<RunRecord>, Self::Error>> + Send + '_;

  fn record_quality(
    &self,
    run_id: Uuid,
    check: NewQualityCheck,
  ) -> impl Future<Output = Result<QualityCheckResult, Self::Error>> + Send + '_;

  fn quality_results(
    &self,
    run_id: Uuid,
  ) -> impl Future<Output = Result<Vec<QualityCheckResult>, Self::Error>> + Send + '_;

  /// Latest result per check name.
  fn latest_quality(
    &self,
  ) -> impl Future<Output = Result<Vec<QualityCheckResult>, Self::Error>> + Send + '_;

  /// Evaluate a probe, or `None` when its input tables are absent.
  fn probe(
    &self,
    probe: QualityProbe,
  ) -> impl Future<Output = Result<Option<ProbeOutcome>, Self::Error>> + Send + '_;
}
