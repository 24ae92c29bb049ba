//! The curated build: raw rows past the boundary, staged and merged into the
//! dimension and fact tables.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use sluice_core::{
  TableName,
  curated::{CourseRow, MergeCounts, StudentRow, SubmissionRow, UnresolvedPolicy},
  metrics::{self, Metrics},
  record::{RAW_COLUMNS, RawRecord, compare_source_ids},
  run::NewQualityCheck,
  store::PipelineStore,
};
use uuid::Uuid;

use crate::{Error, Result, recorder::Bounded};

pub const UNRESOLVED_CHECK: &str = "curated.unresolved_foreign_keys";

/// Raw inputs of the build. Students come from identity mappings.
#[derive(Debug, Clone)]
pub struct CuratedSources {
  pub courses:     TableName,
  pub submissions: TableName,
}

/// A raw table left out of this build.
#[derive(Debug, Clone, Serialize)]
pub struct SkippedTable {
  pub table:  TableName,
  pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CuratedSummary {
  pub boundary_before:       Option<DateTime<Utc>>,
  pub boundary_after:        Option<DateTime<Utc>>,
  pub students:              MergeCounts,
  pub courses:               MergeCounts,
  pub submissions:           MergeCounts,
  pub student_fk_unresolved: u64,
  pub course_fk_unresolved:  u64,
  pub fact_rows_excluded:    u64,
  pub skipped:               Vec<SkippedTable>,
}

/// Build the curated tables from raw rows ingested after the boundary.
///
/// `since` overrides the stored boundary. The stored boundary only moves
/// after every merge succeeded and no input table was skipped.
pub async fn run_curated<S: PipelineStore>(
  db: Bounded<'_, S>,
  run_id: Uuid,
  sources: &CuratedSources,
  since: Option<DateTime<Utc>>,
  policy: UnresolvedPolicy,
) -> Result<(CuratedSummary, Metrics)> {
  let stored = db.call(|s| s.curated_boundary()).await?;
  let boundary = since.or(stored);
  tracing::info!(boundary = ?boundary, explicit = since.is_some(), "curated build started");

  let mut skipped = Vec::new();
  let courses_raw = read_window(db, &sources.courses, boundary, &mut skipped).await?;
  let submissions_raw = read_window(db, &sources.submissions, boundary, &mut skipped).await?;

  let high_water = courses_raw
    .iter()
    .chain(&submissions_raw)
    .map(|r| r.ingested_at)
    .max();

  // ── dim_student ───────────────────────────────────────────────────────

  let mappings = db.call(|s| s.active_mappings()).await?;
  let student_rows = mappings.iter().map(StudentRow::from).collect::<Vec<_>>();
  let students = db.call(|s| s.merge_students(student_rows)).await?;

  // ── dim_course ────────────────────────────────────────────────────────

  let course_rows = courses_raw
    .iter()
    .map(|r| CourseRow::from_payload(&r.record_id, &r.payload, r.record_updated_at))
    .collect::<Vec<_>>();
  let courses = db.call(|s| s.merge_courses(course_rows)).await?;

  // ── fact_submission ───────────────────────────────────────────────────

  let student_keys = db.call(|s| s.student_keys()).await?;
  let course_keys = db.call(|s| s.course_keys()).await?;

  let mut fk = FkTally::default();
  let mut fact_rows = Vec::with_capacity(submissions_raw.len());
  for raw in &submissions_raw {
    let mut row = SubmissionRow::from_payload(&raw.record_id, &raw.payload, raw.record_updated_at);
    row.student_key = row.source_user_id.as_ref().and_then(|u| student_keys.get(u)).copied();
    row.course_key = row.course_id.as_ref().and_then(|c| course_keys.get(c)).copied();
    row.student_resolved = row.student_key.is_some();
    row.course_resolved = row.course_key.is_some();

    if fk.observe(&row) && policy == UnresolvedPolicy::Exclude {
      fk.excluded += 1;
      continue;
    }
    fact_rows.push(row);
  }
  let submissions = db.call(|s| s.merge_submissions(fact_rows)).await?;

  let check = fk.check(submissions_raw.len() as u64, policy);
  db.call(|s| s.record_quality(run_id, check)).await?;

  // ── boundary ──────────────────────────────────────────────────────────

  let boundary_after = match high_water {
    Some(ts) if skipped.is_empty() => Some(db.call(|s| s.advance_curated_boundary(ts)).await?),
    _ => stored,
  };

  tracing::info!(
    students = students.changed(),
    courses = courses.changed(),
    submissions = submissions.changed(),
    student_fk_unresolved = fk.student,
    course_fk_unresolved = fk.course,
    skipped = skipped.len(),
    "curated build finished"
  );

  let mut metrics = Metrics::new()
    .with(metrics::ROWS_STAGED, students.staged + courses.staged + submissions.staged)
    .with(metrics::ROWS_INSERTED, students.inserted + courses.inserted + submissions.inserted)
    .with(metrics::ROWS_UPDATED, students.updated + courses.updated + submissions.updated)
    .with(metrics::STUDENT_FK_UNRESOLVED, fk.student)
    .with(metrics::COURSE_FK_UNRESOLVED, fk.course)
    .with(metrics::FACT_ROWS_EXCLUDED, fk.excluded)
    .with(metrics::TABLES_SKIPPED, skipped.len() as u64);
  for (table, counts) in [
    ("dim_student", students),
    ("dim_course", courses),
    ("fact_submission", submissions),
  ] {
    metrics.set(format!("{table}.rows_inserted"), counts.inserted);
    metrics.set(format!("{table}.rows_updated"), counts.updated);
  }
  if let Some(ts) = boundary_after {
    metrics.set("boundary_after", ts.to_rfc3339());
  }

  let summary = CuratedSummary {
    boundary_before: boundary,
    boundary_after,
    students,
    courses,
    submissions,
    student_fk_unresolved: fk.student,
    course_fk_unresolved: fk.course,
    fact_rows_excluded: fk.excluded,
    skipped,
  };
  Ok((summary, metrics))
}

/// Raw rows past `boundary`. An absent table contributes nothing; a table
/// without the raw columns is skipped and noted.
async fn read_window<S: PipelineStore>(
  db: Bounded<'_, S>,
  table: &TableName,
  boundary: Option<DateTime<Utc>>,
  skipped: &mut Vec<SkippedTable>,
) -> Result<Vec<RawRecord>> {
  let name = table.clone();
  let Some(schema) = db.call(|s| s.describe_table(name)).await? else {
    tracing::debug!(%table, "raw table absent");
    return Ok(Vec::new());
  };

  let missing = schema.missing_columns(RAW_COLUMNS);
  if !missing.is_empty() {
    let err = Error::SchemaIncompatible {
      table:   table.clone(),
      missing: missing.into_iter().map(str::to_owned).collect(),
    };
    tracing::warn!(%table, error = %err, "skipping raw table");
    skipped.push(SkippedTable { table: table.clone(), reason: err.to_string() });
    return Ok(Vec::new());
  }

  let name = table.clone();
  db.call(|s| s.raw_window(name, boundary)).await
}

/// Foreign-key resolution counts for one batch of submissions.
#[derive(Debug, Default)]
struct FkTally {
  student:    u64,
  course:     u64,
  excluded:   u64,
  unresolved: Vec<String>,
}

impl FkTally {
  /// Count the row's unresolved keys; `true` when any key is unresolved.
  fn observe(&mut self, row: &SubmissionRow) -> bool {
    if !row.student_resolved {
      self.student += 1;
    }
    if !row.course_resolved {
      self.course += 1;
    }
    let unresolved = !row.student_resolved || !row.course_resolved;
    if unresolved {
      self.unresolved.push(row.submission_id.clone());
    }
    unresolved
  }

  fn check(&self, total: u64, policy: UnresolvedPolicy) -> NewQualityCheck {
    let mut samples = self.unresolved.clone();
    samples.sort_by(|a, b| compare_source_ids(a, b));
    NewQualityCheck::counted(
      UNRESOLVED_CHECK,
      "fact_submission",
      samples.len() as u64,
      Some(total),
      samples,
    )
    .with_details(json!({
      "policy": policy,
      "student_fk_unresolved": self.student,
      "course_fk_unresolved": self.course,
      "excluded": self.excluded,
    }))
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  fn submission(id: &str, student: bool, course: bool) -> SubmissionRow {
    let mut row = SubmissionRow::from_payload(id, &json!({ "user_id": 1, "course_id": 2 }), None);
    row.student_resolved = student;
    row.course_resolved = course;
    row
  }

  #[test]
  fn tally_counts_each_side_once() {
    let mut fk = FkTally::default();
    assert!(!fk.observe(&submission("1", true, true)));
    assert!(fk.observe(&submission("12", false, true)));
    assert!(fk.observe(&submission("3", false, false)));

    assert_eq!((fk.student, fk.course), (2, 1));
    let check = fk.check(3, UnresolvedPolicy::Flag);
    assert_eq!(check.failed_row_count, 2);
    assert_eq!(check.sample_keys.as_slice(), ["3", "12"]);
    assert_eq!(check.details["policy"], "flag");
  }
}
