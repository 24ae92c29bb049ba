//! Staging + merge into the curated tables.
//!
//! Each merge loads rows into a connection-private TEMP table, then updates
//! target rows whose non-key attributes differ (null-safe `IS NOT`) and
//! inserts rows whose natural key is absent. Everything runs inside the
//! caller's write transaction, so a failed merge leaves the target untouched.

use rusqlite::{Connection, params_from_iter, types::Value};
use sluice_core::curated::{CourseRow, MergeCounts, StudentRow, SubmissionRow};

use crate::encode::{encode_opt_dt, to_count};

/// A curated table addressed by natural key.
pub struct MergeTarget {
  pub table:   &'static str,
  pub key:     &'static str,
  /// Non-key attributes compared and copied by the merge.
  pub columns: &'static [&'static str],
}

pub const DIM_STUDENT: MergeTarget = MergeTarget {
  table:   "dim_student",
  key:     "internal_id",
  columns: &["source_user_id", "email_normalized", "match_method", "match_confidence"],
};

pub const DIM_COURSE: MergeTarget = MergeTarget {
  table:   "dim_course",
  key:     "course_id",
  columns: &[
    "name",
    "course_code",
    "workflow_state",
    "start_at",
    "end_at",
    "term_name",
    "sis_course_id",
    "account_id",
    "raw_updated_at",
  ],
};

pub const FACT_SUBMISSION: MergeTarget = MergeTarget {
  table:   "fact_submission",
  key:     "submission_id",
  columns: &[
    "student_key",
    "course_key",
    "source_user_id",
    "course_id",
    "assignment_id",
    "submitted_at",
    "graded_at",
    "score",
    "attempt",
    "late",
    "missing",
    "due_at",
    "on_time",
    "workflow_state",
    "student_resolved",
    "course_resolved",
    "raw_updated_at",
  ],
};

impl MergeTarget {
  fn stage(&self) -> String { format!("stg_{}", self.table) }

  fn stage_ddl(&self) -> String {
    format!(
      "DROP TABLE IF EXISTS temp.{stage};
       CREATE TEMP TABLE {stage} ({key} PRIMARY KEY, {columns});",
      stage = self.stage(),
      key = self.key,
      columns = self.columns.join(", "),
    )
  }

  fn stage_insert(&self) -> String {
    let placeholders = (1..=self.columns.len() + 1)
      .map(|i| format!("?{i}"))
      .collect::<Vec<_>>()
      .join(", ");
    format!(
      "INSERT OR REPLACE INTO temp.{stage} ({key}, {columns}) VALUES ({placeholders})",
      stage = self.stage(),
      key = self.key,
      columns = self.columns.join(", "),
    )
  }

  fn update_changed(&self) -> String {
    let t = self.table;
    let assignments = self
      .columns
      .iter()
      .map(|c| format!("{c} = s.{c}"))
      .collect::<Vec<_>>()
      .join(", ");
    let differs = self
      .columns
      .iter()
      .map(|c| format!("{t}.{c} IS NOT s.{c}"))
      .collect::<Vec<_>>()
      .join(" OR ");
    format!(
      "UPDATE {t} SET {assignments}, updated_at = ?1
       FROM temp.{stage} AS s
       WHERE {t}.{key} = s.{key} AND ({differs})",
      stage = self.stage(),
      key = self.key,
    )
  }

  fn insert_missing(&self) -> String {
    let t = self.table;
    let columns = self.columns.join(", ");
    let selected = self
      .columns
      .iter()
      .map(|c| format!("s.{c}"))
      .collect::<Vec<_>>()
      .join(", ");
    format!(
      "INSERT INTO {t} ({key}, {columns}, created_at, updated_at)
       SELECT s.{key}, {selected}, ?1, ?1 FROM temp.{stage} AS s
       WHERE NOT EXISTS (SELECT 1 FROM {t} WHERE {t}.{key} = s.{key})
       ORDER BY s.rowid",
      stage = self.stage(),
      key = self.key,
    )
  }
}

/// Stage `rows` (key first, then [`MergeTarget::columns`] in order) and merge
/// them into `target`. Rows repeating a key within one batch collapse to the
/// last one.
pub fn merge(
  tx: &Connection,
  target: &MergeTarget,
  rows: Vec<Vec<Value>>,
  now: &str,
) -> rusqlite::Result<MergeCounts> {
  tx.execute_batch(&target.stage_ddl())?;

  {
    let mut stmt = tx.prepare(&target.stage_insert())?;
    for row in &rows {
      stmt.execute(params_from_iter(row.iter()))?;
    }
  }

  let staged: i64 = tx.query_row(
    &format!("SELECT COUNT(*) FROM temp.{}", target.stage()),
    [],
    |r| r.get(0),
  )?;
  let updated = tx.execute(&target.update_changed(), [now])?;
  let inserted = tx.execute(&target.insert_missing(), [now])?;
  tx.execute_batch(&format!("DROP TABLE temp.{};", target.stage()))?;

  let staged = to_count(staged);
  let inserted = inserted as u64;
  let updated = updated as u64;
  Ok(MergeCounts {
    staged,
    inserted,
    updated,
    unchanged: staged.saturating_sub(inserted + updated),
  })
}

// ─── Row encoding ────────────────────────────────────────────────────────────

pub fn student_values(row: StudentRow) -> Vec<Value> {
  vec![
    row.internal_id.into(),
    row.source_user_id.into(),
    row.email_normalized.into(),
    row.match_method.as_ref().to_owned().into(),
    row.match_confidence.into(),
  ]
}

pub fn course_values(row: CourseRow) -> Vec<Value> {
  vec![
    row.course_id.into(),
    row.name.into(),
    row.course_code.into(),
    row.workflow_state.into(),
    encode_opt_dt(row.start_at).into(),
    encode_opt_dt(row.end_at).into(),
    row.term_name.into(),
    row.sis_course_id.into(),
    row.account_id.into(),
    encode_opt_dt(row.raw_updated_at).into(),
  ]
}

pub fn submission_values(row: SubmissionRow) -> Vec<Value> {
  vec![
    row.submission_id.into(),
    row.student_key.into(),
    row.course_key.into(),
    row.source_user_id.into(),
    row.course_id.into(),
    row.assignment_id.into(),
    encode_opt_dt(row.submitted_at).into(),
    encode_opt_dt(row.graded_at).into(),
    row.score.into(),
    row.attempt.into(),
    row.late.into(),
    row.missing.into(),
    encode_opt_dt(row.due_at).into(),
    row.on_time.into(),
    row.workflow_state.into(),
    row.student_resolved.into(),
    row.course_resolved.into(),
    encode_opt_dt(row.raw_updated_at).into(),
  ]
}
