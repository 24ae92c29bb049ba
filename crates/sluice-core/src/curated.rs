//! Curated (dimension / fact) row shapes and their derivation from raw
//! payloads.
//!
//! Rows are built here without any store access; foreign keys on
//! [`SubmissionRow`] are filled in by the curated builder during staging.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{AsRefStr, Display, EnumString};

use crate::{
  identity::{IdentityMapping, MatchMethod},
  record::{parse_timestamp, scalar_string},
};

/// What to do with a fact row whose foreign key cannot be resolved.
#[derive(
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
  Serialize,
  Deserialize,
  Display,
  EnumString,
  AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum UnresolvedPolicy {
  /// Insert the row with a NULL key and a `*_resolved = false` flag.
  #[default]
  Flag,
  /// Leave the row out of the fact table.
  Exclude,
}

/// Effect of one staging+merge pass on a curated table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeCounts {
  pub staged:    u64,
  pub inserted:  u64,
  pub updated:   u64,
  pub unchanged: u64,
}

impl MergeCounts {
  /// Rows actually written.
  pub fn changed(&self) -> u64 { self.inserted + self.updated }
}

// ─── dim_student ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudentRow {
  pub internal_id:      i64,
  pub source_user_id:   String,
  pub email_normalized: String,
  pub match_method:     MatchMethod,
  pub match_confidence: f64,
}

impl From<&IdentityMapping> for StudentRow {
  fn from(m: &IdentityMapping) -> Self {
    Self {
      internal_id:      m.internal_id,
      source_user_id:   m.source_user_id.clone(),
      email_normalized: m.normalized_match_key.clone(),
      match_method:     m.match_method,
      match_confidence: m.match_confidence,
    }
  }
}

// ─── dim_course ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CourseRow {
  pub course_id:      String,
  pub name:           Option<String>,
  pub course_code:    Option<String>,
  pub workflow_state: Option<String>,
  pub start_at:       Option<DateTime<Utc>>,
  pub end_at:         Option<DateTime<Utc>>,
  pub term_name:      Option<String>,
  pub sis_course_id:  Option<String>,
  pub account_id:     Option<String>,
  pub raw_updated_at: Option<DateTime<Utc>>,
}

impl CourseRow {
  pub fn from_payload(
    course_id: &str,
    payload: &Value,
    raw_updated_at: Option<DateTime<Utc>>,
  ) -> Self {
    Self {
      course_id: course_id.to_owned(),
      name: text(payload, "name"),
      course_code: text(payload, "course_code"),
      workflow_state: text(payload, "workflow_state"),
      start_at: timestamp(payload, "start_at"),
      end_at: timestamp(payload, "end_at"),
      term_name: payload
        .get("term")
        .and_then(|term| text(term, "name")),
      sis_course_id: text(payload, "sis_course_id"),
      account_id: id(payload, "account_id"),
      raw_updated_at,
    }
  }
}

// ─── fact_submission ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionRow {
  pub submission_id:    String,
  pub student_key:      Option<i64>,
  pub course_key:       Option<i64>,
  pub source_user_id:   Option<String>,
  pub course_id:        Option<String>,
  pub assignment_id:    Option<String>,
  pub submitted_at:     Option<DateTime<Utc>>,
  pub graded_at:        Option<DateTime<Utc>>,
  pub score:            Option<f64>,
  pub attempt:          Option<i64>,
  pub late:             Option<bool>,
  pub missing:          Option<bool>,
  pub due_at:           Option<DateTime<Utc>>,
  pub on_time:          Option<bool>,
  pub workflow_state:   Option<String>,
  pub student_resolved: bool,
  pub course_resolved:  bool,
  pub raw_updated_at:   Option<DateTime<Utc>>,
}

impl SubmissionRow {
  /// Parse a submission payload. Foreign keys start unresolved.
  pub fn from_payload(
    submission_id: &str,
    payload: &Value,
    raw_updated_at: Option<DateTime<Utc>>,
  ) -> Self {
    let submitted_at = timestamp(payload, "submitted_at");
    let due_at = timestamp(payload, "due_at");
    let late = payload.get("late").and_then(Value::as_bool);
    let missing = payload.get("missing").and_then(Value::as_bool);

    Self {
      submission_id: submission_id.to_owned(),
      student_key: None,
      course_key: None,
      source_user_id: id(payload, "user_id"),
      course_id: id(payload, "course_id"),
      assignment_id: id(payload, "assignment_id"),
      submitted_at,
      graded_at: timestamp(payload, "graded_at"),
      score: payload.get("score").and_then(Value::as_f64),
      attempt: payload.get("attempt").and_then(Value::as_i64),
      late,
      missing,
      due_at,
      on_time: on_time(submitted_at, due_at, late, missing),
      workflow_state: text(payload, "workflow_state"),
      student_resolved: false,
      course_resolved: false,
      raw_updated_at,
    }
  }
}

/// On time when submitted no later than due; otherwise known-late when the
/// source flags it late or missing; otherwise unknown.
pub fn on_time(
  submitted_at: Option<DateTime<Utc>>,
  due_at: Option<DateTime<Utc>>,
  late: Option<bool>,
  missing: Option<bool>,
) -> Option<bool> {
  match (submitted_at, due_at) {
    (Some(s), Some(d)) => Some(s <= d),
    _ if late == Some(true) || missing == Some(true) => Some(false),
    _ => None,
  }
}

fn text(payload: &Value, key: &str) -> Option<String> {
  payload.get(key).and_then(Value::as_str).map(str::to_owned)
}

fn id(payload: &Value, key: &str) -> Option<String> {
  payload.get(key).and_then(scalar_string)
}

fn timestamp(payload: &Value, key: &str) -> Option<DateTime<Utc>> {
  payload.get(key).and_then(parse_timestamp)
}

#[cfg(test)]
mod tests {
  use chrono::TimeZone;
  use serde_json::json;

  use super::*;

  #[test]
  fn course_pulls_term_name_from_nested_object() {
    let row = CourseRow::from_payload(
      "101",
      &json!({
        "name": "Accounting I",
        "course_code": "ACC-1",
        "term": { "name": "Fall 2024" },
        "account_id": 7,
        "start_at": "2024-09-01T00:00:00Z"
      }),
      None,
    );
    assert_eq!(row.term_name.as_deref(), Some("Fall 2024"));
    assert_eq!(row.account_id.as_deref(), Some("7"));
    assert_eq!(
      row.start_at,
      Some(Utc.with_ymd_and_hms(2024, 9, 1, 0, 0, 0).unwrap())
    );
    assert_eq!(row.end_at, None);
  }

  #[test]
  fn submission_reads_ids_as_strings() {
    let row = SubmissionRow::from_payload(
      "900",
      &json!({ "user_id": 3, "course_id": "101", "score": 9.5, "attempt": 2 }),
      None,
    );
    assert_eq!(row.source_user_id.as_deref(), Some("3"));
    assert_eq!(row.course_id.as_deref(), Some("101"));
    assert_eq!(row.score, Some(9.5));
    assert_eq!(row.attempt, Some(2));
    assert!(!row.student_resolved);
  }

  #[test]
  fn on_time_derivation() {
    let t = |d| Some(Utc.with_ymd_and_hms(2024, 1, d, 0, 0, 0).unwrap());
    assert_eq!(on_time(t(1), t(2), None, None), Some(true));
    assert_eq!(on_time(t(3), t(2), Some(false), None), Some(false));
    assert_eq!(on_time(None, t(2), Some(true), None), Some(false));
    assert_eq!(on_time(None, None, None, Some(true)), Some(false));
    assert_eq!(on_time(t(1), None, Some(false), Some(false)), None);
  }
}
