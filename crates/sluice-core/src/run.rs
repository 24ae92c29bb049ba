//! Run records and data-quality check results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

use crate::metrics::Metrics;

/// Upper bound on stored sample keys per check result.
pub const MAX_SAMPLE_KEYS: usize = 10;

// ─── Runs ────────────────────────────────────────────────────────────────────

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RunStatus {
  Running,
  Success,
  Failed,
}

impl RunStatus {
  pub fn is_terminal(&self) -> bool { !matches!(self, Self::Running) }
}

/// One execution of a pipeline job. Created `running`, then updated to a
/// terminal status exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
  pub run_id:       Uuid,
  pub job_name:     String,
  pub status:       RunStatus,
  pub start_time:   DateTime<Utc>,
  pub end_time:     Option<DateTime<Utc>>,
  pub duration_ms:  Option<i64>,
  pub metrics:      Metrics,
  pub error_detail: Option<String>,
}

// ─── Quality ─────────────────────────────────────────────────────────────────

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
pub enum Severity {
  Info,
  Warn,
  Error,
}

/// Sample keys bounded to [`MAX_SAMPLE_KEYS`], keeping the first entries in
/// the order given.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct SampleKeys(Vec<String>);

impl SampleKeys {
  pub fn as_slice(&self) -> &[String] { &self.0 }

  pub fn len(&self) -> usize { self.0.len() }

  pub fn is_empty(&self) -> bool { self.0.is_empty() }
}

impl<S: Into<String>> FromIterator<S> for SampleKeys {
  fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
    Self(iter.into_iter().take(MAX_SAMPLE_KEYS).map(Into::into).collect())
  }
}

impl From<Vec<String>> for SampleKeys {
  fn from(value: Vec<String>) -> Self { value.into_iter().collect() }
}

impl From<SampleKeys> for Vec<String> {
  fn from(value: SampleKeys) -> Self { value.0 }
}

/// Input to [`crate::store::PipelineStore::record_quality`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewQualityCheck {
  pub check_name:       String,
  pub table_name:       String,
  pub severity:         Severity,
  pub failed_row_count: u64,
  pub total_row_count:  Option<u64>,
  pub sample_keys:      SampleKeys,
  pub details:          Value,
}

impl NewQualityCheck {
  /// `warn` when anything failed, `info` otherwise.
  pub fn counted(
    check_name: impl Into<String>,
    table_name: impl Into<String>,
    failed_row_count: u64,
    total_row_count: Option<u64>,
    sample_keys: impl IntoIterator<Item = String>,
  ) -> Self {
    Self {
      check_name: check_name.into(),
      table_name: table_name.into(),
      severity: if failed_row_count > 0 { Severity::Warn } else { Severity::Info },
      failed_row_count,
      total_row_count,
      sample_keys: sample_keys.into_iter().collect(),
      details: Value::Null,
    }
  }

  pub fn with_severity(mut self, severity: Severity) -> Self {
    self.severity = severity;
    self
  }

  pub fn with_details(mut self, details: Value) -> Self {
    self.details = details;
    self
  }
}

/// A stored check result. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityCheckResult {
  pub result_id:        i64,
  pub run_id:           Uuid,
  pub check_name:       String,
  pub table_name:       String,
  pub severity:         Severity,
  pub failed_row_count: u64,
  pub total_row_count:  Option<u64>,
  pub sample_keys:      SampleKeys,
  pub details:          Value,
  pub created_at:       DateTime<Utc>,
}
