//! Data-quality probes evaluated by the store on behalf of the quality job.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
  TableName,
  run::{SampleKeys, Severity},
};

/// Share of users without a match key tolerated before the check warns.
pub const MISSING_KEY_WARN_RATE: f64 = 0.05;

/// A single measurable property of the persisted data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "probe", rename_all = "snake_case")]
pub enum QualityProbe {
  /// Users without any email-shaped key, out of all users considered by the
  /// last identity resolution.
  IdentityMissingKey,
  /// Users that lost a duplicate-key contest, out of users with a key.
  IdentityDuplicateKey,
  /// Fact rows whose student key is NULL or dangling.
  StudentCoverage,
  /// Fact rows whose course key is NULL or dangling.
  CourseCoverage,
  /// Raw submissions missing from the fact table plus fact rows with no raw
  /// counterpart.
  RawFactReconcile { raw_table: TableName },
  /// Raw rows sharing a `(source_name, record_id)` key with another row.
  /// Only a raw table created outside the pipeline can hold any.
  RawKeyUnique { raw_table: TableName },
}

impl QualityProbe {
  pub fn check_name(&self) -> &'static str {
    match self {
      Self::IdentityMissingKey => "identity.missing_key_rate",
      Self::IdentityDuplicateKey => "identity.duplicate_key_rate",
      Self::StudentCoverage => "fact_submission.student_fk_coverage",
      Self::CourseCoverage => "fact_submission.course_fk_coverage",
      Self::RawFactReconcile { .. } => "reconcile.raw_submissions_vs_fact_submission",
      Self::RawKeyUnique { .. } => "raw.key_unique.duplicate_rows",
    }
  }

  pub fn severity_rule(&self) -> SeverityRule {
    match self {
      Self::IdentityMissingKey => SeverityRule::WarnAbove(MISSING_KEY_WARN_RATE),
      Self::RawKeyUnique { .. } => SeverityRule::ErrorOnAny,
      Self::IdentityDuplicateKey
      | Self::StudentCoverage
      | Self::CourseCoverage
      | Self::RawFactReconcile { .. } => SeverityRule::WarnAbove(0.0),
    }
  }

  /// The table the result is filed under.
  pub fn table_name(&self) -> &str {
    match self {
      Self::IdentityMissingKey | Self::IdentityDuplicateKey => "identity_map",
      Self::StudentCoverage | Self::CourseCoverage => "fact_submission",
      Self::RawFactReconcile { raw_table } | Self::RawKeyUnique { raw_table } => {
        raw_table.as_str()
      }
    }
  }
}

/// What a probe measured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeOutcome {
  pub total_rows:  u64,
  pub failed_rows: u64,
  /// Offending natural keys, in the store's stable key order.
  pub sample_keys: SampleKeys,
  pub details:     Value,
}

impl ProbeOutcome {
  /// `failed / total`, or `None` when nothing was measured.
  pub fn failure_rate(&self) -> Option<f64> {
    (self.total_rows > 0).then(|| self.failed_rows as f64 / self.total_rows as f64)
  }
}

/// How a probe outcome maps to a severity. A clean outcome is always `info`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SeverityRule {
  /// `warn` once the failure rate exceeds the threshold.
  WarnAbove(f64),
  /// `error` as soon as one row fails.
  ErrorOnAny,
}

impl SeverityRule {
  pub fn grade(self, outcome: &ProbeOutcome) -> Severity {
    if outcome.failed_rows == 0 {
      return Severity::Info;
    }
    match self {
      Self::ErrorOnAny => Severity::Error,
      // Failures against an empty total cannot be rated.
      Self::WarnAbove(threshold) => match outcome.failure_rate() {
        Some(rate) if rate <= threshold => Severity::Info,
        _ => Severity::Warn,
      },
    }
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  #[test]
  fn rate_is_undefined_for_empty_input() {
    let empty = ProbeOutcome {
      total_rows:  0,
      failed_rows: 0,
      sample_keys: SampleKeys::default(),
      details:     json!({}),
    };
    assert_eq!(empty.failure_rate(), None);

    let half = ProbeOutcome { total_rows: 4, failed_rows: 2, ..empty };
    assert_eq!(half.failure_rate(), Some(0.5));
  }

  #[test]
  fn severity_rules_grade_in_tiers() {
    let outcome = |failed| ProbeOutcome {
      total_rows:  100,
      failed_rows: failed,
      sample_keys: SampleKeys::default(),
      details:     json!({}),
    };
    let missing = QualityProbe::IdentityMissingKey.severity_rule();
    assert_eq!(missing.grade(&outcome(0)), Severity::Info);
    assert_eq!(missing.grade(&outcome(5)), Severity::Info);
    assert_eq!(missing.grade(&outcome(6)), Severity::Warn);

    let coverage = QualityProbe::StudentCoverage.severity_rule();
    assert_eq!(coverage.grade(&outcome(1)), Severity::Warn);

    let raw_table = TableName::new("raw_users").unwrap();
    let unique = QualityProbe::RawKeyUnique { raw_table }.severity_rule();
    assert_eq!(unique.grade(&outcome(0)), Severity::Info);
    assert_eq!(unique.grade(&outcome(1)), Severity::Error);

    let unrated = ProbeOutcome { total_rows: 0, ..outcome(2) };
    assert_eq!(coverage.grade(&unrated), Severity::Warn);
  }

  #[test]
  fn reconcile_files_under_its_raw_table() {
    let probe = QualityProbe::RawFactReconcile {
      raw_table: TableName::new("raw_submissions").unwrap(),
    };
    assert_eq!(probe.table_name(), "raw_submissions");
    assert_eq!(probe.check_name(), "reconcile.raw_submissions_vs_fact_submission");
  }
}
