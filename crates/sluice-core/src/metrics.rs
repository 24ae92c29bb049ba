//! Open metrics map attached to every run.
//!
//! Any key may be recorded, but the well-known keys of each stage must hold
//! numbers; [`Metrics::validate`] enforces that at the store boundary.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

// ─── Well-known keys ─────────────────────────────────────────────────────────

pub const RECORDS_READ: &str = "records_read";
pub const RECORDS_SKIPPED: &str = "records_skipped";
pub const RECORDS_UPSERTED: &str = "records_upserted";
pub const RECORDS_INSERTED: &str = "records_inserted";
pub const RECORDS_UPDATED: &str = "records_updated";
pub const RECORDS_MALFORMED: &str = "records_malformed";
pub const RECORDS_QUARANTINED: &str = "records_quarantined";
pub const RECORDS_MISSING_TIMESTAMP: &str = "records_missing_timestamp";

pub const USERS_READ: &str = "users_read";
pub const MAPPINGS_ACTIVE: &str = "mappings_active";
pub const MAPPINGS_INSERTED: &str = "mappings_inserted";
pub const MAPPINGS_DEACTIVATED: &str = "mappings_deactivated";
pub const EXCEPTIONS_MISSING_KEY: &str = "exceptions_missing_key";
pub const EXCEPTIONS_DUPLICATE_KEY: &str = "exceptions_duplicate_key";

pub const ROWS_STAGED: &str = "rows_staged";
pub const ROWS_INSERTED: &str = "rows_inserted";
pub const ROWS_UPDATED: &str = "rows_updated";
pub const STUDENT_FK_UNRESOLVED: &str = "student_fk_unresolved";
pub const COURSE_FK_UNRESOLVED: &str = "course_fk_unresolved";
pub const FACT_ROWS_EXCLUDED: &str = "fact_rows_excluded";
pub const TABLES_SKIPPED: &str = "tables_skipped";

pub const TABLES_SNAPSHOTTED: &str = "tables_snapshotted";
pub const CHANGES_DETECTED: &str = "changes_detected";

pub const CHECKS_RUN: &str = "checks_run";
pub const CHECKS_WARN: &str = "checks_warn";
pub const CHECKS_ERROR: &str = "checks_error";

const WELL_KNOWN: &[&str] = &[
  RECORDS_READ,
  RECORDS_SKIPPED,
  RECORDS_UPSERTED,
  RECORDS_INSERTED,
  RECORDS_UPDATED,
  RECORDS_MALFORMED,
  RECORDS_QUARANTINED,
  RECORDS_MISSING_TIMESTAMP,
  USERS_READ,
  MAPPINGS_ACTIVE,
  MAPPINGS_INSERTED,
  MAPPINGS_DEACTIVATED,
  EXCEPTIONS_MISSING_KEY,
  EXCEPTIONS_DUPLICATE_KEY,
  ROWS_STAGED,
  ROWS_INSERTED,
  ROWS_UPDATED,
  STUDENT_FK_UNRESOLVED,
  COURSE_FK_UNRESOLVED,
  FACT_ROWS_EXCLUDED,
  TABLES_SKIPPED,
  TABLES_SNAPSHOTTED,
  CHANGES_DETECTED,
  CHECKS_RUN,
  CHECKS_WARN,
  CHECKS_ERROR,
];

// ─── Values ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
  Integer(i64),
  Number(f64),
  Text(String),
}

impl MetricValue {
  pub fn as_i64(&self) -> Option<i64> {
    match self {
      Self::Integer(n) => Some(*n),
      _ => None,
    }
  }

  pub fn is_numeric(&self) -> bool { !matches!(self, Self::Text(_)) }
}

impl From<u64> for MetricValue {
  fn from(value: u64) -> Self {
    Self::Integer(i64::try_from(value).unwrap_or(i64::MAX))
  }
}

impl From<i64> for MetricValue {
  fn from(value: i64) -> Self { Self::Integer(value) }
}

impl From<f64> for MetricValue {
  fn from(value: f64) -> Self { Self::Number(value) }
}

impl From<String> for MetricValue {
  fn from(value: String) -> Self { Self::Text(value) }
}

impl From<&str> for MetricValue {
  fn from(value: &str) -> Self { Self::Text(value.to_owned()) }
}

// ─── Map ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metrics(BTreeMap<String, MetricValue>);

impl Metrics {
  pub fn new() -> Self { Self::default() }

  pub fn set(&mut self, key: impl Into<String>, value: impl Into<MetricValue>) {
    self.0.insert(key.into(), value.into());
  }

  /// Builder-style [`Metrics::set`].
  pub fn with(mut self, key: impl Into<String>, value: impl Into<MetricValue>) -> Self {
    self.set(key, value);
    self
  }

  pub fn get(&self, key: &str) -> Option<&MetricValue> { self.0.get(key) }

  /// Integer value of `key`, if present and integral.
  pub fn count(&self, key: &str) -> Option<i64> {
    self.get(key).and_then(MetricValue::as_i64)
  }

  pub fn extend(&mut self, other: Metrics) { self.0.extend(other.0); }

  pub fn iter(&self) -> impl Iterator<Item = (&String, &MetricValue)> {
    self.0.iter()
  }

  pub fn is_empty(&self) -> bool { self.0.is_empty() }

  /// Reject well-known keys that carry text. Unknown keys pass through.
  pub fn validate(&self) -> Result<()> {
    match self
      .0
      .iter()
      .find(|(k, v)| WELL_KNOWN.contains(&k.as_str()) && !v.is_numeric())
    {
      Some((key, _)) => Err(Error::NonNumericMetric(key.clone())),
      None => Ok(()),
    }
  }
}
