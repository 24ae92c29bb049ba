//! Encoding and decoding helpers between domain types and the plain-text
//! representations stored in SQLite columns.
//!
//! Timestamps are stored as RFC 3339 UTC strings with a fixed microsecond
//! precision, so lexicographic order in SQL matches chronological order.
//! Structured fields are compact JSON. UUIDs are hyphenated lowercase.

use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use sluice_core::{
  TableName,
  identity::{ExceptionReason, IdentityException, IdentityMapping},
  metrics::Metrics,
  record::{QuarantinedRecord, RawRecord},
  run::{QualityCheckResult, RunRecord},
  schema::{ColumnDescriptor, SchemaChangeEvent, SchemaSnapshot},
  watermark::Watermark,
};
use uuid::Uuid;

use crate::{Error, Result};

// ─── Scalars ─────────────────────────────────────────────────────────────────

pub fn encode_uuid(id: Uuid) -> String { id.hyphenated().to_string() }

pub fn decode_uuid(s: &str) -> Result<Uuid> { Ok(Uuid::parse_str(s)?) }

pub fn encode_dt(dt: DateTime<Utc>) -> String {
  dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn encode_opt_dt(dt: Option<DateTime<Utc>>) -> Option<String> {
  dt.map(encode_dt)
}

pub fn decode_dt(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| Error::DateParse(format!("{s:?}: {e}")))
}

pub fn decode_opt_dt(s: Option<&str>) -> Result<Option<DateTime<Utc>>> {
  s.map(decode_dt).transpose()
}

/// Parse a strum-encoded enum column.
pub fn decode_enum<T: FromStr>(column: &'static str, s: &str) -> Result<T> {
  s.parse().map_err(|_| Error::Decode { column, value: s.to_owned() })
}

pub fn decode_table(s: &str) -> Result<TableName> { Ok(TableName::new(s)?) }

/// Counts are stored as SQLite integers.
pub fn to_count(n: i64) -> u64 { u64::try_from(n).unwrap_or(0) }

pub fn from_count(n: u64) -> i64 { i64::try_from(n).unwrap_or(i64::MAX) }

// ─── Row types ───────────────────────────────────────────────────────────────

/// Raw strings read directly from a raw-table row.
pub struct RawRecordRow {
  pub source_name:       String,
  pub record_id:         String,
  pub payload:           String,
  pub record_updated_at: Option<String>,
  pub ingested_at:       String,
}

impl RawRecordRow {
  pub fn into_record(self) -> Result<RawRecord> {
    Ok(RawRecord {
      source_name:       self.source_name,
      record_id:         self.record_id,
      payload:           serde_json::from_str(&self.payload)?,
      record_updated_at: decode_opt_dt(self.record_updated_at.as_deref())?,
      ingested_at:       decode_dt(&self.ingested_at)?,
    })
  }
}

pub struct RawQuarantined {
  pub source_name:    String,
  pub record_id:      String,
  pub payload:        String,
  pub reason:         String,
  pub quarantined_at: String,
}

impl RawQuarantined {
  pub fn into_record(self) -> Result<QuarantinedRecord> {
    Ok(QuarantinedRecord {
      source_name:    self.source_name,
      record_id:      self.record_id,
      payload:        serde_json::from_str(&self.payload)?,
      reason:         self.reason,
      quarantined_at: decode_dt(&self.quarantined_at)?,
    })
  }
}

pub struct RawWatermark {
  pub source_name:     String,
  pub last_updated_at: Option<String>,
  pub updated_at:      String,
}

impl RawWatermark {
  pub fn into_watermark(self) -> Result<Watermark> {
    Ok(Watermark {
      source_name:     self.source_name,
      last_updated_at: decode_opt_dt(self.last_updated_at.as_deref())?,
      updated_at:      decode_dt(&self.updated_at)?,
    })
  }
}

pub struct RawMapping {
  pub mapping_id:           i64,
  pub internal_id:          i64,
  pub source_user_id:       String,
  pub normalized_match_key: String,
  pub match_method:         String,
  pub match_confidence:     f64,
  pub active:               bool,
  pub updated_at:           String,
}

impl RawMapping {
  pub const COLUMNS: &'static str = "mapping_id, internal_id, source_user_id, normalized_match_key,
     match_method, match_confidence, active, updated_at";

  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      mapping_id:           row.get(0)?,
      internal_id:          row.get(1)?,
      source_user_id:       row.get(2)?,
      normalized_match_key: row.get(3)?,
      match_method:         row.get(4)?,
      match_confidence:     row.get(5)?,
      active:               row.get(6)?,
      updated_at:           row.get(7)?,
    })
  }

  pub fn into_mapping(self) -> Result<IdentityMapping> {
    Ok(IdentityMapping {
      mapping_id:           self.mapping_id,
      internal_id:          self.internal_id,
      source_user_id:       self.source_user_id,
      normalized_match_key: self.normalized_match_key,
      match_method:         decode_enum("match_method", &self.match_method)?,
      match_confidence:     self.match_confidence,
      active:               self.active,
      updated_at:           decode_dt(&self.updated_at)?,
    })
  }
}

pub struct RawException {
  pub source_user_id:         String,
  pub reason:                 String,
  pub normalized_match_key:   Option<String>,
  pub representative_user_id: Option<String>,
}

impl RawException {
  pub fn into_exception(self) -> Result<IdentityException> {
    Ok(IdentityException {
      source_user_id:         self.source_user_id,
      reason:                 decode_enum::<ExceptionReason>("reason", &self.reason)?,
      normalized_match_key:   self.normalized_match_key,
      representative_user_id: self.representative_user_id,
    })
  }
}

pub struct RawSnapshot {
  pub table_name:  String,
  pub present:     bool,
  pub columns:     String,
  pub fingerprint: String,
  pub captured_at: String,
}

impl RawSnapshot {
  pub fn into_snapshot(self) -> Result<SchemaSnapshot> {
    let columns: Vec<ColumnDescriptor> = serde_json::from_str(&self.columns)?;
    Ok(SchemaSnapshot {
      table_name: decode_table(&self.table_name)?,
      present: self.present,
      columns,
      fingerprint: self.fingerprint,
      captured_at: decode_dt(&self.captured_at)?,
    })
  }
}

pub struct RawChange {
  pub change_id:   i64,
  pub table_name:  String,
  pub change_kind: String,
  pub detail:      String,
  pub detected_at: String,
  pub run_id:      Option<String>,
}

impl RawChange {
  pub const COLUMNS: &'static str = "change_id, table_name, change_kind, detail, detected_at, run_id";

  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      change_id:   row.get(0)?,
      table_name:  row.get(1)?,
      change_kind: row.get(2)?,
      detail:      row.get(3)?,
      detected_at: row.get(4)?,
      run_id:      row.get(5)?,
    })
  }

  pub fn into_event(self) -> Result<SchemaChangeEvent> {
    Ok(SchemaChangeEvent {
      change_id:   self.change_id,
      table_name:  decode_table(&self.table_name)?,
      change_kind: decode_enum("change_kind", &self.change_kind)?,
      detail:      serde_json::from_str(&self.detail)?,
      detected_at: decode_dt(&self.detected_at)?,
      run_id:      self.run_id.as_deref().map(decode_uuid).transpose()?,
    })
  }
}

pub struct RawRun {
  pub run_id:       String,
  pub job_name:     String,
  pub status:       String,
  pub start_time:   String,
  pub end_time:     Option<String>,
  pub duration_ms:  Option<i64>,
  pub metrics:      String,
  pub error_detail: Option<String>,
}

impl RawRun {
  pub const COLUMNS: &'static str =
    "run_id, job_name, status, start_time, end_time, duration_ms, metrics, error_detail";

  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      run_id:       row.get(0)?,
      job_name:     row.get(1)?,
      status:       row.get(2)?,
      start_time:   row.get(3)?,
      end_time:     row.get(4)?,
      duration_ms:  row.get(5)?,
      metrics:      row.get(6)?,
      error_detail: row.get(7)?,
    })
  }

  pub fn into_run(self) -> Result<RunRecord> {
    let metrics: Metrics = serde_json::from_str(&self.metrics)?;
    Ok(RunRecord {
      run_id: decode_uuid(&self.run_id)?,
      job_name: self.job_name,
      status: decode_enum("status", &self.status)?,
      start_time: decode_dt(&self.start_time)?,
      end_time: decode_opt_dt(self.end_time.as_deref())?,
      duration_ms: self.duration_ms,
      metrics,
      error_detail: self.error_detail,
    })
  }
}

pub struct RawQuality {
  pub result_id:        i64,
  pub run_id:           String,
  pub check_name:       String,
  pub table_name:       String,
  pub severity:         String,
  pub failed_row_count: i64,
  pub total_row_count:  Option<i64>,
  pub sample_keys:      String,
  pub details:          String,
  pub created_at:       String,
}

impl RawQuality {
  pub const COLUMNS: &'static str = "result_id, run_id, check_name, table_name, severity,
     failed_row_count, total_row_count, sample_keys, details, created_at";

  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      result_id:        row.get(0)?,
      run_id:           row.get(1)?,
      check_name:       row.get(2)?,
      table_name:       row.get(3)?,
      severity:         row.get(4)?,
      failed_row_count: row.get(5)?,
      total_row_count:  row.get(6)?,
      sample_keys:      row.get(7)?,
      details:          row.get(8)?,
      created_at:       row.get(9)?,
    })
  }

  pub fn into_result(self) -> Result<QualityCheckResult> {
    let sample_keys: Vec<String> = serde_json::from_str(&self.sample_keys)?;
    Ok(QualityCheckResult {
      result_id:        self.result_id,
      run_id:           decode_uuid(&self.run_id)?,
      check_name:       self.check_name,
      table_name:       self.table_name,
      severity:         decode_enum("severity", &self.severity)?,
      failed_row_count: to_count(self.failed_row_count),
      total_row_count:  self.total_row_count.map(to_count),
      sample_keys:      sample_keys.into(),
      details:          serde_json::from_str(&self.details)?,
      created_at:       decode_dt(&self.created_at)?,
    })
  }
}

#[cfg(test)]
mod tests {
  use chrono::TimeZone;

  use super::*;

  #[test]
  fn timestamps_sort_lexicographically() {
    let early = Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap();
    let late = early + chrono::Duration::microseconds(1);
    assert!(encode_dt(early) < encode_dt(late));
    assert_eq!(encode_dt(early), "2024-01-01T09:00:00.000000Z");
    assert_eq!(decode_dt(&encode_dt(late)).unwrap(), late);
  }

  #[test]
  fn unknown_enum_values_are_decode_errors() {
    let err = decode_enum::<sluice_core::run::Severity>("severity", "fatal").unwrap_err();
    assert!(matches!(err, Error::Decode { column: "severity", .. }));
  }
}
