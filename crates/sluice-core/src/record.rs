//! Raw records and the helpers that pull identifiers and timestamps out of
//! semi-structured payloads.

use std::cmp::Ordering;

use chrono::{DateTime, NaiveDate, NaiveDateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─── Records ─────────────────────────────────────────────────────────────────

/// Columns every raw table must carry for downstream builds to read it.
pub const RAW_COLUMNS: &[&str] = &[
  "source_name",
  "record_id",
  "payload",
  "record_updated_at",
  "ingested_at",
];

/// A record as it lives in a raw table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
  pub source_name:       String,
  pub record_id:         String,
  pub payload:           Value,
  pub record_updated_at: Option<DateTime<Utc>>,
  /// Store-assigned; refreshed on every upsert.
  pub ingested_at:       DateTime<Utc>,
}

/// Input to [`crate::store::PipelineStore::upsert_raw`].
/// `ingested_at` is always set by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRawRecord {
  pub source_name:       String,
  pub record_id:         String,
  pub payload:           Value,
  pub record_updated_at: Option<DateTime<Utc>>,
}

/// A record diverted from its raw table, kept for inspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuarantinedRecord {
  pub source_name:    String,
  pub record_id:      String,
  pub payload:        Value,
  pub reason:         String,
  pub quarantined_at: DateTime<Utc>,
}

/// Whether an upsert created a row or replaced an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
  Inserted,
  Updated,
}

// ─── Payload access ──────────────────────────────────────────────────────────

/// Follow a dotted path (`"data.updated_at"`) through nested objects.
pub fn extract_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
  path
    .split('.')
    .try_fold(value, |cur, part| cur.as_object()?.get(part))
}

/// Render a scalar identifier as a string. Strings are trimmed; integers and
/// other numbers use their JSON rendering. Nulls, empty strings and
/// structured values yield `None`.
pub fn scalar_string(value: &Value) -> Option<String> {
  match value {
    Value::String(s) => {
      let s = s.trim();
      (!s.is_empty()).then(|| s.to_owned())
    }
    Value::Number(n) => Some(n.to_string()),
    Value::Bool(b) => Some(b.to_string()),
    _ => None,
  }
}

/// Parse a timestamp value, truncated to microseconds.
///
/// Accepts RFC 3339 (`Z` or offset), offset timestamps without seconds, naive
/// date-times (treated as UTC) and bare dates (midnight UTC). Anything else,
/// including non-string values, yields `None`.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
  value.as_str().and_then(parse_timestamp_str)
}

pub fn parse_timestamp_str(raw: &str) -> Option<DateTime<Utc>> {
  let s = raw.trim();
  if s.is_empty() {
    return None;
  }

  let parsed = DateTime::parse_from_rfc3339(s)
    .or_else(|_| DateTime::parse_from_str(s, "%Y-%m-%dT%H:%M%:z"))
    .map(|dt| dt.with_timezone(&Utc))
    .ok()
    .or_else(|| {
      ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| naive.and_utc())
    })
    .or_else(|| {
      NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
    })?;

  Some(parsed.trunc_subsecs(6))
}

/// Ordering for source identifiers: numeric when both sides are integers,
/// lexicographic otherwise, with numbers sorting before text.
pub fn compare_source_ids(a: &str, b: &str) -> Ordering {
  match (a.parse::<i128>(), b.parse::<i128>()) {
    (Ok(x), Ok(y)) => x.cmp(&y).then_with(|| a.cmp(b)),
    (Ok(_), Err(_)) => Ordering::Less,
    (Err(_), Ok(_)) => Ordering::Greater,
    (Err(_), Err(_)) => a.cmp(b),
  }
}

#[cfg(test)]
mod tests {
  use chrono::TimeZone;
  use serde_json::json;

  use super::*;

  #[test]
  fn extracts_nested_paths() {
    let v = json!({ "data": { "updated_at": "2024-01-01T00:00:00Z" }, "id": 4 });
    assert_eq!(
      extract_path(&v, "data.updated_at"),
      Some(&json!("2024-01-01T00:00:00Z"))
    );
    assert_eq!(extract_path(&v, "id"), Some(&json!(4)));
    assert_eq!(extract_path(&v, "data.missing"), None);
    assert_eq!(extract_path(&v, "id.deeper"), None);
  }

  #[test]
  fn parses_common_iso_shapes() {
    let expected = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap();
    for s in [
      "2024-03-01T12:30:00Z",
      "2024-03-01T14:30:00+02:00",
      "2024-03-01T12:30:00",
      "2024-03-01 12:30:00",
      "2024-03-01T12:30+00:00",
    ] {
      assert_eq!(parse_timestamp_str(s), Some(expected), "{s}");
    }
    assert_eq!(
      parse_timestamp_str("2024-03-01"),
      Some(Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap())
    );
  }

  #[test]
  fn unparseable_or_non_string_is_none() {
    assert_eq!(parse_timestamp(&json!("yesterday")), None);
    assert_eq!(parse_timestamp(&json!("   ")), None);
    assert_eq!(parse_timestamp(&json!(1_700_000_000)), None);
    assert_eq!(parse_timestamp(&Value::Null), None);
  }

  #[test]
  fn truncates_to_microseconds() {
    let ts = parse_timestamp_str("2024-03-01T12:30:00.123456789Z").unwrap();
    assert_eq!(ts.timestamp_subsec_nanos(), 123_456_000);
  }

  #[test]
  fn scalar_ids() {
    assert_eq!(scalar_string(&json!(42)), Some("42".into()));
    assert_eq!(scalar_string(&json!(" u-7 ")), Some("u-7".into()));
    assert_eq!(scalar_string(&json!("")), None);
    assert_eq!(scalar_string(&json!({ "id": 1 })), None);
  }

  #[test]
  fn source_id_ordering_is_numeric_aware() {
    let mut ids = vec!["10", "9", "abc", "2", "Z"];
    ids.sort_by(|a, b| compare_source_ids(a, b));
    assert_eq!(ids, ["2", "9", "10", "Z", "abc"]);
  }
}
