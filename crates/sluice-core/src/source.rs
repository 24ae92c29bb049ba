//! Source decoding and the registry of known sources.
//!
//! Each source name maps to a [`RecordDecoder`] that turns one input line
//! into a [`DecodedRecord`] or a per-record [`RecordError`]. The registry is
//! built once at startup; unknown sources fall back to the generic decoder.

use std::{collections::HashMap, fmt, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{AsRefStr, Display, EnumString};
use thiserror::Error;

use crate::{
  TableName,
  record::{extract_path, parse_timestamp, scalar_string},
};

// ─── Options & policy ────────────────────────────────────────────────────────

/// Where to find the identifier and update timestamp in each record.
/// Both accept dotted paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodeOptions {
  pub id_field:      String,
  pub updated_field: String,
}

impl Default for DecodeOptions {
  fn default() -> Self {
    Self {
      id_field:      "id".to_owned(),
      updated_field: "updated_at".to_owned(),
    }
  }
}

/// Treatment of records with a missing or unparseable update timestamp
/// during an incremental run.
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
pub enum MissingTimestampPolicy {
  /// Upsert the record; it never moves the watermark.
  #[default]
  Process,
  /// Divert the record to the quarantine table.
  Quarantine,
}

// ─── Decoding ────────────────────────────────────────────────────────────────

/// A successfully decoded input line.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedRecord {
  pub record_id:  String,
  pub payload:    Value,
  /// `None` when the field is absent or cannot be parsed.
  pub updated_at: Option<DateTime<Utc>>,
}

/// Why a single record was rejected. Never fatal to the run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
  #[error("invalid json: {0}")]
  InvalidJson(String),

  #[error("record is not a json object")]
  NotAnObject,

  #[error("missing or empty id field {0:?}")]
  MissingId(String),

  #[error("missing required field {0:?}")]
  MissingField(String),
}

pub trait RecordDecoder: Send + Sync {
  fn decode(&self, line: &str, opts: &DecodeOptions) -> Result<DecodedRecord, RecordError>;
}

/// Generic JSON-lines decoder with an optional list of fields that must be
/// present and non-null.
#[derive(Debug, Clone, Default)]
pub struct JsonLinesDecoder {
  required_fields: Vec<String>,
}

impl JsonLinesDecoder {
  pub fn new() -> Self { Self::default() }

  pub fn requiring<I, S>(fields: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Self {
      required_fields: fields.into_iter().map(Into::into).collect(),
    }
  }
}

impl RecordDecoder for JsonLinesDecoder {
  fn decode(&self, line: &str, opts: &DecodeOptions) -> Result<DecodedRecord, RecordError> {
    let payload: Value = serde_json::from_str(line)
      .map_err(|e| RecordError::InvalidJson(e.to_string()))?;
    if !payload.is_object() {
      return Err(RecordError::NotAnObject);
    }

    let record_id = extract_path(&payload, &opts.id_field)
      .and_then(scalar_string)
      .ok_or_else(|| RecordError::MissingId(opts.id_field.clone()))?;

    if let Some(field) = self
      .required_fields
      .iter()
      .find(|f| extract_path(&payload, f).is_none_or(Value::is_null))
    {
      return Err(RecordError::MissingField(field.clone()));
    }

    let updated_at = extract_path(&payload, &opts.updated_field).and_then(parse_timestamp);

    Ok(DecodedRecord { record_id, payload, updated_at })
  }
}

// ─── Registry ────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct SourceEntry {
  /// Raw table used when the caller does not name one.
  pub default_table: TableName,
  pub decoder:       Arc<dyn RecordDecoder>,
}

impl fmt::Debug for SourceEntry {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("SourceEntry")
      .field("default_table", &self.default_table)
      .finish_non_exhaustive()
  }
}

/// Source name → decoder lookup, resolved once per process.
#[derive(Clone)]
pub struct SourceRegistry {
  entries:  HashMap<String, SourceEntry>,
  fallback: Arc<dyn RecordDecoder>,
}

impl Default for SourceRegistry {
  fn default() -> Self {
    Self {
      entries:  HashMap::new(),
      fallback: Arc::new(JsonLinesDecoder::new()),
    }
  }
}

impl SourceRegistry {
  /// Registry preloaded with the learning-platform export sources.
  pub fn with_canvas_defaults() -> crate::Result<Self> {
    let mut registry = Self::default();
    registry.register("canvas_users", TableName::new("raw_users")?, JsonLinesDecoder::new());
    registry.register(
      "canvas_courses",
      TableName::new("raw_courses")?,
      JsonLinesDecoder::new(),
    );
    registry.register(
      "canvas_enrollments",
      TableName::new("raw_enrollments")?,
      JsonLinesDecoder::new(),
    );
    registry.register(
      "canvas_submissions",
      TableName::new("raw_submissions")?,
      JsonLinesDecoder::requiring(["user_id", "course_id"]),
    );
    Ok(registry)
  }

  pub fn register(
    &mut self,
    source_name: impl Into<String>,
    default_table: TableName,
    decoder: impl RecordDecoder + 'static,
  ) {
    self.entries.insert(
      source_name.into(),
      SourceEntry { default_table, decoder: Arc::new(decoder) },
    );
  }

  pub fn get(&self, source_name: &str) -> Option<&SourceEntry> {
    self.entries.get(source_name)
  }

  /// The registered decoder, or the generic one.
  pub fn decoder(&self, source_name: &str) -> Arc<dyn RecordDecoder> {
    self
      .get(source_name)
      .map(|e| Arc::clone(&e.decoder))
      .unwrap_or_else(|| Arc::clone(&self.fallback))
  }

  /// The raw table a source lands in: registered default, else `raw_<name>`.
  pub fn default_table(&self, source_name: &str) -> crate::Result<TableName> {
    match self.get(source_name) {
      Some(entry) => Ok(entry.default_table.clone()),
      None => TableName::new(format!("raw_{source_name}")),
    }
  }
}
