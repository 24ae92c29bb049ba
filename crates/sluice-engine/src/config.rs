//! Pipeline configuration.
//!
//! Values come from an optional TOML file layered under `SLUICE_*`
//! environment variables. Nested keys use a double underscore, e.g.
//! `SLUICE_SOURCES__USERS=raw_users_v2`. Every key has a default, so an empty
//! configuration is valid.

use std::{path::{Path, PathBuf}, time::Duration};

use serde::{Deserialize, Serialize};
use sluice_core::{
  TableName,
  curated::UnresolvedPolicy,
  identity::{DEFAULT_KEY_FIELDS, KeyExtractor},
  source::MissingTimestampPolicy,
};

use crate::Result;

const ENV_PREFIX: &str = "SLUICE";

/// Runtime configuration shared by every job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
  pub store_path:               PathBuf,
  /// Upper bound on every store call. The SQLite store waits on locks for
  /// at most half of it.
  pub store_timeout_secs:       u64,
  pub missing_timestamp_policy: MissingTimestampPolicy,
  pub unresolved_policy:        UnresolvedPolicy,
  /// Preferred payload keys for identity matching, in priority order.
  pub identity_key_fields:      Vec<String>,
  /// Tables the drift job snapshots. Empty means every live table plus every
  /// table ever snapshotted.
  pub schema_tables:            Vec<String>,
  pub sources:                  SourceTables,
}

/// Raw table that backs each curated entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceTables {
  pub users:       String,
  pub courses:     String,
  pub submissions: String,
}

impl Default for PipelineConfig {
  fn default() -> Self {
    Self {
      store_path:               PathBuf::from("sluice.db"),
      store_timeout_secs:       30,
      missing_timestamp_policy: MissingTimestampPolicy::default(),
      unresolved_policy:        UnresolvedPolicy::default(),
      identity_key_fields:      DEFAULT_KEY_FIELDS.iter().map(|s| s.to_string()).collect(),
      schema_tables:            Vec::new(),
      sources:                  SourceTables::default(),
    }
  }
}

impl Default for SourceTables {
  fn default() -> Self {
    Self {
      users:       "raw_users".to_owned(),
      courses:     "raw_courses".to_owned(),
      submissions: "raw_submissions".to_owned(),
    }
  }
}

impl PipelineConfig {
  /// Load from `path` (skipped when absent) and the environment.
  pub fn load(path: &Path) -> Result<Self> {
    let settings = config::Config::builder()
      .add_source(config::File::from(path).required(false))
      .add_source(
        config::Environment::with_prefix(ENV_PREFIX)
          .prefix_separator("_")
          .separator("__")
          .try_parsing(true)
          .list_separator(",")
          .with_list_parse_key("identity_key_fields")
          .with_list_parse_key("schema_tables"),
      )
      .build()?;
    Ok(settings.try_deserialize()?)
  }

  pub fn store_timeout(&self) -> Duration { Duration::from_secs(self.store_timeout_secs) }

  pub fn key_extractor(&self) -> KeyExtractor {
    KeyExtractor::new(self.identity_key_fields.iter().cloned())
  }

  /// Configured drift tables, validated.
  pub fn schema_tables(&self) -> Result<Vec<TableName>> {
    Ok(
      self
        .schema_tables
        .iter()
        .map(|t| TableName::new(t.trim()))
        .collect::<sluice_core::Result<_>>()?,
    )
  }
}

impl SourceTables {
  pub fn users(&self) -> Result<TableName> { Ok(TableName::new(self.users.as_str())?) }

  pub fn courses(&self) -> Result<TableName> { Ok(TableName::new(self.courses.as_str())?) }

  pub fn submissions(&self) -> Result<TableName> {
    Ok(TableName::new(self.submissions.as_str())?)
  }
}

#[cfg(test)]
mod tests {
  use std::io::Write as _;

  use super::*;

  #[test]
  fn missing_file_yields_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = PipelineConfig::load(&dir.path().join("absent.toml")).unwrap();
    assert_eq!(cfg.store_timeout(), Duration::from_secs(30));
    assert_eq!(cfg.unresolved_policy, UnresolvedPolicy::Flag);
    assert_eq!(cfg.sources.submissions, "raw_submissions");
    assert_eq!(cfg.identity_key_fields.first().map(String::as_str), Some("email"));
  }

  #[test]
  fn file_values_override_defaults() {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    writeln!(
      file,
      r#"
store_path = "/var/lib/sluice/pipeline.db"
store_timeout_secs = 5
missing_timestamp_policy = "quarantine"
unresolved_policy = "exclude"
schema_tables = ["raw_users", "dim_student"]

[sources]
users = "raw_people"
"#
    )
    .unwrap();

    let cfg = PipelineConfig::load(file.path()).unwrap();
    assert_eq!(cfg.store_path, PathBuf::from("/var/lib/sluice/pipeline.db"));
    assert_eq!(cfg.store_timeout(), Duration::from_secs(5));
    assert_eq!(cfg.missing_timestamp_policy, MissingTimestampPolicy::Quarantine);
    assert_eq!(cfg.unresolved_policy, UnresolvedPolicy::Exclude);
    assert_eq!(cfg.sources.users().unwrap().as_str(), "raw_people");
    assert_eq!(cfg.sources.courses, "raw_courses");
    assert_eq!(cfg.schema_tables().unwrap().len(), 2);
  }

  #[test]
  fn invalid_table_names_are_rejected() {
    let cfg = PipelineConfig {
      schema_tables: vec!["Robert'); DROP TABLE runs;--".into()],
      ..PipelineConfig::default()
    };
    assert!(cfg.schema_tables().is_err());
  }
}
