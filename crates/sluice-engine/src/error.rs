//! Error type for `sluice-engine`.
//!
//! Anything that reaches the caller as an [`Error`] is fatal to the job that
//! raised it. Per-record and per-check problems never surface here; they are
//! counted in run metrics and quality results instead.

use std::time::Duration;

use sluice_core::TableName;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("store error: {0}")]
  Store(#[source] Box<dyn std::error::Error + Send + Sync>),

  #[error("store call did not complete within {0:?}")]
  Timeout(Duration),

  #[error("cannot read input {origin}: {error}")]
  SourceUnreadable {
    origin: String,
    #[source]
    error:  std::io::Error,
  },

  #[error("table {table} is missing required columns: {}", missing.join(", "))]
  SchemaIncompatible {
    table:   TableName,
    missing: Vec<String>,
  },

  #[error("core error: {0}")]
  Core(#[from] sluice_core::Error),

  #[error("configuration error: {0}")]
  Config(#[from] config::ConfigError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
