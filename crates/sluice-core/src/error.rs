//! Error types for `sluice-core`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("invalid table name: {0:?}")]
  InvalidTableName(String),

  #[error("unknown {kind}: {value:?}")]
  UnknownVariant { kind: &'static str, value: String },

  #[error("metric {0:?} is well-known and must be numeric")]
  NonNumericMetric(String),

  #[error("invalid timestamp: {0:?}")]
  InvalidTimestamp(String),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
