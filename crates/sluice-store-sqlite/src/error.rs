//! Error type for `sluice-store-sqlite`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("core error: {0}")]
  Core(#[from] sluice_core::Error),

  #[error("database error: {0}")]
  Database(#[from] tokio_rusqlite::Error),

  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),

  #[error("uuid parse error: {0}")]
  Uuid(#[from] uuid::Error),

  #[error("date/time parse error: {0}")]
  DateParse(String),

  /// A stored enum column held a value no variant matches.
  #[error("cannot decode {column}: {value:?}")]
  Decode { column: &'static str, value: String },

  #[error("run not found: {0}")]
  RunNotFound(uuid::Uuid),

  #[error("run {0} has already finished")]
  RunAlreadyFinished(uuid::Uuid),

  #[error("{0} is not a terminal run status")]
  InvalidTerminalStatus(sluice_core::run::RunStatus),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A write was still short of its commit when the call's budget ran out, and
/// was rolled back.
#[derive(Debug, Error)]
#[error("write rolled back: not committed within {0:?}")]
pub struct DeadlineElapsed(pub std::time::Duration);
