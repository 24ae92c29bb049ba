//! The identity job: raw users in, mappings and exceptions out.

use serde::Serialize;
use sluice_core::{
  TableName,
  identity::{ExceptionReason, IdentityCandidate, IdentityWriteSummary, KeyExtractor, resolve},
  metrics::{self, Metrics},
  record::RAW_COLUMNS,
  store::PipelineStore,
};

use crate::{Error, Result, recorder::Bounded};

#[derive(Debug, Clone, Serialize)]
pub struct IdentitySummary {
  pub users_table:     TableName,
  pub users_read:      u64,
  pub mappings_active: u64,
  pub missing_key:     u64,
  pub duplicate_key:   u64,
  pub written:         IdentityWriteSummary,
}

/// Resolve every raw user and persist the result.
///
/// The whole users table is read each time so the exception set always
/// reflects the full population, not just recent arrivals.
pub async fn run_identity<S: PipelineStore>(
  db: Bounded<'_, S>,
  users_table: &TableName,
  extractor: &KeyExtractor,
) -> Result<(IdentitySummary, Metrics)> {
  require_raw_columns(db, users_table).await?;

  let table = users_table.clone();
  let users = db.call(|s| s.raw_window(table, None)).await?;
  let candidates = users
    .into_iter()
    .map(|u| IdentityCandidate {
      source_user_id: u.record_id,
      payload:        u.payload,
    })
    .collect::<Vec<_>>();

  let resolution = resolve(&candidates, extractor);
  let missing_key = resolution.count(ExceptionReason::MissingKey) as u64;
  let duplicate_key = resolution.count(ExceptionReason::DuplicateKey) as u64;
  let mappings_active = resolution.mappings.len() as u64;

  let written = db.call(|s| s.apply_identity(resolution)).await?;

  tracing::info!(
    users = candidates.len(),
    mapped = mappings_active,
    missing_key,
    duplicate_key,
    inserted = written.mappings_inserted,
    deactivated = written.mappings_deactivated,
    "identity resolved"
  );

  let metrics = Metrics::new()
    .with(metrics::USERS_READ, candidates.len() as u64)
    .with(metrics::MAPPINGS_ACTIVE, mappings_active)
    .with(metrics::MAPPINGS_INSERTED, written.mappings_inserted)
    .with(metrics::MAPPINGS_DEACTIVATED, written.mappings_deactivated)
    .with(metrics::EXCEPTIONS_MISSING_KEY, missing_key)
    .with(metrics::EXCEPTIONS_DUPLICATE_KEY, duplicate_key);

  let summary = IdentitySummary {
    users_table: users_table.clone(),
    users_read: candidates.len() as u64,
    mappings_active,
    missing_key,
    duplicate_key,
    written,
  };
  Ok((summary, metrics))
}

/// Fail with [`Error::SchemaIncompatible`] unless `table` exists with every
/// raw column.
pub(crate) async fn require_raw_columns<S: PipelineStore>(
  db: Bounded<'_, S>,
  table: &TableName,
) -> Result<()> {
  let name = table.clone();
  let missing = match db.call(|s| s.describe_table(name)).await? {
    Some(schema) => schema.missing_columns(RAW_COLUMNS),
    None => RAW_COLUMNS.to_vec(),
  };
  if missing.is_empty() {
    return Ok(());
  }
  Err(Error::SchemaIncompatible {
    table:   table.clone(),
    missing: missing.into_iter().map(str::to_owned).collect(),
  })
}
