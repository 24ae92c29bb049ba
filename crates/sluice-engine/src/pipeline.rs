//! [`Pipeline`]: one store, one configuration, every job.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sluice_core::{
  TableName,
  run::{QualityCheckResult, RunRecord},
  schema::SchemaChangeEvent,
  source::{DecodeOptions, MissingTimestampPolicy, SourceRegistry},
  store::PipelineStore,
};

use crate::{
  Result,
  config::PipelineConfig,
  curated::{CuratedSources, CuratedSummary, run_curated},
  drift::{DriftSummary, run_drift},
  identity::{IdentitySummary, run_identity},
  ingest::{IngestPlan, IngestSummary, run_ingest},
  quality::{QualitySummary, run_quality, standard_probes},
  recorder::{Bounded, JobReport, RunRecorder},
};

pub const JOB_RESOLVE_IDENTITY: &str = "resolve_identity";
pub const JOB_BUILD_CURATED: &str = "build_curated";
pub const JOB_SNAPSHOT_SCHEMA: &str = "snapshot_schema";
pub const JOB_CHECK_QUALITY: &str = "check_quality";

/// Number of schema changes shown by [`Pipeline::status`].
const STATUS_CHANGES: usize = 100;

/// Caller-facing ingestion request. Unset fields fall back to the source
/// registry and the pipeline configuration.
#[derive(Debug, Clone, Default)]
pub struct IngestRequest {
  pub source_name:       String,
  pub input:             PathBuf,
  pub table:             Option<TableName>,
  pub id_field:          Option<String>,
  pub updated_field:     Option<String>,
  pub incremental:       bool,
  pub missing_timestamp: Option<MissingTimestampPolicy>,
}

/// Projection of the derived status views.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
  pub latest_runs:      Vec<RunRecord>,
  pub latest_quality:   Vec<QualityCheckResult>,
  pub schema_changes:   Vec<SchemaChangeEvent>,
  pub curated_boundary: Option<DateTime<Utc>>,
}

pub struct Pipeline<S> {
  store:    S,
  config:   PipelineConfig,
  registry: SourceRegistry,
}

impl<S: PipelineStore> Pipeline<S> {
  /// A pipeline with the built-in source registry.
  pub fn new(store: S, config: PipelineConfig) -> Result<Self> {
    Ok(Self {
      store,
      config,
      registry: SourceRegistry::with_canvas_defaults()?,
    })
  }

  pub fn with_registry(mut self, registry: SourceRegistry) -> Self {
    self.registry = registry;
    self
  }

  pub fn store(&self) -> &S { &self.store }

  pub fn config(&self) -> &PipelineConfig { &self.config }

  fn db(&self) -> Bounded<'_, S> { Bounded::new(&self.store, self.config.store_timeout()) }

  fn recorder(&self) -> RunRecorder<'_, S> { RunRecorder::new(self.db()) }

  // ── Jobs ──────────────────────────────────────────────────────────────

  pub async fn ingest(&self, request: IngestRequest) -> Result<JobReport<IngestSummary>> {
    let defaults = DecodeOptions::default();
    let table = match request.table {
      Some(table) => table,
      None => self.registry.default_table(&request.source_name)?,
    };
    let plan = IngestPlan {
      source_name:       request.source_name,
      table,
      options:           DecodeOptions {
        id_field:      request.id_field.unwrap_or(defaults.id_field),
        updated_field: request.updated_field.unwrap_or(defaults.updated_field),
      },
      incremental:       request.incremental,
      missing_timestamp: request
        .missing_timestamp
        .unwrap_or(self.config.missing_timestamp_policy),
    };
    let decoder = self.registry.decoder(&plan.source_name);
    let input = request.input;
    let db = self.db();

    self
      .recorder()
      .run_job(&format!("ingest:{}", plan.source_name), |run_id| async move {
        run_ingest(db, run_id, &plan, &input, decoder.as_ref()).await
      })
      .await
  }

  pub async fn resolve_identity(&self) -> Result<JobReport<IdentitySummary>> {
    let users = self.config.sources.users()?;
    let extractor = self.config.key_extractor();
    let db = self.db();

    self
      .recorder()
      .run_job(JOB_RESOLVE_IDENTITY, |_| async move {
        run_identity(db, &users, &extractor).await
      })
      .await
  }

  pub async fn build_curated(
    &self,
    since: Option<DateTime<Utc>>,
  ) -> Result<JobReport<CuratedSummary>> {
    let sources = CuratedSources {
      courses:     self.config.sources.courses()?,
      submissions: self.config.sources.submissions()?,
    };
    let policy = self.config.unresolved_policy;
    let db = self.db();

    self
      .recorder()
      .run_job(JOB_BUILD_CURATED, |run_id| async move {
        run_curated(db, run_id, &sources, since, policy).await
      })
      .await
  }

  /// Snapshot `tables`, or the configured list, or the default universe.
  pub async fn snapshot_schema(
    &self,
    tables: Vec<TableName>,
  ) -> Result<JobReport<DriftSummary>> {
    let tables = if tables.is_empty() { self.config.schema_tables()? } else { tables };
    let db = self.db();

    self
      .recorder()
      .run_job(JOB_SNAPSHOT_SCHEMA, |run_id| async move {
        run_drift(db, run_id, &tables).await
      })
      .await
  }

  pub async fn check_quality(&self) -> Result<JobReport<QualitySummary>> {
    let probes =
      standard_probes(&self.config.sources.users()?, &self.config.sources.submissions()?);
    let db = self.db();

    self
      .recorder()
      .run_job(JOB_CHECK_QUALITY, |run_id| async move {
        run_quality(db, run_id, probes).await
      })
      .await
  }

  // ── Reporting ─────────────────────────────────────────────────────────

  pub async fn status(&self) -> Result<StatusReport> {
    let db = self.db();
    Ok(StatusReport {
      latest_runs:      db.call(|s| s.latest_runs()).await?,
      latest_quality:   db.call(|s| s.latest_quality()).await?,
      schema_changes:   db.call(|s| s.recent_schema_changes(STATUS_CHANGES)).await?,
      curated_boundary: db.call(|s| s.curated_boundary()).await?,
    })
  }
}
