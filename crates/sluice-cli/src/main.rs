//! `sluice`: run pipeline jobs against a local SQLite store.
//!
//! Reads `sluice.toml` (or the path given with `--config`), layers `SLUICE_*`
//! environment variables and command-line overrides on top, runs one job and
//! prints its report as JSON on stdout. Logs go to stderr.
//!
//! # Usage
//!
//! ```text
//! sluice ingest --source canvas_users --input users.jsonl --incremental
//! sluice resolve-identity
//! sluice build-curated --since 2024-01-01T00:00:00Z
//! sluice snapshot-schema --tables raw_users,dim_student
//! sluice check-quality
//! sluice status
//! ```

use std::{
  path::{Path, PathBuf},
  process::ExitCode,
};

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use sluice_core::{TableName, record::parse_timestamp_str, source::MissingTimestampPolicy};
use sluice_engine::{IngestRequest, Pipeline, PipelineConfig};
use sluice_store_sqlite::SqliteStore;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

// ─── CLI args ─────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "sluice", author, version, about = "Incremental data-integration pipeline")]
struct Cli {
  /// Path to the TOML configuration file.
  #[arg(short, long, global = true, default_value = "sluice.toml")]
  config: PathBuf,

  /// Store file, overriding `store_path`.
  #[arg(long, global = true, value_name = "FILE")]
  store: Option<PathBuf>,

  /// Bound on every store call in seconds, overriding `store_timeout_secs`.
  #[arg(long, global = true, value_name = "SECS")]
  store_timeout_secs: Option<u64>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand)]
enum Command {
  /// Load JSON-lines records from a source into its raw table.
  Ingest(IngestArgs),

  /// Map raw users to internal identities.
  ResolveIdentity,

  /// Merge raw rows into the dimension and fact tables.
  BuildCurated {
    /// Read raw rows ingested after this instant instead of the stored
    /// boundary.
    #[arg(long, value_parser = parse_since)]
    since: Option<DateTime<Utc>>,
  },

  /// Snapshot table shapes and log structural changes.
  SnapshotSchema {
    /// Comma-separated tables; defaults to the configured or known tables.
    #[arg(long, value_delimiter = ',')]
    tables: Vec<TableName>,
  },

  /// Run the data-quality checks.
  CheckQuality,

  /// Show the latest runs, quality results and schema changes.
  Status,
}

#[derive(Args)]
struct IngestArgs {
  /// Source name, e.g. `canvas_users`.
  #[arg(long)]
  source: String,

  /// JSON-lines input file.
  #[arg(long, value_name = "FILE")]
  input: PathBuf,

  /// Raw table; defaults to the source's registered table.
  #[arg(long)]
  table: Option<TableName>,

  /// Dotted path of the record identifier.
  #[arg(long)]
  id_field: Option<String>,

  /// Skip records at or below the source watermark.
  #[arg(long)]
  incremental: bool,

  /// Dotted path of the update timestamp.
  #[arg(long)]
  updated_field: Option<String>,

  /// `process` or `quarantine` for records without a usable timestamp.
  #[arg(long)]
  missing_timestamp: Option<MissingTimestampPolicy>,
}

impl From<IngestArgs> for IngestRequest {
  fn from(args: IngestArgs) -> Self {
    Self {
      source_name:       args.source,
      input:             args.input,
      table:             args.table,
      id_field:          args.id_field,
      updated_field:     args.updated_field,
      incremental:       args.incremental,
      missing_timestamp: args.missing_timestamp,
    }
  }
}

fn parse_since(raw: &str) -> Result<DateTime<Utc>, String> {
  parse_timestamp_str(raw).ok_or_else(|| format!("not a timestamp: {raw:?}"))
}

// ─── Entry point ──────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> ExitCode {
  tracing_subscriber::fmt()
    .with_writer(std::io::stderr)
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy(),
    )
    .init();

  let cli = Cli::parse();

  match run(cli).await {
    Ok(report) => {
      println!("{report}");
      ExitCode::SUCCESS
    }
    Err(err) => {
      tracing::error!("{err:#}");
      let report = json!({ "status": "failed", "error": format!("{err:#}") });
      println!("{}", serde_json::to_string_pretty(&report).unwrap_or_default());
      ExitCode::FAILURE
    }
  }
}

async fn run(cli: Cli) -> anyhow::Result<String> {
  let mut config = PipelineConfig::load(&cli.config)
    .with_context(|| format!("failed to load configuration from {:?}", cli.config))?;
  if let Some(store) = cli.store {
    config.store_path = store;
  }
  if let Some(secs) = cli.store_timeout_secs {
    config.store_timeout_secs = secs;
  }

  let store_path = expand_tilde(&config.store_path);
  let store = SqliteStore::open_with_call_timeout(&store_path, config.store_timeout())
    .await
    .with_context(|| format!("failed to open store at {store_path:?}"))?;
  let pipeline = Pipeline::new(store, config).context("failed to set up pipeline")?;

  match cli.command {
    Command::Ingest(args) => {
      let source = args.source.clone();
      render(
        pipeline
          .ingest(args.into())
          .await
          .with_context(|| format!("ingest of {source} failed"))?,
      )
    }
    Command::ResolveIdentity => {
      render(pipeline.resolve_identity().await.context("identity resolution failed")?)
    }
    Command::BuildCurated { since } => {
      render(pipeline.build_curated(since).await.context("curated build failed")?)
    }
    Command::SnapshotSchema { tables } => {
      render(pipeline.snapshot_schema(tables).await.context("schema snapshot failed")?)
    }
    Command::CheckQuality => {
      render(pipeline.check_quality().await.context("quality checks failed")?)
    }
    Command::Status => render(pipeline.status().await.context("failed to read status")?),
  }
}

fn render<T: Serialize>(report: T) -> anyhow::Result<String> {
  serde_json::to_string_pretty(&report).context("failed to render report")
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
  let s = path.to_string_lossy();
  if let Some(rest) = s.strip_prefix("~/")
    && let Ok(home) = std::env::var("HOME")
  {
    return PathBuf::from(home).join(rest);
  }
  path.to_path_buf()
}
