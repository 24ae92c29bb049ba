//! Incremental ingestion of JSON-lines input into raw tables.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use sluice_core::{
  TableName,
  metrics::{self, Metrics},
  record::{NewRawRecord, UpsertOutcome},
  run::{MAX_SAMPLE_KEYS, NewQualityCheck},
  source::{DecodeOptions, MissingTimestampPolicy, RecordDecoder},
  store::PipelineStore,
  watermark::WatermarkState,
};
use tokio::io::{AsyncBufRead, AsyncBufReadExt as _, BufReader};
use uuid::Uuid;

use crate::{Error, Result, recorder::Bounded};

pub const MALFORMED_CHECK: &str = "ingest.malformed_records";

const QUARANTINE_MISSING_TIMESTAMP: &str = "missing_timestamp";

/// A fully resolved ingestion request.
#[derive(Debug, Clone)]
pub struct IngestPlan {
  pub source_name:       String,
  pub table:             TableName,
  pub options:           DecodeOptions,
  pub incremental:       bool,
  pub missing_timestamp: MissingTimestampPolicy,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestCounts {
  pub read:              u64,
  pub skipped:           u64,
  pub upserted:          u64,
  pub inserted:          u64,
  pub updated:           u64,
  pub malformed:         u64,
  pub quarantined:       u64,
  pub missing_timestamp: u64,
}

impl IngestCounts {
  pub fn metrics(&self) -> Metrics {
    Metrics::new()
      .with(metrics::RECORDS_READ, self.read)
      .with(metrics::RECORDS_SKIPPED, self.skipped)
      .with(metrics::RECORDS_UPSERTED, self.upserted)
      .with(metrics::RECORDS_INSERTED, self.inserted)
      .with(metrics::RECORDS_UPDATED, self.updated)
      .with(metrics::RECORDS_MALFORMED, self.malformed)
      .with(metrics::RECORDS_QUARANTINED, self.quarantined)
      .with(metrics::RECORDS_MISSING_TIMESTAMP, self.missing_timestamp)
  }
}

/// A rejected input line, numbered from 1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MalformedLine {
  pub line:  u64,
  pub error: String,
}

/// Result of feeding one input through the raw store.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestOutcome {
  pub counts:        IngestCounts,
  pub malformed:     Vec<MalformedLine>,
  /// Largest `updated_at` among records actually upserted.
  pub candidate_max: Option<DateTime<Utc>>,
  /// The prior watermark advanced by `candidate_max`. Not yet persisted.
  pub next:          WatermarkState,
}

/// Report returned by the ingest job.
#[derive(Debug, Clone, Serialize)]
pub struct IngestSummary {
  pub source_name:      String,
  pub table:            TableName,
  pub incremental:      bool,
  pub counts:           IngestCounts,
  pub watermark_before: Option<DateTime<Utc>>,
  pub watermark_after:  Option<DateTime<Utc>>,
  pub malformed_lines:  Vec<u64>,
}

/// Decode and upsert every line of `reader`.
///
/// In incremental mode records at or below `prior` are skipped. Records
/// without a usable timestamp follow `plan.missing_timestamp` and never move
/// the watermark. Blank lines are ignored. A line that is not valid UTF-8 is
/// malformed like any other undecodable line; only a read error is fatal.
pub async fn ingest_lines<S, R>(
  db: Bounded<'_, S>,
  reader: R,
  origin: &str,
  plan: &IngestPlan,
  decoder: &dyn RecordDecoder,
  prior: WatermarkState,
) -> Result<IngestOutcome>
where
  S: PipelineStore,
  R: AsyncBufRead + Unpin,
{
  let mut counts = IngestCounts::default();
  let mut malformed = Vec::new();
  let mut candidate_max: Option<DateTime<Utc>> = None;

  let mut lines = reader.split(b'\n');
  let mut line_no = 0u64;

  while let Some(mut bytes) = lines.next_segment().await.map_err(|error| {
    Error::SourceUnreadable { origin: origin.to_owned(), error }
  })? {
    line_no += 1;
    if bytes.last() == Some(&b'\r') {
      bytes.pop();
    }
    let line = match String::from_utf8(bytes) {
      Ok(line) if line.trim().is_empty() => continue,
      Ok(line) => line,
      Err(e) => {
        tracing::debug!(source = %plan.source_name, line = line_no, "line is not valid utf-8");
        counts.read += 1;
        counts.malformed += 1;
        malformed.push(MalformedLine { line: line_no, error: format!("invalid utf-8: {e}") });
        continue;
      }
    };
    counts.read += 1;

    let decoded = match decoder.decode(&line, &plan.options) {
      Ok(decoded) => decoded,
      Err(e) => {
        tracing::debug!(source = %plan.source_name, line = line_no, error = %e, "malformed record");
        counts.malformed += 1;
        malformed.push(MalformedLine { line: line_no, error: e.to_string() });
        continue;
      }
    };

    let record = NewRawRecord {
      source_name:       plan.source_name.clone(),
      record_id:         decoded.record_id,
      payload:           decoded.payload,
      record_updated_at: decoded.updated_at,
    };

    match decoded.updated_at {
      Some(ts) if plan.incremental && prior.is_stale(ts) => {
        counts.skipped += 1;
        continue;
      }
      Some(_) => {}
      None => {
        counts.missing_timestamp += 1;
        if plan.incremental && plan.missing_timestamp == MissingTimestampPolicy::Quarantine {
          let reason = QUARANTINE_MISSING_TIMESTAMP.to_owned();
          db.call(|s| s.quarantine(record, reason)).await?;
          counts.quarantined += 1;
          continue;
        }
      }
    }

    let table = plan.table.clone();
    match db.call(|s| s.upsert_raw(table, record)).await? {
      UpsertOutcome::Inserted => counts.inserted += 1,
      UpsertOutcome::Updated => counts.updated += 1,
    }
    counts.upserted += 1;

    if let Some(ts) = decoded.updated_at {
      candidate_max = Some(candidate_max.map_or(ts, |m| m.max(ts)));
    }
  }

  Ok(IngestOutcome {
    counts,
    malformed,
    candidate_max,
    next: prior.advanced(candidate_max),
  })
}

/// The ingest job body: watermark in, lines through, watermark out.
///
/// The watermark is only read and advanced in incremental mode, and only
/// advanced once every record has been handled.
pub async fn run_ingest<S: PipelineStore>(
  db: Bounded<'_, S>,
  run_id: Uuid,
  plan: &IngestPlan,
  input: &Path,
  decoder: &dyn RecordDecoder,
) -> Result<(IngestSummary, Metrics)> {
  let prior = if plan.incremental {
    let source = plan.source_name.clone();
    WatermarkState::from(db.call(|s| s.read_watermark(source)).await?)
  } else {
    WatermarkState::default()
  };

  let origin = input.display().to_string();
  let file = tokio::fs::File::open(input)
    .await
    .map_err(|error| Error::SourceUnreadable { origin: origin.clone(), error })?;

  let table = plan.table.clone();
  db.call(|s| s.ensure_raw_table(table)).await?;

  let outcome =
    ingest_lines(db, BufReader::new(file), &origin, plan, decoder, prior).await?;

  let check = malformed_check(plan, &outcome);
  db.call(|s| s.record_quality(run_id, check)).await?;

  let watermark_after = match outcome.candidate_max {
    Some(candidate) if plan.incremental => {
      let source = plan.source_name.clone();
      db.call(|s| s.advance_watermark(source, candidate))
        .await?
        .last_updated_at
    }
    _ => prior.last_updated_at,
  };

  tracing::info!(
    source = %plan.source_name,
    table = %plan.table,
    read = outcome.counts.read,
    upserted = outcome.counts.upserted,
    skipped = outcome.counts.skipped,
    malformed = outcome.counts.malformed,
    "ingest finished"
  );

  let mut metrics = outcome.counts.metrics();
  metrics.set("source_name", plan.source_name.as_str());
  metrics.set("table_name", plan.table.as_str());
  if let Some(ts) = watermark_after {
    metrics.set("watermark_after", ts.to_rfc3339());
  }

  let summary = IngestSummary {
    source_name: plan.source_name.clone(),
    table: plan.table.clone(),
    incremental: plan.incremental,
    counts: outcome.counts,
    watermark_before: prior.last_updated_at,
    watermark_after,
    malformed_lines: outcome.malformed.iter().map(|m| m.line).collect(),
  };
  Ok((summary, metrics))
}

fn malformed_check(plan: &IngestPlan, outcome: &IngestOutcome) -> NewQualityCheck {
  let errors = outcome
    .malformed
    .iter()
    .take(MAX_SAMPLE_KEYS)
    .map(|m| json!({ "line": m.line, "error": m.error }))
    .collect::<Vec<_>>();

  NewQualityCheck::counted(
    MALFORMED_CHECK,
    plan.table.as_str(),
    outcome.counts.malformed,
    Some(outcome.counts.read),
    outcome.malformed.iter().map(|m| m.line.to_string()),
  )
  .with_details(json!({
    "source_name": plan.source_name,
    "errors": errors,
  }))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn plan() -> IngestPlan {
    IngestPlan {
      source_name:       "canvas_users".into(),
      table:             TableName::new("raw_users").unwrap(),
      options:           DecodeOptions::default(),
      incremental:       true,
      missing_timestamp: MissingTimestampPolicy::Process,
    }
  }

  #[test]
  fn malformed_check_samples_line_numbers() {
    let outcome = IngestOutcome {
      counts:        IngestCounts { read: 3, malformed: 2, ..Default::default() },
      malformed:     vec![
        MalformedLine { line: 2, error: "invalid json".into() },
        MalformedLine { line: 5, error: "missing id".into() },
      ],
      candidate_max: None,
      next:          WatermarkState::default(),
    };

    let check = malformed_check(&plan(), &outcome);
    assert_eq!(check.check_name, MALFORMED_CHECK);
    assert_eq!(check.severity, sluice_core::run::Severity::Warn);
    assert_eq!(check.sample_keys.as_slice(), ["2", "5"]);
    assert_eq!(check.total_row_count, Some(3));
  }

  #[test]
  fn counts_map_to_well_known_metrics() {
    let counts = IngestCounts { read: 4, upserted: 3, inserted: 2, updated: 1, ..Default::default() };
    let m = counts.metrics();
    assert_eq!(m.count(metrics::RECORDS_READ), Some(4));
    assert_eq!(m.count(metrics::RECORDS_UPDATED), Some(1));
    assert!(m.validate().is_ok());
  }
}
