//! The quality job: evaluate every probe and record one result per probe.

use serde::Serialize;
use serde_json::{Value, json};
use sluice_core::{
  TableName,
  metrics::{self, Metrics},
  quality::{ProbeOutcome, QualityProbe},
  run::{NewQualityCheck, QualityCheckResult, SampleKeys, Severity},
  store::PipelineStore,
};
use uuid::Uuid;

use crate::{Result, recorder::Bounded};

#[derive(Debug, Clone, Serialize)]
pub struct QualitySummary {
  pub results: Vec<QualityCheckResult>,
}

/// The standard probe set over the configured raw `users` and `submissions`.
pub fn standard_probes(users: &TableName, submissions: &TableName) -> Vec<QualityProbe> {
  vec![
    QualityProbe::RawKeyUnique { raw_table: users.clone() },
    QualityProbe::IdentityMissingKey,
    QualityProbe::IdentityDuplicateKey,
    QualityProbe::StudentCoverage,
    QualityProbe::CourseCoverage,
    QualityProbe::RawFactReconcile { raw_table: submissions.clone() },
  ]
}

/// Turn a probe outcome into a check graded by the probe's severity rule.
/// Absent inputs are a skipped `warn`.
pub fn check_for(probe: &QualityProbe, outcome: Option<ProbeOutcome>) -> NewQualityCheck {
  match outcome {
    Some(outcome) => {
      let severity = probe.severity_rule().grade(&outcome);
      let details = with_rate(outcome.details.clone(), outcome.failure_rate());
      NewQualityCheck::counted(
        probe.check_name(),
        probe.table_name(),
        outcome.failed_rows,
        Some(outcome.total_rows),
        Vec::from(outcome.sample_keys),
      )
      .with_severity(severity)
      .with_details(details)
    }
    None => NewQualityCheck {
      check_name:       probe.check_name().to_owned(),
      table_name:       probe.table_name().to_owned(),
      severity:         Severity::Warn,
      failed_row_count: 0,
      total_row_count:  None,
      sample_keys:      SampleKeys::default(),
      details:          json!({ "skipped": true, "reason": "input tables not present" }),
    },
  }
}

fn with_rate(details: Value, rate: Option<f64>) -> Value {
  match details {
    Value::Object(mut map) => {
      map.insert("failure_rate".to_owned(), json!(rate));
      Value::Object(map)
    }
    other => json!({ "failure_rate": rate, "measured": other }),
  }
}

pub async fn run_quality<S: PipelineStore>(
  db: Bounded<'_, S>,
  run_id: Uuid,
  probes: Vec<QualityProbe>,
) -> Result<(QualitySummary, Metrics)> {
  let mut results = Vec::with_capacity(probes.len());

  for probe in probes {
    let request = probe.clone();
    let outcome = db.call(|s| s.probe(request)).await?;
    let check = check_for(&probe, outcome);
    let stored = db.call(|s| s.record_quality(run_id, check)).await?;
    tracing::info!(
      check = %stored.check_name,
      severity = %stored.severity,
      failed = stored.failed_row_count,
      total = ?stored.total_row_count,
      "quality check recorded"
    );
    results.push(stored);
  }

  let count = |severity: Severity| results.iter().filter(|r| r.severity == severity).count() as u64;
  let metrics = Metrics::new()
    .with(metrics::CHECKS_RUN, results.len() as u64)
    .with(metrics::CHECKS_WARN, count(Severity::Warn))
    .with(metrics::CHECKS_ERROR, count(Severity::Error));

  Ok((QualitySummary { results }, metrics))
}
