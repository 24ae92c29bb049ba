//! Timeout-bounded store access and the run lifecycle wrapper.

use std::{future::Future, time::Duration};

use serde::Serialize;
use sluice_core::{
  metrics::Metrics,
  run::{RunRecord, RunStatus},
  store::PipelineStore,
};
use uuid::Uuid;

use crate::{Error, Result};

/// Tries at marking a run failed. A lock that outlasted the job's own call
/// may still be held for the first of them.
const FINISH_ATTEMPTS: u32 = 3;

// ─── Bounded store handle ────────────────────────────────────────────────────

/// A store reference whose every call is bounded by the same timeout.
///
/// Store errors are boxed into [`Error::Store`]; an elapsed timeout becomes
/// [`Error::Timeout`].
pub struct Bounded<'s, S> {
  store:   &'s S,
  timeout: Duration,
}

impl<S> Clone for Bounded<'_, S> {
  fn clone(&self) -> Self { *self }
}

impl<S> Copy for Bounded<'_, S> {}

impl<'s, S: PipelineStore> Bounded<'s, S> {
  pub fn new(store: &'s S, timeout: Duration) -> Self { Self { store, timeout } }

  pub fn timeout(&self) -> Duration { self.timeout }

  /// Run one store call under the timeout.
  pub async fn call<T, F>(&self, op: impl FnOnce(&'s S) -> F) -> Result<T>
  where
    F: Future<Output = Result<T, S::Error>>,
  {
    match tokio::time::timeout(self.timeout, op(self.store)).await {
      Ok(result) => result.map_err(|e| Error::Store(Box::new(e))),
      Err(_) => Err(Error::Timeout(self.timeout)),
    }
  }
}

// ─── Run recorder ────────────────────────────────────────────────────────────

/// A finished job: its terminal run row plus the job's own report.
#[derive(Debug, Clone, Serialize)]
pub struct JobReport<T> {
  pub run:    RunRecord,
  pub output: T,
}

/// Wraps a job in `start_run` / `finish_run`.
pub struct RunRecorder<'s, S> {
  db: Bounded<'s, S>,
}

impl<'s, S: PipelineStore> RunRecorder<'s, S> {
  pub fn new(db: Bounded<'s, S>) -> Self { Self { db } }

  /// Start a run, execute `job` with its id, and finish the run.
  ///
  /// On success the run is marked `success` with the job's metrics. On any
  /// error, including a timeout, finishing the run as `failed` is always
  /// attempted before the original error is returned.
  pub async fn run_job<T, F, Fut>(&self, job_name: &str, job: F) -> Result<JobReport<T>>
  where
    F: FnOnce(Uuid) -> Fut,
    Fut: Future<Output = Result<(T, Metrics)>>,
  {
    let name = job_name.to_owned();
    let started = self.db.call(|s| s.start_run(name)).await?;
    let run_id = started.run_id;
    tracing::info!(%run_id, job = job_name, "run started");

    match job(run_id).await {
      Ok((output, metrics)) => {
        let run = self
          .db
          .call(|s| s.finish_run(run_id, RunStatus::Success, metrics, None))
          .await?;
        tracing::info!(
          %run_id,
          job = job_name,
          duration_ms = ?run.duration_ms,
          "run succeeded"
        );
        Ok(JobReport { run, output })
      }
      Err(err) => {
        let summary = err.to_string();
        tracing::error!(%run_id, job = job_name, error = %summary, "run failed");
        self.mark_failed(run_id, summary).await;
        Err(err)
      }
    }
  }

  /// Finish `run_id` as `failed`, giving every attempt the full timeout.
  ///
  /// The store rolls back writes that overrun their budget, so by the time
  /// the job's error surfaces nothing of it is still in flight.
  async fn mark_failed(&self, run_id: Uuid, summary: String) {
    let pause = self.db.timeout() / 4;
    for attempt in 1..=FINISH_ATTEMPTS {
      let detail = summary.clone();
      let finished = self
        .db
        .call(|s| s.finish_run(run_id, RunStatus::Failed, Metrics::new(), Some(detail)))
        .await;
      match finished {
        Ok(_) => return,
        Err(err) if attempt < FINISH_ATTEMPTS => {
          tracing::debug!(%run_id, attempt, error = %err, "retrying failed-run update");
          tokio::time::sleep(pause).await;
        }
        Err(err) => {
          tracing::warn!(%run_id, error = %err, "could not mark run as failed");
        }
      }
    }
  }
}
