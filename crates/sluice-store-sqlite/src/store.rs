//! [`SqliteStore`]: the SQLite implementation of [`PipelineStore`].

use std::{
  collections::{BTreeMap, BTreeSet, HashMap, HashSet},
  path::Path,
  time::{Duration, Instant},
};

use chrono::{DateTime, SubsecRound, TimeDelta, Utc};
use rusqlite::{OptionalExtension as _, Transaction, TransactionBehavior, params};
use uuid::Uuid;

use sluice_core::{
  TableName,
  curated::{CourseRow, MergeCounts, StudentRow, SubmissionRow},
  identity::{IdentityException, IdentityMapping, IdentityWriteSummary, Resolution},
  metrics::Metrics,
  quality::{ProbeOutcome, QualityProbe},
  record::{NewRawRecord, QuarantinedRecord, RawRecord, UpsertOutcome, compare_source_ids},
  run::{NewQualityCheck, QualityCheckResult, RunRecord, RunStatus},
  schema::{ColumnDescriptor, SchemaChange, SchemaChangeEvent, SchemaSnapshot, TableSchema},
  store::PipelineStore,
  watermark::Watermark,
};

use crate::{
  Error, Result,
  error::DeadlineElapsed,
  encode::{
    RawChange, RawException, RawMapping, RawQuality, RawQuarantined, RawRecordRow, RawRun,
    RawSnapshot, RawWatermark, decode_dt, encode_dt, encode_opt_dt, encode_uuid, from_count,
    to_count,
  },
  merge::{
    DIM_COURSE, DIM_STUDENT, FACT_SUBMISSION, course_values, merge, student_values,
    submission_values,
  },
  probe,
  schema::{SCHEMA, raw_table_ddl},
};

const CURATED_BOUNDARY_KEY: &str = "curated.last_ingested_at";
const INGEST_CLOCK_KEY: &str = "raw.last_ingested_at";

const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Exception row as a comparable tuple:
/// `(source_user_id, reason, normalized_match_key, representative_user_id)`.
type ExceptionKey = (String, String, Option<String>, Option<String>);

// ─── Call budget ─────────────────────────────────────────────────────────────

/// How long one call may wait on the database, derived from the timeout the
/// caller applies to it.
///
/// Lock waits give up after half the timeout, and a write still short of its
/// commit at three quarters of it rolls back. A call the caller has already
/// abandoned therefore never commits.
#[derive(Debug, Clone, Copy)]
struct CallBudget {
  busy:   Duration,
  commit: Duration,
}

impl CallBudget {
  fn within(timeout: Duration) -> Self {
    Self { busy: timeout / 2, commit: timeout * 3 / 4 }
  }
}

/// The instant past which a write rolls back instead of committing.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Deadline {
  at:     Instant,
  budget: Duration,
}

impl Deadline {
  pub(crate) fn after(budget: Duration) -> Self { Self { at: Instant::now() + budget, budget } }

  pub(crate) fn check(self) -> tokio_rusqlite::Result<()> {
    if Instant::now() < self.at {
      return Ok(());
    }
    Err(tokio_rusqlite::Error::Other(Box::new(DeadlineElapsed(self.budget))))
  }
}

/// Next `ingested_at` stamp, strictly after every stamp committed through
/// any connection to this file. Writers are serialised, so commit order and
/// stamp order agree.
fn next_ingested_at(tx: &Transaction<'_>) -> tokio_rusqlite::Result<String> {
  let last: Option<String> = tx
    .query_row(
      "SELECT value FROM pipeline_state WHERE key = ?1",
      params![INGEST_CLOCK_KEY],
      |r| r.get(0),
    )
    .optional()?;
  let last = last
    .as_deref()
    .map(DateTime::parse_from_rfc3339)
    .transpose()
    .map_err(|e| tokio_rusqlite::Error::Other(Box::new(e)))?
    .map(|dt| dt.with_timezone(&Utc));

  let now = Utc::now().trunc_subsecs(6);
  let next = match last {
    Some(prev) if now <= prev => prev + TimeDelta::microseconds(1),
    _ => now,
  };
  let next = encode_dt(next);
  tx.execute(
    "INSERT INTO pipeline_state (key, value, updated_at) VALUES (?1, ?2, ?2)
     ON CONFLICT (key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
    params![INGEST_CLOCK_KEY, next],
  )?;
  Ok(next)
}

// ─── Store ───────────────────────────────────────────────────────────────────

/// A Sluice store backed by a single SQLite file.
///
/// Cloning is cheap: clones share the connection.
#[derive(Clone)]
pub struct SqliteStore {
  conn:   tokio_rusqlite::Connection,
  budget: CallBudget,
}

impl SqliteStore {
  /// Open (or create) a store at `path` and run schema initialisation.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    Self::open_with_call_timeout(path, DEFAULT_CALL_TIMEOUT).await
  }

  /// Like [`SqliteStore::open`], for callers that abandon a call after
  /// `timeout`. Lock waits and commits are bounded well inside it, so an
  /// abandoned write is rolled back rather than committed late.
  pub async fn open_with_call_timeout(path: impl AsRef<Path>, timeout: Duration) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    Self::init(conn, CallBudget::within(timeout)).await
  }

  /// Open an in-memory store, useful for testing.
  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    Self::init(conn, CallBudget::within(DEFAULT_CALL_TIMEOUT)).await
  }

  async fn init(conn: tokio_rusqlite::Connection, budget: CallBudget) -> Result<Self> {
    conn
      .call(move |conn| {
        conn.busy_timeout(budget.busy)?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
      })
      .await?;
    Ok(Self { conn, budget })
  }

  /// Run `f` in an immediate write transaction that commits only before the
  /// call's deadline. The deadline is fixed when the call is issued, so time
  /// spent queued behind other calls counts against it.
  async fn write<T, F>(&self, f: F) -> Result<T>
  where
    T: Send + 'static,
    F: FnOnce(&Transaction<'_>) -> tokio_rusqlite::Result<T> + Send + 'static,
  {
    let deadline = Deadline::after(self.budget.commit);
    let out = self
      .conn
      .call(move |conn| {
        deadline.check()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        deadline.check()?;
        tx.commit()?;
        Ok(out)
      })
      .await?;
    Ok(out)
  }

  async fn merge_rows(
    &self,
    target: &'static crate::merge::MergeTarget,
    rows: Vec<Vec<rusqlite::types::Value>>,
  ) -> Result<MergeCounts> {
    let now = encode_dt(Utc::now());
    let counts = self.write(move |tx| Ok(merge(tx, target, rows, &now)?)).await?;
    tracing::debug!(
      table = target.table,
      staged = counts.staged,
      inserted = counts.inserted,
      updated = counts.updated,
      "merged curated rows"
    );
    Ok(counts)
  }

  async fn load_map(&self, sql: &'static str) -> Result<HashMap<String, i64>> {
    let map = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
          .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?
          .collect::<rusqlite::Result<HashMap<_, _>>>()?;
        Ok(rows)
      })
      .await?;
    Ok(map)
  }
}

// ─── PipelineStore impl ──────────────────────────────────────────────────────

impl PipelineStore for SqliteStore {
  type Error = Error;

  // ── Raw records ───────────────────────────────────────────────────────────

  async fn ensure_raw_table(&self, table: TableName) -> Result<()> {
    let ddl = raw_table_ddl(table.as_str());
    self
      .write(move |tx| {
        tx.execute_batch(&ddl)?;
        Ok(())
      })
      .await
  }

  async fn upsert_raw(&self, table: TableName, record: NewRawRecord) -> Result<UpsertOutcome> {
    let ddl = raw_table_ddl(table.as_str());
    let exists_sql =
      format!("SELECT 1 FROM \"{table}\" WHERE source_name = ?1 AND record_id = ?2");
    let upsert_sql = format!(
      "INSERT INTO \"{table}\" (source_name, record_id, payload, record_updated_at, ingested_at)
       VALUES (?1, ?2, ?3, ?4, ?5)
       ON CONFLICT (source_name, record_id) DO UPDATE SET
         payload           = excluded.payload,
         record_updated_at = excluded.record_updated_at,
         ingested_at       = excluded.ingested_at"
    );

    let payload_str    = record.payload.to_string();
    let updated_at_str = encode_opt_dt(record.record_updated_at);
    let NewRawRecord { source_name, record_id, .. } = record;

    let existed = self
      .write(move |tx| {
        tx.execute_batch(&ddl)?;
        let existed = tx
          .query_row(&exists_sql, params![source_name, record_id], |_| Ok(true))
          .optional()?
          .unwrap_or(false);
        let ingested_at_str = next_ingested_at(tx)?;
        tx.execute(
          &upsert_sql,
          params![source_name, record_id, payload_str, updated_at_str, ingested_at_str],
        )?;
        Ok(existed)
      })
      .await?;

    Ok(if existed { UpsertOutcome::Updated } else { UpsertOutcome::Inserted })
  }

  async fn get_raw(
    &self,
    table: TableName,
    source_name: String,
    record_id: String,
  ) -> Result<Option<RawRecord>> {
    let sql = format!(
      "SELECT source_name, record_id, payload, record_updated_at, ingested_at
       FROM \"{table}\" WHERE source_name = ?1 AND record_id = ?2"
    );

    let raw: Option<RawRecordRow> = self
      .conn
      .call(move |conn| {
        Ok(conn
          .query_row(&sql, params![source_name, record_id], |row| {
            Ok(RawRecordRow {
              source_name:       row.get(0)?,
              record_id:         row.get(1)?,
              payload:           row.get(2)?,
              record_updated_at: row.get(3)?,
              ingested_at:       row.get(4)?,
            })
          })
          .optional()?)
      })
      .await?;

    raw.map(RawRecordRow::into_record).transpose()
  }

  async fn raw_window(
    &self,
    table: TableName,
    after: Option<DateTime<Utc>>,
  ) -> Result<Vec<RawRecord>> {
    let sql = format!(
      "SELECT source_name, record_id, payload, record_updated_at, ingested_at
       FROM \"{table}\"
       WHERE ?1 IS NULL OR ingested_at > ?1
       ORDER BY ingested_at, source_name, record_id"
    );
    let after_str = encode_opt_dt(after);

    let raws: Vec<RawRecordRow> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
          .query_map(params![after_str], |row| {
            Ok(RawRecordRow {
              source_name:       row.get(0)?,
              record_id:         row.get(1)?,
              payload:           row.get(2)?,
              record_updated_at: row.get(3)?,
              ingested_at:       row.get(4)?,
            })
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawRecordRow::into_record).collect()
  }

  async fn quarantine(&self, record: NewRawRecord, reason: String) -> Result<()> {
    let payload_str = record.payload.to_string();
    let at_str      = encode_dt(Utc::now());
    let NewRawRecord { source_name, record_id, .. } = record;

    self
      .write(move |tx| {
        tx.execute(
          "INSERT INTO quarantined_records
             (source_name, record_id, payload, reason, quarantined_at)
           VALUES (?1, ?2, ?3, ?4, ?5)",
          params![source_name, record_id, payload_str, reason, at_str],
        )?;
        Ok(())
      })
      .await
  }

  async fn quarantined(&self, source_name: String) -> Result<Vec<QuarantinedRecord>> {
    let raws: Vec<RawQuarantined> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT source_name, record_id, payload, reason, quarantined_at
           FROM quarantined_records WHERE source_name = ?1
           ORDER BY quarantine_id",
        )?;
        let rows = stmt
          .query_map(params![source_name], |row| {
            Ok(RawQuarantined {
              source_name:    row.get(0)?,
              record_id:      row.get(1)?,
              payload:        row.get(2)?,
              reason:         row.get(3)?,
              quarantined_at: row.get(4)?,
            })
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawQuarantined::into_record).collect()
  }

  // ── Watermarks ────────────────────────────────────────────────────────────

  async fn read_watermark(&self, source_name: String) -> Result<Option<Watermark>> {
    let raw: Option<RawWatermark> = self
      .conn
      .call(move |conn| {
        Ok(conn
          .query_row(
            "SELECT source_name, last_updated_at, updated_at
             FROM watermarks WHERE source_name = ?1",
            params![source_name],
            |row| {
              Ok(RawWatermark {
                source_name:     row.get(0)?,
                last_updated_at: row.get(1)?,
                updated_at:      row.get(2)?,
              })
            },
          )
          .optional()?)
      })
      .await?;

    raw.map(RawWatermark::into_watermark).transpose()
  }

  async fn advance_watermark(
    &self,
    source_name: String,
    candidate: DateTime<Utc>,
  ) -> Result<Watermark> {
    let candidate_str = encode_dt(candidate);
    let now_str       = encode_dt(Utc::now());

    let raw: RawWatermark = self
      .write(move |tx| {
        Ok(tx.query_row(
          "INSERT INTO watermarks (source_name, last_updated_at, updated_at)
           VALUES (?1, ?2, ?3)
           ON CONFLICT (source_name) DO UPDATE SET
             last_updated_at = CASE
               WHEN watermarks.last_updated_at IS NULL
                 OR excluded.last_updated_at > watermarks.last_updated_at
               THEN excluded.last_updated_at
               ELSE watermarks.last_updated_at
             END,
             updated_at = excluded.updated_at
           RETURNING source_name, last_updated_at, updated_at",
          params![source_name, candidate_str, now_str],
          |row| {
            Ok(RawWatermark {
              source_name:     row.get(0)?,
              last_updated_at: row.get(1)?,
              updated_at:      row.get(2)?,
            })
          },
        )?)
      })
      .await?;

    raw.into_watermark()
  }

  // ── Identity ──────────────────────────────────────────────────────────────

  async fn apply_identity(&self, resolution: Resolution) -> Result<IdentityWriteSummary> {
    let now_str = encode_dt(Utc::now());
    let desired: Vec<(String, String, String, f64)> = resolution
      .mappings
      .into_iter()
      .map(|m| {
        (
          m.source_user_id,
          m.normalized_match_key,
          m.match_method.as_ref().to_owned(),
          m.match_confidence,
        )
      })
      .collect();
    let wanted_exceptions: BTreeSet<ExceptionKey> = resolution
      .exceptions
      .into_iter()
      .map(|e| {
        (
          e.source_user_id,
          e.reason.as_ref().to_owned(),
          e.normalized_match_key,
          e.representative_user_id,
        )
      })
      .collect();

    let summary = self
      .write(move |tx| {
        let mut summary = IdentityWriteSummary::default();

        let active = {
          let mut stmt = tx.prepare(
            "SELECT mapping_id, source_user_id, normalized_match_key
             FROM identity_map WHERE active = 1",
          )?;
          let rows = stmt
            .query_map([], |r| {
              Ok((r.get::<_, i64>(0)?, r.get::<_, String>(1)?, r.get::<_, String>(2)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
          rows
        };

        let wanted: HashSet<(&str, &str)> =
          desired.iter().map(|(u, k, ..)| (u.as_str(), k.as_str())).collect();
        let mut kept: HashSet<(&str, &str)> = HashSet::new();

        // Deactivate first so the partial unique indexes never see two
        // active rows for one key or one user.
        for (mapping_id, user, key) in &active {
          if wanted.contains(&(user.as_str(), key.as_str())) {
            kept.insert((user.as_str(), key.as_str()));
          } else {
            tx.execute(
              "UPDATE identity_map SET active = 0, updated_at = ?2 WHERE mapping_id = ?1",
              params![mapping_id, now_str],
            )?;
            summary.mappings_deactivated += 1;
          }
        }

        for (user, key, method, confidence) in &desired {
          if kept.contains(&(user.as_str(), key.as_str())) {
            summary.mappings_unchanged += 1;
            continue;
          }
          tx.execute(
            "INSERT INTO identities (source_user_id, created_at) VALUES (?1, ?2)
             ON CONFLICT (source_user_id) DO NOTHING",
            params![user, now_str],
          )?;
          let internal_id: i64 = tx.query_row(
            "SELECT internal_id FROM identities WHERE source_user_id = ?1",
            params![user],
            |r| r.get(0),
          )?;
          tx.execute(
            "INSERT INTO identity_map (
               internal_id, source_user_id, normalized_match_key,
               match_method, match_confidence, active, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?6)",
            params![internal_id, user, key, method, confidence, now_str],
          )?;
          summary.mappings_inserted += 1;
        }

        let stored = {
          let mut stmt = tx.prepare(
            "SELECT source_user_id, reason, normalized_match_key, representative_user_id
             FROM identity_exceptions",
          )?;
          let rows = stmt
            .query_map([], |r| {
              Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?))
            })?
            .collect::<rusqlite::Result<BTreeSet<ExceptionKey>>>()?;
          rows
        };

        for (user, ..) in stored.difference(&wanted_exceptions) {
          tx.execute(
            "DELETE FROM identity_exceptions WHERE source_user_id = ?1",
            params![user],
          )?;
          summary.exceptions_cleared += 1;
        }
        for (user, reason, key, representative) in wanted_exceptions.difference(&stored) {
          tx.execute(
            "INSERT INTO identity_exceptions (
               source_user_id, reason, normalized_match_key,
               representative_user_id, detected_at
             ) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![user, reason, key, representative, now_str],
          )?;
          summary.exceptions_inserted += 1;
        }

        Ok(summary)
      })
      .await?;

    Ok(summary)
  }

  async fn active_mappings(&self) -> Result<Vec<IdentityMapping>> {
    let raws: Vec<RawMapping> = self
      .conn
      .call(|conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {} FROM identity_map WHERE active = 1 ORDER BY normalized_match_key",
          RawMapping::COLUMNS
        ))?;
        let rows = stmt
          .query_map([], RawMapping::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawMapping::into_mapping).collect()
  }

  async fn mappings_for(&self, source_user_id: String) -> Result<Vec<IdentityMapping>> {
    let raws: Vec<RawMapping> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {} FROM identity_map WHERE source_user_id = ?1 ORDER BY mapping_id",
          RawMapping::COLUMNS
        ))?;
        let rows = stmt
          .query_map(params![source_user_id], RawMapping::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawMapping::into_mapping).collect()
  }

  async fn identity_exceptions(&self) -> Result<Vec<IdentityException>> {
    let raws: Vec<RawException> = self
      .conn
      .call(|conn| {
        let mut stmt = conn.prepare(
          "SELECT source_user_id, reason, normalized_match_key, representative_user_id
           FROM identity_exceptions",
        )?;
        let rows = stmt
          .query_map([], |row| {
            Ok(RawException {
              source_user_id:         row.get(0)?,
              reason:                 row.get(1)?,
              normalized_match_key:   row.get(2)?,
              representative_user_id: row.get(3)?,
            })
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    let mut exceptions = raws
      .into_iter()
      .map(RawException::into_exception)
      .collect::<Result<Vec<_>>>()?;
    exceptions.sort_by(|a, b| {
      a.reason
        .cmp(&b.reason)
        .then_with(|| compare_source_ids(&a.source_user_id, &b.source_user_id))
    });
    Ok(exceptions)
  }

  // ── Curated tables ────────────────────────────────────────────────────────

  async fn merge_students(&self, rows: Vec<StudentRow>) -> Result<MergeCounts> {
    let rows = rows.into_iter().map(student_values).collect();
    self.merge_rows(&DIM_STUDENT, rows).await
  }

  async fn merge_courses(&self, rows: Vec<CourseRow>) -> Result<MergeCounts> {
    let rows = rows.into_iter().map(course_values).collect();
    self.merge_rows(&DIM_COURSE, rows).await
  }

  async fn merge_submissions(&self, rows: Vec<SubmissionRow>) -> Result<MergeCounts> {
    let rows = rows.into_iter().map(submission_values).collect();
    self.merge_rows(&FACT_SUBMISSION, rows).await
  }

  async fn student_keys(&self) -> Result<HashMap<String, i64>> {
    self
      .load_map(
        "SELECT m.source_user_id, d.student_key
         FROM identity_map m
         JOIN dim_student d ON d.internal_id = m.internal_id
         WHERE m.active = 1",
      )
      .await
  }

  async fn course_keys(&self) -> Result<HashMap<String, i64>> {
    self
      .load_map("SELECT course_id, course_key FROM dim_course")
      .await
  }

  async fn curated_boundary(&self) -> Result<Option<DateTime<Utc>>> {
    let value: Option<String> = self
      .conn
      .call(|conn| {
        Ok(conn
          .query_row(
            "SELECT value FROM pipeline_state WHERE key = ?1",
            params![CURATED_BOUNDARY_KEY],
            |r| r.get(0),
          )
          .optional()?)
      })
      .await?;

    value.as_deref().map(decode_dt).transpose()
  }

  async fn advance_curated_boundary(&self, boundary: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let boundary_str = encode_dt(boundary);
    let now_str      = encode_dt(Utc::now());

    let value: String = self
      .write(move |tx| {
        Ok(tx.query_row(
          "INSERT INTO pipeline_state (key, value, updated_at) VALUES (?1, ?2, ?3)
           ON CONFLICT (key) DO UPDATE SET
             value = CASE
               WHEN excluded.value > pipeline_state.value THEN excluded.value
               ELSE pipeline_state.value
             END,
             updated_at = excluded.updated_at
           RETURNING value",
          params![CURATED_BOUNDARY_KEY, boundary_str, now_str],
          |r| r.get(0),
        )?)
      })
      .await?;

    decode_dt(&value)
  }

  // ── Schema ────────────────────────────────────────────────────────────────

  async fn list_tables(&self) -> Result<Vec<TableName>> {
    let names: Vec<String> = self
      .conn
      .call(|conn| {
        let mut stmt = conn.prepare(
          "SELECT name FROM sqlite_master
           WHERE type = 'table' AND name NOT LIKE 'sqlite%'
           ORDER BY name",
        )?;
        let rows = stmt
          .query_map([], |r| r.get(0))?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    // Tables created outside the pipeline may not be valid identifiers.
    Ok(names.into_iter().filter_map(|n| TableName::new(n).ok()).collect())
  }

  async fn describe_table(&self, table: TableName) -> Result<Option<TableSchema>> {
    let name = table.as_str().to_owned();

    let columns = self
      .conn
      .call(move |conn| {
        if !probe::table_exists(conn, &name)? {
          return Ok(None);
        }
        let mut stmt = conn.prepare(
          "SELECT name, type, \"notnull\", pk FROM pragma_table_info(?1) ORDER BY cid",
        )?;
        let rows = stmt
          .query_map(params![name], |r| {
            let name: String = r.get(0)?;
            let ty: String = r.get(1)?;
            let not_null: i64 = r.get(2)?;
            let pk: i64 = r.get(3)?;
            Ok((name, ty, not_null != 0, pk != 0))
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(Some(rows))
      })
      .await?;

    Ok(columns.map(|columns| TableSchema {
      table_name: table,
      columns:    columns
        .into_iter()
        .map(|(name, ty, not_null, pk)| ColumnDescriptor::new(name, &ty, !not_null && !pk))
        .collect(),
    }))
  }

  async fn latest_snapshots(&self) -> Result<BTreeMap<TableName, SchemaSnapshot>> {
    let raws: Vec<RawSnapshot> = self
      .conn
      .call(|conn| {
        let mut stmt = conn.prepare(
          "SELECT s.table_name, s.present, s.columns, s.fingerprint, s.captured_at
           FROM schema_snapshots s
           WHERE s.snapshot_id = (
             SELECT MAX(s2.snapshot_id) FROM schema_snapshots s2
             WHERE s2.table_name = s.table_name
           )",
        )?;
        let rows = stmt
          .query_map([], |row| {
            Ok(RawSnapshot {
              table_name:  row.get(0)?,
              present:     row.get(1)?,
              columns:     row.get(2)?,
              fingerprint: row.get(3)?,
              captured_at: row.get(4)?,
            })
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws
      .into_iter()
      .map(|raw| {
        let snapshot = raw.into_snapshot()?;
        Ok((snapshot.table_name.clone(), snapshot))
      })
      .collect()
  }

  async fn record_schema_generation(
    &self,
    snapshots: Vec<SchemaSnapshot>,
    changes: Vec<SchemaChange>,
    run_id: Option<Uuid>,
  ) -> Result<Vec<SchemaChangeEvent>> {
    let detected_at = Utc::now();
    let detected_str = encode_dt(detected_at);
    let run_str = run_id.map(encode_uuid);

    let snapshot_rows = snapshots
      .into_iter()
      .map(|s| {
        Ok((
          s.table_name.to_string(),
          s.present,
          serde_json::to_string(&s.columns)?,
          s.fingerprint,
          encode_dt(s.captured_at),
        ))
      })
      .collect::<Result<Vec<_>>>()?;
    let change_rows = changes
      .iter()
      .map(|c| {
        Ok((
          c.table_name.to_string(),
          c.kind.as_ref().to_owned(),
          serde_json::to_string(&c.detail)?,
        ))
      })
      .collect::<Result<Vec<_>>>()?;

    let ids: Vec<i64> = self
      .write(move |tx| {
        for (table, present, columns, fingerprint, captured) in &snapshot_rows {
          tx.execute(
            "INSERT INTO schema_snapshots
               (table_name, present, columns, fingerprint, captured_at, run_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![table, present, columns, fingerprint, captured, run_str],
          )?;
        }
        let mut ids = Vec::with_capacity(change_rows.len());
        for (table, kind, detail) in &change_rows {
          tx.execute(
            "INSERT INTO schema_changes
               (table_name, change_kind, detail, detected_at, run_id)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![table, kind, detail, detected_str, run_str],
          )?;
          ids.push(tx.last_insert_rowid());
        }
        Ok(ids)
      })
      .await?;

    Ok(
      ids
        .into_iter()
        .zip(changes)
        .map(|(change_id, c)| SchemaChangeEvent {
          change_id,
          table_name: c.table_name,
          change_kind: c.kind,
          detail: c.detail,
          detected_at: detected_at.trunc_subsecs(6),
          run_id,
        })
        .collect(),
    )
  }

  async fn recent_schema_changes(&self, limit: usize) -> Result<Vec<SchemaChangeEvent>> {
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);

    let raws: Vec<RawChange> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {} FROM schema_changes ORDER BY change_id DESC LIMIT ?1",
          RawChange::COLUMNS
        ))?;
        let rows = stmt
          .query_map(params![limit], RawChange::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawChange::into_event).collect()
  }

  // ── Runs & quality ────────────────────────────────────────────────────────

  async fn start_run(&self, job_name: String) -> Result<RunRecord> {
    let run = RunRecord {
      run_id:       Uuid::new_v4(),
      job_name,
      status:       RunStatus::Running,
      start_time:   Utc::now().trunc_subsecs(6),
      end_time:     None,
      duration_ms:  None,
      metrics:      Metrics::new(),
      error_detail: None,
    };

    let id_str     = encode_uuid(run.run_id);
    let job_str    = run.job_name.clone();
    let status_str = run.status.as_ref().to_owned();
    let start_str  = encode_dt(run.start_time);

    self
      .write(move |tx| {
        tx.execute(
          "INSERT INTO runs (run_id, job_name, status, start_time, metrics)
           VALUES (?1, ?2, ?3, ?4, '{}')",
          params![id_str, job_str, status_str, start_str],
        )?;
        Ok(())
      })
      .await?;

    Ok(run)
  }

  async fn finish_run(
    &self,
    run_id: Uuid,
    status: RunStatus,
    metrics: Metrics,
    error_detail: Option<String>,
  ) -> Result<RunRecord> {
    if !status.is_terminal() {
      return Err(Error::InvalidTerminalStatus(status));
    }
    metrics.validate()?;

    let current = self.get_run(run_id).await?.ok_or(Error::RunNotFound(run_id))?;
    if current.status.is_terminal() {
      return Err(Error::RunAlreadyFinished(run_id));
    }

    let end_time    = Utc::now().trunc_subsecs(6).max(current.start_time);
    let duration_ms = (end_time - current.start_time).num_milliseconds();

    let id_str      = encode_uuid(run_id);
    let status_str  = status.as_ref().to_owned();
    let end_str     = encode_dt(end_time);
    let metrics_str = serde_json::to_string(&metrics)?;
    let detail      = error_detail.clone();

    let changed = self
      .write(move |tx| {
        Ok(tx.execute(
          "UPDATE runs
           SET status = ?2, end_time = ?3, duration_ms = ?4, metrics = ?5, error_detail = ?6
           WHERE run_id = ?1 AND status = 'running'",
          params![id_str, status_str, end_str, duration_ms, metrics_str, detail],
        )?)
      })
      .await?;

    if changed == 0 {
      return Err(Error::RunAlreadyFinished(run_id));
    }

    Ok(RunRecord {
      status,
      end_time: Some(end_time),
      duration_ms: Some(duration_ms),
      metrics,
      error_detail,
      ..current
    })
  }

  async fn get_run(&self, run_id: Uuid) -> Result<Option<RunRecord>> {
    let id_str = encode_uuid(run_id);

    let raw: Option<RawRun> = self
      .conn
      .call(move |conn| {
        Ok(conn
          .query_row(
            &format!("SELECT {} FROM runs WHERE run_id = ?1", RawRun::COLUMNS),
            params![id_str],
            RawRun::from_row,
          )
          .optional()?)
      })
      .await?;

    raw.map(RawRun::into_run).transpose()
  }

  async fn latest_runs(&self) -> Result<Vec<RunRecord>> {
    let raws: Vec<RawRun> = self
      .conn
      .call(|conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {} FROM v_latest_runs ORDER BY job_name",
          RawRun::COLUMNS
        ))?;
        let rows = stmt
          .query_map([], RawRun::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawRun::into_run).collect()
  }

  async fn record_quality(
    &self,
    run_id: Uuid,
    check: NewQualityCheck,
  ) -> Result<QualityCheckResult> {
    let created_at = Utc::now().trunc_subsecs(6);

    let run_str      = encode_uuid(run_id);
    let check_name   = check.check_name.clone();
    let table_name   = check.table_name.clone();
    let severity_str = check.severity.as_ref().to_owned();
    let failed       = from_count(check.failed_row_count);
    let total        = check.total_row_count.map(from_count);
    let samples_str  = serde_json::to_string(&check.sample_keys)?;
    let details_str  = serde_json::to_string(&check.details)?;
    let created_str  = encode_dt(created_at);

    let result_id = self
      .write(move |tx| {
        tx.execute(
          "INSERT INTO quality_results (
             run_id, check_name, table_name, severity, failed_row_count,
             total_row_count, sample_keys, details, created_at
           ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
          params![
            run_str,
            check_name,
            table_name,
            severity_str,
            failed,
            total,
            samples_str,
            details_str,
            created_str,
          ],
        )?;
        Ok(tx.last_insert_rowid())
      })
      .await?;

    Ok(QualityCheckResult {
      result_id,
      run_id,
      check_name: check.check_name,
      table_name: check.table_name,
      severity: check.severity,
      failed_row_count: check.failed_row_count,
      total_row_count: check.total_row_count,
      sample_keys: check.sample_keys,
      details: check.details,
      created_at,
    })
  }

  async fn quality_results(&self, run_id: Uuid) -> Result<Vec<QualityCheckResult>> {
    let run_str = encode_uuid(run_id);

    let raws: Vec<RawQuality> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {} FROM quality_results WHERE run_id = ?1 ORDER BY result_id",
          RawQuality::COLUMNS
        ))?;
        let rows = stmt
          .query_map(params![run_str], RawQuality::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawQuality::into_result).collect()
  }

  async fn latest_quality(&self) -> Result<Vec<QualityCheckResult>> {
    let raws: Vec<RawQuality> = self
      .conn
      .call(|conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {} FROM v_latest_quality ORDER BY check_name, table_name",
          RawQuality::COLUMNS
        ))?;
        let rows = stmt
          .query_map([], RawQuality::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawQuality::into_result).collect()
  }

  async fn probe(&self, check: QualityProbe) -> Result<Option<ProbeOutcome>> {
    let outcome = self
      .conn
      .call(move |conn| Ok(probe::evaluate(conn, &check)?))
      .await?;

    Ok(outcome.map(|raw| ProbeOutcome {
      total_rows:  to_count(raw.total),
      failed_rows: to_count(raw.failed),
      sample_keys: raw.samples.into_iter().collect(),
      details:     raw.details,
    }))
  }
}
