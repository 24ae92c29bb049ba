//! SQL behind [`QualityProbe`] evaluation.

use rusqlite::{Connection, OptionalExtension as _, params};
use serde_json::{Value, json};
use sluice_core::{quality::QualityProbe, run::MAX_SAMPLE_KEYS};

/// Untyped probe result, converted by the store.
pub struct RawOutcome {
  pub total:   i64,
  pub failed:  i64,
  pub samples: Vec<String>,
  pub details: Value,
}

pub fn table_exists(conn: &Connection, table: &str) -> rusqlite::Result<bool> {
  Ok(
    conn
      .query_row(
        "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
        params![table],
        |_| Ok(true),
      )
      .optional()?
      .unwrap_or(false),
  )
}

fn count(conn: &Connection, sql: &str) -> rusqlite::Result<i64> {
  conn.query_row(sql, [], |r| r.get(0))
}

fn keys(conn: &Connection, sql: &str) -> rusqlite::Result<Vec<String>> {
  let mut stmt = conn.prepare(sql)?;
  let rows = stmt
    .query_map(params![MAX_SAMPLE_KEYS as i64], |r| r.get(0))?
    .collect::<rusqlite::Result<Vec<String>>>()?;
  Ok(rows)
}

pub fn evaluate(
  conn: &Connection,
  probe: &QualityProbe,
) -> rusqlite::Result<Option<RawOutcome>> {
  match probe {
    QualityProbe::IdentityMissingKey => identity(conn, "missing_key"),
    QualityProbe::IdentityDuplicateKey => identity(conn, "duplicate_key"),
    QualityProbe::StudentCoverage => {
      coverage(conn, "student_key", "dim_student", "student_key")
    }
    QualityProbe::CourseCoverage => {
      coverage(conn, "course_key", "dim_course", "course_key")
    }
    QualityProbe::RawFactReconcile { raw_table } => reconcile(conn, raw_table.as_str()),
    QualityProbe::RawKeyUnique { raw_table } => key_unique(conn, raw_table.as_str()),
  }
}

fn identity(conn: &Connection, reason: &str) -> rusqlite::Result<Option<RawOutcome>> {
  if !table_exists(conn, "identity_map")? || !table_exists(conn, "identity_exceptions")? {
    return Ok(None);
  }

  let mapped = count(conn, "SELECT COUNT(*) FROM identity_map WHERE active = 1")?;
  let missing = count(
    conn,
    "SELECT COUNT(*) FROM identity_exceptions WHERE reason = 'missing_key'",
  )?;
  let duplicate = count(
    conn,
    "SELECT COUNT(*) FROM identity_exceptions WHERE reason = 'duplicate_key'",
  )?;

  // Missing keys are measured against every user; duplicates against users
  // that have a key at all.
  let (total, failed) = match reason {
    "missing_key" => (mapped + missing + duplicate, missing),
    _ => (mapped + duplicate, duplicate),
  };

  let mut stmt = conn.prepare(
    "SELECT source_user_id FROM identity_exceptions
     WHERE reason = ?1 ORDER BY source_user_id LIMIT ?2",
  )?;
  let samples = stmt
    .query_map(params![reason, MAX_SAMPLE_KEYS as i64], |r| r.get(0))?
    .collect::<rusqlite::Result<Vec<String>>>()?;

  Ok(Some(RawOutcome {
    total,
    failed,
    samples,
    details: json!({
      "active_mappings": mapped,
      "missing_key": missing,
      "duplicate_key": duplicate,
    }),
  }))
}

fn coverage(
  conn: &Connection,
  fk: &str,
  dim: &str,
  dim_key: &str,
) -> rusqlite::Result<Option<RawOutcome>> {
  if !table_exists(conn, "fact_submission")? || !table_exists(conn, dim)? {
    return Ok(None);
  }

  let total = count(conn, "SELECT COUNT(*) FROM fact_submission")?;
  let null_rows = count(
    conn,
    &format!("SELECT COUNT(*) FROM fact_submission WHERE {fk} IS NULL"),
  )?;
  let dangling = format!(
    "f.{fk} IS NOT NULL AND NOT EXISTS (SELECT 1 FROM {dim} d WHERE d.{dim_key} = f.{fk})"
  );
  let bad_fk_rows = count(
    conn,
    &format!("SELECT COUNT(*) FROM fact_submission f WHERE {dangling}"),
  )?;
  let samples = keys(
    conn,
    &format!(
      "SELECT f.submission_id FROM fact_submission f
       WHERE f.{fk} IS NULL OR ({dangling})
       ORDER BY f.submission_id LIMIT ?1"
    ),
  )?;

  Ok(Some(RawOutcome {
    total,
    failed: null_rows + bad_fk_rows,
    samples,
    details: json!({
      "dimension": dim,
      "null_key_rows": null_rows,
      "bad_fk_rows": bad_fk_rows,
      "covered_rows": total - null_rows - bad_fk_rows,
    }),
  }))
}

fn reconcile(conn: &Connection, raw: &str) -> rusqlite::Result<Option<RawOutcome>> {
  if !table_exists(conn, raw)? || !table_exists(conn, "fact_submission")? {
    return Ok(None);
  }

  let raw_rows = count(conn, &format!("SELECT COUNT(DISTINCT record_id) FROM \"{raw}\""))?;
  let fact_rows = count(conn, "SELECT COUNT(*) FROM fact_submission")?;
  let missing_in_fact = count(
    conn,
    &format!(
      "SELECT COUNT(DISTINCT r.record_id) FROM \"{raw}\" r
       WHERE NOT EXISTS (SELECT 1 FROM fact_submission f WHERE f.submission_id = r.record_id)"
    ),
  )?;
  let extras_in_fact = count(
    conn,
    &format!(
      "SELECT COUNT(*) FROM fact_submission f
       WHERE NOT EXISTS (SELECT 1 FROM \"{raw}\" r WHERE r.record_id = f.submission_id)"
    ),
  )?;
  let samples = keys(
    conn,
    &format!(
      "SELECT id FROM (
         SELECT r.record_id AS id FROM \"{raw}\" r
         WHERE NOT EXISTS (SELECT 1 FROM fact_submission f WHERE f.submission_id = r.record_id)
         UNION
         SELECT f.submission_id AS id FROM fact_submission f
         WHERE NOT EXISTS (SELECT 1 FROM \"{raw}\" r WHERE r.record_id = f.submission_id)
       )
       ORDER BY id LIMIT ?1"
    ),
  )?;

  Ok(Some(RawOutcome {
    total: raw_rows,
    failed: missing_in_fact + extras_in_fact,
    samples,
    details: json!({
      "raw_table": raw,
      "fact_table": "fact_submission",
      "raw_rows": raw_rows,
      "fact_rows": fact_rows,
      "diff_fact_minus_raw": fact_rows - raw_rows,
      "missing_in_fact": missing_in_fact,
      "extras_in_fact": extras_in_fact,
    }),
  }))
}

fn key_unique(conn: &Connection, raw: &str) -> rusqlite::Result<Option<RawOutcome>> {
  if !table_exists(conn, raw)? {
    return Ok(None);
  }

  let total = count(conn, &format!("SELECT COUNT(*) FROM \"{raw}\""))?;
  let distinct = count(
    conn,
    &format!("SELECT COUNT(*) FROM (SELECT DISTINCT source_name, record_id FROM \"{raw}\")"),
  )?;
  let samples = keys(
    conn,
    &format!(
      "SELECT record_id FROM \"{raw}\"
       GROUP BY source_name, record_id HAVING COUNT(*) > 1
       ORDER BY record_id, source_name LIMIT ?1"
    ),
  )?;

  Ok(Some(RawOutcome {
    total,
    failed: total - distinct,
    samples,
    details: json!({
      "raw_table": raw,
      "total_rows": total,
      "distinct_keys": distinct,
      "duplicate_rows": total - distinct,
    }),
  }))
}
