//! SQL schema for the Sluice SQLite store.
//!
//! Executed once at connection startup. Raw tables are not part of it: they
//! are created on demand per source table, see [`raw_table_ddl`].

/// Full schema DDL; idempotent thanks to `IF NOT EXISTS`.
pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS watermarks (
    source_name     TEXT PRIMARY KEY,
    last_updated_at TEXT,            -- NULL: no watermark yet
    updated_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS quarantined_records (
    quarantine_id  INTEGER PRIMARY KEY AUTOINCREMENT,
    source_name    TEXT NOT NULL,
    record_id      TEXT NOT NULL,
    payload        TEXT NOT NULL,
    reason         TEXT NOT NULL,
    quarantined_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS quarantined_source_idx
    ON quarantined_records(source_name);

-- One internal id per source user, allocated once and never reused.
CREATE TABLE IF NOT EXISTS identities (
    internal_id    INTEGER PRIMARY KEY AUTOINCREMENT,
    source_user_id TEXT NOT NULL UNIQUE,
    created_at     TEXT NOT NULL
);

-- Mappings are deactivated, never deleted.
CREATE TABLE IF NOT EXISTS identity_map (
    mapping_id           INTEGER PRIMARY KEY AUTOINCREMENT,
    internal_id          INTEGER NOT NULL REFERENCES identities(internal_id),
    source_user_id       TEXT NOT NULL,
    normalized_match_key TEXT NOT NULL,
    match_method         TEXT NOT NULL,
    match_confidence     REAL NOT NULL,
    active               INTEGER NOT NULL DEFAULT 1,
    created_at           TEXT NOT NULL,
    updated_at           TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS identity_map_active_key_idx
    ON identity_map(normalized_match_key) WHERE active = 1;
CREATE UNIQUE INDEX IF NOT EXISTS identity_map_active_user_idx
    ON identity_map(source_user_id) WHERE active = 1;

CREATE TABLE IF NOT EXISTS identity_exceptions (
    source_user_id         TEXT PRIMARY KEY,
    reason                 TEXT NOT NULL CHECK (reason IN ('missing_key', 'duplicate_key')),
    normalized_match_key   TEXT,
    representative_user_id TEXT,
    detected_at            TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS dim_student (
    student_key      INTEGER PRIMARY KEY AUTOINCREMENT,
    internal_id      INTEGER NOT NULL UNIQUE,
    source_user_id   TEXT NOT NULL,
    email_normalized TEXT NOT NULL,
    match_method     TEXT NOT NULL,
    match_confidence REAL NOT NULL,
    created_at       TEXT NOT NULL,
    updated_at       TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS dim_course (
    course_key     INTEGER PRIMARY KEY AUTOINCREMENT,
    course_id      TEXT NOT NULL UNIQUE,
    name           TEXT,
    course_code    TEXT,
    workflow_state TEXT,
    start_at       TEXT,
    end_at         TEXT,
    term_name      TEXT,
    sis_course_id  TEXT,
    account_id     TEXT,
    raw_updated_at TEXT,
    created_at     TEXT NOT NULL,
    updated_at     TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS fact_submission (
    submission_id    TEXT PRIMARY KEY,
    student_key      INTEGER REFERENCES dim_student(student_key),
    course_key       INTEGER REFERENCES dim_course(course_key),
    source_user_id   TEXT,
    course_id        TEXT,
    assignment_id    TEXT,
    submitted_at     TEXT,
    graded_at        TEXT,
    score            REAL,
    attempt          INTEGER,
    late             INTEGER,
    missing          INTEGER,
    due_at           TEXT,
    on_time          INTEGER,
    workflow_state   TEXT,
    student_resolved INTEGER NOT NULL,
    course_resolved  INTEGER NOT NULL,
    raw_updated_at   TEXT,
    created_at       TEXT NOT NULL,
    updated_at       TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS fact_submission_student_idx ON fact_submission(student_key);
CREATE INDEX IF NOT EXISTS fact_submission_course_idx  ON fact_submission(course_key);

CREATE TABLE IF NOT EXISTS pipeline_state (
    key        TEXT PRIMARY KEY,
    value      TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Snapshots and change events are append-only.
CREATE TABLE IF NOT EXISTS schema_snapshots (
    snapshot_id INTEGER PRIMARY KEY AUTOINCREMENT,
    table_name  TEXT NOT NULL,
    present     INTEGER NOT NULL,
    columns     TEXT NOT NULL,       -- JSON array of column descriptors
    fingerprint TEXT NOT NULL,
    captured_at TEXT NOT NULL,
    run_id      TEXT
);

CREATE INDEX IF NOT EXISTS schema_snapshots_table_idx
    ON schema_snapshots(table_name, snapshot_id);

CREATE TABLE IF NOT EXISTS schema_changes (
    change_id   INTEGER PRIMARY KEY AUTOINCREMENT,
    table_name  TEXT NOT NULL,
    change_kind TEXT NOT NULL,
    detail      TEXT NOT NULL,       -- JSON
    detected_at TEXT NOT NULL,
    run_id      TEXT
);

CREATE TABLE IF NOT EXISTS runs (
    run_id       TEXT PRIMARY KEY,
    job_name     TEXT NOT NULL,
    status       TEXT NOT NULL CHECK (status IN ('running', 'success', 'failed')),
    start_time   TEXT NOT NULL,
    end_time     TEXT,
    duration_ms  INTEGER,
    metrics      TEXT NOT NULL DEFAULT '{}',
    error_detail TEXT
);

CREATE INDEX IF NOT EXISTS runs_job_idx ON runs(job_name, start_time);

-- Append-only.
CREATE TABLE IF NOT EXISTS quality_results (
    result_id        INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id           TEXT NOT NULL REFERENCES runs(run_id),
    check_name       TEXT NOT NULL,
    table_name       TEXT NOT NULL,
    severity         TEXT NOT NULL CHECK (severity IN ('info', 'warn', 'error')),
    failed_row_count INTEGER NOT NULL,
    total_row_count  INTEGER,
    sample_keys      TEXT NOT NULL DEFAULT '[]',
    details          TEXT NOT NULL DEFAULT 'null',
    created_at       TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS quality_results_run_idx ON quality_results(run_id);

CREATE VIEW IF NOT EXISTS v_latest_runs AS
SELECT r.run_id, r.job_name, r.status, r.start_time, r.end_time,
       r.duration_ms, r.metrics, r.error_detail
FROM runs r
WHERE r.rowid = (
    SELECT r2.rowid FROM runs r2
    WHERE r2.job_name = r.job_name
    ORDER BY r2.start_time DESC, r2.rowid DESC
    LIMIT 1
);

CREATE VIEW IF NOT EXISTS v_latest_quality AS
SELECT q.result_id, q.run_id, q.check_name, q.table_name, q.severity,
       q.failed_row_count, q.total_row_count, q.sample_keys, q.details,
       q.created_at
FROM quality_results q
WHERE q.result_id = (
    SELECT MAX(q2.result_id) FROM quality_results q2
    WHERE q2.check_name = q.check_name AND q2.table_name = q.table_name
);

CREATE VIEW IF NOT EXISTS v_recent_schema_changes AS
SELECT change_id, table_name, change_kind, detail, detected_at, run_id
FROM schema_changes
ORDER BY change_id DESC
LIMIT 100;

PRAGMA user_version = 1;
";

/// DDL for one raw table. `table` must already be a validated identifier.
pub fn raw_table_ddl(table: &str) -> String {
  format!(
    "CREATE TABLE IF NOT EXISTS \"{table}\" (
         source_name       TEXT NOT NULL,
         record_id         TEXT NOT NULL,
         payload           TEXT NOT NULL,
         record_updated_at TEXT,
         ingested_at       TEXT NOT NULL,
         PRIMARY KEY (source_name, record_id)
     );
     CREATE INDEX IF NOT EXISTS \"{table}_ingested_idx\" ON \"{table}\"(ingested_at);"
  )
}
