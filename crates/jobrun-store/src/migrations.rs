use jobrun_core::now_ms;
use rusqlite::Connection;
use tracing::info;

use crate::error::Result;

/// Forward-only migrations, applied in ascending version order.
///
/// Each entry is a pure DDL/DML script. A script runs inside a transaction
/// that also inserts the matching `schema_version` row, so a crash mid-way
/// leaves the ledger consistent with the schema.
const MIGRATIONS: &[(i64, &str)] = &[
    (
        1,
        "
        CREATE TABLE jobs (
            id              TEXT    NOT NULL PRIMARY KEY,
            name            TEXT    NOT NULL,
            schedule        TEXT    NOT NULL,
            script          TEXT    NOT NULL,
            job_type        TEXT    NOT NULL DEFAULT 'script',
            description     TEXT,
            enabled         INTEGER NOT NULL DEFAULT 1,
            timeout_ms      INTEGER,
            overlap_policy  TEXT    NOT NULL DEFAULT 'skip',
            on_failure      TEXT,
            on_success      TEXT,
            created_at      INTEGER NOT NULL,
            updated_at      INTEGER NOT NULL
        );
        ",
    ),
    (
        2,
        "
        CREATE TABLE runs (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            job_id       TEXT    NOT NULL REFERENCES jobs(id),
            status       TEXT    NOT NULL,
            started_at   INTEGER NOT NULL,
            finished_at  INTEGER,
            duration_ms  INTEGER,
            exit_code    INTEGER,
            tokens       INTEGER,
            result_meta  TEXT,
            error        TEXT,
            stdout_tail  TEXT,
            stderr_tail  TEXT,
            trigger      TEXT    NOT NULL DEFAULT 'schedule'
        );
        CREATE INDEX idx_runs_job_started ON runs (job_id, started_at DESC);
        CREATE INDEX idx_runs_started ON runs (started_at);
        ",
    ),
    (
        3,
        "
        CREATE TABLE state (
            ns          TEXT    NOT NULL,
            key         TEXT    NOT NULL,
            value       TEXT,
            expires_at  INTEGER,
            updated_at  INTEGER NOT NULL,
            PRIMARY KEY (ns, key)
        );
        CREATE TABLE state_items (
            ns          TEXT    NOT NULL,
            key         TEXT    NOT NULL,
            item_key    TEXT    NOT NULL,
            value       TEXT,
            updated_at  INTEGER NOT NULL,
            PRIMARY KEY (ns, key, item_key),
            FOREIGN KEY (ns, key) REFERENCES state(ns, key) ON DELETE CASCADE
        );
        ",
    ),
    (
        4,
        "
        CREATE TABLE queue_defs (
            id              TEXT    NOT NULL PRIMARY KEY,
            name            TEXT    NOT NULL,
            dedup_expr      TEXT,
            dedup_scope     TEXT    NOT NULL DEFAULT 'pending',
            max_attempts    INTEGER NOT NULL DEFAULT 1,
            retention_days  INTEGER NOT NULL DEFAULT 7
        );
        CREATE TABLE queue_items (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            queue_id      TEXT    NOT NULL,
            payload       TEXT    NOT NULL,
            status        TEXT    NOT NULL DEFAULT 'pending',
            priority      INTEGER NOT NULL DEFAULT 0,
            attempts      INTEGER NOT NULL DEFAULT 0,
            max_attempts  INTEGER NOT NULL DEFAULT 1,
            dedup_key     TEXT,
            error         TEXT,
            created_at    INTEGER NOT NULL,
            claimed_at    INTEGER,
            finished_at   INTEGER
        );
        CREATE INDEX idx_queue_items_claim
            ON queue_items (queue_id, status, priority DESC, created_at);
        CREATE INDEX idx_queue_items_dedup ON queue_items (queue_id, dedup_key);
        ",
    ),
];

/// Apply every registered migration newer than the recorded version.
///
/// Safe to call on every startup; a fully migrated store is a no-op.
pub(crate) fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version     INTEGER NOT NULL PRIMARY KEY,
            applied_at  INTEGER NOT NULL
        );",
    )?;

    let current: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;

    for (version, script) in MIGRATIONS.iter().filter(|(v, _)| *v > current) {
        let tx = conn.transaction()?;
        tx.execute_batch(script)?;
        tx.execute(
            "INSERT INTO schema_version (version, applied_at) VALUES (?1, ?2)",
            rusqlite::params![version, now_ms()],
        )?;
        tx.commit()?;
        info!(version, "applied schema migration");
    }

    Ok(())
}
