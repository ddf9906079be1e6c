//! Database bootstrap
//!
//! Pool construction and schema initialization for the engine's embedded
//! SQLite database. The binding uniqueness invariants live here as unique
//! indexes so that separate worker processes sharing the database file
//! serialize create/lookup races through the storage layer, not through
//! in-process locks.

use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tracing::debug;

/// Open (creating if missing) the engine database at the given path.
pub async fn connect(path: &Path) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5))
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    debug!(path = %path.display(), "Opened engine database");
    Ok(pool)
}

/// Create the engine schema if it does not exist yet.
///
/// Idempotent; safe to run on every startup.
pub async fn init_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS local_records (
            id            BLOB PRIMARY KEY,
            kind          TEXT NOT NULL,
            business_key  TEXT,
            payload       TEXT NOT NULL,
            active        INTEGER NOT NULL DEFAULT 1,
            created_at    TEXT NOT NULL,
            updated_at    TEXT NOT NULL
        )
        ",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r"
        CREATE UNIQUE INDEX IF NOT EXISTS ux_local_records_kind_key
            ON local_records (kind, business_key)
            WHERE business_key IS NOT NULL
        ",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS bindings (
            id              BLOB PRIMARY KEY,
            backend_id      BLOB NOT NULL,
            kind            TEXT NOT NULL,
            local_id        BLOB NOT NULL REFERENCES local_records (id),
            external_id     TEXT,
            state           TEXT NOT NULL,
            last_synced_at  TEXT,
            last_error      TEXT,
            created_at      TEXT NOT NULL,
            updated_at      TEXT NOT NULL
        )
        ",
    )
    .execute(pool)
    .await?;

    // One live binding per local record and per external id, per backend
    // and kind. NULL external ids (pending export) are exempt.
    sqlx::query(
        r"
        CREATE UNIQUE INDEX IF NOT EXISTS ux_bindings_local
            ON bindings (backend_id, kind, local_id)
        ",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r"
        CREATE UNIQUE INDEX IF NOT EXISTS ux_bindings_external
            ON bindings (backend_id, kind, external_id)
            WHERE external_id IS NOT NULL
        ",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS jobs (
            id            BLOB PRIMARY KEY,
            backend_id    BLOB NOT NULL,
            kind          TEXT NOT NULL,
            op            TEXT NOT NULL,
            payload       TEXT NOT NULL,
            priority      INTEGER NOT NULL,
            state         TEXT NOT NULL,
            retry_count   INTEGER NOT NULL DEFAULT 0,
            max_retries   INTEGER NOT NULL,
            next_run_at   TEXT NOT NULL,
            last_error    TEXT,
            created_at    TEXT NOT NULL,
            started_at    TEXT,
            finished_at   TEXT,
            updated_at    TEXT NOT NULL
        )
        ",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r"
        CREATE INDEX IF NOT EXISTS ix_jobs_dequeue
            ON jobs (state, next_run_at, priority, created_at)
        ",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS job_attempts (
            job_id          BLOB NOT NULL REFERENCES jobs (id),
            attempt_number  INTEGER NOT NULL,
            error           TEXT NOT NULL,
            failed_at       TEXT NOT NULL,
            PRIMARY KEY (job_id, attempt_number)
        )
        ",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS checkpoints (
            id           BLOB PRIMARY KEY,
            backend_id   BLOB NOT NULL,
            kind         TEXT,
            local_id     BLOB,
            external_id  TEXT,
            reason       TEXT NOT NULL,
            message      TEXT NOT NULL,
            job_id       BLOB,
            created_at   TEXT NOT NULL
        )
        ",
    )
    .execute(pool)
    .await?;

    debug!("Engine schema initialized");
    Ok(())
}
