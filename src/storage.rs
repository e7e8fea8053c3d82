use crate::schema::{Job, JobLog, JobMetric};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::time::Duration;

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS jobs (
    id          TEXT PRIMARY KEY,
    command     TEXT NOT NULL,
    state       TEXT NOT NULL,
    attempts    INTEGER NOT NULL DEFAULT 0,
    max_retries INTEGER NOT NULL DEFAULT 3,
    priority    INTEGER NOT NULL DEFAULT 100,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL,
    run_at      TEXT,
    next_run_at TEXT,
    worker_id   TEXT,
    last_error  TEXT
);

CREATE INDEX IF NOT EXISTS idx_jobs_state ON jobs (state);
CREATE INDEX IF NOT EXISTS idx_jobs_dispatch ON jobs (state, priority, created_at);

CREATE TABLE IF NOT EXISTS job_logs (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id     TEXT NOT NULL REFERENCES jobs (id) ON DELETE CASCADE,
    message    TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_job_logs_job ON job_logs (job_id);

CREATE TABLE IF NOT EXISTS job_metrics (
    job_id       TEXT PRIMARY KEY,
    command      TEXT NOT NULL,
    state        TEXT NOT NULL,
    duration     REAL NOT NULL,
    worker_id    TEXT NOT NULL,
    completed_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS config (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS workers (
    id             TEXT PRIMARY KEY,
    started_at     TEXT NOT NULL,
    last_heartbeat TEXT NOT NULL
);
";

/// Config defaults seeded on first boot. Existing values are left alone.
const CONFIG_DEFAULTS: &[(&str, &str)] =
    &[("max_retries", "3"), ("backoff_base", "2"), ("job_timeout", "300")];

/// Open the queue database, creating the file if necessary.
///
/// WAL journaling keeps an unclean shutdown from corrupting the database;
/// the busy timeout serialises concurrent writers instead of failing them.
pub async fn connect(path: &Path) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));

    SqlitePoolOptions::new().max_connections(5).connect_with(options).await
}

/// Create the queue tables and seed config defaults.
pub async fn setup_database(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(SCHEMA).execute(pool).await?;

    for (key, value) in CONFIG_DEFAULTS {
        sqlx::query("INSERT OR IGNORE INTO config (key, value) VALUES (?, ?)")
            .bind(key)
            .bind(value)
            .execute(pool)
            .await?;
    }

    Ok(())
}

/// Insert a freshly built job row.
pub(crate) async fn insert_job(pool: &SqlitePool, job: &Job) -> Result<(), sqlx::Error> {
    sqlx::query(
        r"
        INSERT INTO jobs (id, command, state, attempts, max_retries, priority,
                          created_at, updated_at, run_at, next_run_at, worker_id, last_error)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ",
    )
    .bind(&job.id)
    .bind(&job.command)
    .bind(&job.state)
    .bind(job.attempts)
    .bind(job.max_retries)
    .bind(job.priority)
    .bind(&job.created_at)
    .bind(&job.updated_at)
    .bind(&job.run_at)
    .bind(&job.next_run_at)
    .bind(&job.worker_id)
    .bind(&job.last_error)
    .execute(pool)
    .await?;
    Ok(())
}

/// Find the next claimable pending job without claiming it.
///
/// Ordering: priority ascending (smaller = more urgent), then jobs with an
/// explicit `run_at` before jobs without, then `run_at`, then `created_at`.
pub(crate) async fn find_claimable_job(
    pool: &SqlitePool,
    now: &str,
) -> Result<Option<Job>, sqlx::Error> {
    sqlx::query_as::<_, Job>(
        r"
        SELECT * FROM jobs
        WHERE state = 'pending'
          AND (run_at IS NULL OR run_at <= ?)
          AND (next_run_at IS NULL OR next_run_at <= ?)
        ORDER BY priority ASC, run_at IS NULL ASC, run_at ASC, created_at ASC
        LIMIT 1
        ",
    )
    .bind(now)
    .bind(now)
    .fetch_optional(pool)
    .await
}

/// The claim primitive: conditionally bind a pending job to a worker.
///
/// Returns the affected-row count; zero means another worker won the race.
pub(crate) async fn claim_job(
    pool: &SqlitePool,
    id: &str,
    worker_id: &str,
    now: &str,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE jobs SET state = 'processing', worker_id = ?, updated_at = ? \
         WHERE id = ? AND state = 'pending'",
    )
    .bind(worker_id)
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Transition a job to `completed`.
pub(crate) async fn mark_completed(
    pool: &SqlitePool,
    id: &str,
    now: &str,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE jobs SET state = 'completed', worker_id = NULL, updated_at = ? WHERE id = ?",
    )
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Transition a failed job into its retry-backoff wait.
pub(crate) async fn mark_waiting(
    pool: &SqlitePool,
    id: &str,
    attempts: i64,
    last_error: &str,
    next_run_at: &str,
    now: &str,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE jobs SET state = 'waiting', attempts = ?, last_error = ?, \
         next_run_at = ?, worker_id = NULL, updated_at = ? WHERE id = ?",
    )
    .bind(attempts)
    .bind(last_error)
    .bind(next_run_at)
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Transition a job whose retries are exhausted into the dead-letter queue.
pub(crate) async fn mark_dead(
    pool: &SqlitePool,
    id: &str,
    attempts: i64,
    last_error: &str,
    now: &str,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE jobs SET state = 'dead', attempts = ?, last_error = ?, \
         next_run_at = NULL, worker_id = NULL, updated_at = ? WHERE id = ?",
    )
    .bind(attempts)
    .bind(last_error)
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Promote scheduled jobs whose `run_at` has arrived.
pub(crate) async fn activate_scheduled(
    pool: &SqlitePool,
    now: &str,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE jobs SET state = 'pending', updated_at = ? \
         WHERE state = 'scheduled' AND run_at <= ?",
    )
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Promote retry-waiting jobs whose backoff has elapsed.
///
/// Matches legacy `failed` rows as well as `waiting` ones.
pub(crate) async fn reactivate_waiting(
    pool: &SqlitePool,
    now: &str,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE jobs SET state = 'pending', updated_at = ? \
         WHERE state IN ('waiting', 'failed') AND next_run_at <= ?",
    )
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Return one dead job to `pending` with a fresh attempt budget.
pub(crate) async fn retry_dead(
    pool: &SqlitePool,
    id: &str,
    now: &str,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE jobs SET state = 'pending', attempts = 0, next_run_at = NULL, \
         last_error = NULL, updated_at = ? WHERE id = ? AND state = 'dead'",
    )
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Return every dead job to `pending`.
pub(crate) async fn retry_all_dead(pool: &SqlitePool, now: &str) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE jobs SET state = 'pending', attempts = 0, next_run_at = NULL, \
         last_error = NULL, updated_at = ? WHERE state = 'dead'",
    )
    .bind(now)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Physically delete the dead-letter queue. Log rows cascade.
pub(crate) async fn delete_dead(pool: &SqlitePool) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM jobs WHERE state = 'dead'").execute(pool).await?;
    Ok(result.rows_affected())
}

/// Reclaim jobs orphaned in `processing` by an unclean shutdown.
///
/// Attempts are left untouched; the reclaimed job re-enters the pool as
/// `pending` (at-least-once delivery).
pub(crate) async fn recover_orphaned(pool: &SqlitePool, now: &str) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE jobs SET state = 'pending', worker_id = NULL, updated_at = ? \
         WHERE state = 'processing'",
    )
    .bind(now)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Fetch a job by id.
pub(crate) async fn get_job(pool: &SqlitePool, id: &str) -> Result<Option<Job>, sqlx::Error> {
    sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
}

/// List jobs, optionally filtered by state, newest first.
pub(crate) async fn list_jobs(
    pool: &SqlitePool,
    state: Option<&str>,
) -> Result<Vec<Job>, sqlx::Error> {
    match state {
        Some(state) => {
            sqlx::query_as::<_, Job>(
                "SELECT * FROM jobs WHERE state = ? ORDER BY created_at DESC, id",
            )
            .bind(state)
            .fetch_all(pool)
            .await
        }
        None => {
            sqlx::query_as::<_, Job>("SELECT * FROM jobs ORDER BY created_at DESC, id")
                .fetch_all(pool)
                .await
        }
    }
}

/// Per-state job counts.
pub(crate) async fn state_counts(pool: &SqlitePool) -> Result<Vec<(String, i64)>, sqlx::Error> {
    sqlx::query_as::<_, (String, i64)>("SELECT state, COUNT(*) FROM jobs GROUP BY state")
        .fetch_all(pool)
        .await
}

/// Count pending jobs whose due times have arrived.
pub(crate) async fn count_ready_pending(
    pool: &SqlitePool,
    now: &str,
) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>(
        r"
        SELECT COUNT(*) FROM jobs
        WHERE state = 'pending'
          AND (run_at IS NULL OR run_at <= ?)
          AND (next_run_at IS NULL OR next_run_at <= ?)
        ",
    )
    .bind(now)
    .bind(now)
    .fetch_one(pool)
    .await
}

/// Append one log line for a job.
pub(crate) async fn insert_log(
    pool: &SqlitePool,
    job_id: &str,
    message: &str,
    now: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query("INSERT INTO job_logs (job_id, message, created_at) VALUES (?, ?, ?)")
        .bind(job_id)
        .bind(message)
        .bind(now)
        .execute(pool)
        .await?;
    Ok(())
}

/// All log lines for a job, in insertion order.
pub(crate) async fn logs_for_job(
    pool: &SqlitePool,
    job_id: &str,
) -> Result<Vec<JobLog>, sqlx::Error> {
    sqlx::query_as::<_, JobLog>("SELECT * FROM job_logs WHERE job_id = ? ORDER BY id ASC")
        .bind(job_id)
        .fetch_all(pool)
        .await
}

/// Insert-or-update the execution summary for a job.
///
/// Keyed by `job_id` so that retries overwrite instead of accumulating.
pub(crate) async fn upsert_metric(
    pool: &SqlitePool,
    metric: &JobMetric,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r"
        INSERT INTO job_metrics (job_id, command, state, duration, worker_id, completed_at)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT (job_id) DO UPDATE SET
            command = excluded.command,
            state = excluded.state,
            duration = excluded.duration,
            worker_id = excluded.worker_id,
            completed_at = excluded.completed_at
        ",
    )
    .bind(&metric.job_id)
    .bind(&metric.command)
    .bind(&metric.state)
    .bind(metric.duration)
    .bind(&metric.worker_id)
    .bind(&metric.completed_at)
    .execute(pool)
    .await?;
    Ok(())
}

/// All execution summaries, most recent first.
pub(crate) async fn list_metrics(pool: &SqlitePool) -> Result<Vec<JobMetric>, sqlx::Error> {
    sqlx::query_as::<_, JobMetric>("SELECT * FROM job_metrics ORDER BY completed_at DESC")
        .fetch_all(pool)
        .await
}

/// Register a worker, or refresh its heartbeat if the row already exists.
pub(crate) async fn upsert_worker(
    pool: &SqlitePool,
    id: &str,
    now: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r"
        INSERT INTO workers (id, started_at, last_heartbeat) VALUES (?, ?, ?)
        ON CONFLICT (id) DO UPDATE SET last_heartbeat = excluded.last_heartbeat
        ",
    )
    .bind(id)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}

/// Advance a worker's heartbeat.
pub(crate) async fn touch_worker(
    pool: &SqlitePool,
    id: &str,
    now: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE workers SET last_heartbeat = ? WHERE id = ?")
        .bind(now)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Remove a worker's registration row.
pub(crate) async fn delete_worker(pool: &SqlitePool, id: &str) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM workers WHERE id = ?").bind(id).execute(pool).await?;
    Ok(())
}

/// Read one config value.
pub(crate) async fn get_config(
    pool: &SqlitePool,
    key: &str,
) -> Result<Option<String>, sqlx::Error> {
    sqlx::query_scalar::<_, String>("SELECT value FROM config WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await
}

/// Upsert one config value.
pub(crate) async fn set_config(
    pool: &SqlitePool,
    key: &str,
    value: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO config (key, value) VALUES (?, ?) \
         ON CONFLICT (key) DO UPDATE SET value = excluded.value",
    )
    .bind(key)
    .bind(value)
    .execute(pool)
    .await?;
    Ok(())
}
