use crate::clock;
use crate::config::Config;
use crate::errors::QueueError;
use crate::schema::{Job, JobLog, JobMetric, JobState};
use crate::storage;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::collections::BTreeMap;
use tracing::debug;
use uuid::Uuid;

/// A job specification as accepted on enqueue.
///
/// `run_at` strings without a timezone designator are interpreted at the
/// fixed +05:30 local offset (see [`crate::clock::LOCAL_UTC_OFFSET_SECS`]).
#[derive(Debug, Clone, Deserialize)]
pub struct JobSpec {
    /// Caller-supplied id; a UUID is generated when absent.
    #[serde(default)]
    pub id: Option<String>,
    /// The shell command line to execute.
    pub command: String,
    /// Retry budget; defaults to the `max_retries` config value.
    #[serde(default)]
    pub max_retries: Option<i64>,
    /// Dispatch priority; smaller value runs first. Defaults to 100.
    #[serde(default)]
    pub priority: Option<i64>,
    /// Earliest execution time; enqueue as `scheduled` when in the future.
    #[serde(default)]
    pub run_at: Option<String>,
}

impl JobSpec {
    /// Build a spec for a bare command with all defaults.
    pub fn command(command: impl Into<String>) -> Self {
        Self { id: None, command: command.into(), max_retries: None, priority: None, run_at: None }
    }
}

/// Queue-state histogram plus the count of immediately runnable jobs.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSummary {
    /// Jobs per state, every state present even when zero.
    pub states: BTreeMap<String, i64>,
    /// Pending jobs whose due times have arrived.
    pub ready_pending: i64,
}

/// The state-machine façade over the store.
///
/// `Queue` is the sole authority on job-state transitions; workers never
/// mutate job rows directly. Every mutating operation is a single atomic
/// statement, so partial state is impossible.
#[derive(Clone)]
pub struct Queue {
    pool: SqlitePool,
    config: Config,
}

impl Queue {
    /// Wrap a pool in the queue API.
    pub fn new(pool: SqlitePool) -> Self {
        let config = Config::new(pool.clone());
        Self { pool, config }
    }

    /// Insert a new job and return its id.
    ///
    /// The job is born `scheduled` when `run_at` is strictly in the future,
    /// `pending` otherwise. Fails with [`QueueError::DuplicateId`] when the
    /// id already exists.
    pub async fn enqueue(&self, spec: JobSpec) -> Result<String, QueueError> {
        let command = spec.command.trim();
        if command.is_empty() {
            return Err(QueueError::InvalidInput("command must not be empty".into()));
        }

        let max_retries = match spec.max_retries {
            Some(n) if n >= 0 => n,
            Some(n) => {
                return Err(QueueError::InvalidInput(format!("max_retries must be >= 0, got {n}")))
            }
            None => self.config.get_i64("max_retries", 3).await?,
        };

        let id = spec.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let run_at = spec.run_at.as_deref().map(clock::parse_run_at).transpose()?;
        let now = clock::now_iso();

        let state = match &run_at {
            Some(t) if t.as_str() > now.as_str() => JobState::Scheduled,
            _ => JobState::Pending,
        };

        let job = Job {
            id: id.clone(),
            command: command.to_string(),
            state: state.as_str().to_string(),
            attempts: 0,
            max_retries,
            priority: spec.priority.unwrap_or(100),
            created_at: now.clone(),
            updated_at: now,
            run_at,
            next_run_at: None,
            worker_id: None,
            last_error: None,
        };

        storage::insert_job(&self.pool, &job).await.map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                QueueError::DuplicateId(id.clone())
            }
            other => QueueError::from(other),
        })?;

        debug!(job.id = %id, state = %state, "enqueued");
        Ok(id)
    }

    /// The dispatch primitive: select and atomically claim at most one job.
    ///
    /// The claim is a conditional update on `state = 'pending'`; when the
    /// affected-row count is zero another worker won the race and `None` is
    /// returned. No application-level locking is involved.
    pub async fn fetch_next_job(&self, worker_id: &str) -> Result<Option<Job>, QueueError> {
        let now = clock::now_iso();

        let Some(candidate) = storage::find_claimable_job(&self.pool, &now).await? else {
            return Ok(None);
        };

        if storage::claim_job(&self.pool, &candidate.id, worker_id, &now).await? == 0 {
            return Ok(None);
        }

        Ok(storage::get_job(&self.pool, &candidate.id).await?)
    }

    /// Transition a job to `completed`. Terminal.
    pub async fn mark_job_completed(&self, id: &str) -> Result<(), QueueError> {
        if storage::mark_completed(&self.pool, id, &clock::now_iso()).await? == 0 {
            return Err(QueueError::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// Record a failed attempt.
    ///
    /// The caller passes `attempts` already incremented for this attempt and
    /// the computed backoff. The job goes `dead` once `attempts` exceeds
    /// `max_retries` (the `max_retries + 1`-th failure); otherwise it waits
    /// out `backoff_seconds` before reactivation.
    pub async fn mark_job_failed(
        &self,
        id: &str,
        last_error: &str,
        attempts: i64,
        max_retries: i64,
        backoff_seconds: i64,
    ) -> Result<(), QueueError> {
        let now = clock::now_iso();
        let rows = if attempts > max_retries {
            storage::mark_dead(&self.pool, id, attempts, last_error, &now).await?
        } else {
            let next_run_at = clock::iso_after(backoff_seconds);
            storage::mark_waiting(&self.pool, id, attempts, last_error, &next_run_at, &now).await?
        };
        if rows == 0 {
            return Err(QueueError::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// Promote `scheduled` jobs whose `run_at` has arrived. Idempotent;
    /// returns the number of rows promoted.
    pub async fn activate_scheduled_jobs(&self) -> Result<u64, QueueError> {
        Ok(storage::activate_scheduled(&self.pool, &clock::now_iso()).await?)
    }

    /// Promote `waiting` jobs whose backoff has elapsed. Idempotent;
    /// returns the number of rows promoted.
    pub async fn reactivate_waiting_jobs(&self) -> Result<u64, QueueError> {
        Ok(storage::reactivate_waiting(&self.pool, &clock::now_iso()).await?)
    }

    /// Reclaim jobs left in `processing` by an unclean shutdown.
    ///
    /// They re-enter the pool as `pending` without an attempts increment.
    pub async fn recover_orphaned_jobs(&self) -> Result<u64, QueueError> {
        Ok(storage::recover_orphaned(&self.pool, &clock::now_iso()).await?)
    }

    /// Retry one dead job, or every dead job when `id` is `None`.
    ///
    /// Retried jobs return to `pending` with `attempts = 0` and a cleared
    /// error. Returns the number of jobs transitioned; a named id that is
    /// not a dead job is [`QueueError::NotFound`].
    pub async fn retry_dead_job(&self, id: Option<&str>) -> Result<u64, QueueError> {
        let now = clock::now_iso();
        match id {
            Some(id) => {
                let rows = storage::retry_dead(&self.pool, id, &now).await?;
                if rows == 0 {
                    return Err(QueueError::NotFound(format!("no dead job with id {id}")));
                }
                Ok(rows)
            }
            None => Ok(storage::retry_all_dead(&self.pool, &now).await?),
        }
    }

    /// Delete every dead job (logs cascade). Returns the count removed.
    pub async fn clear_dead_jobs(&self) -> Result<u64, QueueError> {
        Ok(storage::delete_dead(&self.pool).await?)
    }

    /// Fetch a job by id.
    pub async fn get_job(&self, id: &str) -> Result<Option<Job>, QueueError> {
        Ok(storage::get_job(&self.pool, id).await?)
    }

    /// List jobs, optionally filtered by state, newest first.
    pub async fn list_jobs(&self, state: Option<JobState>) -> Result<Vec<Job>, QueueError> {
        Ok(storage::list_jobs(&self.pool, state.map(JobState::as_str)).await?)
    }

    /// List the dead-letter queue.
    pub async fn list_dead_jobs(&self) -> Result<Vec<Job>, QueueError> {
        self.list_jobs(Some(JobState::Dead)).await
    }

    /// Per-state histogram plus the immediately runnable count.
    pub async fn status_summary(&self) -> Result<StatusSummary, QueueError> {
        let mut states: BTreeMap<String, i64> =
            JobState::ALL.iter().map(|s| (s.as_str().to_string(), 0)).collect();
        for (state, count) in storage::state_counts(&self.pool).await? {
            // Fold legacy names onto their canonical state.
            let key = JobState::parse(&state)
                .map(|s| s.as_str().to_string())
                .unwrap_or(state);
            *states.entry(key).or_insert(0) += count;
        }
        let ready_pending = storage::count_ready_pending(&self.pool, &clock::now_iso()).await?;
        Ok(StatusSummary { states, ready_pending })
    }

    /// Append a log line to a job.
    pub async fn add_job_log(&self, job_id: &str, message: &str) -> Result<(), QueueError> {
        Ok(storage::insert_log(&self.pool, job_id, message, &clock::now_iso()).await?)
    }

    /// All log lines for a job. [`QueueError::NotFound`] for an unknown id.
    pub async fn get_job_logs(&self, job_id: &str) -> Result<Vec<JobLog>, QueueError> {
        if storage::get_job(&self.pool, job_id).await?.is_none() {
            return Err(QueueError::NotFound(job_id.to_string()));
        }
        Ok(storage::logs_for_job(&self.pool, job_id).await?)
    }

    /// Record the execution summary for a job, overwriting any earlier
    /// attempt's row.
    pub async fn record_metric(&self, metric: &JobMetric) -> Result<(), QueueError> {
        Ok(storage::upsert_metric(&self.pool, metric).await?)
    }

    /// All execution summaries, most recent first.
    pub async fn list_metrics(&self) -> Result<Vec<JobMetric>, QueueError> {
        Ok(storage::list_metrics(&self.pool).await?)
    }
}
