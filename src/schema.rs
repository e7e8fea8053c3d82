//! Database schema definitions.
//!
//! Row types for the job queue tables. Timestamps are fixed-width ISO-8601
//! UTC strings (see [`crate::clock`]); state columns hold the lowercase
//! [`JobState`] names.

use serde::Serialize;
use sqlx::FromRow;
use std::fmt;

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// `run_at` is in the future; not yet eligible for dispatch.
    Scheduled,
    /// Eligible for dispatch as soon as a worker claims it.
    Pending,
    /// Claimed by exactly one worker; `worker_id` is set.
    Processing,
    /// A failed attempt is waiting out its retry backoff (`next_run_at`).
    Waiting,
    /// Terminal: the command exited 0.
    Completed,
    /// Terminal: retries exhausted; parked in the dead-letter queue.
    Dead,
}

impl JobState {
    /// Every state, in lifecycle order.
    pub const ALL: [JobState; 6] = [
        JobState::Scheduled,
        JobState::Pending,
        JobState::Processing,
        JobState::Waiting,
        JobState::Completed,
        JobState::Dead,
    ];

    /// The stored column value.
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Scheduled => "scheduled",
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Waiting => "waiting",
            JobState::Completed => "completed",
            JobState::Dead => "dead",
        }
    }

    /// Parse a stored or user-supplied state name.
    ///
    /// `failed` is accepted as a synonym for [`JobState::Waiting`]: older
    /// databases used that name for the retry-wait state.
    pub fn parse(s: &str) -> Option<JobState> {
        match s {
            "scheduled" => Some(JobState::Scheduled),
            "pending" => Some(JobState::Pending),
            "processing" => Some(JobState::Processing),
            "waiting" | "failed" => Some(JobState::Waiting),
            "completed" => Some(JobState::Completed),
            "dead" => Some(JobState::Dead),
            _ => None,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A job row: one shell command plus its lifecycle metadata.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Job {
    /// Globally unique opaque identifier.
    pub id: String,
    /// The shell command line to execute. Opaque to the queue.
    pub command: String,
    /// Current [`JobState`] name.
    pub state: String,
    /// Completed execution attempts.
    pub attempts: i64,
    /// Cap on retried attempts after the first.
    pub max_retries: i64,
    /// Dispatch priority; smaller value runs first.
    pub priority: i64,
    /// Insertion time.
    pub created_at: String,
    /// Advanced on every transition.
    pub updated_at: String,
    /// Earliest time the job may first execute, if scheduled.
    pub run_at: Option<String>,
    /// Earliest time a retry-waiting job becomes runnable.
    pub next_run_at: Option<String>,
    /// Set while `state = processing`, null otherwise.
    pub worker_id: Option<String>,
    /// Most recent failure reason.
    pub last_error: Option<String>,
}

/// An append-only log line attached to a job.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct JobLog {
    /// Insertion-ordered row id.
    pub id: i64,
    /// Owning job; deletion cascades with it.
    pub job_id: String,
    /// The log line.
    pub message: String,
    /// Insertion time.
    pub created_at: String,
}

/// One execution summary per job, upserted on every attempt.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct JobMetric {
    /// Owning job; primary key, so retries overwrite rather than accumulate.
    pub job_id: String,
    /// The command that ran.
    pub command: String,
    /// Terminal classification: `completed`, `failed` or `timeout`.
    pub state: String,
    /// Wall-clock seconds from spawn to exit.
    pub duration: f64,
    /// The worker that ran the attempt.
    pub worker_id: String,
    /// When the attempt finished.
    pub completed_at: String,
}

/// A registered worker with its liveness heartbeat.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct WorkerRow {
    /// Worker id of the form `worker-<epoch_ms>-<rand5>-<i>`.
    pub id: String,
    /// When the worker was started.
    pub started_at: String,
    /// Advanced every two seconds while the worker lives.
    pub last_heartbeat: String,
}
