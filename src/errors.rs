use thiserror::Error;

/// Errors surfaced by the queue API.
///
/// Child-process outcomes (spawn failure, timeout, non-zero exit) are not
/// errors at this layer; the worker records them as failed attempts through
/// [`crate::Queue::mark_job_failed`].
#[derive(Debug, Error)]
pub enum QueueError {
    /// The job specification was malformed (missing or empty command,
    /// negative retry budget, unparseable `run_at`).
    #[error("invalid job spec: {0}")]
    InvalidInput(String),

    /// An enqueue collided with an existing job id.
    #[error("job id already exists: {0}")]
    DuplicateId(String),

    /// The referenced job does not exist, or is not in the required state.
    #[error("not found: {0}")]
    NotFound(String),

    /// The underlying store raised.
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}
