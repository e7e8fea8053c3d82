#![allow(missing_docs)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::indexing_slicing)]

use claims::{assert_none, assert_some};
use jobq::schema::Job;
use jobq::{Config, JobSpec, Queue, WorkerManager};
use sqlx::SqlitePool;
use std::time::Duration;
use tempfile::TempDir;

/// Test utilities and common setup
mod test_utils {
    use super::*;

    pub(super) async fn setup() -> anyhow::Result<(Queue, SqlitePool, TempDir)> {
        let dir = tempfile::tempdir()?;
        let pool = jobq::connect(&dir.path().join("queue.sqlite")).await?;
        jobq::setup_database(&pool).await?;
        Ok((Queue::new(pool.clone()), pool, dir))
    }

    /// Poll until the job reaches `state` or the deadline passes.
    pub(super) async fn wait_for_state(
        queue: &Queue,
        id: &str,
        state: &str,
        timeout: Duration,
    ) -> anyhow::Result<Job> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(job) = queue.get_job(id).await? {
                if job.state == state {
                    return Ok(job);
                }
            }
            if tokio::time::Instant::now() >= deadline {
                anyhow::bail!("job {id} did not reach state {state} within {timeout:?}");
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

#[cfg(unix)]
#[tokio::test]
async fn happy_path_runs_a_job_to_completion() -> anyhow::Result<()> {
    let (queue, pool, _dir) = test_utils::setup().await?;

    let id = queue.enqueue(JobSpec::command("echo Hi")).await?;

    let mut manager = WorkerManager::new(pool.clone());
    manager.start(1).await?;

    let job = test_utils::wait_for_state(&queue, &id, "completed", Duration::from_secs(5)).await?;
    assert_eq!(job.attempts, 1);
    assert_none!(job.worker_id);

    let logs = queue.get_job_logs(&id).await?;
    assert!(logs.iter().any(|l| l.message.contains("Hi")));

    let metrics = queue.list_metrics().await?;
    assert_eq!(metrics.len(), 1);
    assert_eq!(metrics[0].state, "completed");
    assert_eq!(metrics[0].job_id, id);

    manager.stop().await;
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
async fn child_observes_its_attempt_index() -> anyhow::Result<()> {
    let (queue, pool, _dir) = test_utils::setup().await?;

    let id = queue.enqueue(JobSpec::command("echo attempt=$ATTEMPT")).await?;

    let mut manager = WorkerManager::new(pool.clone());
    manager.start(1).await?;

    test_utils::wait_for_state(&queue, &id, "completed", Duration::from_secs(5)).await?;
    let logs = queue.get_job_logs(&id).await?;
    assert!(logs.iter().any(|l| l.message.contains("attempt=0")));

    manager.stop().await;
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
async fn first_failure_enters_backoff_wait() -> anyhow::Result<()> {
    let (queue, pool, _dir) = test_utils::setup().await?;

    let spec = JobSpec { max_retries: Some(2), ..JobSpec::command("false") };
    let id = queue.enqueue(spec).await?;

    let mut manager = WorkerManager::new(pool.clone());
    manager.start(1).await?;

    let job = test_utils::wait_for_state(&queue, &id, "waiting", Duration::from_secs(5)).await?;
    assert_eq!(job.attempts, 1);
    assert_eq!(job.last_error.as_deref(), Some("exit=1"));
    assert_some!(job.next_run_at);

    manager.stop().await;
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
async fn retries_exhaust_into_the_dead_letter_queue() -> anyhow::Result<()> {
    let (queue, pool, _dir) = test_utils::setup().await?;

    // 1-second backoff keeps the retry trajectory fast.
    Config::new(pool.clone()).set("backoff_base", "1").await?;

    let spec = JobSpec { max_retries: Some(1), ..JobSpec::command("false") };
    let id = queue.enqueue(spec).await?;

    let mut manager = WorkerManager::new(pool.clone());
    manager.start(1).await?;

    let job = test_utils::wait_for_state(&queue, &id, "dead", Duration::from_secs(15)).await?;
    assert_eq!(job.attempts, 2); // first attempt + one retry
    assert_eq!(job.last_error.as_deref(), Some("exit=1"));

    let dead = queue.list_dead_jobs().await?;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].id, id);

    let metrics = queue.list_metrics().await?;
    assert_eq!(metrics.len(), 1); // retries overwrite, never accumulate
    assert_eq!(metrics[0].state, "failed");

    manager.stop().await;
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
async fn timeout_kills_the_child_and_records_it() -> anyhow::Result<()> {
    let (queue, pool, _dir) = test_utils::setup().await?;

    Config::new(pool.clone()).set("job_timeout", "1").await?;

    let spec = JobSpec { max_retries: Some(0), ..JobSpec::command("sleep 5") };
    let id = queue.enqueue(spec).await?;

    let mut manager = WorkerManager::new(pool.clone());
    manager.start(1).await?;

    let job = test_utils::wait_for_state(&queue, &id, "dead", Duration::from_secs(10)).await?;
    assert_eq!(job.last_error.as_deref(), Some("timeout"));

    let metrics = queue.list_metrics().await?;
    assert_eq!(metrics.len(), 1);
    assert_eq!(metrics[0].state, "timeout");
    assert!(metrics[0].duration >= 1.0);

    manager.stop().await;
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
async fn scheduled_job_waits_for_its_due_time() -> anyhow::Result<()> {
    let (queue, pool, _dir) = test_utils::setup().await?;

    let spec = JobSpec { run_at: Some(jobq::clock::iso_after(2)), ..JobSpec::command("echo Soon") };
    let id = queue.enqueue(spec).await?;
    assert_eq!(assert_some!(queue.get_job(&id).await?).state, "scheduled");

    let mut manager = WorkerManager::new(pool.clone());
    manager.start(1).await?;

    test_utils::wait_for_state(&queue, &id, "completed", Duration::from_secs(10)).await?;

    manager.stop().await;
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
async fn smaller_priority_runs_first() -> anyhow::Result<()> {
    let (queue, pool, _dir) = test_utils::setup().await?;

    let a = queue
        .enqueue(JobSpec { priority: Some(100), ..JobSpec::command("echo A") })
        .await?;
    let b = queue.enqueue(JobSpec { priority: Some(1), ..JobSpec::command("echo B") }).await?;

    let mut manager = WorkerManager::new(pool.clone());
    manager.start(1).await?;

    test_utils::wait_for_state(&queue, &a, "completed", Duration::from_secs(10)).await?;
    test_utils::wait_for_state(&queue, &b, "completed", Duration::from_secs(10)).await?;

    // Log rows share one autoincrement sequence, so B's first line having a
    // smaller id than A's proves B was claimed first.
    let first_b = queue.get_job_logs(&b).await?.first().map(|l| l.id);
    let first_a = queue.get_job_logs(&a).await?.first().map(|l| l.id);
    assert!(assert_some!(first_b) < assert_some!(first_a));

    manager.stop().await;
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
async fn orphaned_jobs_resume_after_a_crash() -> anyhow::Result<()> {
    let (queue, pool, _dir) = test_utils::setup().await?;

    let id = queue.enqueue(JobSpec::command("echo ok")).await?;

    // Simulate a worker that died mid-job: claimed, never resolved.
    assert_some!(queue.fetch_next_job("worker-crashed").await?);
    assert_eq!(assert_some!(queue.get_job(&id).await?).state, "processing");

    let mut manager = WorkerManager::new(pool.clone());
    manager.start(1).await?;

    let job = test_utils::wait_for_state(&queue, &id, "completed", Duration::from_secs(5)).await?;
    assert_eq!(job.attempts, 1); // recovery did not count as an attempt

    manager.stop().await;
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
async fn graceful_stop_drains_the_inflight_job() -> anyhow::Result<()> {
    let (queue, pool, _dir) = test_utils::setup().await?;

    let id = queue.enqueue(JobSpec::command("sleep 2")).await?;

    let mut manager = WorkerManager::new(pool.clone());
    manager.start(1).await?;

    test_utils::wait_for_state(&queue, &id, "processing", Duration::from_secs(5)).await?;
    manager.stop().await;

    // stop() blocked until the child finished; the job must have resolved.
    let job = assert_some!(queue.get_job(&id).await?);
    assert_eq!(job.state, "completed");

    let worker_rows = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM workers")
        .fetch_one(&pool)
        .await?;
    assert_eq!(worker_rows, 0);

    Ok(())
}

#[tokio::test]
async fn worker_rows_track_the_pool() -> anyhow::Result<()> {
    let (_queue, pool, _dir) = test_utils::setup().await?;

    let mut manager = WorkerManager::new(pool.clone());
    manager.start(2).await?;
    assert_eq!(manager.worker_count(), 2);

    let rows = sqlx::query_as::<_, jobq::schema::WorkerRow>("SELECT * FROM workers ORDER BY id")
        .fetch_all(&pool)
        .await?;
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|row| row.id.starts_with("worker-")));
    assert!(rows.iter().all(|row| !row.last_heartbeat.is_empty()));

    manager.stop().await;
    assert_eq!(manager.worker_count(), 0);

    let remaining = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM workers")
        .fetch_one(&pool)
        .await?;
    assert_eq!(remaining, 0);

    Ok(())
}

#[cfg(unix)]
#[tokio::test]
async fn spawn_failure_counts_as_a_failed_attempt() -> anyhow::Result<()> {
    let (queue, pool, _dir) = test_utils::setup().await?;

    // /bin/sh itself spawns fine and exits 127 for an unknown command, so
    // this exercises the non-zero-exit path the same policy covers.
    let spec = JobSpec { max_retries: Some(0), ..JobSpec::command("definitely-not-a-command-xyz") };
    let id = queue.enqueue(spec).await?;

    let mut manager = WorkerManager::new(pool.clone());
    manager.start(1).await?;

    let job = test_utils::wait_for_state(&queue, &id, "dead", Duration::from_secs(5)).await?;
    assert_eq!(job.last_error.as_deref(), Some("exit=127"));

    manager.stop().await;
    Ok(())
}
