use crate::clock;
use crate::config::Config;
use crate::queue::Queue;
use crate::schema::{Job, JobMetric};
use rand::Rng;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info_span, trace, warn, Instrument};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_JITTER: Duration = Duration::from_millis(100);
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(500);
const STORE_ERROR_DELAY: Duration = Duration::from_secs(1);
const KILL_GRACE: Duration = Duration::from_secs(5);

/// A single worker: repeatedly claims one runnable job and executes it as a
/// child process of the platform shell.
///
/// Workers never mutate job rows directly; every outcome is reported back
/// through the [`Queue`] state machine.
pub struct Worker {
    id: String,
    queue: Queue,
    config: Config,
    shutdown: Arc<AtomicBool>,
    in_progress: Arc<AtomicBool>,
    current: Arc<tokio::sync::Mutex<Option<String>>>,
    poll_interval: Duration,
    jitter: Duration,
}

impl Worker {
    /// Create a worker. The `shutdown` flag is shared with the manager that
    /// owns this worker.
    pub fn new(id: String, queue: Queue, config: Config, shutdown: Arc<AtomicBool>) -> Self {
        Self {
            id,
            queue,
            config,
            shutdown,
            in_progress: Arc::new(AtomicBool::new(false)),
            current: Arc::new(tokio::sync::Mutex::new(None)),
            poll_interval: DEFAULT_POLL_INTERVAL,
            jitter: DEFAULT_JITTER,
        }
    }

    /// This worker's id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether a job is currently executing on this worker.
    pub fn in_progress(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    /// The id of the job currently executing, if any.
    pub async fn current_job(&self) -> Option<String> {
        self.current.lock().await.clone()
    }

    fn sleep_duration_with_jitter(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.poll_interval;
        }
        let jitter_millis = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        let random_jitter = rand::thread_rng().gen_range(0..=jitter_millis);
        self.poll_interval + Duration::from_millis(random_jitter)
    }

    /// Run until the manager requests shutdown.
    ///
    /// Each tick runs the promotion sweeps, then claims and executes at
    /// most one job. Store errors are logged and swallowed after a brief
    /// delay; an administrator must inspect them.
    pub async fn run(&self) {
        loop {
            if self.shutdown.load(Ordering::SeqCst) && !self.in_progress() {
                debug!(worker.id = %self.id, "shutdown requested, exiting run loop");
                break;
            }

            // Both sweeps are cheap idempotent updates; running them on
            // every tick bounds promotion latency by the poll period no
            // matter which worker's tick handles it.
            if let Err(error) = self.queue.activate_scheduled_jobs().await {
                error!(%error, "failed to activate scheduled jobs");
            }
            if let Err(error) = self.queue.reactivate_waiting_jobs().await {
                error!(%error, "failed to reactivate waiting jobs");
            }

            // Don't claim new work while draining.
            if self.shutdown.load(Ordering::SeqCst) {
                sleep(self.sleep_duration_with_jitter()).await;
                continue;
            }

            match self.queue.fetch_next_job(&self.id).await {
                Ok(Some(job)) => {
                    self.in_progress.store(true, Ordering::SeqCst);
                    *self.current.lock().await = Some(job.id.clone());

                    let span = info_span!("job", job.id = %job.id, worker.id = %self.id);
                    if let Err(error) = self.execute_job(&job).instrument(span).await {
                        error!(job.id = %job.id, %error, "job execution failed");
                    }

                    *self.current.lock().await = None;
                    self.in_progress.store(false, Ordering::SeqCst);
                }
                Ok(None) => {
                    trace!(worker.id = %self.id, "no runnable jobs, polling again");
                    sleep(self.sleep_duration_with_jitter()).await;
                }
                Err(error) => {
                    error!(%error, "failed to fetch next job");
                    sleep(STORE_ERROR_DELAY).await;
                }
            }
        }
    }

    /// Request shutdown and block until the in-flight job (if any) has run
    /// to completion or timeout. The child is never forcibly aborted here.
    pub async fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        while self.in_progress() {
            sleep(STOP_POLL_INTERVAL).await;
        }
    }

    /// Execute one claimed job and resolve its outcome into a transition.
    async fn execute_job(&self, job: &Job) -> anyhow::Result<()> {
        let timeout_secs = self.config.get_i64("job_timeout", 300).await?.max(1) as u64;
        let backoff_base = self.config.get_i64("backoff_base", 2).await?;

        let attempts = job.attempts + 1;
        let backoff_seconds = backoff_base.saturating_pow(attempts.clamp(1, 32) as u32);

        self.queue
            .add_job_log(&job.id, &format!("started attempt {attempts} on {}", self.id))
            .await?;
        debug!(command = %job.command, attempts, "running job");

        let start = Instant::now();
        let mut cmd = shell_command(&job.command);
        cmd.env("ATTEMPT", job.attempts.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(error) => {
                let message = format!("spawn failed: {error}");
                self.queue.add_job_log(&job.id, &message).await?;
                self.queue
                    .mark_job_failed(&job.id, &message, attempts, job.max_retries, backoff_seconds)
                    .await?;
                self.record_metric(job, "failed", start.elapsed()).await?;
                return Ok(());
            }
        };

        let mut io_tasks = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            io_tasks.push(self.capture_output(&job.id, stdout, "📤 "));
        }
        if let Some(stderr) = child.stderr.take() {
            io_tasks.push(self.capture_output(&job.id, stderr, "[stderr] "));
        }

        let mut killed = false;
        let wait = tokio::time::timeout(Duration::from_secs(timeout_secs), child.wait()).await;
        let status = match wait {
            Ok(status) => status?,
            Err(_elapsed) => {
                killed = true;
                warn!(job.id = %job.id, timeout_secs, "job timed out, terminating child");
                terminate(&mut child);
                match tokio::time::timeout(KILL_GRACE, child.wait()).await {
                    Ok(status) => status?,
                    Err(_elapsed) => {
                        child.start_kill()?;
                        child.wait().await?
                    }
                }
            }
        };

        // Let the pipe readers drain before classifying.
        for task in io_tasks {
            if let Err(error) = task.await {
                warn!(%error, "output capture task failed");
            }
        }

        let duration = start.elapsed();
        let timed_out = killed || exit_was_sigterm(&status);

        if timed_out {
            self.queue
                .add_job_log(&job.id, &format!("killed after {timeout_secs}s timeout"))
                .await?;
            self.queue
                .mark_job_failed(&job.id, "timeout", attempts, job.max_retries, backoff_seconds)
                .await?;
            self.record_metric(job, "timeout", duration).await?;
        } else if status.success() {
            self.queue
                .add_job_log(&job.id, &format!("completed in {:.2}s", duration.as_secs_f64()))
                .await?;
            self.queue.mark_job_completed(&job.id).await?;
            self.record_metric(job, "completed", duration).await?;
        } else {
            let message = format!("exit={}", status.code().unwrap_or(-1));
            self.queue.add_job_log(&job.id, &format!("failed with {message}")).await?;
            self.queue
                .mark_job_failed(&job.id, &message, attempts, job.max_retries, backoff_seconds)
                .await?;
            self.record_metric(job, "failed", duration).await?;
        }

        Ok(())
    }

    /// Append every non-empty output line as a tagged job log row.
    fn capture_output<R>(&self, job_id: &str, reader: R, tag: &'static str) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let queue = self.queue.clone();
        let job_id = job_id.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                if let Err(error) = queue.add_job_log(&job_id, &format!("{tag}{line}")).await {
                    warn!(%error, "failed to record output line");
                }
            }
        })
    }

    async fn record_metric(
        &self,
        job: &Job,
        state: &str,
        duration: Duration,
    ) -> anyhow::Result<()> {
        let metric = JobMetric {
            job_id: job.id.clone(),
            command: job.command.clone(),
            state: state.to_string(),
            duration: duration.as_secs_f64(),
            worker_id: self.id.clone(),
            completed_at: clock::now_iso(),
        };
        self.queue.record_metric(&metric).await?;
        Ok(())
    }
}

/// Build the child command for the platform's default shell.
fn shell_command(command: &str) -> Command {
    if cfg!(windows) {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(command);
        cmd
    } else {
        let mut cmd = Command::new("/bin/sh");
        cmd.args(["-c", command]);
        cmd
    }
}

/// Ask the child to terminate. SIGTERM on unix so the command can clean up;
/// a SIGKILL follow-up happens after the grace period if it ignores this.
#[cfg(unix)]
fn terminate(child: &mut Child) {
    if let Some(pid) = child.id() {
        // SAFETY: signalling a child pid we spawned and still own.
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) {
    if let Err(error) = child.start_kill() {
        warn!(%error, "failed to kill timed-out child");
    }
}

/// Whether the child died from our SIGTERM rather than exiting on its own.
#[cfg(unix)]
fn exit_was_sigterm(status: &std::process::ExitStatus) -> bool {
    use std::os::unix::process::ExitStatusExt;
    status.signal() == Some(libc::SIGTERM)
}

#[cfg(not(unix))]
fn exit_was_sigterm(_status: &std::process::ExitStatus) -> bool {
    false
}
