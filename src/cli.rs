use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Persistent single-node job queue for shell commands.
#[derive(Parser)]
#[command(name = "jobq", version, about)]
pub struct Cli {
    /// Path to the queue database file.
    #[arg(long, global = true, default_value = "data/queue.sqlite")]
    pub db: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Enqueue a job described by a JSON spec.
    ///
    /// Accepted fields: "command" (required), "id", "max_retries",
    /// "priority" (smaller value = higher urgency, default 100) and
    /// "run_at" (ISO-8601; naked local timestamps are read as +05:30).
    /// Prints the job id.
    Enqueue {
        /// The job spec, e.g. '{"command":"echo hi","priority":10}'
        json: String,
    },
    /// Worker pool management.
    Worker {
        #[command(subcommand)]
        command: WorkerCommand,
    },
    /// Print the queue-state histogram and the ready-to-run count.
    Status,
    /// List jobs, newest first.
    List {
        /// Only show jobs in this state.
        #[arg(long)]
        state: Option<String>,
    },
    /// Dead-letter queue operations.
    Dlq {
        #[command(subcommand)]
        command: DlqCommand,
    },
    /// Print a job's metadata and its log lines.
    Logs {
        /// The job id.
        job_id: String,
    },
    /// Print per-job execution metrics.
    Metrics,
    /// Read or write configuration values.
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand)]
pub enum WorkerCommand {
    /// Start a worker pool; runs until ctrl-c, then drains in-flight jobs.
    Start {
        /// Number of concurrent workers.
        #[arg(short = 'c', long, default_value_t = 1)]
        count: usize,
    },
}

#[derive(Subcommand)]
pub enum DlqCommand {
    /// List dead jobs.
    List,
    /// Return one dead job (or all of them) to pending with a fresh
    /// attempt budget.
    Retry {
        /// The job id; omit to retry every dead job.
        id: Option<String>,
    },
    /// Delete every dead job and its logs.
    Clear,
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Print one config value.
    Get {
        /// Key, e.g. max_retries, backoff_base, job_timeout.
        key: String,
    },
    /// Set one config value.
    Set {
        /// Key, e.g. max_retries, backoff_base, job_timeout.
        key: String,
        /// The new value.
        value: String,
    },
}
