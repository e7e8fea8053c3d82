mod cli;

use clap::Parser;
use cli::{Cli, Command, ConfigCommand, DlqCommand, WorkerCommand};
use jobq::schema::{Job, JobState};
use jobq::{Config, JobSpec, Queue, QueueError, WorkerManager};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();

    if let Err(error) = run().await {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Some(parent) = cli.db.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let pool = jobq::connect(&cli.db).await?;
    jobq::setup_database(&pool).await?;
    let queue = Queue::new(pool.clone());

    match cli.command {
        Command::Enqueue { json } => {
            let spec: JobSpec = serde_json::from_str(&json)
                .map_err(|e| QueueError::InvalidInput(format!("bad job JSON: {e}")))?;
            let id = queue.enqueue(spec).await?;
            println!("{id}");
        }
        Command::Worker { command: WorkerCommand::Start { count } } => {
            let mut manager = WorkerManager::new(pool.clone());
            manager.start(count).await?;
            info!(count, "worker pool running, ctrl-c to stop");
            tokio::signal::ctrl_c().await?;
            info!("shutting down, draining in-flight jobs");
            manager.stop().await;
        }
        Command::Status => {
            let summary = queue.status_summary().await?;
            for (state, count) in &summary.states {
                println!("{state:>12}  {count}");
            }
            println!("{:>12}  {}", "ready_pending", summary.ready_pending);
        }
        Command::List { state } => {
            let state = state.as_deref().map(parse_state).transpose()?;
            for job in queue.list_jobs(state).await? {
                print_job_line(&job);
            }
        }
        Command::Dlq { command } => match command {
            DlqCommand::List => {
                for job in queue.list_dead_jobs().await? {
                    print_job_line(&job);
                }
            }
            DlqCommand::Retry { id } => {
                let count = queue.retry_dead_job(id.as_deref()).await?;
                println!("{count} job(s) returned to pending");
            }
            DlqCommand::Clear => {
                let count = queue.clear_dead_jobs().await?;
                println!("{count} job(s) removed");
            }
        },
        Command::Logs { job_id } => {
            let job = queue
                .get_job(&job_id)
                .await?
                .ok_or_else(|| QueueError::NotFound(job_id.clone()))?;
            println!("id:          {}", job.id);
            println!("command:     {}", job.command);
            println!("state:       {}", job.state);
            println!("attempts:    {} (max_retries {})", job.attempts, job.max_retries);
            println!("priority:    {}", job.priority);
            if let Some(run_at) = &job.run_at {
                println!("run_at:      {run_at}");
            }
            if let Some(next_run_at) = &job.next_run_at {
                println!("next_run_at: {next_run_at}");
            }
            if let Some(last_error) = &job.last_error {
                println!("last_error:  {last_error}");
            }
            println!();
            for line in queue.get_job_logs(&job_id).await? {
                println!("{}  {}", line.created_at, line.message);
            }
        }
        Command::Metrics => {
            for metric in queue.list_metrics().await? {
                println!(
                    "{}  {:<9}  {:>8.2}s  {}  {}",
                    metric.completed_at,
                    metric.state,
                    metric.duration,
                    metric.job_id,
                    metric.command
                );
            }
        }
        Command::Config { command } => {
            let config = Config::new(pool.clone());
            match command {
                ConfigCommand::Get { key } => {
                    let value = config
                        .try_get(&key)
                        .await?
                        .ok_or_else(|| QueueError::NotFound(format!("config key {key}")))?;
                    println!("{value}");
                }
                ConfigCommand::Set { key, value } => {
                    config.set(&key, &value).await?;
                }
            }
        }
    }

    Ok(())
}

fn parse_state(s: &str) -> Result<JobState, QueueError> {
    JobState::parse(s).ok_or_else(|| QueueError::InvalidInput(format!("unknown state: {s}")))
}

fn print_job_line(job: &Job) {
    println!(
        "{}  {:<10}  p{:<4}  attempts {}  {}",
        job.id, job.state, job.priority, job.attempts, job.command
    );
}
