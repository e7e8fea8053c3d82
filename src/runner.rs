use crate::clock;
use crate::config::Config;
use crate::errors::QueueError;
use crate::queue::Queue;
use crate::storage;
use crate::worker::Worker;
use futures_util::future::join_all;
use rand::Rng;
use sqlx::SqlitePool;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, info_span, warn, Instrument};

const HEARTBEAT_INTERVAL: std::time::Duration = std::time::Duration::from_secs(2);

/// Owns a pool of [`Worker`]s: starts them, keeps their heartbeats fresh,
/// and drains them on shutdown.
///
/// Starting the pool first reclaims any job a previous unclean shutdown
/// left in `processing`, so orphaned work re-enters the queue before a new
/// worker can claim anything.
pub struct WorkerManager {
    pool: SqlitePool,
    queue: Queue,
    config: Config,
    workers: Vec<WorkerHandle>,
    shutdown: Arc<AtomicBool>,
}

struct WorkerHandle {
    worker: Arc<Worker>,
    run_task: JoinHandle<()>,
    heartbeat_task: JoinHandle<()>,
}

impl WorkerManager {
    /// Create a manager over the queue database.
    pub fn new(pool: SqlitePool) -> Self {
        let queue = Queue::new(pool.clone());
        let config = Config::new(pool.clone());
        Self { pool, queue, config, workers: Vec::new(), shutdown: Arc::new(AtomicBool::new(false)) }
    }

    /// The queue this manager dispatches from.
    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    /// Number of live workers.
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Spawn `count` workers after reclaiming orphaned jobs.
    pub async fn start(&mut self, count: usize) -> Result<(), QueueError> {
        let reclaimed = self.queue.recover_orphaned_jobs().await?;
        if reclaimed > 0 {
            info!(reclaimed, "recovered orphaned in-flight jobs");
        }

        let epoch_ms = clock::now().timestamp_millis();
        for i in 0..count {
            let id = format!("worker-{epoch_ms}-{}-{i}", rand_suffix());
            storage::upsert_worker(&self.pool, &id, &clock::now_iso()).await?;

            let heartbeat_pool = self.pool.clone();
            let heartbeat_id = id.clone();
            let heartbeat_task = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
                loop {
                    ticker.tick().await;
                    let now = clock::now_iso();
                    if let Err(error) =
                        storage::touch_worker(&heartbeat_pool, &heartbeat_id, &now).await
                    {
                        warn!(%error, worker.id = %heartbeat_id, "heartbeat update failed");
                    }
                }
            });

            let worker = Arc::new(Worker::new(
                id.clone(),
                self.queue.clone(),
                self.config.clone(),
                self.shutdown.clone(),
            ));
            info!(worker.id = %id, "starting worker");

            let span = info_span!("worker", worker.id = %id);
            let run_worker = worker.clone();
            let run_task = tokio::spawn(async move { run_worker.run().instrument(span).await });

            self.workers.push(WorkerHandle { worker, run_task, heartbeat_task });
        }

        Ok(())
    }

    /// Request shutdown and wait for every worker to drain.
    ///
    /// In-flight children run to completion or timeout; nothing is aborted.
    /// Heartbeats stop and worker rows are removed once their worker has
    /// exited.
    pub async fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let handles: Vec<WorkerHandle> = self.workers.drain(..).collect();

        join_all(handles.iter().map(|handle| handle.worker.stop())).await;

        for handle in handles {
            handle.heartbeat_task.abort();
            if let Err(error) = storage::delete_worker(&self.pool, handle.worker.id()).await {
                warn!(%error, worker.id = %handle.worker.id(), "failed to remove worker row");
            }
            if let Err(error) = handle.run_task.await {
                warn!(%error, "worker task panicked");
            }
        }
        info!("worker pool stopped");
    }
}

fn rand_suffix() -> String {
    rand::thread_rng()
        .sample_iter(rand::distributions::Alphanumeric)
        .take(5)
        .map(char::from)
        .collect::<String>()
        .to_lowercase()
}
