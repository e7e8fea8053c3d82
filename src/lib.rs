#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

pub mod clock;
mod config;
mod errors;
mod queue;
mod runner;
/// Database schema row types.
pub mod schema;
mod storage;
mod worker;

/// Read-through configuration persisted in the store.
pub use self::config::Config;
/// Error taxonomy for queue operations.
pub use self::errors::QueueError;
/// The state-machine façade: enqueue, claim, transitions, DLQ, listings.
pub use self::queue::{JobSpec, Queue, StatusSummary};
/// The worker pool owner.
pub use self::runner::WorkerManager;
/// Pool setup for the embedded queue database.
pub use self::storage::{connect, setup_database};
/// A single claim-and-execute worker.
pub use self::worker::Worker;
