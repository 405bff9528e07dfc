//! Queue-driven sync scheduling and the worker loop.

pub mod scheduler;
pub mod worker;

pub use scheduler::enqueue_all_enabled;
pub use worker::{SyncWorker, SyncWorkerHandle, MAX_RETRIES, REQUESTS_PER_SYNC};
