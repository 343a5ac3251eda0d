//! Background workers.

pub mod sync_worker;

pub use sync_worker::{SyncWorker, SyncWorkerConfig, WorkerHandle, WorkerMetrics, generate_worker_id};
