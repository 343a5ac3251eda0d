//! Durable synchronization job queue.
//!
//! ## Components
//!
//! - `Job`: one row per (operation, target) unit of work, with retry budget
//! - `JobStore`: persistence (in-memory or Postgres) with atomic claims
//! - `JobService`: enqueue de-duplication and every state transition

pub mod postgres;
pub mod service;
pub mod store;
pub mod types;

pub use postgres::{LOCK_OWNER_MAX_LEN, PostgresJobStore};
pub use service::JobService;
pub use store::{EnqueueRequest, InMemoryJobStore, JobStats, JobStore, JobStoreError};
pub use types::{
    FlushProfilePayload, Job, JobId, JobStatus, MarkDeletedPayload, OperationKind, RetryPolicy,
    SyncOperation, SyncTarget, SyncUserPayload,
};
