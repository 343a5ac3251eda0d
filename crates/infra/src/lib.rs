//! Infrastructure layer: job queue, Postgres/Redis adapters, the external
//! loyalty client and the background sync worker.

pub mod backend;
pub mod clock;
pub mod config;
pub mod customers;
pub mod external;
pub mod handlers;
pub mod jobs;
pub mod lock;
pub mod workers;

pub use backend::{BackendError, SharedBackend};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, SyncSettings};
pub use lock::{DistributedLock, LockOptions};
