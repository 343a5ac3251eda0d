//! Shared key-value backend used for the token cache and distributed locks.
//!
//! The backend is chosen once at start-up and passed by value (it is cheap to
//! clone) to every component that needs it:
//!
//! - **Redis**: shared between every worker process.
//! - **Local**: process-local map plus named mutexes. Locks only exclude
//!   tasks inside this process.

mod local;
mod redis_backend;

use std::time::Duration;

use tracing::{info, warn};

pub use self::local::LocalBackend;
pub use self::redis_backend::RedisBackend;

#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    #[error("backend connection error: {0}")]
    Connection(String),

    #[error("backend command error: {0}")]
    Command(String),
}

/// Cache and lock backend, selected once at construction.
#[derive(Debug, Clone)]
pub enum SharedBackend {
    Redis(RedisBackend),
    Local(LocalBackend),
}

impl SharedBackend {
    /// Connect to Redis when a URL is configured, otherwise (or when Redis is
    /// unreachable) fall back to the process-local backend.
    pub async fn connect(redis_url: Option<&str>) -> Self {
        let Some(url) = redis_url.map(str::trim).filter(|u| !u.is_empty()) else {
            warn!("redis_not_configured_using_local_backend");
            return Self::local();
        };

        match RedisBackend::connect(url).await {
            Ok(backend) => {
                info!("redis_backend_connected");
                Self::Redis(backend)
            }
            Err(e) => {
                warn!(error = %e, "redis_unavailable_using_local_backend");
                Self::local()
            }
        }
    }

    pub fn local() -> Self {
        Self::Local(LocalBackend::new())
    }

    /// Whether locks taken through this backend exclude other processes.
    pub fn is_shared(&self) -> bool {
        matches!(self, SharedBackend::Redis(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SharedBackend::Redis(_) => "redis",
            SharedBackend::Local(_) => "local",
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
        match self {
            SharedBackend::Redis(redis) => redis.get(key).await,
            SharedBackend::Local(local) => Ok(local.get(key)),
        }
    }

    pub async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), BackendError> {
        match self {
            SharedBackend::Redis(redis) => redis.set(key, value, ttl).await,
            SharedBackend::Local(local) => {
                local.set(key, value, ttl);
                Ok(())
            }
        }
    }

    pub async fn delete(&self, key: &str) -> Result<(), BackendError> {
        match self {
            SharedBackend::Redis(redis) => redis.delete(key).await,
            SharedBackend::Local(local) => {
                local.delete(key);
                Ok(())
            }
        }
    }

    /// Delete every key under `namespace:`.
    pub async fn clear_namespace(&self, namespace: &str) -> Result<usize, BackendError> {
        let prefix = format!("{namespace}:");
        match self {
            SharedBackend::Redis(redis) => redis.delete_prefix(&prefix).await,
            SharedBackend::Local(local) => Ok(local.delete_prefix(&prefix)),
        }
    }
}
