//! Distributed mutual exclusion on top of [`SharedBackend`].
//!
//! With Redis the lock is a `SET NX PX` key holding a random ownership
//! token, released through a compare-and-delete script. With the local
//! backend it degrades to a named in-process mutex: exclusion then only
//! holds between tasks of this process.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::backend::SharedBackend;

/// Timing knobs for a [`DistributedLock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    /// Expiry of the shared key; a crashed holder frees the lock after this.
    pub ttl: Duration,
    /// How long `acquire` keeps trying before giving up.
    pub wait: Duration,
    /// Poll interval while the shared key is held by someone else.
    pub retry_interval: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(45),
            wait: Duration::from_millis(200),
            retry_interval: Duration::from_millis(50),
        }
    }
}

enum Held {
    Shared {
        token: String,
    },
    Local {
        handle: Arc<Mutex<()>>,
        _guard: OwnedMutexGuard<()>,
    },
}

/// A named lock. Dropping it without [`release`](Self::release) leaves a
/// shared key to expire after its TTL; a local guard is freed immediately.
pub struct DistributedLock {
    backend: SharedBackend,
    name: String,
    options: LockOptions,
    held: Option<Held>,
}

impl std::fmt::Debug for DistributedLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedLock")
            .field("name", &self.name)
            .field("backend", &self.backend.kind())
            .field("held", &self.held.is_some())
            .finish()
    }
}

impl DistributedLock {
    pub fn new(backend: SharedBackend, name: impl Into<String>, options: LockOptions) -> Self {
        Self {
            backend,
            name: name.into(),
            options,
            held: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_held(&self) -> bool {
        self.held.is_some()
    }

    /// Try to take the lock, waiting at most `options.wait`.
    ///
    /// Backend errors are logged and reported as "not acquired".
    pub async fn acquire(&mut self) -> bool {
        if self.held.is_some() {
            return true;
        }

        let held = match self.backend.clone() {
            SharedBackend::Redis(_) => self.acquire_shared().await,
            SharedBackend::Local(local) => {
                let handle = local.named_lock(&self.name);
                match tokio::time::timeout(self.options.wait, Arc::clone(&handle).lock_owned())
                    .await
                {
                    Ok(guard) => Some(Held::Local {
                        handle,
                        _guard: guard,
                    }),
                    Err(_) => {
                        debug!(lock = %self.name, "lock_acquire_timeout");
                        local.forget_lock(&self.name, &handle);
                        None
                    }
                }
            }
        };

        self.held = held;
        self.held.is_some()
    }

    async fn acquire_shared(&self) -> Option<Held> {
        let SharedBackend::Redis(redis) = &self.backend else {
            return None;
        };
        let token = Uuid::new_v4().simple().to_string();
        let deadline = Instant::now() + self.options.wait;
        let mut contended = false;

        loop {
            match redis.set_if_absent(&self.name, &token, self.options.ttl).await {
                Ok(true) => return Some(Held::Shared { token }),
                Ok(false) => {
                    if !contended {
                        debug!(lock = %self.name, "lock_contention");
                        contended = true;
                    }
                }
                Err(e) => {
                    warn!(lock = %self.name, error = %e, "lock_backend_error");
                    return None;
                }
            }

            let now = Instant::now();
            if now >= deadline {
                debug!(lock = %self.name, "lock_acquire_timeout");
                return None;
            }
            tokio::time::sleep(self.options.retry_interval.min(deadline - now)).await;
        }
    }

    /// Release the lock if held. Calling it again (or without acquiring) is a no-op.
    pub async fn release(&mut self) {
        let Some(held) = self.held.take() else {
            return;
        };

        match (held, &self.backend) {
            (Held::Shared { token }, SharedBackend::Redis(redis)) => {
                match redis.delete_if_equals(&self.name, &token).await {
                    Ok(true) => {}
                    Ok(false) => warn!(lock = %self.name, "lock_expired_before_release"),
                    Err(e) => warn!(lock = %self.name, error = %e, "lock_release_failed"),
                }
            }
            (Held::Local { handle, _guard }, SharedBackend::Local(local)) => {
                drop(_guard);
                local.forget_lock(&self.name, &handle);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(wait_ms: u64) -> LockOptions {
        LockOptions {
            ttl: Duration::from_secs(5),
            wait: Duration::from_millis(wait_ms),
            retry_interval: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn held_lock_blocks_second_holder_within_wait_bound() {
        let backend = SharedBackend::local();
        let mut first = DistributedLock::new(backend.clone(), "loyalty:sync:job:user:1", options(50));
        let mut second = DistributedLock::new(backend.clone(), "loyalty:sync:job:user:1", options(50));

        assert!(first.acquire().await);
        let started = std::time::Instant::now();
        assert!(!second.acquire().await);
        assert!(started.elapsed() < Duration::from_secs(2));

        first.release().await;
        assert!(second.acquire().await);
        second.release().await;
    }

    #[tokio::test]
    async fn different_names_do_not_contend() {
        let backend = SharedBackend::local();
        let mut a = DistributedLock::new(backend.clone(), "user:1", options(10));
        let mut b = DistributedLock::new(backend, "user:2", options(10));

        assert!(a.acquire().await);
        assert!(b.acquire().await);
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let mut lock = DistributedLock::new(SharedBackend::local(), "user:9", options(10));
        lock.release().await;

        assert!(lock.acquire().await);
        assert!(lock.acquire().await);
        lock.release().await;
        lock.release().await;
        assert!(!lock.is_held());
    }

    #[tokio::test]
    async fn waiter_gets_lock_once_released() {
        let backend = SharedBackend::local();
        let mut holder = DistributedLock::new(backend.clone(), "user:3", options(10));
        assert!(holder.acquire().await);

        let waiter = tokio::spawn({
            let backend = backend.clone();
            async move {
                let mut lock = DistributedLock::new(backend, "user:3", options(2_000));
                lock.acquire().await
            }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        holder.release().await;
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    #[ignore = "requires REDIS_URL"]
    async fn redis_lock_excludes_and_releases_by_token() {
        let url = std::env::var("REDIS_URL").expect("REDIS_URL must be set");
        let backend = SharedBackend::connect(Some(&url)).await;
        assert!(backend.is_shared());

        let name = format!("loyalty:test:lock:{}", Uuid::new_v4());
        let mut first = DistributedLock::new(backend.clone(), name.clone(), options(50));
        let mut second = DistributedLock::new(backend.clone(), name.clone(), options(50));

        assert!(first.acquire().await);
        assert!(!second.acquire().await);

        // A stranger's token must not delete the key.
        if let SharedBackend::Redis(redis) = &backend {
            assert!(!redis.delete_if_equals(&name, "not-the-owner").await.unwrap());
        }

        first.release().await;
        assert!(second.acquire().await);
        second.release().await;
    }
}
