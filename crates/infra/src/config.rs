//! Process configuration read from the environment.
//!
//! `SyncSettings::from_env` loads an optional `.env` first. Everything but
//! the database URL and the loyalty API identity has a default.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::external::ClientSettings;
use crate::jobs::{LOCK_OWNER_MAX_LEN, RetryPolicy};
use crate::lock::LockOptions;
use crate::workers::{SyncWorkerConfig, generate_worker_id};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

/// Everything the worker binary needs to start.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncSettings {
    pub database_url: String,
    /// `None` selects the process-local lock and cache backend
    pub redis_url: Option<String>,
    pub api_base_url: String,
    pub api_login: String,
    pub organization_id: String,
    pub http_timeout: Duration,

    pub worker_id: String,
    pub batch_size: usize,
    pub poll_interval: Duration,
    pub lock_ttl: Duration,
    pub lock_wait: Duration,
    pub stuck_timeout: Duration,
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub pause_on_rejection: bool,
}

impl SyncSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        match dotenvy::dotenv() {
            Ok(path) => debug!(path = %path.display(), "dotenv_loaded"),
            Err(e) if e.not_found() => {}
            Err(e) => warn!(error = %e, "dotenv_load_failed"),
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);
        let defaults = SyncWorkerConfig::default();
        let lock = LockOptions::default();
        let retry = RetryPolicy::default();

        Ok(Self {
            database_url: env.required("DATABASE_URL")?,
            redis_url: env.optional("REDIS_URL"),
            api_base_url: env.required("LOYALTY_API_BASE_URL")?,
            api_login: env.required("LOYALTY_API_LOGIN")?,
            organization_id: env.required("LOYALTY_ORGANIZATION_ID")?,
            http_timeout: env.secs("LOYALTY_HTTP_TIMEOUT_SECS", Duration::from_secs(10))?,

            worker_id: env.worker_id()?,
            batch_size: env.parsed("SYNC_BATCH_SIZE", defaults.batch_size)?,
            poll_interval: env.millis("SYNC_POLL_INTERVAL_MS", defaults.poll_interval)?,
            lock_ttl: env.secs("SYNC_LOCK_TTL_SECS", lock.ttl)?,
            lock_wait: env.millis("SYNC_LOCK_WAIT_MS", lock.wait)?,
            stuck_timeout: env.secs("SYNC_STUCK_TIMEOUT_SECS", defaults.stuck_timeout)?,
            max_attempts: env.max_attempts(retry.max_attempts)?,
            base_backoff: env.secs("SYNC_BASE_BACKOFF_SECS", retry.base_delay)?,
            max_backoff: env.secs("SYNC_MAX_BACKOFF_SECS", retry.max_delay)?,
            pause_on_rejection: env.flag("SYNC_PAUSE_ON_REJECTION", defaults.pause_on_rejection)?,
        })
    }

    pub fn client_settings(&self) -> ClientSettings {
        let mut settings = ClientSettings::new(
            self.api_base_url.clone(),
            self.api_login.clone(),
            self.organization_id.clone(),
        );
        settings.timeout = self.http_timeout;
        settings
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(self.max_attempts, self.base_backoff, self.max_backoff)
    }

    pub fn worker_config(&self) -> SyncWorkerConfig {
        SyncWorkerConfig {
            worker_id: self.worker_id.clone(),
            batch_size: self.batch_size,
            poll_interval: self.poll_interval,
            lock: LockOptions {
                ttl: self.lock_ttl,
                wait: self.lock_wait,
                ..LockOptions::default()
            },
            stuck_timeout: self.stuck_timeout,
            pause_on_rejection: self.pause_on_rejection,
            call_budget: Some(self.client_settings().worst_case_call()),
            ..SyncWorkerConfig::default()
        }
    }
}

struct Env<F>(F);

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn optional(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, key: &'static str) -> Result<String, ConfigError> {
        self.optional(key).ok_or(ConfigError::Missing(key))
    }

    fn parsed<T: FromStr>(&self, key: &'static str, default: T) -> Result<T, ConfigError> {
        match self.optional(key) {
            None => Ok(default),
            Some(value) => value
                .parse()
                .map_err(|_| ConfigError::Invalid { key, value }),
        }
    }

    fn worker_id(&self) -> Result<String, ConfigError> {
        match self.optional("SYNC_WORKER_ID") {
            None => Ok(generate_worker_id()),
            Some(value) if value.chars().count() > LOCK_OWNER_MAX_LEN => {
                Err(ConfigError::Invalid {
                    key: "SYNC_WORKER_ID",
                    value,
                })
            }
            Some(value) => Ok(value),
        }
    }

    /// Attempt counters are stored as `INTEGER`.
    fn max_attempts(&self, default: u32) -> Result<u32, ConfigError> {
        const KEY: &str = "SYNC_MAX_ATTEMPTS";
        let attempts = self.parsed(KEY, default)?;
        if attempts == 0 || i32::try_from(attempts).is_err() {
            return Err(ConfigError::Invalid {
                key: KEY,
                value: attempts.to_string(),
            });
        }
        Ok(attempts)
    }

    fn secs(&self, key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        self.parsed(key, default.as_secs()).map(Duration::from_secs)
    }

    fn millis(&self, key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        self.parsed(key, default.as_millis() as u64)
            .map(Duration::from_millis)
    }

    fn flag(&self, key: &'static str, default: bool) -> Result<bool, ConfigError> {
        match self.optional(key) {
            None => Ok(default),
            Some(value) => match value.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::Invalid { key, value }),
            },
        }
    }
}
