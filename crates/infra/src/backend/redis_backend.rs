//! Redis-backed cache and lock primitives.

use std::sync::Arc;
use std::time::Duration;

use redis::aio::MultiplexedConnection;
use tracing::instrument;

use super::BackendError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const SCAN_BATCH: usize = 200;

/// Deletes the key only if it still holds the caller's token.
const RELEASE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

#[derive(Clone)]
pub struct RedisBackend {
    client: Arc<redis::Client>,
    conn: MultiplexedConnection,
    release: Arc<redis::Script>,
}

impl std::fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackend")
            .field("connection", &self.client.get_connection_info().addr)
            .finish()
    }
}

impl RedisBackend {
    /// Open a multiplexed connection and verify it with `PING`.
    pub async fn connect(redis_url: &str) -> Result<Self, BackendError> {
        let client =
            redis::Client::open(redis_url).map_err(|e| BackendError::Connection(e.to_string()))?;

        let mut conn = tokio::time::timeout(CONNECT_TIMEOUT, client.get_multiplexed_async_connection())
            .await
            .map_err(|_| BackendError::Connection("timed out connecting to redis".into()))?
            .map_err(|e| BackendError::Connection(e.to_string()))?;

        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| BackendError::Connection(e.to_string()))?;

        Ok(Self {
            client: Arc::new(client),
            conn,
            release: Arc::new(redis::Script::new(RELEASE_SCRIPT)),
        })
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(command_error)?;
        Ok(value)
    }

    pub async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), BackendError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(command_error)?;
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> Result<(), BackendError> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(command_error)?;
        Ok(())
    }

    /// Delete every key starting with `prefix`, scanning in batches.
    pub async fn delete_prefix(&self, prefix: &str) -> Result<usize, BackendError> {
        let mut conn = self.conn.clone();
        let pattern = format!("{prefix}*");
        let mut cursor: u64 = 0;
        let mut deleted = 0usize;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(command_error)?;

            if !keys.is_empty() {
                let removed: i64 = redis::cmd("DEL")
                    .arg(&keys)
                    .query_async(&mut conn)
                    .await
                    .map_err(command_error)?;
                deleted += removed.max(0) as usize;
            }

            if next == 0 {
                return Ok(deleted);
            }
            cursor = next;
        }
    }

    /// `SET key token NX PX ttl`; returns whether the key was set.
    #[instrument(skip(self, token), err)]
    pub async fn set_if_absent(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, BackendError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(command_error)?;
        Ok(reply.is_some())
    }

    /// Atomically delete `key` if it still holds `token`.
    #[instrument(skip(self, token), err)]
    pub async fn delete_if_equals(&self, key: &str, token: &str) -> Result<bool, BackendError> {
        let mut conn = self.conn.clone();
        let removed: i64 = self
            .release
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await
            .map_err(command_error)?;
        Ok(removed > 0)
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

fn command_error(err: redis::RedisError) -> BackendError {
    if err.is_connection_dropped() || err.is_io_error() || err.is_timeout() {
        BackendError::Connection(err.to_string())
    } else {
        BackendError::Command(err.to_string())
    }
}
