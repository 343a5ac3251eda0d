//! Access token cache with single-flighted refresh.

use std::time::Duration;

use serde_json::json;
use tracing::{debug, info, warn};

use super::errors::{SyncClientError, SyncClientResult};
use super::transport::{ApiRequest, Idempotency, Transport};
use super::types::TokenResponse;
use crate::backend::SharedBackend;
use crate::lock::{DistributedLock, LockOptions};

pub const TOKEN_PATH: &str = "/api/1/access_token";
pub const ACCESS_TOKEN_KEY: &str = "loyalty:access_token";
pub const REFRESH_LOCK_KEY: &str = "loyalty:access_token:refresh";

const DEFAULT_LIFETIME_SECS: u64 = 3600;
const EXPIRY_BUFFER_SECS: u64 = 30;
const MIN_CACHE_SECS: u64 = 30;

/// Cached token lifetime: the advertised expiry minus a safety buffer.
pub fn cache_ttl(lifetime_secs: Option<u64>) -> Duration {
    let lifetime = lifetime_secs.unwrap_or(DEFAULT_LIFETIME_SECS);
    Duration::from_secs(lifetime.saturating_sub(EXPIRY_BUFFER_SECS).max(MIN_CACHE_SECS))
}

#[derive(Debug, Clone)]
pub struct TokenManager {
    backend: SharedBackend,
    api_login: String,
    lock_options: LockOptions,
}

impl TokenManager {
    pub fn new(backend: SharedBackend, api_login: impl Into<String>) -> Self {
        Self {
            backend,
            api_login: api_login.into(),
            lock_options: LockOptions {
                ttl: Duration::from_secs(15),
                wait: Duration::from_secs(5),
                retry_interval: Duration::from_millis(50),
            },
        }
    }

    pub fn with_lock_options(mut self, lock_options: LockOptions) -> Self {
        self.lock_options = lock_options;
        self
    }

    /// Return a usable token.
    ///
    /// `rejected` is the token the server just refused; a cached value equal
    /// to it is treated as a miss and forces a refresh.
    pub async fn token(
        &self,
        transport: &dyn Transport,
        rejected: Option<&str>,
    ) -> SyncClientResult<String> {
        if let Some(token) = self.cached(rejected).await {
            return Ok(token);
        }

        let mut lock = DistributedLock::new(
            self.backend.clone(),
            REFRESH_LOCK_KEY,
            self.lock_options,
        );
        if !lock.acquire().await {
            // The holder may have finished while we waited.
            return match self.cached(rejected).await {
                Some(token) => Ok(token),
                None => {
                    debug!("access_token_refresh_in_progress");
                    Err(SyncClientError::TokenRefreshInProgress)
                }
            };
        }

        let result = match self.cached(rejected).await {
            Some(token) => Ok(token),
            None => self.fetch(transport).await,
        };
        lock.release().await;
        result
    }

    /// Drop the cached token.
    pub async fn invalidate(&self) {
        if let Err(e) = self.backend.delete(ACCESS_TOKEN_KEY).await {
            warn!(error = %e, "access_token_invalidate_failed");
        }
    }

    async fn cached(&self, rejected: Option<&str>) -> Option<String> {
        match self.backend.get(ACCESS_TOKEN_KEY).await {
            Ok(Some(token)) if !token.is_empty() && Some(token.as_str()) != rejected => Some(token),
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, "access_token_cache_read_failed");
                None
            }
        }
    }

    async fn fetch(&self, transport: &dyn Transport) -> SyncClientResult<String> {
        let request = ApiRequest::post(
            TOKEN_PATH,
            json!({ "apiLogin": self.api_login }),
            Idempotency::Idempotent,
        );
        let response = transport.execute(&request).await?;
        if !response.is_success() {
            warn!(status = response.status, "access_token_refresh_failed");
            return Err(SyncClientError::Token(format!(
                "token endpoint returned {}",
                response.status
            )));
        }

        let payload: TokenResponse = response
            .json()
            .map_err(|e| SyncClientError::Decode(e.to_string()))?;
        let token = payload
            .token
            .clone()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| SyncClientError::Token("token missing in response".into()))?;

        let ttl = cache_ttl(payload.lifetime_secs());
        if let Err(e) = self.backend.set(ACCESS_TOKEN_KEY, &token, ttl).await {
            warn!(error = %e, "access_token_cache_write_failed");
        }
        info!(ttl_secs = ttl.as_secs(), "access_token_refreshed");
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::external::transport::testing::ScriptedTransport;
    use crate::external::transport::{ApiResponse, ReqwestTransport};

    #[test]
    fn cache_ttl_keeps_buffer_and_floor() {
        assert_eq!(cache_ttl(None), Duration::from_secs(3570));
        assert_eq!(cache_ttl(Some(600)), Duration::from_secs(570));
        assert_eq!(cache_ttl(Some(40)), Duration::from_secs(30));
        assert_eq!(cache_ttl(Some(0)), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn caches_fetched_token() {
        let backend = SharedBackend::local();
        let manager = TokenManager::new(backend.clone(), "login");
        let transport = ScriptedTransport::new(vec![Ok(ApiResponse::new(
            200,
            r#"{"token":"t-1","expiresIn":600}"#,
        ))]);

        assert_eq!(manager.token(&transport, None).await.unwrap(), "t-1");
        assert_eq!(manager.token(&transport, None).await.unwrap(), "t-1");
        assert_eq!(transport.calls(), 1);
        assert_eq!(backend.get(ACCESS_TOKEN_KEY).await.unwrap().as_deref(), Some("t-1"));
    }

    #[tokio::test]
    async fn rejected_token_forces_refresh() {
        let manager = TokenManager::new(SharedBackend::local(), "login");
        let transport = ScriptedTransport::new(vec![
            Ok(ApiResponse::new(200, r#"{"token":"t-1"}"#)),
            Ok(ApiResponse::new(200, r#"{"token":"t-2"}"#)),
        ]);

        let first = manager.token(&transport, None).await.unwrap();
        let second = manager.token(&transport, Some(&first)).await.unwrap();
        assert_eq!(second, "t-2");
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn missing_token_is_an_error() {
        let manager = TokenManager::new(SharedBackend::local(), "login");
        let transport = ScriptedTransport::new(vec![
            Ok(ApiResponse::new(200, r#"{"expiresIn":600}"#)),
            Ok(ApiResponse::new(401, "")),
        ]);

        assert!(matches!(manager.token(&transport, None).await, Err(SyncClientError::Token(_))));
        assert!(matches!(manager.token(&transport, None).await, Err(SyncClientError::Token(_))));
    }

    #[tokio::test]
    async fn contended_refresh_reports_in_progress() {
        let backend = SharedBackend::local();
        let manager = TokenManager::new(backend.clone(), "login").with_lock_options(LockOptions {
            ttl: Duration::from_secs(5),
            wait: Duration::from_millis(20),
            retry_interval: Duration::from_millis(5),
        });

        let mut holder = DistributedLock::new(backend, REFRESH_LOCK_KEY, LockOptions::default());
        assert!(holder.acquire().await);

        let transport = ScriptedTransport::new(vec![]);
        assert!(matches!(
            manager.token(&transport, None).await,
            Err(SyncClientError::TokenRefreshInProgress)
        ));
        assert_eq!(transport.calls(), 0);
        holder.release().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_share_one_refresh() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(TOKEN_PATH))
            .and(body_json(serde_json::json!({"apiLogin": "login"})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"token": "shared", "expiresIn": 3600}))
                    .set_delay(Duration::from_millis(50)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let transport = Arc::new(ReqwestTransport::new(server.uri(), Duration::from_secs(5)).unwrap());
        let manager = Arc::new(TokenManager::new(SharedBackend::local(), "login"));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let transport = Arc::clone(&transport);
            let manager = Arc::clone(&manager);
            handles.push(tokio::spawn(async move {
                manager.token(transport.as_ref(), None).await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "shared");
        }
        // `expect(1)` is verified when the server drops.
    }
}
