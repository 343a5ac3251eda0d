//! HTTP transport for the loyalty API with idempotency-aware retries.
//!
//! Retries here are the fast inner tier: a few attempts with a short
//! exponential backoff. Anything that still fails surfaces to the job queue,
//! which applies its own, much slower backoff.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client as ReqwestClient, Method};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

/// Where in the request lifecycle a transport failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureStage {
    /// Waiting for a pooled connection; nothing was sent.
    Pool,
    /// Establishing the connection; nothing was sent.
    Connect,
    /// Sending the request; the server may have seen part or all of it.
    Write,
    /// Waiting for or reading the response; the server may have acted.
    Read,
    /// Anything else (builder errors, redirects, ...).
    Other,
}

impl FailureStage {
    /// Failures that provably happened before the server saw the request.
    pub fn is_before_send(&self) -> bool {
        matches!(self, FailureStage::Pool | FailureStage::Connect)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureStage::Pool => "pool",
            FailureStage::Connect => "connect",
            FailureStage::Write => "write",
            FailureStage::Read => "read",
            FailureStage::Other => "other",
        }
    }
}

impl std::fmt::Display for FailureStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("transport failure at {stage} stage: {message}")]
pub struct TransportError {
    pub stage: FailureStage,
    pub message: String,
}

impl TransportError {
    pub fn new(stage: FailureStage, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        Self::new(classify(&err), err.to_string())
    }
}

fn classify(err: &reqwest::Error) -> FailureStage {
    // A connect timeout reports both flags; it never reached the server.
    if err.is_connect() {
        FailureStage::Connect
    } else if err.is_timeout() || err.is_body() || err.is_decode() {
        FailureStage::Read
    } else if err.is_request() {
        FailureStage::Write
    } else {
        FailureStage::Other
    }
}

/// Whether repeating a request can change remote state a second time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Idempotency {
    Idempotent,
    NonIdempotent,
}

/// A JSON request against the loyalty API.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub body: Option<Value>,
    pub bearer: Option<String>,
    pub idempotency: Idempotency,
}

impl ApiRequest {
    pub fn post(path: impl Into<String>, body: Value, idempotency: Idempotency) -> Self {
        Self {
            method: Method::POST,
            path: path.into(),
            body: Some(body),
            bearer: None,
            idempotency,
        }
    }

    pub fn with_bearer(mut self, token: impl Into<String>) -> Self {
        self.bearer = Some(token.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: String,
}

impl ApiResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_server_error(&self) -> bool {
        (500..600).contains(&self.status)
    }

    /// Decode the body, treating an empty body as `{}`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        if self.body.trim().is_empty() {
            serde_json::from_str("{}")
        } else {
            serde_json::from_str(&self.body)
        }
    }
}

/// Executes one [`ApiRequest`].
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    async fn execute(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError> {
        (**self).execute(request).await
    }
}

/// `reqwest`-backed transport rooted at the API base URL.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: ReqwestClient,
    base_url: String,
}

impl ReqwestTransport {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, TransportError> {
        let client = ReqwestClient::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .no_proxy()
            .build()
            .map_err(|e| TransportError::new(FailureStage::Other, e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn execute(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError> {
        let mut builder = self
            .client
            .request(request.method.clone(), self.url(&request.path));
        if let Some(token) = &request.bearer {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| {
            TransportError::new(FailureStage::Read, format!("failed to read body: {e}"))
        })?;
        Ok(ApiResponse { status, body })
    }
}

/// Inner-tier retry settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportRetryPolicy {
    /// Total number of attempts (initial try + retries).
    pub max_attempts: usize,
    pub base_backoff: Duration,
}

impl Default for TransportRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(200),
        }
    }
}

impl TransportRetryPolicy {
    fn backoff_delay(&self, retry_number: usize) -> Duration {
        let shift = retry_number.saturating_sub(1).min(8) as u32;
        self.base_backoff.saturating_mul(1u32 << shift)
    }

    /// Worst-case wall time of one logical call, given a per-attempt timeout.
    pub fn worst_case(&self, per_attempt: Duration) -> Duration {
        let attempts = self.max_attempts.max(1);
        let sleeps: Duration = (1..attempts).map(|n| self.backoff_delay(n)).sum();
        per_attempt.saturating_mul(attempts as u32) + sleeps
    }
}

/// Wraps a transport with retries that respect [`Idempotency`]:
///
/// - idempotent requests retry on any transport stage and on 5xx responses;
/// - non-idempotent requests retry only when the failure happened before the
///   request left this process.
#[derive(Debug, Clone)]
pub struct RetryingTransport<T> {
    inner: T,
    policy: TransportRetryPolicy,
}

impl<T: Transport> RetryingTransport<T> {
    pub fn new(inner: T, policy: TransportRetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn policy(&self) -> &TransportRetryPolicy {
        &self.policy
    }

    async fn sleep_with_backoff(&self, retry_number: usize) {
        let delay = self.policy.backoff_delay(retry_number);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

fn should_retry_error(err: &TransportError, idempotency: Idempotency) -> bool {
    match idempotency {
        Idempotency::Idempotent => err.stage != FailureStage::Other,
        Idempotency::NonIdempotent => err.stage.is_before_send(),
    }
}

#[async_trait]
impl<T: Transport> Transport for RetryingTransport<T> {
    async fn execute(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError> {
        let attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let last = attempt >= attempts;

            match self.inner.execute(request).await {
                Ok(response) => {
                    if response.is_server_error()
                        && request.idempotency == Idempotency::Idempotent
                        && !last
                    {
                        debug!(attempt, path = %request.path, status = response.status, "retrying server error");
                        self.sleep_with_backoff(attempt).await;
                        continue;
                    }
                    return Ok(response);
                }
                Err(err) => {
                    if !last && should_retry_error(&err, request.idempotency) {
                        debug!(attempt, path = %request.path, stage = %err.stage, error = %err.message, "retrying transport failure");
                        self.sleep_with_backoff(attempt).await;
                        continue;
                    }
                    return Err(err);
                }
            }
        }
    }
}
