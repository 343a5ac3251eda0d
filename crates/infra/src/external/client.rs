use std::time::Duration;

use async_trait::async_trait;
use loyaltysync_core::{CardIdentity, Phone};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use tracing::{debug, instrument, warn};

use super::SyncClient;
use super::errors::{SyncClientError, SyncClientResult};
use super::token::TokenManager;
use super::transport::{
    ApiRequest, ApiResponse, Idempotency, ReqwestTransport, RetryingTransport, Transport,
    TransportRetryPolicy,
};
use super::types::{CardRef, Profile};
use crate::backend::SharedBackend;

pub const LOOKUP_PATH: &str = "/api/1/loyalty/customer/info";
pub const CREATE_OR_UPDATE_PATH: &str = "/api/1/loyalty/customer/create_or_update";
pub const ADD_CARD_PATH: &str = "/api/1/loyalty/customer/card/add";

pub const DEFAULT_COMMENT: &str = "CASHBACK MOBILE APP CLIENT";

const MAX_LOGGED_BODY: usize = 500;

/// Connection and identity settings for [`LoyaltyClient`].
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub base_url: String,
    pub api_login: String,
    pub organization_id: String,
    /// Per-attempt request timeout.
    pub timeout: Duration,
    pub retry: TransportRetryPolicy,
    pub default_comment: String,
}

impl ClientSettings {
    pub fn new(
        base_url: impl Into<String>,
        api_login: impl Into<String>,
        organization_id: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            api_login: api_login.into(),
            organization_id: organization_id.into(),
            timeout: Duration::from_secs(10),
            retry: TransportRetryPolicy::default(),
            default_comment: DEFAULT_COMMENT.to_string(),
        }
    }

    /// Longest time one logical call can take, retries included.
    pub fn worst_case_call(&self) -> Duration {
        self.retry.worst_case(self.timeout)
    }
}

/// Loyalty API client: bearer auth with one forced refresh on 401/403,
/// idempotency-aware transport retries underneath.
#[derive(Debug)]
pub struct LoyaltyClient<T = ReqwestTransport> {
    transport: RetryingTransport<T>,
    tokens: TokenManager,
    organization_id: String,
    default_comment: String,
}

impl LoyaltyClient<ReqwestTransport> {
    pub fn from_settings(settings: &ClientSettings, backend: SharedBackend) -> SyncClientResult<Self> {
        let transport = ReqwestTransport::new(settings.base_url.clone(), settings.timeout)?;
        Ok(Self::new(transport, settings, backend))
    }
}

impl<T: Transport> LoyaltyClient<T> {
    pub fn new(transport: T, settings: &ClientSettings, backend: SharedBackend) -> Self {
        Self {
            transport: RetryingTransport::new(transport, settings.retry),
            tokens: TokenManager::new(backend, settings.api_login.clone()),
            organization_id: settings.organization_id.clone(),
            default_comment: settings.default_comment.clone(),
        }
    }

    pub fn tokens(&self) -> &TokenManager {
        &self.tokens
    }

    async fn send(
        &self,
        path: &str,
        body: Value,
        idempotency: Idempotency,
    ) -> SyncClientResult<ApiResponse> {
        let token = self.tokens.token(&self.transport, None).await?;
        let request = ApiRequest::post(path, body, idempotency).with_bearer(token.clone());
        let response = self.transport.execute(&request).await?;

        if !matches!(response.status, 401 | 403) {
            return Ok(response);
        }

        debug!(path, status = response.status, "loyalty_token_rejected");
        let fresh = self.tokens.token(&self.transport, Some(&token)).await?;
        Ok(self.transport.execute(&request.with_bearer(fresh)).await?)
    }

    async fn call<R: DeserializeOwned>(
        &self,
        path: &str,
        body: Value,
        idempotency: Idempotency,
    ) -> SyncClientResult<R> {
        let response = self.send(path, body, idempotency).await?;
        if !response.is_success() {
            return Err(status_error(path, &response));
        }
        response
            .json()
            .map_err(|e| SyncClientError::Decode(e.to_string()))
    }
}

fn status_error(path: &str, response: &ApiResponse) -> SyncClientError {
    let body: String = response.body.chars().take(MAX_LOGGED_BODY).collect();
    warn!(path, status = response.status, body = %body, "loyalty_request_failed");
    SyncClientError::from_status(response.status, body)
}

#[async_trait]
impl<T: Transport> SyncClient for LoyaltyClient<T> {
    #[instrument(skip_all, fields(phone = %phone), err)]
    async fn lookup(&self, phone: &Phone) -> SyncClientResult<Option<Profile>> {
        let body = json!({
            "organizationId": self.organization_id,
            "phone": phone.as_str(),
            "type": "phone",
        });
        let response = self.send(LOOKUP_PATH, body, Idempotency::Idempotent).await?;

        match response.status {
            404 | 400 => {
                debug!(phone = %phone, status = response.status, "loyalty_customer_not_found");
                Ok(None)
            }
            _ if !response.is_success() => Err(status_error(LOOKUP_PATH, &response)),
            _ if response.body.trim().is_empty() => Ok(None),
            _ => response
                .json()
                .map(Some)
                .map_err(|e| SyncClientError::Decode(e.to_string())),
        }
    }

    #[instrument(skip_all, fields(phone = %phone), err)]
    async fn create_or_update(
        &self,
        phone: &Phone,
        fields: Map<String, Value>,
    ) -> SyncClientResult<Profile> {
        let mut body = Map::new();
        body.insert("organizationId".into(), json!(self.organization_id));
        body.insert("phone".into(), json!(phone.as_str()));
        body.extend(fields);
        body.entry("comment")
            .or_insert_with(|| json!(self.default_comment));

        self.call(CREATE_OR_UPDATE_PATH, Value::Object(body), Idempotency::NonIdempotent)
            .await
    }

    #[instrument(skip_all, fields(customer_id = %customer_id, card_number = %card.card_number), err)]
    async fn issue_card(&self, customer_id: &str, card: &CardIdentity) -> SyncClientResult<CardRef> {
        let body = json!({
            "organizationId": self.organization_id,
            "customerId": customer_id,
            "cardTrack": card.card_track,
            "cardNumber": card.card_number,
        });
        self.call(ADD_CARD_PATH, body, Idempotency::NonIdempotent).await
    }
}
