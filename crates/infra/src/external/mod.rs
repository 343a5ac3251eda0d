//! Client for the remote loyalty backend.
//!
//! Two retry tiers apply to every remote call: [`RetryingTransport`] retries
//! quickly inside one job attempt, and whatever still fails is handed back to
//! the job queue and its exponential backoff.

pub mod client;
pub mod errors;
#[cfg(test)]
pub(crate) mod fake;
pub mod token;
pub mod transport;
pub mod types;

use async_trait::async_trait;
use loyaltysync_core::{CardIdentity, Phone};
use serde_json::{Map, Value};

pub use client::{ClientSettings, DEFAULT_COMMENT, LoyaltyClient};
pub use errors::{SyncClientError, SyncClientResult};
pub use token::TokenManager;
pub use transport::{
    ApiRequest, ApiResponse, FailureStage, Idempotency, ReqwestTransport, RetryingTransport,
    Transport, TransportError, TransportRetryPolicy,
};
pub use types::{CardRef, Profile, RemoteCard, WalletBalance, format_birthday};

/// Operations the sync handlers need from the loyalty backend.
#[async_trait]
pub trait SyncClient: Send + Sync {
    /// Look a customer up by phone; `None` when the backend does not know it.
    async fn lookup(&self, phone: &Phone) -> SyncClientResult<Option<Profile>>;

    /// Create the customer or update its fields. Not idempotent.
    async fn create_or_update(
        &self,
        phone: &Phone,
        fields: Map<String, Value>,
    ) -> SyncClientResult<Profile>;

    /// Bind a new card to an existing remote customer. Not idempotent.
    async fn issue_card(&self, customer_id: &str, card: &CardIdentity) -> SyncClientResult<CardRef>;
}
