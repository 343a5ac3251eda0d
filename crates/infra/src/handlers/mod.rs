//! Operation handlers: what each job kind actually does.
//!
//! Handlers run while the worker holds the per-target lock. They report a
//! [`HandlerError`] whose [`FailureClass`] tells the worker which queue
//! transition to apply.

mod sync;

use std::time::Duration;

use thiserror::Error;

use crate::customers::CustomerStoreError;
use crate::external::SyncClientError;

pub use sync::{SyncHandlers, SyncReport};

/// Requeue delay while another caller refreshes the access token.
const TOKEN_REFRESH_RETRY_AFTER: Duration = Duration::from_secs(2);

/// How the worker should treat a failed job attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Coordination hiccup; retry soon without spending an attempt.
    Infrastructure,
    /// Remote or storage failure; spend an attempt and back off.
    External,
    /// The same input will fail again.
    Rejected,
}

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Client(#[from] SyncClientError),

    #[error(transparent)]
    Store(#[from] CustomerStoreError),

    /// The job row cannot be executed as stored.
    #[error("invalid job: {0}")]
    InvalidJob(String),

    /// The operation ran but could not reach its goal.
    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    pub fn class(&self) -> FailureClass {
        match self {
            HandlerError::Client(e) if e.is_transient() => FailureClass::Infrastructure,
            HandlerError::Client(e) if e.is_rejection() => FailureClass::Rejected,
            HandlerError::InvalidJob(_) => FailureClass::Rejected,
            _ => FailureClass::External,
        }
    }

    /// Requeue delay for infrastructure failures; `None` means the default.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            HandlerError::Client(SyncClientError::TokenRefreshInProgress) => {
                Some(TOKEN_REFRESH_RETRY_AFTER)
            }
            _ => None,
        }
    }
}

pub type HandlerResult<T> = Result<T, HandlerError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::{FailureStage, TransportError};

    #[test]
    fn classification() {
        let transient = HandlerError::from(SyncClientError::TokenRefreshInProgress);
        assert_eq!(transient.class(), FailureClass::Infrastructure);
        assert_eq!(transient.retry_after(), Some(Duration::from_secs(2)));

        let rejected = HandlerError::from(SyncClientError::Rejected {
            status: 400,
            body: String::new(),
        });
        assert_eq!(rejected.class(), FailureClass::Rejected);

        let timeout = HandlerError::from(SyncClientError::from(TransportError::new(
            FailureStage::Read,
            "timed out",
        )));
        assert_eq!(timeout.class(), FailureClass::External);

        let storage = HandlerError::from(CustomerStoreError::Storage("down".into()));
        assert_eq!(storage.class(), FailureClass::External);
        assert_eq!(HandlerError::InvalidJob("x".into()).class(), FailureClass::Rejected);
        assert_eq!(HandlerError::Failed("remote_customer_not_found".into()).class(), FailureClass::External);
    }
}
