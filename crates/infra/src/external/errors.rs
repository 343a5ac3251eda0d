use thiserror::Error;

use super::transport::TransportError;

#[derive(Debug, Clone, Error)]
pub enum SyncClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Another caller holds the token refresh lock; try again shortly.
    #[error("access token refresh already in progress")]
    TokenRefreshInProgress,

    #[error("access token unavailable: {0}")]
    Token(String),

    /// The remote side refused the request as malformed (400/422).
    #[error("request rejected by loyalty api ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("loyalty api returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("failed to decode loyalty api response: {0}")]
    Decode(String),
}

impl SyncClientError {
    pub(crate) fn from_status(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        match status {
            400 | 422 => SyncClientError::Rejected { status, body },
            _ => SyncClientError::Status { status, body },
        }
    }

    /// Failures caused by coordination, not by the remote service.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncClientError::TokenRefreshInProgress)
    }

    /// The same request will be refused again.
    pub fn is_rejection(&self) -> bool {
        matches!(self, SyncClientError::Rejected { .. })
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            SyncClientError::Rejected { status, .. } | SyncClientError::Status { status, .. } => {
                Some(*status)
            }
            _ => None,
        }
    }
}

pub type SyncClientResult<T> = Result<T, SyncClientError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::transport::FailureStage;

    #[test]
    fn classifies_statuses() {
        assert!(SyncClientError::from_status(400, "bad").is_rejection());
        assert!(SyncClientError::from_status(422, "bad").is_rejection());
        assert!(!SyncClientError::from_status(500, "boom").is_rejection());
        assert_eq!(SyncClientError::from_status(503, "").status(), Some(503));
    }

    #[test]
    fn only_refresh_contention_is_transient() {
        assert!(SyncClientError::TokenRefreshInProgress.is_transient());
        let transport: SyncClientError =
            TransportError::new(FailureStage::Read, "timed out").into();
        assert!(!transport.is_transient());
        assert!(transport.status().is_none());
    }
}
