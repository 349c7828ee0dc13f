//! Gateway error taxonomy

use std::time::Duration;

use thiserror::Error;

/// Failures of the HTTP primitive itself
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection, TLS, or body read failure
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// Transport cannot be used (stub, shut down, misconfigured)
    #[error("Transport unavailable: {0}")]
    Unavailable(String),
}

/// Errors surfaced by [`TokenGateway`](super::TokenGateway)
///
/// An expired access token is never surfaced directly: it triggers one
/// refresh-and-retry cycle, and a second expiry becomes
/// [`ReauthRequired`](GatewayError::ReauthRequired).
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Authenticated request attempted with nothing stored
    #[error("No credentials stored")]
    NoCredentials,

    /// Network failure, surfaced as-is and never retried here
    #[error("Transport failure: {0}")]
    Transport(#[from] TransportError),

    /// The session cannot continue; the application should sign out
    #[error("Re-authentication required: {0}")]
    ReauthRequired(String),

    /// Backend answered with a non-200 result code
    #[error("Request failed with code {status_code}: {description}")]
    DomainFailure {
        status_code: i64,
        description: String,
        details: Option<serde_json::Value>,
    },

    /// Non-success HTTP status without a usable envelope
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// Response body did not match the expected shape
    #[error("Failed to decode response: {0}")]
    Decode(String),

    /// A queued request lost its refresh cycle before being settled
    #[error("Refresh cycle ended without settling this request")]
    RefreshAbandoned,
}

impl GatewayError {
    /// True if the application should return to an unauthenticated state
    pub fn is_reauth_required(&self) -> bool {
        matches!(
            self,
            GatewayError::ReauthRequired(_) | GatewayError::RefreshAbandoned
        )
    }

    /// Backend result code of a domain failure
    pub fn status_code(&self) -> Option<i64> {
        match self {
            GatewayError::DomainFailure { status_code, .. } => Some(*status_code),
            GatewayError::Status { status, .. } => Some(i64::from(*status)),
            _ => None,
        }
    }
}
