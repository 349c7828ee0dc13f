//! Gateway module - Authenticated request dispatch
//!
//! This module provides:
//! - [`TokenGateway`]: credential injection, envelope checks and single-flight refresh
//! - [`HttpTransport`]: the HTTP seam, with [`ReqwestTransport`] for production
//! - Wire types for requests, credentials and the `{ data, result }` envelope

mod client;
mod error;
mod refresh;
mod transport;
mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use client::TokenGateway;
pub use error::{GatewayError, TransportError};
pub use refresh::{RefreshOutcome, RefreshPhase};
pub use transport::{HttpTransport, ReqwestTransport, TransportRequest, TransportResponse};
pub use types::{
    ApiEnvelope, ApiResult, CredentialPair, LoginRequest, RequestDescriptor, SUCCESS_CODE,
    UNAUTHORIZED_CODE,
};
