//! Coordinator module - Session lifecycle for one execution context
//!
//! [`SessionCoordinator`] restores the session at startup, records sign-in
//! and sign-out, and follows changes other contexts make to the shared store.

mod manager;
mod profile;

pub use manager::{SessionCallback, SessionCoordinator};
pub use profile::{SessionState, UserProfile};

use thiserror::Error;

use crate::gateway::GatewayError;

/// Errors surfaced by session lifecycle operations
#[derive(Debug, Error)]
pub enum SessionError {
    /// The operation needs stored credentials and there are none
    #[error("Not authenticated")]
    NotAuthenticated,

    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

impl SessionError {
    /// True if the application should return to its sign-in screen
    pub fn is_reauth_required(&self) -> bool {
        match self {
            SessionError::NotAuthenticated => true,
            SessionError::Gateway(e) => e.is_reauth_required(),
        }
    }
}
