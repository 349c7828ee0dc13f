//! User profile and session state

use serde::{Deserialize, Serialize};

use crate::security::Sanitizer;

/// Signed-in user as cached under the `user` namespace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: String,
    #[serde(default)]
    pub tenant_id: Option<String>,
    /// Bumped by the backend whenever the profile changes
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
}

impl UserProfile {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tenant_id: None,
            version: 0,
            display_name: None,
            email: None,
            roles: Vec::new(),
        }
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Same user, same tenant, same version
    ///
    /// Two profiles with the same revision are treated as identical even if
    /// other fields differ.
    pub fn same_revision(&self, other: &UserProfile) -> bool {
        self.id == other.id && self.tenant_id == other.tenant_id && self.version == other.version
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    /// User id as it may appear in logs
    pub fn masked_id(&self) -> String {
        Sanitizer::mask_string(&self.id, 2)
    }
}

/// What this context believes about the session
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Not restored yet
    #[default]
    Unknown,
    Unauthenticated,
    Authenticated(UserProfile),
}

impl SessionState {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, SessionState::Authenticated(_))
    }

    pub fn user(&self) -> Option<&UserProfile> {
        match self {
            SessionState::Authenticated(profile) => Some(profile),
            _ => None,
        }
    }
}
