//! Key-space partitions

use std::fmt;

use serde::{Deserialize, Serialize};

/// Logical partition of the session key space
///
/// The namespace is part of every physical storage key, so the same logical
/// key under two namespaces can never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Namespace {
    /// Credentials
    Auth,
    /// Cached user profile
    User,
    /// Navigation/menu data
    Menu,
    /// User preferences
    Preferences,
    /// Arbitrary response caches
    Cache,
    /// UI state (open panels, table layouts)
    Ui,
    /// Feature flags
    Feature,
}

impl Namespace {
    /// Every namespace, in declaration order
    pub const ALL: [Namespace; 7] = [
        Namespace::Auth,
        Namespace::User,
        Namespace::Menu,
        Namespace::Preferences,
        Namespace::Cache,
        Namespace::Ui,
        Namespace::Feature,
    ];

    /// Namespaces holding data tied to the signed-in user. These are purged
    /// on logout; the rest describe the device and survive it.
    pub const USER_SCOPED: [Namespace; 4] = [
        Namespace::Auth,
        Namespace::User,
        Namespace::Menu,
        Namespace::Cache,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::Auth => "auth",
            Namespace::User => "user",
            Namespace::Menu => "menu",
            Namespace::Preferences => "preferences",
            Namespace::Cache => "cache",
            Namespace::Ui => "ui",
            Namespace::Feature => "feature",
        }
    }

    /// Writes to these namespaces are announced to other contexts
    pub fn is_security_relevant(&self) -> bool {
        matches!(self, Namespace::Auth | Namespace::User)
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
