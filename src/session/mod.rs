//! Session module - Namespaced, expiring, structured storage
//!
//! Wraps a raw [`KeyValueStore`](crate::storage::KeyValueStore) with:
//! - namespacing (`{prefix}:{namespace}:{key}` physical keys)
//! - JSON encoding of [`StoredRecord`]s
//! - lazy TTL expiry, enforced on read
//! - change announcements for security-relevant namespaces

mod clock;
mod namespace;
mod record;
mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use namespace::Namespace;
pub use record::StoredRecord;
pub use store::{SessionStore, SetOptions};

/// Well-known logical keys shared by the gateway and the coordinator
pub mod keys {
    /// [`CredentialPair`](crate::gateway::CredentialPair) under [`Namespace::Auth`](super::Namespace::Auth)
    pub const CREDENTIALS: &str = "credentials";
    /// [`UserProfile`](crate::coordinator::UserProfile) under [`Namespace::User`](super::Namespace::User)
    pub const PROFILE: &str = "profile";
}
