//! Storage module - Raw persistent key-value backends
//!
//! The session core only ever talks to storage through [`KeyValueStore`]:
//! string keys, string values, a handful of async operations. Structured
//! encoding, namespacing and expiry live one layer up in [`crate::session`].
//!
//! Backends:
//! - [`MemoryStorage`]: shared in-process map (tests, multi-context emulation)
//! - [`FileStorage`]: JSON file on disk
//! - [`KeyringStorage`]: OS credential manager via the keyring crate

mod file;
mod keyring;
mod memory;

pub use self::file::FileStorage;
pub use self::keyring::KeyringStorage;
pub use self::memory::MemoryStorage;

use async_trait::async_trait;
use thiserror::Error;

/// Errors raised by storage backends
///
/// These never reach application code: the session store logs and swallows
/// them.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Backing data could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// OS credential manager failure
    #[error("Keyring error: {0}")]
    Keyring(#[from] ::keyring::Error),

    /// Backend refused the operation
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// Platform-supplied persistent key-value storage
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Returns the stored value, or `None` if the key is absent
    async fn get_item(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Stores a value, overwriting any previous one
    async fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Removes a key. Removing an absent key is not an error.
    async fn remove_item(&self, key: &str) -> Result<(), StorageError>;

    /// Removes every key held by this backend
    async fn clear(&self) -> Result<(), StorageError>;

    /// Lists every key currently held by this backend
    async fn keys(&self) -> Result<Vec<String>, StorageError>;
}
