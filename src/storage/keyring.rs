//! OS credential manager storage
//!
//! Stores each item as a separate credential (Windows Credential Manager,
//! macOS Keychain, Linux Secret Service) under a fixed service name.

use std::collections::BTreeSet;

use ::keyring::Entry;
use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{KeyValueStore, StorageError};

/// Keyring-backed storage
///
/// The credential manager cannot enumerate the entries of a service, so
/// [`keys`](KeyValueStore::keys) and [`clear`](KeyValueStore::clear) only
/// see keys written through this instance.
///
/// # Example
///
/// ```no_run
/// use session_gate::storage::{KeyValueStore, KeyringStorage};
///
/// # async fn demo() -> Result<(), session_gate::storage::StorageError> {
/// let storage = KeyringStorage::new();
/// storage.set_item("app:auth:credentials", "{...}").await?;
/// let raw = storage.get_item("app:auth:credentials").await?;
/// assert!(raw.is_some());
/// # Ok(())
/// # }
/// ```
pub struct KeyringStorage {
    service: String,
    written: RwLock<BTreeSet<String>>,
}

impl KeyringStorage {
    /// Creates a storage with the default service name
    pub fn new() -> Self {
        Self::with_service("SessionGate")
    }

    /// Creates a storage with a custom service name
    ///
    /// Useful for separating credential sets per deployment.
    pub fn with_service(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            written: RwLock::new(BTreeSet::new()),
        }
    }

    /// Returns the service name used for this store
    pub fn service(&self) -> &str {
        &self.service
    }

    // keyring calls block on platform IPC, keep them off the runtime threads
    async fn blocking<T, F>(&self, key: &str, op: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(Entry) -> Result<T, ::keyring::Error> + Send + 'static,
    {
        let service = self.service.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || {
            let entry = Entry::new(&service, &key)?;
            op(entry)
        })
        .await
        .map_err(|e| StorageError::Unavailable(format!("keyring task failed: {}", e)))?
        .map_err(StorageError::from)
    }
}

impl Default for KeyringStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueStore for KeyringStorage {
    async fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.blocking(key, |entry| match entry.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(::keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e),
        })
        .await
    }

    async fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let value = value.to_string();
        self.blocking(key, move |entry| entry.set_password(&value))
            .await?;
        self.written.write().await.insert(key.to_string());
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        self.blocking(key, |entry| match entry.delete_credential() {
            Ok(()) | Err(::keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e),
        })
        .await?;
        self.written.write().await.remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<(), StorageError> {
        for key in self.keys().await? {
            if let Err(e) = self.remove_item(&key).await {
                tracing::warn!("Failed to clear keyring entry: {}", e);
            }
        }
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.written.read().await.iter().cloned().collect())
    }
}
