//! In-memory storage backend

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{KeyValueStore, StorageError};

/// Map-backed storage
///
/// Clones share the same map, so several session contexts built over clones
/// of one `MemoryStorage` see each other's writes the way browser tabs share
/// local storage.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    items: Arc<RwLock<HashMap<String, String>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of raw keys currently stored
    pub async fn len(&self) -> usize {
        self.items.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.read().await.is_empty()
    }

    /// Returns true if the raw key is physically present
    pub async fn contains_key(&self, key: &str) -> bool {
        self.items.read().await.contains_key(key)
    }
}

#[async_trait]
impl KeyValueStore for MemoryStorage {
    async fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.items.read().await.get(key).cloned())
    }

    async fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.items
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        self.items.write().await.remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.items.write().await.clear();
        Ok(())
    }

    /// Snapshot of all raw keys, sorted
    async fn keys(&self) -> Result<Vec<String>, StorageError> {
        let mut keys: Vec<String> = self.items.read().await.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_and_get() {
        let storage = MemoryStorage::new();
        storage.set_item("k", "v").await.unwrap();
        assert_eq!(storage.get_item("k").await.unwrap(), Some("v".to_string()));
        assert_eq!(storage.get_item("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let a = MemoryStorage::new();
        let b = a.clone();

        a.set_item("shared", "1").await.unwrap();
        assert_eq!(b.get_item("shared").await.unwrap(), Some("1".to_string()));

        b.remove_item("shared").await.unwrap();
        assert!(!a.contains_key("shared").await);
    }

    #[tokio::test]
    async fn test_remove_missing_is_ok() {
        let storage = MemoryStorage::new();
        assert!(storage.remove_item("nope").await.is_ok());
    }

    #[tokio::test]
    async fn test_clear() {
        let storage = MemoryStorage::new();
        storage.set_item("a", "1").await.unwrap();
        storage.set_item("b", "2").await.unwrap();
        assert_eq!(storage.keys().await.unwrap(), vec!["a".to_string(), "b".to_string()]);

        storage.clear().await.unwrap();
        assert!(storage.is_empty().await);
    }
}
