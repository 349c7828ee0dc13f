//! Session store
//!
//! Every operation here is infallible from the caller's point of view:
//! backend errors and undecodable records are logged and treated as a
//! missing value or a no-op, so session bookkeeping can never take
//! application code down with it.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::clock::{Clock, SystemClock};
use super::namespace::Namespace;
use super::record::StoredRecord;
use crate::broadcast::{Broadcaster, ChangeAction};
use crate::storage::KeyValueStore;

/// Options for a single write
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetOptions {
    /// Record lifetime; `None` means the record never expires
    pub ttl: Option<Duration>,
    /// Do not announce this write, even in a security-relevant namespace
    pub skip_broadcast: bool,
}

impl SetOptions {
    pub fn ttl(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            ..Default::default()
        }
    }

    pub fn silent() -> Self {
        Self {
            skip_broadcast: true,
            ..Default::default()
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_skip_broadcast(mut self, skip: bool) -> Self {
        self.skip_broadcast = skip;
        self
    }
}

/// Namespaced view over a raw key-value backend
pub struct SessionStore {
    backend: Arc<dyn KeyValueStore>,
    prefix: String,
    clock: Arc<dyn Clock>,
    broadcaster: Option<Broadcaster>,
}

impl SessionStore {
    /// Creates a store over `backend` whose physical keys start with `prefix`
    pub fn new(backend: Arc<dyn KeyValueStore>, prefix: impl Into<String>) -> Self {
        Self {
            backend,
            prefix: prefix.into(),
            clock: Arc::new(SystemClock),
            broadcaster: None,
        }
    }

    /// Announces security-relevant writes through `broadcaster`
    pub fn with_broadcaster(mut self, broadcaster: Broadcaster) -> Self {
        self.broadcaster = Some(broadcaster);
        self
    }

    /// Replaces the time source
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn broadcaster(&self) -> Option<&Broadcaster> {
        self.broadcaster.as_ref()
    }

    /// Physical storage key for a namespaced key
    pub fn physical_key(&self, namespace: Namespace, key: &str) -> String {
        format!("{}:{}:{}", self.prefix, namespace.as_str(), key)
    }

    fn namespace_prefix(&self, namespace: Namespace) -> String {
        format!("{}:{}:", self.prefix, namespace.as_str())
    }

    /// Reads a value, enforcing expiry
    ///
    /// Expired records are deleted on the way out and read as `None`.
    pub async fn get<T: DeserializeOwned>(&self, namespace: Namespace, key: &str) -> Option<T> {
        self.read_record(namespace, key).await.map(|record| record.value)
    }

    /// Writes a value that never expires
    pub async fn set<T: Serialize + ?Sized>(&self, namespace: Namespace, key: &str, value: &T) {
        self.set_with(namespace, key, value, SetOptions::default()).await
    }

    /// Writes a value, overwriting any previous record
    pub async fn set_with<T: Serialize + ?Sized>(
        &self,
        namespace: Namespace,
        key: &str,
        value: &T,
        options: SetOptions,
    ) {
        let record = StoredRecord::new(value, self.clock.now(), options.ttl);
        let encoded = match serde_json::to_string(&record) {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::warn!("Failed to encode {}/{}: {}", namespace, key, e);
                return;
            }
        };

        let physical = self.physical_key(namespace, key);
        if let Err(e) = self.backend.set_item(&physical, &encoded).await {
            tracing::warn!("Failed to write {}/{}: {}", namespace, key, e);
            return;
        }
        tracing::debug!("Stored {}/{} (ttl: {:?})", namespace, key, options.ttl);

        self.announce(namespace, key, ChangeAction::Set, options.skip_broadcast);
    }

    /// Removes a value and announces the removal
    pub async fn remove(&self, namespace: Namespace, key: &str) {
        self.remove_with(namespace, key, false).await
    }

    /// Removes a value, optionally without announcing it
    pub async fn remove_with(&self, namespace: Namespace, key: &str, skip_broadcast: bool) {
        if self.delete(namespace, key).await {
            self.announce(namespace, key, ChangeAction::Remove, skip_broadcast);
        }
    }

    /// True if an unexpired record exists
    pub async fn has_valid(&self, namespace: Namespace, key: &str) -> bool {
        self.read_record::<serde_json::Value>(namespace, key)
            .await
            .is_some()
    }

    /// Remaining lifetime of a record
    ///
    /// `None` if the record is absent, expired, or has no expiry.
    pub async fn time_to_expiry(&self, namespace: Namespace, key: &str) -> Option<Duration> {
        let record = self.read_record::<serde_json::Value>(namespace, key).await?;
        record.time_to_expiry(self.clock.now())
    }

    /// Keys of a namespace physically present in the backend, sorted
    ///
    /// Covers keys written by any context sharing the backend. Expired
    /// records that were never read are still listed.
    pub async fn keys(&self, namespace: Namespace) -> Vec<String> {
        let all = match self.backend.keys().await {
            Ok(all) => all,
            Err(e) => {
                tracing::warn!("Failed to list keys for {}: {}", namespace, e);
                return Vec::new();
            }
        };

        let prefix = self.namespace_prefix(namespace);
        let mut keys: Vec<String> = all
            .iter()
            .filter_map(|physical| physical.strip_prefix(prefix.as_str()))
            .map(str::to_string)
            .collect();
        keys.sort();
        keys
    }

    /// Removes every key of a namespace, whoever wrote it
    pub async fn clear_namespace(&self, namespace: Namespace) {
        let keys = self.keys(namespace).await;
        tracing::debug!("Clearing {} keys from {}", keys.len(), namespace);
        for key in keys {
            self.remove(namespace, &key).await;
        }
    }

    /// Clears several namespaces. Each one is attempted even if an earlier
    /// one failed.
    pub async fn clear_namespaces(&self, namespaces: &[Namespace]) {
        for namespace in namespaces {
            self.clear_namespace(*namespace).await;
        }
    }

    /// Clears every namespace
    pub async fn clear_all(&self) {
        self.clear_namespaces(&Namespace::ALL).await
    }

    async fn read_record<T: DeserializeOwned>(
        &self,
        namespace: Namespace,
        key: &str,
    ) -> Option<StoredRecord<T>> {
        let physical = self.physical_key(namespace, key);
        let raw = match self.backend.get_item(&physical).await {
            Ok(raw) => raw?,
            Err(e) => {
                tracing::warn!("Failed to read {}/{}: {}", namespace, key, e);
                return None;
            }
        };

        let record: StoredRecord<T> = match serde_json::from_str(&raw) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!("Discarding undecodable record {}/{}: {}", namespace, key, e);
                return None;
            }
        };

        if record.is_expired(self.clock.now()) {
            tracing::debug!("Record {}/{} expired, removing", namespace, key);
            // Expiry is bookkeeping, not a state change worth announcing
            self.delete(namespace, key).await;
            return None;
        }

        Some(record)
    }

    async fn delete(&self, namespace: Namespace, key: &str) -> bool {
        let physical = self.physical_key(namespace, key);
        if let Err(e) = self.backend.remove_item(&physical).await {
            tracing::warn!("Failed to remove {}/{}: {}", namespace, key, e);
            return false;
        }
        true
    }

    fn announce(&self, namespace: Namespace, key: &str, action: ChangeAction, skip: bool) {
        if skip || !namespace.is_security_relevant() {
            return;
        }
        if let Some(broadcaster) = &self.broadcaster {
            broadcaster.publish(namespace, key, action);
        }
    }
}
