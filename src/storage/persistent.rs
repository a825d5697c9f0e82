// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Persistent tier service: write-through journal over a [`PersistentStore`].
//!
//! Writes replace every existing record for the key pair before inserting
//! the new one. Reads return the highest-id record. Storage failures on
//! the write path are logged and reported as `false`, never raised.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

use super::traits::{now_millis, PersistedRecord, PersistentStore, StorageError};

#[derive(Clone)]
pub struct PersistentCache {
    store: Arc<dyn PersistentStore>,
    default_ttl: Duration,
    max_value_bytes: usize,
}

impl PersistentCache {
    pub fn new(store: Arc<dyn PersistentStore>, default_ttl: Duration, max_value_bytes: usize) -> Self {
        Self {
            store,
            default_ttl,
            max_value_bytes,
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn PersistentStore> {
        &self.store
    }

    #[must_use]
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Replace the pair's records with one expiring `ttl` from now.
    #[tracing::instrument(skip(self, value), fields(value_len = value.len()))]
    pub async fn set(&self, primary_key: &str, secondary_key: &str, value: &str, ttl: Option<Duration>) -> bool {
        match self.try_set(primary_key, secondary_key, value, ttl).await {
            Ok(id) => {
                debug!(id, "Persisted");
                crate::metrics::record_operation("persistent", "set", "success");
                true
            }
            Err(e) => {
                error!(error = %e, "Persistent write failed");
                crate::metrics::record_operation("persistent", "set", "error");
                crate::metrics::record_error("persistent", "set", error_type(&e));
                false
            }
        }
    }

    async fn try_set(
        &self,
        primary_key: &str,
        secondary_key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<i64, StorageError> {
        if value.len() > self.max_value_bytes {
            return Err(StorageError::ValueTooLarge {
                size: value.len(),
                max: self.max_value_bytes,
            });
        }

        if self.store.count_pair(primary_key, secondary_key).await? > 0 {
            self.store.delete_pair(primary_key, secondary_key).await?;
        }

        let created_at = now_millis();
        let ttl_ms = ttl.unwrap_or(self.default_ttl).as_millis().min(i64::MAX as u128) as i64;
        let expires_at = created_at.saturating_add(ttl_ms);
        self.store
            .insert(primary_key, secondary_key, value, created_at, expires_at)
            .await
    }

    /// Serialized value of the latest record, or `NotFound`.
    pub async fn get(&self, primary_key: &str, secondary_key: &str) -> Result<String, StorageError> {
        self.record(primary_key, secondary_key).await.map(|r| r.value)
    }

    /// Latest record for the pair, or `NotFound`.
    pub async fn record(&self, primary_key: &str, secondary_key: &str) -> Result<PersistedRecord, StorageError> {
        self.store
            .latest(primary_key, secondary_key)
            .await?
            .ok_or(StorageError::NotFound)
    }

    /// Delete every record under the primary key.
    pub async fn remove(&self, primary_key: &str) -> Result<u64, StorageError> {
        self.store.delete_primary(primary_key).await
    }

    /// Delete every record for the pair.
    pub async fn remove_pair(&self, primary_key: &str, secondary_key: &str) -> Result<u64, StorageError> {
        self.store.delete_pair(primary_key, secondary_key).await
    }

    /// Keep only the highest-id record of each pair.
    pub async fn collapse_duplicates(&self) -> Result<u64, StorageError> {
        let removed = self.store.collapse_duplicates().await?;
        if removed > 0 {
            debug!(removed, "Collapsed duplicate records");
        }
        Ok(removed)
    }
}

fn error_type(e: &StorageError) -> &'static str {
    match e {
        StorageError::NotFound => "not_found",
        StorageError::Backend(_) => "backend",
        StorageError::ValueTooLarge { .. } => "value_too_large",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::InMemoryStore;

    fn service(store: Arc<InMemoryStore>) -> PersistentCache {
        PersistentCache::new(store, Duration::from_secs(3600), 16)
    }

    #[tokio::test]
    async fn test_set_replaces_existing_records() {
        let store = Arc::new(InMemoryStore::new());
        store.insert("u1", "p", "stale-1", 0, 1).await.unwrap();
        store.insert("u1", "p", "stale-2", 0, 1).await.unwrap();
        let cache = service(store.clone());

        assert!(cache.set("u1", "p", "fresh", None).await);

        let records = store.records_for("u1", "p");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].value, "fresh");
        assert_eq!(cache.get("u1", "p").await.unwrap(), "fresh");
    }

    #[tokio::test]
    async fn test_set_uses_given_or_default_ttl() {
        let store = Arc::new(InMemoryStore::new());
        let cache = service(store.clone());

        cache.set("u1", "a", "v", Some(Duration::from_secs(10))).await;
        cache.set("u1", "b", "v", None).await;

        let a = cache.record("u1", "a").await.unwrap();
        let b = cache.record("u1", "b").await.unwrap();
        assert_eq!(a.expires_at - a.created_at, 10_000);
        assert_eq!(b.expires_at - b.created_at, 3_600_000);
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let cache = service(Arc::new(InMemoryStore::new()));
        assert!(matches!(cache.get("u1", "p").await, Err(StorageError::NotFound)));
    }

    #[tokio::test]
    async fn test_oversized_value_rejected() {
        let store = Arc::new(InMemoryStore::new());
        let cache = service(store.clone());

        assert!(!cache.set("u1", "p", "this value is too long", None).await);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_remove_cascades() {
        let store = Arc::new(InMemoryStore::new());
        let cache = service(store.clone());
        cache.set("u1", "a", "v", None).await;
        cache.set("u1", "b", "v", None).await;
        cache.set("u2", "a", "v", None).await;

        assert_eq!(cache.remove_pair("u2", "a").await.unwrap(), 1);
        assert_eq!(cache.remove("u1").await.unwrap(), 2);
        assert!(store.is_empty());
    }
}
