use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

use super::traits::{PersistedRecord, PersistentStore, StorageError};

/// Persistent store kept in process memory, ordered by id.
///
/// Behaves like the SQL store (monotonic ids, duplicates allowed per
/// pair) without durability. Used in tests and single-process setups.
pub struct InMemoryStore {
    rows: Mutex<BTreeMap<i64, PersistedRecord>>,
    next_id: Mutex<i64>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(BTreeMap::new()),
            next_id: Mutex::new(1),
        }
    }

    /// Get current record count
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    /// Check if empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.lock().is_empty()
    }

    /// All records for a pair, oldest first
    #[must_use]
    pub fn records_for(&self, primary_key: &str, secondary_key: &str) -> Vec<PersistedRecord> {
        self.rows
            .lock()
            .values()
            .filter(|r| r.primary_key == primary_key && r.secondary_key == secondary_key)
            .cloned()
            .collect()
    }

    fn delete_where(&self, predicate: impl Fn(&PersistedRecord) -> bool) -> u64 {
        let mut rows = self.rows.lock();
        let before = rows.len();
        rows.retain(|_, r| !predicate(r));
        (before - rows.len()) as u64
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PersistentStore for InMemoryStore {
    async fn insert(
        &self,
        primary_key: &str,
        secondary_key: &str,
        value: &str,
        created_at: i64,
        expires_at: i64,
    ) -> Result<i64, StorageError> {
        let id = {
            let mut next = self.next_id.lock();
            let id = *next;
            *next += 1;
            id
        };
        self.rows.lock().insert(
            id,
            PersistedRecord {
                id,
                primary_key: primary_key.to_string(),
                secondary_key: secondary_key.to_string(),
                created_at,
                expires_at,
                value: value.to_string(),
            },
        );
        Ok(id)
    }

    async fn latest(&self, primary_key: &str, secondary_key: &str) -> Result<Option<PersistedRecord>, StorageError> {
        Ok(self
            .rows
            .lock()
            .values()
            .rev()
            .find(|r| r.primary_key == primary_key && r.secondary_key == secondary_key)
            .cloned())
    }

    async fn count_pair(&self, primary_key: &str, secondary_key: &str) -> Result<u64, StorageError> {
        Ok(self
            .rows
            .lock()
            .values()
            .filter(|r| r.primary_key == primary_key && r.secondary_key == secondary_key)
            .count() as u64)
    }

    async fn delete_pair(&self, primary_key: &str, secondary_key: &str) -> Result<u64, StorageError> {
        Ok(self.delete_where(|r| r.primary_key == primary_key && r.secondary_key == secondary_key))
    }

    async fn delete_primary(&self, primary_key: &str) -> Result<u64, StorageError> {
        Ok(self.delete_where(|r| r.primary_key == primary_key))
    }

    async fn delete_record(&self, id: i64) -> Result<u64, StorageError> {
        Ok(self.rows.lock().remove(&id).map_or(0, |_| 1))
    }

    async fn collapse_duplicates(&self) -> Result<u64, StorageError> {
        let mut rows = self.rows.lock();
        let mut keep: HashMap<(String, String), i64> = HashMap::new();
        for r in rows.values() {
            let id = keep.entry((r.primary_key.clone(), r.secondary_key.clone())).or_insert(r.id);
            *id = (*id).max(r.id);
        }
        let before = rows.len();
        rows.retain(|id, r| keep.get(&(r.primary_key.clone(), r.secondary_key.clone())) == Some(id));
        Ok((before - rows.len()) as u64)
    }

    async fn scan_after(&self, after_id: i64, limit: usize) -> Result<Vec<PersistedRecord>, StorageError> {
        Ok(self
            .rows
            .lock()
            .range(after_id.saturating_add(1)..)
            .take(limit)
            .map(|(_, r)| r.clone())
            .collect())
    }

    async fn expired(&self, now_ms: i64, limit: usize) -> Result<Vec<PersistedRecord>, StorageError> {
        Ok(self
            .rows
            .lock()
            .values()
            .filter(|r| r.is_expired(now_ms))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn count_all(&self) -> Result<u64, StorageError> {
        Ok(self.rows.lock().len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_new_store_is_empty() {
        let store = InMemoryStore::new();
        assert!(store.is_empty());
        assert_eq!(store.count_all().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_ids_are_monotonic_and_latest_wins() {
        let store = InMemoryStore::new();
        let first = store.insert("u1", "p", "v1", 0, 10).await.unwrap();
        let second = store.insert("u1", "p", "v2", 0, 10).await.unwrap();
        assert!(second > first);

        let latest = store.latest("u1", "p").await.unwrap().unwrap();
        assert_eq!(latest.value, "v2");
        assert_eq!(store.count_pair("u1", "p").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_collapse_keeps_highest_id_per_pair() {
        let store = InMemoryStore::new();
        store.insert("u1", "p", "old", 0, 10).await.unwrap();
        store.insert("u1", "q", "only", 0, 10).await.unwrap();
        let newest = store.insert("u1", "p", "new", 0, 10).await.unwrap();

        assert_eq!(store.collapse_duplicates().await.unwrap(), 1);
        let remaining = store.records_for("u1", "p");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, newest);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_scan_after_pages_in_id_order() {
        let store = InMemoryStore::new();
        for i in 0..5 {
            store.insert("k", &i.to_string(), "v", 0, 10).await.unwrap();
        }

        let page = store.scan_after(0, 2).await.unwrap();
        assert_eq!(page.iter().map(|r| r.id).collect::<Vec<_>>(), vec![1, 2]);
        let page = store.scan_after(2, 10).await.unwrap();
        assert_eq!(page.iter().map(|r| r.id).collect::<Vec<_>>(), vec![3, 4, 5]);
        assert!(store.scan_after(5, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_deletes() {
        let store = InMemoryStore::new();
        store.insert("u1", "a", "v", 0, 10).await.unwrap();
        store.insert("u1", "b", "v", 0, 10).await.unwrap();
        let other = store.insert("u2", "a", "v", 0, 10).await.unwrap();

        assert_eq!(store.delete_pair("u1", "a").await.unwrap(), 1);
        assert_eq!(store.delete_primary("u1").await.unwrap(), 1);
        assert_eq!(store.delete_record(other).await.unwrap(), 1);
        assert_eq!(store.delete_record(other).await.unwrap(), 0);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_expired_selects_past_records() {
        let store = InMemoryStore::new();
        store.insert("u1", "a", "v", 0, 100).await.unwrap();
        store.insert("u1", "b", "v", 0, 200).await.unwrap();
        store.insert("u1", "c", "v", 0, 300).await.unwrap();

        let expired = store.expired(200, 10).await.unwrap();
        assert_eq!(expired.iter().map(|r| r.secondary_key.as_str()).collect::<Vec<_>>(), vec!["a", "b"]);
    }
}
