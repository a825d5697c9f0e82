use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Record not found")]
    NotFound,
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Value of {size} bytes exceeds the {max} byte limit")]
    ValueTooLarge { size: usize, max: usize },
}

/// One persisted row. The highest `id` for a key pair is authoritative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedRecord {
    pub id: i64,
    pub primary_key: String,
    pub secondary_key: String,
    /// Epoch millis
    pub created_at: i64,
    /// Epoch millis
    pub expires_at: i64,
    pub value: String,
}

impl PersistedRecord {
    /// Whole seconds left before expiry at `now_ms`; negative once past.
    #[must_use]
    pub fn remaining_secs(&self, now_ms: i64) -> i64 {
        (self.expires_at - now_ms).div_euclid(1000)
    }

    #[must_use]
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at <= now_ms
    }
}

/// Row-level operations the persistent tier needs from its store.
#[async_trait]
pub trait PersistentStore: Send + Sync {
    /// Append a record and return its store-assigned id.
    async fn insert(
        &self,
        primary_key: &str,
        secondary_key: &str,
        value: &str,
        created_at: i64,
        expires_at: i64,
    ) -> Result<i64, StorageError>;

    /// Highest-id record for the pair.
    async fn latest(&self, primary_key: &str, secondary_key: &str) -> Result<Option<PersistedRecord>, StorageError>;

    async fn count_pair(&self, primary_key: &str, secondary_key: &str) -> Result<u64, StorageError>;

    async fn delete_pair(&self, primary_key: &str, secondary_key: &str) -> Result<u64, StorageError>;

    async fn delete_primary(&self, primary_key: &str) -> Result<u64, StorageError>;

    async fn delete_record(&self, id: i64) -> Result<u64, StorageError>;

    /// Delete every record that is not the highest id of its pair.
    async fn collapse_duplicates(&self) -> Result<u64, StorageError>;

    /// Records with `id > after_id` in id order (keyset pagination).
    async fn scan_after(&self, after_id: i64, limit: usize) -> Result<Vec<PersistedRecord>, StorageError>;

    /// Records with `expires_at <= now_ms` in id order.
    async fn expired(&self, now_ms: i64, limit: usize) -> Result<Vec<PersistedRecord>, StorageError>;

    async fn count_all(&self) -> Result<u64, StorageError>;
}

/// Current wall-clock time as epoch millis.
#[must_use]
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
