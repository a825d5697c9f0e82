//! Chaos Testing for Tiered Cache
//!
//! This module tests failure scenarios using:
//! 1. **FailingStore wrappers** - precise error injection at specific call counts
//! 2. **Failing channels** - replication publishes that never succeed
//! 3. **Lifecycle abuse** - double shutdown, writes after shutdown
//!
//! # Running Chaos Tests
//! ```bash
//! RUST_LOG=tiered_cache=debug cargo test --test chaos -- --nocapture
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use tiered_cache::replication::{ReplicationError, Subscription};
use tiered_cache::storage::traits::{now_millis, PersistedRecord};
use tiered_cache::{
    CacheConfig, CacheEngine, CacheError, InMemoryStore, PersistentStore, ReplicationChannel, ReplicationEvent,
    ReplicationHandler, RetryConfig, SetRequest, StorageError,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn quiet_config() -> CacheConfig {
    CacheConfig {
        reconcile_delay_ms: 3_600_000,
        ..Default::default()
    }
}

// =============================================================================
// Failing Store Wrapper - Precise Error Injection
// =============================================================================

/// Wraps an [`InMemoryStore`] and fails calls by count.
pub struct FailingStore {
    inner: InMemoryStore,
    call_count: AtomicU64,
    /// Calls numbered up to and including this one fail (1-indexed)
    fail_through: u64,
    error_msg: String,
}

impl FailingStore {
    /// Fail the first `n` calls, then behave.
    pub fn fail_first(inner: InMemoryStore, n: u64, error_msg: &str) -> Self {
        Self {
            inner,
            call_count: AtomicU64::new(0),
            fail_through: n,
            error_msg: error_msg.to_string(),
        }
    }

    /// Fail every call.
    pub fn always(inner: InMemoryStore, error_msg: &str) -> Self {
        Self::fail_first(inner, u64::MAX, error_msg)
    }

    pub fn calls(&self) -> u64 {
        self.call_count.load(Ordering::SeqCst)
    }

    fn maybe_fail(&self) -> Result<(), StorageError> {
        let count = self.call_count.fetch_add(1, Ordering::SeqCst) + 1;
        if count <= self.fail_through {
            Err(StorageError::Backend(self.error_msg.clone()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PersistentStore for FailingStore {
    async fn insert(
        &self,
        primary_key: &str,
        secondary_key: &str,
        value: &str,
        created_at: i64,
        expires_at: i64,
    ) -> Result<i64, StorageError> {
        self.maybe_fail()?;
        self.inner
            .insert(primary_key, secondary_key, value, created_at, expires_at)
            .await
    }

    async fn latest(&self, primary_key: &str, secondary_key: &str) -> Result<Option<PersistedRecord>, StorageError> {
        self.maybe_fail()?;
        self.inner.latest(primary_key, secondary_key).await
    }

    async fn count_pair(&self, primary_key: &str, secondary_key: &str) -> Result<u64, StorageError> {
        self.maybe_fail()?;
        self.inner.count_pair(primary_key, secondary_key).await
    }

    async fn delete_pair(&self, primary_key: &str, secondary_key: &str) -> Result<u64, StorageError> {
        self.maybe_fail()?;
        self.inner.delete_pair(primary_key, secondary_key).await
    }

    async fn delete_primary(&self, primary_key: &str) -> Result<u64, StorageError> {
        self.maybe_fail()?;
        self.inner.delete_primary(primary_key).await
    }

    async fn delete_record(&self, id: i64) -> Result<u64, StorageError> {
        self.maybe_fail()?;
        self.inner.delete_record(id).await
    }

    async fn collapse_duplicates(&self) -> Result<u64, StorageError> {
        self.maybe_fail()?;
        self.inner.collapse_duplicates().await
    }

    async fn scan_after(&self, after_id: i64, limit: usize) -> Result<Vec<PersistedRecord>, StorageError> {
        self.maybe_fail()?;
        self.inner.scan_after(after_id, limit).await
    }

    async fn expired(&self, now_ms: i64, limit: usize) -> Result<Vec<PersistedRecord>, StorageError> {
        self.maybe_fail()?;
        self.inner.expired(now_ms, limit).await
    }

    async fn count_all(&self) -> Result<u64, StorageError> {
        self.maybe_fail()?;
        self.inner.count_all().await
    }
}

async fn seeded_store(live: usize, expired: usize) -> InMemoryStore {
    let store = InMemoryStore::new();
    let now = now_millis();
    for i in 0..live {
        store
            .insert("live", &format!("k{}", i), "1", now, now + 600_000)
            .await
            .unwrap();
    }
    for i in 0..expired {
        store
            .insert("dead", &format!("k{}", i), "1", now - 5_000, now - 1_000)
            .await
            .unwrap();
    }
    store
}

// =============================================================================
// Failing Channel - Publishes Never Land
// =============================================================================

struct DeadChannel;

#[async_trait]
impl ReplicationChannel for DeadChannel {
    async fn publish(&self, _event: &ReplicationEvent) -> Result<(), ReplicationError> {
        Err(ReplicationError::Publish("connection reset".into()))
    }

    async fn subscribe(&self, _handler: Arc<dyn ReplicationHandler>) -> Result<Subscription, ReplicationError> {
        Err(ReplicationError::Connect("subscribe refused".into()))
    }

    fn name(&self) -> &'static str {
        "dead"
    }
}

/// Subscribes fine, but every publish fails.
struct MutedChannel {
    inner: tiered_cache::LocalBus,
}

#[async_trait]
impl ReplicationChannel for MutedChannel {
    async fn publish(&self, _event: &ReplicationEvent) -> Result<(), ReplicationError> {
        Err(ReplicationError::Publish("broker unavailable".into()))
    }

    async fn subscribe(&self, handler: Arc<dyn ReplicationHandler>) -> Result<Subscription, ReplicationError> {
        self.inner.subscribe(handler).await
    }

    fn name(&self) -> &'static str {
        "muted"
    }
}

// =============================================================================
// Job Retry
// =============================================================================

#[tokio::test]
async fn chaos_reconcile_recovers_after_transient_failures() {
    init_tracing();
    let store = Arc::new(FailingStore::fail_first(seeded_store(3, 2).await, 2, "deadlock detected"));
    let engine = CacheEngine::new(quiet_config())
        .with_persistent_store(store.clone())
        .with_job_retry(RetryConfig::fast(5));

    let report = engine.reconcile().await.unwrap();

    // Whole pass restarted: nothing double-counted
    assert_eq!(report.loaded, 3);
    assert_eq!(report.skipped, 2);
    assert_eq!(engine.memory().size(), 3);
}

#[tokio::test]
async fn chaos_reconcile_abandoned_after_five_attempts() {
    init_tracing();
    let store = Arc::new(FailingStore::always(seeded_store(3, 0).await, "connection refused"));
    let engine = CacheEngine::new(quiet_config())
        .with_persistent_store(store.clone())
        .with_job_retry(RetryConfig::fast(5));

    let err = engine.reconcile().await.unwrap_err();

    match err {
        CacheError::JobAbandoned { job, attempts, reason } => {
            assert_eq!(job, "reconcile");
            assert_eq!(attempts, 5);
            assert!(reason.contains("connection refused"));
        }
        other => panic!("expected abandonment, got {:?}", other),
    }
    // Each attempt dies on its first call
    assert_eq!(store.calls(), 5);
    assert_eq!(engine.memory().size(), 0);
}

#[tokio::test]
async fn chaos_purge_restarts_whole_pass() {
    init_tracing();
    // First call (the expired query) fails, second attempt runs clean
    let store = Arc::new(FailingStore::fail_first(seeded_store(1, 4).await, 1, "lock wait timeout"));
    let engine = CacheEngine::new(quiet_config())
        .with_persistent_store(store.clone())
        .with_job_retry(RetryConfig::fast(5));

    let report = engine.purge_expired().await.unwrap();

    assert_eq!(report.purged, 4);
    assert_eq!(store.inner.len(), 1);
}

// =============================================================================
// Write Path Isolation
// =============================================================================

#[tokio::test]
async fn chaos_storage_down_does_not_fail_writes() {
    init_tracing();
    let store = Arc::new(FailingStore::always(InMemoryStore::new(), "disk full"));
    let mut engine = CacheEngine::new(quiet_config()).with_persistent_store(store.clone());
    engine.start().await.unwrap();

    for i in 0..20 {
        engine
            .write(SetRequest::new("u1", format!("k{}", i), json!(i)))
            .unwrap();
    }
    engine.flush().await;

    assert_eq!(engine.read("u1", "k7").unwrap(), json!(7));
    assert!(store.inner.is_empty());
    assert!(store.calls() >= 20);
}

#[tokio::test]
async fn chaos_publish_failures_are_counted_not_raised() {
    init_tracing();
    let channel = Arc::new(MutedChannel {
        inner: tiered_cache::LocalBus::default(),
    });
    let mut engine = CacheEngine::new(quiet_config()).with_replication(channel);
    engine.start().await.unwrap();

    engine.write(SetRequest::new("u1", "p", json!(1))).unwrap();
    engine.write(SetRequest::new("u1", "q", json!(2))).unwrap();
    engine.flush().await;

    let stats = engine.replication_stats();
    assert_eq!(stats.publish_failed, 2);
    assert_eq!(stats.published, 0);
    assert_eq!(engine.read("u1", "q").unwrap(), json!(2));
}

// =============================================================================
// Lifecycle Abuse
// =============================================================================

#[tokio::test]
async fn chaos_subscribe_failure_aborts_start() {
    init_tracing();
    let mut engine = CacheEngine::new(quiet_config()).with_replication(Arc::new(DeadChannel));

    let err = engine.start().await.unwrap_err();

    assert!(matches!(err, CacheError::Replication(ReplicationError::Connect(_))));
    assert_eq!(engine.state(), tiered_cache::EngineState::Created);
}

#[tokio::test]
async fn chaos_shutdown_without_start() {
    init_tracing();
    let engine = CacheEngine::new(quiet_config());
    engine.shutdown().await;
    engine.shutdown().await;
    assert_eq!(engine.state(), tiered_cache::EngineState::ShuttingDown);
}

#[tokio::test]
async fn chaos_writes_after_shutdown_stay_in_memory() {
    init_tracing();
    let store = Arc::new(InMemoryStore::new());
    let mut engine = CacheEngine::new(quiet_config()).with_persistent_store(store.clone());
    engine.start().await.unwrap();
    engine.shutdown().await;

    engine.write(SetRequest::new("u1", "p", json!(1))).unwrap();
    engine.flush().await;

    assert_eq!(engine.read("u1", "p").unwrap(), json!(1));
    assert!(store.is_empty(), "persistence stopped with the engine");
}
