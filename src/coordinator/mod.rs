// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cache engine coordinator.
//!
//! The [`CacheEngine`] ties the tiers together:
//! - memory tier: the only tier consulted on reads
//! - persistent tier: write-behind journal and startup source
//! - replication channel: broadcast of accepted writes to peers
//!
//! # Lifecycle
//!
//! ```text
//! Created → Connecting → Running → ShuttingDown
//! ```
//!
//! Before [`start()`](CacheEngine::start) the engine serves memory reads
//! and writes only; persistence and publishing begin once started.
//!
//! # Example
//!
//! ```rust,no_run
//! use tiered_cache::{CacheEngine, CacheConfig, EngineState, SetRequest};
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), tiered_cache::CacheError> {
//! let mut engine = CacheEngine::new(CacheConfig::default());
//! assert_eq!(engine.state(), EngineState::Created);
//!
//! engine.start().await?;
//! engine.write(SetRequest::new("u1", "profile", json!({"name": "a"})).with_ttl(3600))?;
//! assert_eq!(engine.read("u1", "profile")?, json!({"name": "a"}));
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod lifecycle;
mod types;

pub use types::{EngineState, HealthCheck};
use types::PersistTask;

use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::CacheConfig;
use crate::dispatch::Dispatcher;
use crate::error::CacheError;
use crate::jobs::{self, PurgeReport, ReconcileReport};
use crate::memory::{MemoryCache, MemoryProbe, MemorySettings, ProcessMemoryProbe};
use crate::node::NodeId;
use crate::replication::{RedisChannel, ReplicationChannel, ReplicationCounts, ReplicationEvent, ReplicationStats, Subscription};
use crate::request::{validate_key, SetRequest};
use crate::resilience::retry::RetryConfig;
use crate::storage::sql::SqlStore;
use crate::storage::traits::PersistentStore;
use crate::storage::PersistentCache;

/// Per-node cache orchestrator.
///
/// # Thread Safety
///
/// All request-path methods take `&self`; the engine can be shared behind an
/// `Arc` once started.
pub struct CacheEngine {
    pub(super) config: CacheConfig,
    pub(super) node_id: NodeId,

    pub(super) state: watch::Sender<EngineState>,
    pub(super) state_rx: watch::Receiver<EngineState>,

    pub(super) memory: MemoryCache<Value>,

    /// Write-behind journal (injected or connected from `sql_url`)
    pub(super) persistent: Option<PersistentCache>,
    /// Direct handle for health probes when the journal is SQL-backed
    pub(super) sql_store: Option<Arc<SqlStore>>,

    pub(super) replication: Option<Arc<dyn ReplicationChannel>>,
    /// Direct handle for health probes when replicating over Redis
    pub(super) redis_channel: Option<Arc<RedisChannel>>,
    pub(super) replication_stats: Arc<ReplicationStats>,
    pub(super) subscription: Mutex<Option<Subscription>>,

    pub(super) persist_queue: Option<Dispatcher<PersistTask>>,
    pub(super) publish_queue: Option<Dispatcher<ReplicationEvent>>,

    pub(super) job_retry: RetryConfig,
    pub(super) job_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl CacheEngine {
    /// Create an engine with a fresh node id.
    ///
    /// Spawns the memory tier's workers, so this must be called from within
    /// a Tokio runtime.
    pub fn new(config: CacheConfig) -> Self {
        Self::with_node_id(config, NodeId::random())
    }

    pub fn with_node_id(config: CacheConfig, node_id: NodeId) -> Self {
        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        let settings = MemorySettings::from(&config);
        let memory = if config.measures_process_memory() {
            MemoryCache::with_probe(settings, Arc::new(ProcessMemoryProbe::new()))
        } else {
            MemoryCache::new(settings)
        };
        let job_retry = RetryConfig::job(config.job_max_attempts);

        Self {
            config,
            node_id,
            state: state_tx,
            state_rx,
            memory,
            persistent: None,
            sql_store: None,
            replication: None,
            redis_channel: None,
            replication_stats: Arc::new(ReplicationStats::default()),
            subscription: Mutex::new(None),
            persist_queue: None,
            publish_queue: None,
            job_retry,
            job_handles: Mutex::new(Vec::new()),
        }
    }

    /// Use `store` as the persistent tier instead of connecting to `sql_url`.
    #[must_use]
    pub fn with_persistent_store(mut self, store: Arc<dyn PersistentStore>) -> Self {
        self.persistent = Some(PersistentCache::new(
            store,
            self.config.default_ttl(),
            self.config.max_value_bytes,
        ));
        self
    }

    /// Measure memory-tier usage with `probe`.
    ///
    /// Replaces the memory tier, so call it before the first write.
    #[must_use]
    pub fn with_memory_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.memory = MemoryCache::with_probe(MemorySettings::from(&self.config), probe);
        self
    }

    /// Use `channel` for replication instead of connecting to `redis_url`.
    #[must_use]
    pub fn with_replication(mut self, channel: Arc<dyn ReplicationChannel>) -> Self {
        self.replication = Some(channel);
        self
    }

    /// Override the retry policy of reconciliation and purge passes.
    #[must_use]
    pub fn with_job_retry(mut self, retry: RetryConfig) -> Self {
        self.job_retry = retry;
        self
    }

    #[must_use]
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    #[must_use]
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == EngineState::Running
    }

    /// The memory tier, for direct inspection.
    #[must_use]
    pub fn memory(&self) -> &MemoryCache<Value> {
        &self.memory
    }

    #[must_use]
    pub fn persistent(&self) -> Option<&PersistentCache> {
        self.persistent.as_ref()
    }

    #[must_use]
    pub fn replication_stats(&self) -> ReplicationCounts {
        self.replication_stats.snapshot()
    }

    // --- Request path ---

    /// Accept a write.
    ///
    /// The memory tier is updated before this returns. Persistence and
    /// publishing are queued and never fail the call. A write refused by the
    /// memory tier under pressure is logged and still journaled and published.
    #[tracing::instrument(
        skip(self, request),
        fields(primary_key = %request.primary_key, secondary_key = %request.secondary_key)
    )]
    pub fn write(&self, request: SetRequest) -> Result<(), CacheError> {
        let start = Instant::now();
        if let Err(e) = request.validate() {
            crate::metrics::record_error("engine", "write", e.kind());
            return Err(e);
        }

        let ttl = request.ttl();
        let accepted = match ttl {
            Some(ttl) => self.memory.set_with_ttl(
                &request.primary_key,
                &request.secondary_key,
                request.value.clone(),
                ttl,
            ),
            None => self
                .memory
                .set(&request.primary_key, &request.secondary_key, request.value.clone()),
        };

        if accepted {
            debug!("Write applied to memory tier");
        } else {
            let rejected = CacheError::WriteRejected;
            warn!(error = %rejected, "Memory tier refused write");
            crate::metrics::record_error("engine", "write", rejected.kind());
        }

        if let Some(ref queue) = self.persist_queue {
            match serde_json::to_string(&request.value) {
                Ok(value) => {
                    queue.try_dispatch(PersistTask::Set {
                        primary_key: request.primary_key.clone(),
                        secondary_key: request.secondary_key.clone(),
                        value,
                        ttl,
                    });
                }
                Err(e) => {
                    warn!(error = %e, "Value could not be serialized for persistence");
                    crate::metrics::record_error("persistent", "set", "serialize");
                }
            }
        }

        if let Some(ref queue) = self.publish_queue {
            queue.try_dispatch(ReplicationEvent::new(self.node_id, request));
        }

        crate::metrics::record_operation("engine", "write", "success");
        crate::metrics::record_latency("engine", "write", start.elapsed());
        Ok(())
    }

    /// Read from the memory tier only.
    pub fn read(&self, primary_key: &str, secondary_key: &str) -> Result<Value, CacheError> {
        let _timer = crate::time_operation!("engine", "read");
        validate_key("primary_key", primary_key)?;
        validate_key("secondary_key", secondary_key)?;

        match self.memory.get(primary_key, secondary_key) {
            Some(value) => {
                debug!(primary_key, secondary_key, "Read hit");
                crate::metrics::record_operation("engine", "read", "hit");
                Ok(value)
            }
            None => {
                debug!(primary_key, secondary_key, "Read miss");
                crate::metrics::record_operation("engine", "read", "miss");
                Err(CacheError::not_found(primary_key, secondary_key))
            }
        }
    }

    /// Drop a whole primary group. Memory is cleared now, storage later.
    /// Removals are not replicated.
    pub fn remove(&self, primary_key: &str) -> usize {
        let removed = self.memory.remove(primary_key);
        if let Some(ref queue) = self.persist_queue {
            queue.try_dispatch(PersistTask::Remove {
                primary_key: primary_key.to_string(),
            });
        }
        crate::metrics::record_operation("engine", "remove", "success");
        removed
    }

    /// Drop a single pair. Memory is cleared now, storage later.
    pub fn remove_pair(&self, primary_key: &str, secondary_key: &str) -> bool {
        let removed = self.memory.remove_pair(primary_key, secondary_key);
        if let Some(ref queue) = self.persist_queue {
            queue.try_dispatch(PersistTask::RemovePair {
                primary_key: primary_key.to_string(),
                secondary_key: secondary_key.to_string(),
            });
        }
        crate::metrics::record_operation("engine", "remove_pair", "success");
        removed
    }

    /// Wait until queued persistence and publish work has been handled.
    pub async fn flush(&self) {
        if let Some(ref queue) = self.persist_queue {
            queue.flush().await;
        }
        if let Some(ref queue) = self.publish_queue {
            queue.flush().await;
        }
    }

    // --- Jobs on demand ---

    /// Run one reconciliation pass now, with the engine's retry policy.
    pub async fn reconcile(&self) -> Result<ReconcileReport, CacheError> {
        let persistent = self.require_persistent()?;
        jobs::run_job("reconcile", &self.job_retry, || {
            jobs::reconcile_once(persistent, &self.memory, self.config.job_page_size)
        })
        .await
    }

    /// Run one expired-record purge pass now, with the engine's retry policy.
    pub async fn purge_expired(&self) -> Result<PurgeReport, CacheError> {
        let persistent = self.require_persistent()?;
        jobs::run_job("purge", &self.job_retry, || {
            jobs::purge_once(persistent, &self.memory, self.config.job_page_size)
        })
        .await
    }

    fn require_persistent(&self) -> Result<&PersistentCache, CacheError> {
        self.persistent
            .as_ref()
            .ok_or_else(|| CacheError::Internal("no persistent tier configured".into()))
    }

    // --- Health ---

    /// Cached state plus live probes of SQL and Redis when configured.
    pub async fn health_check(&self) -> HealthCheck {
        self.update_gauge_metrics();

        let state = self.state();
        let accepting_writes = self.memory.is_write_permitted();

        let ((sql_connected, sql_latency_ms), (redis_connected, redis_latency_ms)) =
            tokio::join!(self.probe_sql(), self.probe_redis());

        let replication_subscribed = self
            .replication
            .as_ref()
            .map(|_| self.subscription.lock().as_ref().is_some_and(Subscription::is_active));
        if replication_subscribed == Some(false) && state == EngineState::Running {
            warn!("Replication subscription is no longer delivering events");
        }

        let healthy = state == EngineState::Running
            && accepting_writes
            && replication_subscribed != Some(false)
            && sql_connected != Some(false)
            && redis_connected != Some(false);

        HealthCheck {
            state,
            node_id: self.node_id,
            healthy,
            memory_entries: self.memory.size(),
            memory_bytes: self.memory.size_bytes(),
            memory_pressure: self.memory.memory_pressure(),
            accepting_writes,
            evicting: self.memory.is_evicting(),
            persistent_configured: self.persistent.is_some(),
            sql_connected,
            sql_latency_ms,
            replication_transport: self.replication.as_ref().map(|r| r.name()),
            replication_subscribed,
            redis_connected,
            redis_latency_ms,
            replication: self.replication_stats.snapshot(),
            persist_queue_depth: self.persist_queue.as_ref().map_or(0, |q| q.depth()),
            publish_queue_depth: self.publish_queue.as_ref().map_or(0, |q| q.depth()),
        }
    }

    async fn probe_sql(&self) -> (Option<bool>, Option<u64>) {
        let Some(ref store) = self.sql_store else {
            return (None, None);
        };

        let start = Instant::now();
        match store.ping().await {
            Ok(()) => {
                crate::metrics::set_backend_healthy("sql", true);
                (Some(true), Some(start.elapsed().as_millis() as u64))
            }
            Err(_) => {
                crate::metrics::set_backend_healthy("sql", false);
                (Some(false), None)
            }
        }
    }

    async fn probe_redis(&self) -> (Option<bool>, Option<u64>) {
        let Some(ref channel) = self.redis_channel else {
            return (None, None);
        };

        let start = Instant::now();
        match channel.ping().await {
            Ok(()) => {
                crate::metrics::set_backend_healthy("redis", true);
                (Some(true), Some(start.elapsed().as_millis() as u64))
            }
            Err(_) => {
                crate::metrics::set_backend_healthy("redis", false);
                (Some(false), None)
            }
        }
    }

    /// Push memory-tier gauges to the metrics recorder.
    pub fn update_gauge_metrics(&self) {
        crate::metrics::set_memory_entries(self.memory.size());
        crate::metrics::set_memory_bytes(self.memory.size_bytes());
        crate::metrics::set_memory_pressure(self.memory.memory_pressure());
        crate::metrics::set_write_permission(self.memory.is_write_permitted());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_new_engine_is_created() {
        let engine = CacheEngine::new(CacheConfig::default());
        assert_eq!(engine.state(), EngineState::Created);
        assert!(!engine.is_running());
    }

    #[tokio::test]
    async fn test_write_before_start_is_memory_only() {
        let engine = CacheEngine::new(CacheConfig::default());
        engine.write(SetRequest::new("u1", "p", json!(1))).unwrap();

        assert_eq!(engine.read("u1", "p").unwrap(), json!(1));
        assert!(engine.persistent().is_none());
    }

    #[tokio::test]
    async fn test_invalid_requests_rejected() {
        let engine = CacheEngine::new(CacheConfig::default());

        let err = engine.write(SetRequest::new("", "p", json!(1))).unwrap_err();
        assert_eq!(err.http_status(), 400);

        let err = engine.write(SetRequest::new("u1", "p", json!(1)).with_ttl(10)).unwrap_err();
        assert!(matches!(err, CacheError::InvalidRequest(_)));

        assert!(matches!(engine.read("u1", ""), Err(CacheError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_read_miss_is_not_found() {
        let engine = CacheEngine::new(CacheConfig::default());
        let err = engine.read("u1", "missing").unwrap_err();
        assert_eq!(err.http_status(), 404);
    }

    #[tokio::test]
    async fn test_jobs_need_persistent_tier() {
        let engine = CacheEngine::new(CacheConfig::default());
        assert!(matches!(engine.reconcile().await, Err(CacheError::Internal(_))));
        assert!(matches!(engine.purge_expired().await, Err(CacheError::Internal(_))));
    }

    #[tokio::test]
    async fn test_health_before_start() {
        let engine = CacheEngine::new(CacheConfig::default());
        let health = engine.health_check().await;

        assert_eq!(health.state, EngineState::Created);
        assert!(!health.healthy);
        assert!(health.accepting_writes);
        assert_eq!(health.sql_connected, None);
        assert_eq!(health.replication_transport, None);
        assert_eq!(health.replication_subscribed, None);
    }
}
