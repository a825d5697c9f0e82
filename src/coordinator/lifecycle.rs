//! Engine lifecycle management: start and shutdown.

use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

use crate::dispatch::Dispatcher;
use crate::error::CacheError;
use crate::jobs::{self, purge::spawn_purger, sweep::spawn_sweeper};
use crate::replication::{RedisChannel, ReplicaApplier, ReplicationEvent};
use crate::storage::sql::SqlStore;
use crate::storage::PersistentCache;

use super::{CacheEngine, EngineState, PersistTask};

impl CacheEngine {
    /// Connect backends and start background work.
    ///
    /// Startup flow:
    /// 1. Connect SQL from `sql_url` unless a store was injected (required if configured)
    /// 2. Connect Redis from `redis_url` unless a channel was injected (required if configured)
    /// 3. Start the persistence and publish queues
    /// 4. Subscribe the replica applier to the channel
    /// 5. Schedule the memory sweep, startup reconciliation and, if enabled, the purge
    #[tracing::instrument(skip(self), fields(node_id = %self.node_id, has_sql, has_replication))]
    pub async fn start(&mut self) -> Result<(), CacheError> {
        if self.state() != EngineState::Created {
            return Err(CacheError::Internal(format!("cannot start engine in state {}", self.state())));
        }

        let startup_start = Instant::now();
        info!("Starting cache engine...");
        self.set_state(EngineState::Connecting);

        // ========== PHASE 1: Persistent tier ==========
        if self.persistent.is_none() {
            if let Some(url) = self.config.sql_url.clone() {
                let phase_start = Instant::now();
                info!(url = %url, "Connecting to SQL persistent tier...");
                match SqlStore::new(&url).await {
                    Ok(store) => {
                        let store = Arc::new(store);
                        self.sql_store = Some(store.clone());
                        self.persistent = Some(PersistentCache::new(
                            store,
                            self.config.default_ttl(),
                            self.config.max_value_bytes,
                        ));
                        crate::metrics::set_backend_healthy("sql", true);
                        crate::metrics::record_startup_phase("sql_connect", phase_start.elapsed());
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to connect to SQL");
                        crate::metrics::set_backend_healthy("sql", false);
                        crate::metrics::record_connection_error("sql");
                        self.set_state(EngineState::Created);
                        return Err(e.into());
                    }
                }
            } else {
                warn!("No persistent tier configured - writes will not be journaled");
            }
        }
        tracing::Span::current().record("has_sql", self.persistent.is_some());

        // ========== PHASE 2: Replication channel ==========
        if self.replication.is_none() {
            if let Some(url) = self.config.redis_url.clone() {
                let phase_start = Instant::now();
                info!(url = %url, channel = %self.config.replication_channel, "Connecting to Redis replication channel...");
                match RedisChannel::connect(&url, &self.config.replication_channel).await {
                    Ok(channel) => {
                        let channel = Arc::new(channel);
                        self.redis_channel = Some(channel.clone());
                        self.replication = Some(channel);
                        crate::metrics::set_backend_healthy("redis", true);
                        crate::metrics::record_startup_phase("redis_connect", phase_start.elapsed());
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to connect to Redis");
                        crate::metrics::set_backend_healthy("redis", false);
                        self.set_state(EngineState::Created);
                        return Err(e.into());
                    }
                }
            } else {
                warn!("No replication channel configured - running as a single node");
            }
        }
        tracing::Span::current().record("has_replication", self.replication.is_some());

        // ========== PHASE 3: Write-behind queues ==========
        let capacity = self.config.dispatch_queue_capacity;
        if let Some(ref persistent) = self.persistent {
            let persistent = persistent.clone();
            self.persist_queue = Some(Dispatcher::spawn("persist", capacity, move |task: PersistTask| {
                let persistent = persistent.clone();
                async move { apply_persist_task(&persistent, task).await }
            }));
        }

        if let Some(ref channel) = self.replication {
            let channel = channel.clone();
            let publisher = channel.clone();
            let stats = self.replication_stats.clone();
            self.publish_queue = Some(Dispatcher::spawn("publish", capacity, move |event: ReplicationEvent| {
                let publisher = publisher.clone();
                let stats = stats.clone();
                async move {
                    match publisher.publish(&event).await {
                        Ok(()) => stats.record_published(),
                        Err(e) => {
                            warn!(
                                error = %e,
                                primary_key = %event.payload.primary_key,
                                "Replication publish failed"
                            );
                            stats.record_publish_failed();
                        }
                    }
                }
            }));

            // ========== PHASE 4: Subscribe ==========
            let phase_start = Instant::now();
            let applier = Arc::new(ReplicaApplier::new(
                self.node_id,
                self.memory.clone(),
                self.replication_stats.clone(),
            ));
            match channel.subscribe(applier).await {
                Ok(subscription) => {
                    *self.subscription.lock() = Some(subscription);
                    crate::metrics::record_startup_phase("subscribe", phase_start.elapsed());
                }
                Err(e) => {
                    error!(error = %e, transport = channel.name(), "Replication subscribe failed");
                    self.stop_queues();
                    self.set_state(EngineState::Created);
                    return Err(e.into());
                }
            }
        }

        // ========== PHASE 5: Scheduled jobs ==========
        let mut handles = Vec::new();
        handles.push(spawn_sweeper(
            self.memory.clone(),
            self.config.sweep_initial_delay(),
            self.config.sweep_period(),
        ));

        if let Some(ref persistent) = self.persistent {
            let loader = persistent.clone();
            let memory = self.memory.clone();
            let retry = self.job_retry.clone();
            let page_size = self.config.job_page_size;
            let delay = self.config.reconcile_delay();
            handles.push(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                // Abandonment is logged inside
                let _ = jobs::run_job("reconcile", &retry, || jobs::reconcile_once(&loader, &memory, page_size)).await;
            }));

            if self.config.purge_enabled {
                handles.push(spawn_purger(
                    persistent.clone(),
                    self.memory.clone(),
                    self.config.purge_interval(),
                    page_size,
                    self.job_retry.clone(),
                ));
            }
        }
        self.job_handles.lock().extend(handles);

        self.set_state(EngineState::Running);
        crate::metrics::record_startup_total(startup_start.elapsed());
        info!(
            elapsed_ms = startup_start.elapsed().as_millis() as u64,
            purge_enabled = self.config.purge_enabled,
            "Cache engine running"
        );
        Ok(())
    }

    /// Graceful shutdown: drain queued work, then stop workers and jobs.
    #[tracing::instrument(skip(self), fields(node_id = %self.node_id))]
    pub async fn shutdown(&self) {
        let shutdown_start = Instant::now();
        info!("Initiating cache engine shutdown...");
        self.set_state(EngineState::ShuttingDown);

        self.flush().await;
        self.memory.quiesce().await;

        self.subscription.lock().take();
        for handle in self.job_handles.lock().drain(..) {
            handle.abort();
        }
        self.stop_queues();

        crate::metrics::record_startup_phase("shutdown", shutdown_start.elapsed());
        info!("Cache engine shutdown complete");
    }

    fn stop_queues(&self) {
        if let Some(ref queue) = self.persist_queue {
            queue.abort();
        }
        if let Some(ref queue) = self.publish_queue {
            queue.abort();
        }
    }

    pub(super) fn set_state(&self, state: EngineState) {
        let _ = self.state.send(state);
        crate::metrics::set_engine_state(&state.to_string());
    }
}

async fn apply_persist_task(persistent: &PersistentCache, task: PersistTask) {
    match task {
        PersistTask::Set {
            primary_key,
            secondary_key,
            value,
            ttl,
        } => {
            // Failures are logged by the persistent tier
            persistent.set(&primary_key, &secondary_key, &value, ttl).await;
        }
        PersistTask::Remove { primary_key } => {
            if let Err(e) = persistent.remove(&primary_key).await {
                error!(error = %e, primary_key = %primary_key, "Persistent remove failed");
                crate::metrics::record_error("persistent", "remove", "backend");
            }
        }
        PersistTask::RemovePair {
            primary_key,
            secondary_key,
        } => {
            if let Err(e) = persistent.remove_pair(&primary_key, &secondary_key).await {
                error!(
                    error = %e,
                    primary_key = %primary_key,
                    secondary_key = %secondary_key,
                    "Persistent remove failed"
                );
                crate::metrics::record_error("persistent", "remove_pair", "backend");
            }
        }
    }
}
