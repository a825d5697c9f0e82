// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for the tiered cache.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The embedding process is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `tiered_cache_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `tier`: memory, persistent, replication
//! - `operation`: set, get, remove, publish, apply
//! - `status`: success, miss, error, rejected

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record a tier operation outcome
pub fn record_operation(tier: &str, operation: &str, status: &str) {
    counter!(
        "tiered_cache_operations_total",
        "tier" => tier.to_string(),
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record operation latency
pub fn record_latency(tier: &str, operation: &str, duration: Duration) {
    histogram!(
        "tiered_cache_operation_seconds",
        "tier" => tier.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record an error with category for alerting
pub fn record_error(tier: &str, operation: &str, error_type: &str) {
    counter!(
        "tiered_cache_errors_total",
        "tier" => tier.to_string(),
        "operation" => operation.to_string(),
        "error_type" => error_type.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// MEMORY TIER - Size, pressure, eviction
// ═══════════════════════════════════════════════════════════════════════════

/// Set current memory tier entry count
pub fn set_memory_entries(count: usize) {
    gauge!("tiered_cache_memory_entries").set(count as f64);
}

/// Set current tracked memory tier size in bytes
pub fn set_memory_bytes(bytes: usize) {
    gauge!("tiered_cache_memory_bytes").set(bytes as f64);
}

/// Set memory pressure (used / threshold)
pub fn set_memory_pressure(pressure: f64) {
    gauge!("tiered_cache_memory_pressure").set(pressure);
}

/// Record the outcome of one eviction cycle
pub fn record_eviction(evicted: usize, stale: usize, bytes: usize) {
    counter!("tiered_cache_evictions_total").increment(evicted as u64);
    counter!("tiered_cache_eviction_stale_refs_total").increment(stale as u64);
    counter!("tiered_cache_evicted_bytes_total").increment(bytes as u64);
}

/// Record eviction cycle duration
pub fn record_eviction_duration(duration: Duration) {
    histogram!("tiered_cache_eviction_seconds").record(duration.as_secs_f64());
}

/// Record a write-permission revocation
pub fn record_permission_revoked() {
    counter!("tiered_cache_permission_revocations_total").increment(1);
}

/// Set write permission state (1 = granted, 0 = revoked)
pub fn set_write_permission(granted: bool) {
    gauge!("tiered_cache_write_permission").set(if granted { 1.0 } else { 0.0 });
}

/// Record entries removed by the expiry sweep
pub fn record_sweep(removed: usize) {
    counter!("tiered_cache_swept_entries_total").increment(removed as u64);
}

/// Record a reclamation pass and the empty groups it pruned
pub fn record_reclaim(pruned_groups: usize) {
    counter!("tiered_cache_reclaim_runs_total").increment(1);
    counter!("tiered_cache_reclaim_pruned_groups_total").increment(pruned_groups as u64);
}

// ═══════════════════════════════════════════════════════════════════════════
// JOBS - Reconciliation, purge, sweep
// ═══════════════════════════════════════════════════════════════════════════

/// Record a scheduled job attempt outcome (success, retry, abandoned)
pub fn record_job_run(job: &str, outcome: &str) {
    counter!(
        "tiered_cache_job_runs_total",
        "job" => job.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record items a job processed, by kind (loaded, skipped, purged)
pub fn record_job_items(job: &str, kind: &str, count: usize) {
    counter!(
        "tiered_cache_job_items_total",
        "job" => job.to_string(),
        "kind" => kind.to_string()
    )
    .increment(count as u64);
}

/// Record job duration
pub fn record_job_duration(job: &str, duration: Duration) {
    histogram!(
        "tiered_cache_job_seconds",
        "job" => job.to_string()
    )
    .record(duration.as_secs_f64());
}

// ═══════════════════════════════════════════════════════════════════════════
// REPLICATION AND DISPATCH
// ═══════════════════════════════════════════════════════════════════════════

/// Record a replication event (direction: outbound/inbound, status: sent, applied, echo, error)
pub fn record_replication(direction: &str, status: &str) {
    counter!(
        "tiered_cache_replication_events_total",
        "direction" => direction.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record a task dropped because its dispatch queue was full
pub fn record_dispatch_drop(queue: &str) {
    counter!(
        "tiered_cache_dispatch_dropped_total",
        "queue" => queue.to_string()
    )
    .increment(1);
}

/// Set number of tasks waiting in a dispatch queue
pub fn set_dispatch_depth(queue: &str, depth: usize) {
    gauge!(
        "tiered_cache_dispatch_depth",
        "queue" => queue.to_string()
    )
    .set(depth as f64);
}

// ═══════════════════════════════════════════════════════════════════════════
// BACKENDS AND LIFECYCLE
// ═══════════════════════════════════════════════════════════════════════════

/// Set backend health status
pub fn set_backend_healthy(backend: &str, healthy: bool) {
    gauge!(
        "tiered_cache_backend_healthy",
        "backend" => backend.to_string()
    )
    .set(if healthy { 1.0 } else { 0.0 });
}

/// Record a connection/backend error
pub fn record_connection_error(backend: &str) {
    counter!(
        "tiered_cache_connection_errors_total",
        "backend" => backend.to_string()
    )
    .increment(1);
}

/// Record startup phase duration
pub fn record_startup_phase(phase: &str, duration: Duration) {
    histogram!(
        "tiered_cache_startup_seconds",
        "phase" => phase.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record total startup time
pub fn record_startup_total(duration: Duration) {
    histogram!("tiered_cache_startup_total_seconds").record(duration.as_secs_f64());
}

/// Count engine state transitions
pub fn set_engine_state(state: &str) {
    counter!(
        "tiered_cache_state_transitions_total",
        "state" => state.to_string()
    )
    .increment(1);
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    tier: &'static str,
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(tier: &'static str, operation: &'static str) -> Self {
        Self {
            tier,
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.tier, self.operation, self.start.elapsed());
    }
}

/// Convenience macro for timing operations
#[macro_export]
macro_rules! time_operation {
    ($tier:expr, $op:expr) => {
        $crate::metrics::LatencyTimer::new($tier, $op)
    };
}
