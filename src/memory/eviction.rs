// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Pressure-driven eviction cycle.
//!
//! A cycle pops ledger references oldest-first and removes the entry each
//! one points at, until usage is back under the threshold or the ledger
//! runs dry. Every `eviction_batch_size` pops make a batch. Once
//! `permission_revoke_batches` batches have completed with usage still
//! above the threshold, write permission is revoked so new writes stop
//! feeding the pressure. Permission is restored when the cycle ends.

use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::entry::SizedValue;
use super::ledger::LedgerRef;
use super::MemoryInner;

/// Why an eviction cycle stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionOutcome {
    /// Usage fell back under the threshold
    Relieved,
    /// No references left to pop
    LedgerExhausted,
}

/// Summary of one eviction cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionReport {
    /// Entries removed
    pub evicted: usize,
    /// References whose entry was already gone or rewritten
    pub stale: usize,
    pub bytes_freed: usize,
    /// Completed batches of `eviction_batch_size` pops
    pub batches: usize,
    /// Whether this cycle revoked write permission
    pub permission_revoked: bool,
    pub outcome: EvictionOutcome,
    pub duration: Duration,
}

impl<V> MemoryInner<V>
where
    V: SizedValue + Clone + Send + Sync + 'static,
{
    /// Run one cycle on the calling thread. `None` if a cycle is already running.
    pub(crate) fn run_eviction_cycle(&self) -> Option<EvictionReport> {
        let _flight = self.eviction.try_acquire()?;
        let started = Instant::now();
        let batch_size = self.settings.eviction_batch_size.max(1);

        let mut evicted = 0;
        let mut stale = 0;
        let mut bytes_freed = 0;
        let mut batches = 0;
        let mut permission_revoked = false;
        let mut popped_in_batch = 0;
        let mut used_bytes;

        let outcome = loop {
            used_bytes = self.used_bytes();
            if used_bytes <= self.settings.threshold_bytes {
                break EvictionOutcome::Relieved;
            }
            let Some(candidate) = self.ledger.pop_oldest() else {
                break EvictionOutcome::LedgerExhausted;
            };

            match self.evict_if_current(&candidate) {
                Some(freed) => {
                    evicted += 1;
                    bytes_freed += freed;
                }
                None => stale += 1,
            }

            popped_in_batch += 1;
            if popped_in_batch == batch_size {
                popped_in_batch = 0;
                batches += 1;
                self.workers.request_reclaim();

                if batches >= self.settings.permission_revoke_batches && self.permission.revoke() {
                    permission_revoked = true;
                    warn!(
                        batches,
                        used_bytes,
                        threshold_bytes = self.settings.threshold_bytes,
                        "Memory pressure persists, revoking write permission"
                    );
                    crate::metrics::record_permission_revoked();
                    crate::metrics::set_write_permission(false);
                }
            }
        };

        if self.permission.restore() {
            info!("Write permission restored");
            crate::metrics::set_write_permission(true);
        }
        self.workers.request_reclaim();

        let report = EvictionReport {
            evicted,
            stale,
            bytes_freed,
            batches,
            permission_revoked,
            outcome,
            duration: started.elapsed(),
        };

        crate::metrics::record_eviction(evicted, stale, bytes_freed);
        crate::metrics::record_eviction_duration(report.duration);
        crate::metrics::set_memory_bytes(self.tracked_bytes());
        if outcome == EvictionOutcome::LedgerExhausted {
            warn!(?report, used_bytes, "Eviction ledger exhausted while still over threshold");
        } else {
            debug!(?report, "Eviction cycle complete");
        }
        Some(report)
    }

    /// Remove the entry a reference points at if it is still that exact write.
    fn evict_if_current(&self, candidate: &LedgerRef) -> Option<usize> {
        let freed = {
            let mut group = self.groups.get_mut(&candidate.primary_key)?;
            match group.get(&candidate.secondary_key) {
                Some(entry) if entry.stamp == candidate.stamp => {}
                _ => return None,
            }
            let freed = group.remove(&candidate.secondary_key)?.size_bytes;
            self.release_bytes(freed);
            freed
        };
        self.groups.remove_if(&candidate.primary_key, |_, group| group.is_empty());
        Some(freed)
    }
}
