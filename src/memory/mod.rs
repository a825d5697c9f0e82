// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Memory tier: concurrent two-level key/value store with expiry and
//! pressure-driven eviction.
//!
//! Entries live under a primary key group, each group mapping secondary
//! keys to a [`CacheEntry`]. Groups are independent DashMap shards, so
//! writers to different primary keys never contend on a global lock.
//!
//! # Example
//!
//! ```rust,no_run
//! use tiered_cache::memory::{MemoryCache, MemorySettings};
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let cache: MemoryCache<serde_json::Value> = MemoryCache::new(MemorySettings::default());
//!
//! assert!(cache.set("u1", "profile", json!({"name": "a"})));
//! assert_eq!(cache.get("u1", "profile"), Some(json!({"name": "a"})));
//!
//! cache.remove("u1");
//! assert_eq!(cache.get("u1", "profile"), None);
//! # }
//! ```

mod entry;
mod eviction;
mod ledger;
pub mod probe;
mod workers;

pub use entry::{CacheEntry, SizedValue};
pub use eviction::{EvictionOutcome, EvictionReport};
pub use ledger::{EvictionLedger, LedgerRef};
pub use probe::ProcessMemoryProbe;

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::backpressure::{SingleFlight, WritePermission};
use crate::config::CacheConfig;
use workers::Workers;

/// Source of the "current memory usage" figure compared against the threshold.
///
/// Without a probe the tier uses its own tracked entry bytes. See
/// [`ProcessMemoryProbe`] for the process resident set.
pub trait MemoryProbe: Send + Sync {
    fn used_bytes(&self) -> usize;
}

/// Result of loading a stored record into the tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Loaded,
    /// Write permission was revoked
    Rejected,
    /// The pair was written at or after the load's mark
    Superseded,
}

/// Memory tier tuning, usually derived from [`CacheConfig`].
#[derive(Debug, Clone)]
pub struct MemorySettings {
    pub default_ttl: Duration,
    /// Usage above this many bytes starts an eviction cycle
    pub threshold_bytes: usize,
    pub eviction_batch_size: usize,
    pub permission_revoke_batches: usize,
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self::from(&CacheConfig::default())
    }
}

impl From<&CacheConfig> for MemorySettings {
    fn from(config: &CacheConfig) -> Self {
        Self {
            default_ttl: config.default_ttl(),
            threshold_bytes: config.threshold_bytes(),
            eviction_batch_size: config.eviction_batch_size,
            permission_revoke_batches: config.permission_revoke_batches,
        }
    }
}

type Group<V> = HashMap<String, CacheEntry<V>>;

/// Ledgers at or below this length are never compacted outside eviction.
pub(crate) const LEDGER_COMPACT_FLOOR: usize = 256;
/// Stale references tolerated per live entry before compaction.
pub(crate) const LEDGER_STALE_RATIO: usize = 4;

pub(crate) struct MemoryInner<V> {
    groups: DashMap<String, Group<V>>,
    ledger: EvictionLedger,
    tracked_bytes: AtomicUsize,
    next_stamp: AtomicU64,
    permission: WritePermission,
    eviction: SingleFlight,
    settings: MemorySettings,
    probe: Option<Arc<dyn MemoryProbe>>,
    workers: Workers,
}

impl<V> MemoryInner<V>
where
    V: SizedValue + Clone + Send + Sync + 'static,
{
    fn tracked_bytes(&self) -> usize {
        self.tracked_bytes.load(Ordering::Acquire)
    }

    fn used_bytes(&self) -> usize {
        match self.probe {
            Some(ref probe) => probe.used_bytes(),
            None => self.tracked_bytes(),
        }
    }

    fn over_threshold(&self) -> bool {
        self.used_bytes() > self.settings.threshold_bytes
    }

    fn release_bytes(&self, bytes: usize) {
        let _ = self
            .tracked_bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(bytes))
            });
    }

    /// Whether `r` still points at the live write it was appended for.
    fn is_current(&self, r: &LedgerRef) -> bool {
        self.groups
            .get(&r.primary_key)
            .and_then(|group| group.get(&r.secondary_key).map(|e| e.stamp == r.stamp))
            .unwrap_or(false)
    }

    /// Ledger references outnumber live entries by more than
    /// [`LEDGER_STALE_RATIO`] to one.
    fn ledger_is_bloated(&self) -> bool {
        let refs = self.ledger.len();
        refs > LEDGER_COMPACT_FLOOR && refs > self.entry_count().saturating_mul(LEDGER_STALE_RATIO)
    }

    fn entry_count(&self) -> usize {
        self.groups.iter().map(|group| group.len()).sum()
    }

    /// Drop references to overwritten or removed entries.
    fn compact_ledger(&self) -> usize {
        let dropped = self.ledger.compact(|r| self.is_current(r));
        if dropped > 0 {
            debug!(dropped_refs = dropped, remaining = self.ledger.len(), "Ledger compacted");
        }
        dropped
    }

    fn schedule_capacity_check(&self) {
        if !self.eviction.is_running() && self.over_threshold() {
            self.workers.request_eviction();
        }
    }

    /// Prune empty groups and drop ledger references to entries that are gone.
    fn reclaim(&self) {
        let before = self.groups.len();
        self.groups.retain(|_, group| !group.is_empty());
        let pruned = before.saturating_sub(self.groups.len());
        self.groups.shrink_to_fit();

        let dropped = self.compact_ledger();

        debug!(pruned_groups = pruned, dropped_refs = dropped, "Reclaim pass complete");
        crate::metrics::record_reclaim(pruned);
    }
}

/// Handle to a memory tier. Cheap to clone; clones share state.
pub struct MemoryCache<V> {
    inner: Arc<MemoryInner<V>>,
}

impl<V> Clone for MemoryCache<V> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<V> MemoryCache<V>
where
    V: SizedValue + Clone + Send + Sync + 'static,
{
    /// Create a memory tier measuring usage by tracked entry bytes.
    ///
    /// Spawns the tier's background workers, so this must be called from
    /// within a Tokio runtime.
    #[must_use]
    pub fn new(settings: MemorySettings) -> Self {
        Self::build(settings, None)
    }

    /// Create a memory tier whose usage figure comes from `probe`.
    #[must_use]
    pub fn with_probe(settings: MemorySettings, probe: Arc<dyn MemoryProbe>) -> Self {
        Self::build(settings, Some(probe))
    }

    fn build(settings: MemorySettings, probe: Option<Arc<dyn MemoryProbe>>) -> Self {
        let inner = Arc::new_cyclic(|weak| MemoryInner {
            groups: DashMap::new(),
            ledger: EvictionLedger::new(),
            tracked_bytes: AtomicUsize::new(0),
            next_stamp: AtomicU64::new(0),
            permission: WritePermission::new(),
            eviction: SingleFlight::new(),
            settings,
            probe,
            workers: Workers::spawn(weak.clone()),
        });
        Self { inner }
    }

    #[must_use]
    pub fn settings(&self) -> &MemorySettings {
        &self.inner.settings
    }

    /// Insert or overwrite with the default lifetime.
    pub fn set(&self, primary_key: &str, secondary_key: &str, value: V) -> bool {
        self.set_with_ttl(primary_key, secondary_key, value, self.inner.settings.default_ttl)
    }

    /// Insert or overwrite (primary_key, secondary_key).
    ///
    /// Returns `false` without mutating anything while write permission is
    /// revoked.
    pub fn set_with_ttl(&self, primary_key: &str, secondary_key: &str, value: V, ttl: Duration) -> bool {
        self.put(primary_key, secondary_key, value, ttl, None) == LoadOutcome::Loaded
    }

    /// Position in the write sequence. Every later write carries a stamp at
    /// or above it.
    #[must_use]
    pub fn write_mark(&self) -> u64 {
        self.inner.next_stamp.load(Ordering::Acquire)
    }

    /// Like [`set_with_ttl`](Self::set_with_ttl), but leaves the pair alone
    /// if it was written at or after `mark`.
    pub fn load_unless_newer(
        &self,
        primary_key: &str,
        secondary_key: &str,
        value: V,
        ttl: Duration,
        mark: u64,
    ) -> LoadOutcome {
        self.put(primary_key, secondary_key, value, ttl, Some(mark))
    }

    fn put(&self, primary_key: &str, secondary_key: &str, value: V, ttl: Duration, mark: Option<u64>) -> LoadOutcome {
        let inner = &self.inner;
        if !inner.permission.is_granted() {
            debug!(primary_key, secondary_key, "Write permission revoked, set rejected");
            crate::metrics::record_operation("memory", "set", "rejected");
            return LoadOutcome::Rejected;
        }

        let stamp = inner.next_stamp.fetch_add(1, Ordering::AcqRel);
        let entry = CacheEntry::new(primary_key, secondary_key, value, ttl, stamp);
        let size = entry.size_bytes;

        {
            // Accounting happens under the shard lock so a racing removal
            // of this pair always sees the bytes it releases.
            let mut group = inner.groups.entry(primary_key.to_string()).or_default();
            if let Some(mark) = mark {
                if group.get(secondary_key).is_some_and(|live| live.stamp >= mark) {
                    debug!(primary_key, secondary_key, "Newer write present, load skipped");
                    return LoadOutcome::Superseded;
                }
            }
            let replaced = group.insert(secondary_key.to_string(), entry);
            inner.tracked_bytes.fetch_add(size, Ordering::AcqRel);
            if let Some(old) = replaced {
                inner.release_bytes(old.size_bytes);
            }
        }

        inner.workers.append(LedgerRef {
            primary_key: primary_key.to_string(),
            secondary_key: secondary_key.to_string(),
            stamp,
        });
        inner.schedule_capacity_check();
        crate::metrics::record_operation("memory", "set", "success");
        LoadOutcome::Loaded
    }

    /// Current value, or `None` if absent or past its expiry.
    #[must_use]
    pub fn get(&self, primary_key: &str, secondary_key: &str) -> Option<V> {
        let group = self.inner.groups.get(primary_key)?;
        let entry = group.get(secondary_key)?;
        if entry.is_expired(Instant::now()) {
            return None;
        }
        Some(entry.value.clone())
    }

    /// Time left on a live entry.
    #[must_use]
    pub fn remaining_ttl(&self, primary_key: &str, secondary_key: &str) -> Option<Duration> {
        let now = Instant::now();
        let group = self.inner.groups.get(primary_key)?;
        group
            .get(secondary_key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.remaining(now))
    }

    /// Remove a whole primary group. Returns how many entries it held.
    pub fn remove(&self, primary_key: &str) -> usize {
        match self.inner.groups.remove(primary_key) {
            Some((_, group)) => {
                let bytes = group.values().map(|e| e.size_bytes).sum();
                self.inner.release_bytes(bytes);
                group.len()
            }
            None => 0,
        }
    }

    /// Remove one entry. Returns whether it existed.
    pub fn remove_pair(&self, primary_key: &str, secondary_key: &str) -> bool {
        let removed = self.inner.groups.get_mut(primary_key).and_then(|mut group| {
            let entry = group.remove(secondary_key)?;
            self.inner.release_bytes(entry.size_bytes);
            Some(entry)
        });

        if removed.is_none() {
            return false;
        }
        self.inner.groups.remove_if(primary_key, |_, group| group.is_empty());
        true
    }

    /// Stored entries across all groups, including expired ones not yet swept.
    #[must_use]
    pub fn size(&self) -> usize {
        self.inner.entry_count()
    }

    #[must_use]
    pub fn primary_count(&self) -> usize {
        self.inner.groups.len()
    }

    #[must_use]
    pub fn contains_primary(&self, primary_key: &str) -> bool {
        self.inner.groups.contains_key(primary_key)
    }

    /// Tracked bytes of all stored entries.
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.inner.tracked_bytes()
    }

    /// Usage divided by threshold; above 1.0 means eviction is due.
    #[must_use]
    pub fn memory_pressure(&self) -> f64 {
        let threshold = self.inner.settings.threshold_bytes;
        if threshold == 0 {
            return 0.0;
        }
        self.inner.used_bytes() as f64 / threshold as f64
    }

    #[must_use]
    pub fn is_write_permitted(&self) -> bool {
        self.inner.permission.is_granted()
    }

    #[must_use]
    pub fn permission_revocations(&self) -> u64 {
        self.inner.permission.revocations()
    }

    #[must_use]
    pub fn is_evicting(&self) -> bool {
        self.inner.eviction.is_running()
    }

    #[must_use]
    pub fn ledger_len(&self) -> usize {
        self.inner.ledger.len()
    }

    /// Remove every expired entry and prune groups left empty.
    /// Returns the number of entries removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        let mut freed = 0;

        self.inner.groups.retain(|_, group| {
            group.retain(|_, entry| {
                if entry.is_expired(now) {
                    removed += 1;
                    freed += entry.size_bytes;
                    false
                } else {
                    true
                }
            });
            !group.is_empty()
        });
        self.inner.release_bytes(freed);

        if removed > 0 {
            info!(removed, remaining = self.size(), "Expiry sweep removed entries");
            self.inner.workers.request_reclaim();
        }
        crate::metrics::record_sweep(removed);
        crate::metrics::set_memory_entries(self.size());
        crate::metrics::set_memory_bytes(self.size_bytes());
        removed
    }

    /// Run an eviction cycle on the calling thread.
    ///
    /// Returns `None` if another cycle is in flight. Blocks for the whole
    /// cycle; call from `spawn_blocking` when used from async code paths
    /// that must not stall.
    pub fn evict_now(&self) -> Option<EvictionReport> {
        self.inner.run_eviction_cycle()
    }

    /// Ask the reclaim worker for a pass.
    pub fn request_reclaim(&self) {
        self.inner.workers.request_reclaim();
    }

    /// Wait until queued ledger appends have landed and any eviction they
    /// make necessary has finished.
    pub async fn quiesce(&self) {
        self.inner.workers.ledger_barrier().await;
        if self.inner.over_threshold() {
            self.inner.workers.request_eviction();
        }
        self.inner.workers.eviction_barrier().await;
    }
}
