// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Expired-record purge for the persistent tier.

use serde_json::Value;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

use super::run_job;
use crate::memory::MemoryCache;
use crate::resilience::retry::RetryConfig;
use crate::storage::traits::{now_millis, StorageError};
use crate::storage::PersistentCache;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub purged: usize,
}

/// Delete every record expired as of now, dropping the same pair from memory.
pub async fn purge_once(
    persistent: &PersistentCache,
    memory: &MemoryCache<Value>,
    page_size: usize,
) -> Result<PurgeReport, StorageError> {
    let page_size = page_size.max(1);
    let cutoff = now_millis();
    let mut report = PurgeReport::default();

    loop {
        let page = persistent.store().expired(cutoff, page_size).await?;
        if page.is_empty() {
            break;
        }

        for record in &page {
            persistent.store().delete_record(record.id).await?;
            // May already be gone from memory
            memory.remove_pair(&record.primary_key, &record.secondary_key);
            report.purged += 1;
        }

        if page.len() < page_size {
            break;
        }
    }

    crate::metrics::record_job_items("purge", "purged", report.purged);
    if report.purged > 0 {
        info!(purged = report.purged, "Purged expired records");
    } else {
        debug!("No expired records to purge");
    }

    Ok(report)
}

/// Run [`purge_once`] every `period`, first after one full period.
pub(crate) fn spawn_purger(
    persistent: PersistentCache,
    memory: MemoryCache<Value>,
    period: Duration,
    page_size: usize,
    retry: RetryConfig,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            // Abandonment is logged inside; the next tick tries again
            let _ = run_job("purge", &retry, || purge_once(&persistent, &memory, page_size)).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemorySettings;
    use crate::storage::memory::InMemoryStore;
    use crate::storage::traits::PersistentStore;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_purges_expired_rows_and_memory() {
        let store = Arc::new(InMemoryStore::new());
        let now = now_millis();
        for i in 0..5 {
            store.insert("old", &format!("k{}", i), "1", now - 5000, now - 10).await.unwrap();
        }
        store.insert("fresh", "k", "1", now, now + 600_000).await.unwrap();

        let persistent = PersistentCache::new(store.clone(), Duration::from_secs(3600), 65_000);
        let memory = MemoryCache::new(MemorySettings::default());
        memory.set("old", "k0", json!(1));
        memory.set("fresh", "k", json!(1));

        let report = purge_once(&persistent, &memory, 2).await.unwrap();

        assert_eq!(report.purged, 5);
        assert_eq!(store.len(), 1);
        assert_eq!(memory.get("old", "k0"), None);
        assert_eq!(memory.get("fresh", "k"), Some(json!(1)));
    }

    #[tokio::test]
    async fn test_empty_store_purges_nothing() {
        let persistent = PersistentCache::new(Arc::new(InMemoryStore::new()), Duration::from_secs(3600), 65_000);
        let memory = MemoryCache::new(MemorySettings::default());
        assert_eq!(purge_once(&persistent, &memory, 10).await.unwrap().purged, 0);
    }
}
