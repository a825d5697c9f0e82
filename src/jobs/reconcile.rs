// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Startup reconciliation: hydrate the memory tier from storage.

use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info};

use crate::memory::{LoadOutcome, MemoryCache};
use crate::storage::traits::{now_millis, StorageError};
use crate::storage::PersistentCache;

/// Records expiring within this many seconds are not worth loading.
pub const MIN_REMAINING_SECS: i64 = 1;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Superseded records removed before the scan
    pub collapsed: u64,
    pub loaded: usize,
    /// Expired or about to expire
    pub skipped: usize,
    /// Refused by the memory tier while writes were throttled
    pub rejected: usize,
    /// Left alone because the pair was written after the pass began
    pub superseded: usize,
}

/// One full pass: collapse duplicates, then load every live record.
///
/// Pairs written to memory after the pass starts keep their newer value.
pub async fn reconcile_once(
    persistent: &PersistentCache,
    memory: &MemoryCache<Value>,
    page_size: usize,
) -> Result<ReconcileReport, StorageError> {
    reconcile_from_mark(persistent, memory, page_size, memory.write_mark()).await
}

async fn reconcile_from_mark(
    persistent: &PersistentCache,
    memory: &MemoryCache<Value>,
    page_size: usize,
    mark: u64,
) -> Result<ReconcileReport, StorageError> {
    let mut report = ReconcileReport {
        collapsed: persistent.collapse_duplicates().await?,
        ..Default::default()
    };

    let page_size = page_size.max(1);
    let mut after_id = 0i64;

    loop {
        let page = persistent.store().scan_after(after_id, page_size).await?;
        let Some(last) = page.last() else { break };
        after_id = last.id;
        let now = now_millis();

        for record in &page {
            let remaining = record.remaining_secs(now);
            if remaining <= MIN_REMAINING_SECS {
                report.skipped += 1;
                continue;
            }

            let ttl = Duration::from_secs(remaining.unsigned_abs());
            let value = decode_value(&record.value);
            match memory.load_unless_newer(&record.primary_key, &record.secondary_key, value, ttl, mark) {
                LoadOutcome::Loaded => report.loaded += 1,
                LoadOutcome::Rejected => report.rejected += 1,
                LoadOutcome::Superseded => report.superseded += 1,
            }
        }

        debug!(after_id, loaded = report.loaded, skipped = report.skipped, "Reconcile page done");
        if page.len() < page_size {
            break;
        }
    }

    crate::metrics::record_job_items("reconcile", "loaded", report.loaded);
    crate::metrics::record_job_items("reconcile", "skipped", report.skipped);
    crate::metrics::record_job_items("reconcile", "rejected", report.rejected);
    crate::metrics::record_job_items("reconcile", "superseded", report.superseded);
    info!(
        collapsed = report.collapsed,
        loaded = report.loaded,
        skipped = report.skipped,
        rejected = report.rejected,
        superseded = report.superseded,
        "Reconciliation pass complete"
    );

    Ok(report)
}

/// Stored values are JSON; anything else is kept as a plain string.
pub(crate) fn decode_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}
