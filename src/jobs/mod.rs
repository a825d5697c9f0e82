// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Scheduled maintenance that keeps the two tiers consistent.
//!
//! - [`reconcile`]: one-shot startup load of the memory tier from storage
//! - [`sweep`]: periodic removal of expired memory entries
//! - [`purge`]: periodic deletion of expired stored records
//!
//! Storage-backed passes are restarted from scratch on failure, up to the
//! configured attempt count, then abandoned until the next invocation.

pub mod purge;
pub mod reconcile;
pub mod sweep;

pub use purge::{purge_once, PurgeReport};
pub use reconcile::{reconcile_once, ReconcileReport};

use std::future::Future;
use std::time::Instant;
use tracing::error;

use crate::error::CacheError;
use crate::resilience::retry::{retry, RetryConfig};
use crate::storage::traits::StorageError;

/// Run `pass` under `config`, restarting it whole on each failure.
pub(crate) async fn run_job<F, Fut, T>(job: &'static str, config: &RetryConfig, mut pass: F) -> Result<T, CacheError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StorageError>>,
{
    let start = Instant::now();
    let mut attempts = 0usize;

    let result = retry(job, config, || {
        attempts += 1;
        pass()
    })
    .await;

    crate::metrics::record_job_duration(job, start.elapsed());

    match result {
        Ok(value) => {
            crate::metrics::record_job_run(job, "success");
            Ok(value)
        }
        Err(e) => {
            error!(job, attempts, error = %e, "Job abandoned after repeated failures");
            crate::metrics::record_job_run(job, "abandoned");
            Err(CacheError::JobAbandoned {
                job,
                attempts,
                reason: e.to_string(),
            })
        }
    }
}
