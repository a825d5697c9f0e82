// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Periodic expiry sweep of the memory tier.

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::trace;

use crate::memory::{MemoryCache, SizedValue};

/// Sweep after `initial_delay`, then every `period`.
pub(crate) fn spawn_sweeper<V>(memory: MemoryCache<V>, initial_delay: Duration, period: Duration) -> JoinHandle<()>
where
    V: SizedValue + Clone + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + initial_delay, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let removed = memory.sweep_expired();
            trace!(removed, "Expiry sweep tick");
        }
    })
}
