// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Background workers owned by one memory tier instance.
//!
//! Three single-task workers, each serialized on its own channel:
//! - **ledger**: appends references for new writes, compacting the ledger
//!   when stale references pile up
//! - **eviction**: runs eviction cycles when a capacity check fires
//! - **reclaim**: prunes empty groups and compacts the ledger
//!
//! Workers hold a `Weak` to the tier, so they exit once the last
//! `MemoryCache` handle is dropped and the channels close.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Weak;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use super::entry::SizedValue;
use super::ledger::LedgerRef;
use super::MemoryInner;

/// Appends between checks for a bloated ledger.
const COMPACT_CHECK_INTERVAL: u64 = 1024;

pub(crate) enum LedgerCommand {
    Append(LedgerRef),
    Barrier(oneshot::Sender<()>),
}

pub(crate) enum EvictionCommand {
    Check,
    Barrier(oneshot::Sender<()>),
}

pub(crate) struct Workers {
    ledger_tx: mpsc::UnboundedSender<LedgerCommand>,
    eviction_tx: mpsc::UnboundedSender<EvictionCommand>,
    reclaim_tx: mpsc::Sender<()>,
    check_pending: AtomicBool,
}

impl Workers {
    /// Spawn the three workers. Must be called inside a Tokio runtime.
    pub(crate) fn spawn<V>(inner: Weak<MemoryInner<V>>) -> Self
    where
        V: SizedValue + Clone + Send + Sync + 'static,
    {
        let (ledger_tx, ledger_rx) = mpsc::unbounded_channel();
        let (eviction_tx, eviction_rx) = mpsc::unbounded_channel();
        let (reclaim_tx, reclaim_rx) = mpsc::channel(1);

        tokio::spawn(ledger_worker(inner.clone(), ledger_rx));
        tokio::spawn(eviction_worker(inner.clone(), eviction_rx));
        tokio::spawn(reclaim_worker(inner, reclaim_rx));

        Self {
            ledger_tx,
            eviction_tx,
            reclaim_tx,
            check_pending: AtomicBool::new(false),
        }
    }

    pub(crate) fn append(&self, entry: LedgerRef) {
        let _ = self.ledger_tx.send(LedgerCommand::Append(entry));
    }

    /// Queue a capacity check; checks coalesce while one is pending.
    pub(crate) fn request_eviction(&self) {
        if !self.check_pending.swap(true, Ordering::AcqRel) {
            let _ = self.eviction_tx.send(EvictionCommand::Check);
        }
    }

    pub(crate) fn request_reclaim(&self) {
        // A full channel means a pass is already queued.
        let _ = self.reclaim_tx.try_send(());
    }

    pub(crate) async fn ledger_barrier(&self) {
        let (tx, rx) = oneshot::channel();
        if self.ledger_tx.send(LedgerCommand::Barrier(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    pub(crate) async fn eviction_barrier(&self) {
        let (tx, rx) = oneshot::channel();
        if self.eviction_tx.send(EvictionCommand::Barrier(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

async fn ledger_worker<V>(inner: Weak<MemoryInner<V>>, mut rx: mpsc::UnboundedReceiver<LedgerCommand>)
where
    V: SizedValue + Clone + Send + Sync + 'static,
{
    let mut appended: u64 = 0;
    while let Some(command) = rx.recv().await {
        match command {
            LedgerCommand::Append(entry) => {
                let Some(inner) = inner.upgrade() else { break };
                inner.ledger.push(entry);
                appended += 1;
                // Overwrites and removals leave stale refs behind
                if appended % COMPACT_CHECK_INTERVAL == 0 && inner.ledger_is_bloated() {
                    inner.compact_ledger();
                }
            }
            LedgerCommand::Barrier(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("Ledger worker stopped");
}

async fn eviction_worker<V>(inner: Weak<MemoryInner<V>>, mut rx: mpsc::UnboundedReceiver<EvictionCommand>)
where
    V: SizedValue + Clone + Send + Sync + 'static,
{
    while let Some(command) = rx.recv().await {
        match command {
            EvictionCommand::Check => {
                let Some(inner) = inner.upgrade() else { break };
                inner.workers.check_pending.store(false, Ordering::Release);
                if !inner.over_threshold() {
                    continue;
                }
                match tokio::task::spawn_blocking(move || inner.run_eviction_cycle()).await {
                    Ok(Some(_report)) => {}
                    Ok(None) => debug!("Eviction cycle already running, check skipped"),
                    Err(e) => {
                        error!(error = %e, "Eviction cycle panicked");
                        crate::metrics::record_error("memory", "evict", "panic");
                    }
                }
            }
            EvictionCommand::Barrier(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("Eviction worker stopped");
}

async fn reclaim_worker<V>(inner: Weak<MemoryInner<V>>, mut rx: mpsc::Receiver<()>)
where
    V: SizedValue + Clone + Send + Sync + 'static,
{
    while rx.recv().await.is_some() {
        let Some(inner) = inner.upgrade() else { break };
        if let Err(e) = tokio::task::spawn_blocking(move || inner.reclaim()).await {
            error!(error = %e, "Reclaim pass panicked");
            crate::metrics::record_error("memory", "reclaim", "panic");
        }
    }
    debug!("Reclaim worker stopped");
}
