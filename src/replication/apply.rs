// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

use super::{ReplicationEvent, ReplicationHandler};
use crate::memory::MemoryCache;
use crate::node::NodeId;

/// Counters shared between the engine and its applier.
#[derive(Debug, Default)]
pub struct ReplicationStats {
    published: AtomicU64,
    publish_failed: AtomicU64,
    applied: AtomicU64,
    rejected: AtomicU64,
    echoes_skipped: AtomicU64,
}

/// Point-in-time copy of [`ReplicationStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplicationCounts {
    pub published: u64,
    pub publish_failed: u64,
    pub applied: u64,
    pub rejected: u64,
    pub echoes_skipped: u64,
}

impl ReplicationStats {
    pub(crate) fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_replication("outbound", "published");
    }

    pub(crate) fn record_publish_failed(&self) {
        self.publish_failed.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_replication("outbound", "error");
    }

    #[must_use]
    pub fn snapshot(&self) -> ReplicationCounts {
        ReplicationCounts {
            published: self.published.load(Ordering::Relaxed),
            publish_failed: self.publish_failed.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            echoes_skipped: self.echoes_skipped.load(Ordering::Relaxed),
        }
    }
}

/// Applies peer writes to the local memory tier.
///
/// Events carrying this node's id are skipped. Applied events touch memory
/// only; the origin has already persisted them.
pub struct ReplicaApplier {
    node_id: NodeId,
    memory: MemoryCache<Value>,
    stats: Arc<ReplicationStats>,
}

impl ReplicaApplier {
    pub fn new(node_id: NodeId, memory: MemoryCache<Value>, stats: Arc<ReplicationStats>) -> Self {
        Self { node_id, memory, stats }
    }
}

impl ReplicationHandler for ReplicaApplier {
    fn handle(&self, event: ReplicationEvent) {
        if event.origin == self.node_id {
            trace!(primary_key = %event.payload.primary_key, "Skipping own replication event");
            self.stats.echoes_skipped.fetch_add(1, Ordering::Relaxed);
            crate::metrics::record_replication("inbound", "echo");
            return;
        }

        let ttl = event.payload.ttl();
        let request = event.payload;
        let accepted = match ttl {
            Some(ttl) => self
                .memory
                .set_with_ttl(&request.primary_key, &request.secondary_key, request.value, ttl),
            None => self.memory.set(&request.primary_key, &request.secondary_key, request.value),
        };

        if accepted {
            self.stats.applied.fetch_add(1, Ordering::Relaxed);
            crate::metrics::record_replication("inbound", "applied");
        } else {
            debug!(
                origin = %event.origin,
                primary_key = %request.primary_key,
                "Replicated write rejected by memory tier"
            );
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            crate::metrics::record_replication("inbound", "rejected");
        }
    }
}
