// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication channel: broadcast of accepted writes to peer nodes.
//!
//! Each event is a JSON envelope carrying the origin node id next to the
//! write itself:
//!
//! ```text
//! {"origin": "6f1c…", "payload": {"primary_key": "u1", "secondary_key": "profile", "value": {…}, "ttl_secs": 3600}}
//! ```
//!
//! Channels may deliver a node's own events back to it. Filtering those
//! is the subscriber's job ([`ReplicaApplier`] compares origins).

mod apply;
pub mod local;
pub mod redis;

pub use apply::{ReplicaApplier, ReplicationCounts, ReplicationStats};
pub use local::LocalBus;
pub use self::redis::RedisChannel;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::node::NodeId;
use crate::request::SetRequest;

#[derive(Error, Debug)]
pub enum ReplicationError {
    #[error("replication channel connect failed: {0}")]
    Connect(String),
    #[error("replication publish failed: {0}")]
    Publish(String),
    #[error("replication payload could not be encoded or decoded: {0}")]
    Codec(#[from] serde_json::Error),
}

/// A write travelling between nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationEvent {
    pub origin: NodeId,
    pub payload: SetRequest,
}

impl ReplicationEvent {
    pub fn new(origin: NodeId, payload: SetRequest) -> Self {
        Self { origin, payload }
    }

    pub fn encode(&self) -> Result<String, ReplicationError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &str) -> Result<Self, ReplicationError> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Invoked once per received event.
pub trait ReplicationHandler: Send + Sync {
    fn handle(&self, event: ReplicationEvent);
}

/// Pub/sub transport for replication events.
#[async_trait]
pub trait ReplicationChannel: Send + Sync {
    /// Broadcast to all subscribers.
    async fn publish(&self, event: &ReplicationEvent) -> Result<(), ReplicationError>;

    /// Start delivering received events to `handler` until the returned
    /// subscription is dropped.
    async fn subscribe(&self, handler: Arc<dyn ReplicationHandler>) -> Result<Subscription, ReplicationError>;

    /// Transport name for logs and metrics.
    fn name(&self) -> &'static str;
}

/// Background delivery task; aborted on drop.
pub struct Subscription {
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn new(task: JoinHandle<()>) -> Self {
        Self { task }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Decode a raw payload and hand it to the handler.
pub(crate) fn deliver(handler: &dyn ReplicationHandler, transport: &'static str, raw: &str) {
    match ReplicationEvent::decode(raw) {
        Ok(event) => handler.handle(event),
        Err(e) => {
            warn!(transport, error = %e, "Dropping undecodable replication event");
            crate::metrics::record_replication("inbound", "decode_error");
        }
    }
}
