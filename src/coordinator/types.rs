//! Public types for the cache engine coordinator.

use crate::node::NodeId;
use crate::replication::ReplicationCounts;

/// Engine lifecycle state.
///
/// Use [`super::CacheEngine::state()`] to check the current state or
/// [`super::CacheEngine::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Just created, not yet started
    Created,
    /// Connecting to the persistent store and replication channel
    Connecting,
    /// Background workers and jobs running
    Running,
    /// Graceful shutdown in progress
    ShuttingDown,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Running => write!(f, "Running"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
        }
    }
}

/// Snapshot returned by [`super::CacheEngine::health_check()`].
///
/// Backend fields are `None` when that backend is not configured or
/// cannot be probed.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub state: EngineState,
    pub node_id: NodeId,
    /// Running, writes permitted, the replication subscription alive, and
    /// every probed backend answered
    pub healthy: bool,

    pub memory_entries: usize,
    pub memory_bytes: usize,
    pub memory_pressure: f64,
    pub accepting_writes: bool,
    pub evicting: bool,

    pub persistent_configured: bool,
    pub sql_connected: Option<bool>,
    pub sql_latency_ms: Option<u64>,

    /// Transport name of the replication channel, if any
    pub replication_transport: Option<&'static str>,
    /// Whether inbound replication is still being delivered
    pub replication_subscribed: Option<bool>,
    pub redis_connected: Option<bool>,
    pub redis_latency_ms: Option<u64>,
    pub replication: ReplicationCounts,

    pub persist_queue_depth: usize,
    pub publish_queue_depth: usize,
}

/// Deferred persistent-tier work, handled in submission order.
#[derive(Debug)]
pub(super) enum PersistTask {
    Set {
        primary_key: String,
        secondary_key: String,
        value: String,
        ttl: Option<std::time::Duration>,
    },
    Remove {
        primary_key: String,
    },
    RemovePair {
        primary_key: String,
        secondary_key: String,
    },
}
