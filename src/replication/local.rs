// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process replication channel for tests and single-host clusters.
//!
//! Every subscriber receives every published event, including the
//! publisher's own, exactly as a shared pub/sub topic would.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::{deliver, ReplicationChannel, ReplicationError, ReplicationEvent, ReplicationHandler, Subscription};

const TRANSPORT: &str = "local";

#[derive(Clone)]
pub struct LocalBus {
    tx: broadcast::Sender<String>,
}

impl LocalBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl ReplicationChannel for LocalBus {
    async fn publish(&self, event: &ReplicationEvent) -> Result<(), ReplicationError> {
        let payload = event.encode()?;
        if self.tx.send(payload).is_err() {
            debug!("No local subscribers for replication event");
        }
        Ok(())
    }

    async fn subscribe(&self, handler: Arc<dyn ReplicationHandler>) -> Result<Subscription, ReplicationError> {
        let mut rx = self.tx.subscribe();
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => deliver(handler.as_ref(), TRANSPORT, &payload),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Local replication subscriber lagged, events lost");
                        crate::metrics::record_replication("inbound", "lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(Subscription::new(task))
    }

    fn name(&self) -> &'static str {
        TRANSPORT
    }
}
