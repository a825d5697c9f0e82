// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis pub/sub replication channel.
//!
//! Publishing goes through a shared [`ConnectionManager`]; each subscription
//! holds its own dedicated pub/sub connection, since a subscribed Redis
//! connection cannot issue other commands. When that connection drops the
//! subscription reconnects with the startup retry budget, and ends only
//! once that budget is spent.

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::{ConnectionManager, PubSub};
use redis::{AsyncCommands, Client};
use std::sync::Arc;
use tracing::{error, info, warn};

use super::{deliver, ReplicationChannel, ReplicationError, ReplicationEvent, ReplicationHandler, Subscription};
use crate::resilience::retry::{retry, RetryConfig};

const TRANSPORT: &str = "redis";

pub struct RedisChannel {
    client: Client,
    publisher: ConnectionManager,
    channel: String,
}

impl RedisChannel {
    /// Connect to Redis and bind to `channel`.
    pub async fn connect(url: &str, channel: &str) -> Result<Self, ReplicationError> {
        let client = Client::open(url).map_err(|e| ReplicationError::Connect(e.to_string()))?;

        let publisher = retry("redis_connect", &RetryConfig::startup(), || async {
            ConnectionManager::new(client.clone()).await
        })
        .await
        .map_err(|e: redis::RedisError| {
            crate::metrics::record_connection_error(TRANSPORT);
            ReplicationError::Connect(e.to_string())
        })?;

        Ok(Self {
            client,
            publisher,
            channel: channel.to_string(),
        })
    }

    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub async fn ping(&self) -> Result<(), ReplicationError> {
        let mut conn = self.publisher.clone();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map(|_| ())
            .map_err(|e| ReplicationError::Connect(e.to_string()))
    }
}

#[async_trait]
impl ReplicationChannel for RedisChannel {
    async fn publish(&self, event: &ReplicationEvent) -> Result<(), ReplicationError> {
        let payload = event.encode()?;
        let mut conn = self.publisher.clone();
        conn.publish::<_, _, ()>(&self.channel, payload)
            .await
            .map_err(|e| ReplicationError::Publish(e.to_string()))
    }

    async fn subscribe(&self, handler: Arc<dyn ReplicationHandler>) -> Result<Subscription, ReplicationError> {
        let first = open_pubsub(&self.client, &self.channel).await?;
        info!(channel = %self.channel, "Subscribed to replication channel");

        let client = self.client.clone();
        let channel = self.channel.clone();
        let task = tokio::spawn(async move {
            let mut pubsub = first;
            loop {
                pump(pubsub, &channel, handler.as_ref()).await;
                warn!(channel = %channel, "Replication subscription closed, resubscribing");
                crate::metrics::record_connection_error(TRANSPORT);

                match retry("redis_resubscribe", &RetryConfig::startup(), || open_pubsub(&client, &channel)).await {
                    Ok(fresh) => {
                        info!(channel = %channel, "Resubscribed to replication channel");
                        pubsub = fresh;
                    }
                    Err(e) => {
                        error!(channel = %channel, error = %e, "Replication subscription lost");
                        break;
                    }
                }
            }
        });

        Ok(Subscription::new(task))
    }

    fn name(&self) -> &'static str {
        TRANSPORT
    }
}

async fn open_pubsub(client: &Client, channel: &str) -> Result<PubSub, ReplicationError> {
    let mut pubsub = client
        .get_async_pubsub()
        .await
        .map_err(|e| ReplicationError::Connect(e.to_string()))?;
    pubsub
        .subscribe(channel)
        .await
        .map_err(|e| ReplicationError::Connect(e.to_string()))?;
    Ok(pubsub)
}

/// Deliver messages until the connection's stream ends.
async fn pump(pubsub: PubSub, channel: &str, handler: &dyn ReplicationHandler) {
    let mut messages = Box::pin(pubsub.into_on_message());
    while let Some(msg) = messages.next().await {
        match msg.get_payload::<String>() {
            Ok(payload) => deliver(handler, TRANSPORT, &payload),
            Err(e) => {
                warn!(channel, error = %e, "Unreadable replication message");
                crate::metrics::record_replication("inbound", "decode_error");
            }
        }
    }
}
