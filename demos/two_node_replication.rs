// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Two cache nodes sharing one replication channel.
//!
//! Demonstrates:
//! 1. Writing on node A and reading the replicated value on node B
//! 2. A ignoring its own echoed event
//! 3. Write-behind to A's journal only
//! 4. Restarting from the journal via reconciliation
//! 5. Displaying captured metrics
//!
//! Runs fully in-process. Set `REDIS_URL` to replicate over Redis pub/sub
//! instead of the in-process bus.
//!
//! # Run
//!
//! ```bash
//! cargo run --example two_node_replication
//! REDIS_URL=redis://localhost:6379 cargo run --example two_node_replication
//! ```

use std::sync::Arc;
use std::time::Duration;

use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use serde_json::json;
use tiered_cache::{
    CacheConfig, CacheEngine, InMemoryStore, LocalBus, RedisChannel, ReplicationChannel, SetRequest,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("tiered_cache=info")),
        )
        .with_target(false)
        .compact()
        .init();

    println!("\n── tiered-cache: two-node replication ──\n");

    let channel: Arc<dyn ReplicationChannel> = match std::env::var("REDIS_URL") {
        Ok(url) => Arc::new(RedisChannel::connect(&url, "tiered-cache.demo").await?),
        Err(_) => Arc::new(LocalBus::default()),
    };
    println!("Replication transport: {}", channel.name());

    let config = CacheConfig {
        reconcile_delay_ms: 3_600_000,
        ..Default::default()
    };
    let journal = Arc::new(InMemoryStore::new());

    let mut a = CacheEngine::new(config.clone())
        .with_persistent_store(journal.clone())
        .with_replication(channel.clone());
    let mut b = CacheEngine::new(config.clone()).with_replication(channel.clone());
    a.start().await?;
    b.start().await?;
    println!("Node A: {}", a.node_id());
    println!("Node B: {}", b.node_id());

    // 1. Write on A
    a.write(SetRequest::new("u1", "profile", json!({"name": "a"})).with_ttl(3600))?;
    a.write(SetRequest::new("u1", "settings", json!({"theme": "dark"})))?;
    a.flush().await;

    // 2. Wait for B
    for _ in 0..100 {
        if b.read("u1", "settings").is_ok() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    println!("B reads u1/profile  = {}", b.read("u1", "profile")?);
    println!("B reads u1/settings = {}", b.read("u1", "settings")?);

    let stats = a.replication_stats();
    println!(
        "A: published={} echoes_skipped={} | B: applied={}",
        stats.published,
        stats.echoes_skipped,
        b.replication_stats().applied
    );

    // 3. Only A journals
    println!("A journal records: {}", journal.len());

    // 4. Fresh node hydrated from A's journal
    a.shutdown().await;
    let c = CacheEngine::new(config).with_persistent_store(journal);
    let report = c.reconcile().await?;
    println!(
        "C reconciled: loaded={} skipped={} -> u1/profile = {}",
        report.loaded,
        report.skipped,
        c.read("u1", "profile")?
    );

    b.shutdown().await;

    println!("\n── metrics ──");
    dump_metrics(&snapshotter);
    Ok(())
}

fn dump_metrics(snapshotter: &Snapshotter) {
    let mut lines = Vec::new();
    for (composite_key, _, _, value) in snapshotter.snapshot().into_vec() {
        let (_, key) = composite_key.into_parts();
        let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
        let label_str = if labels.is_empty() {
            String::new()
        } else {
            format!("{{{}}}", labels.join(","))
        };
        let rendered = match value {
            DebugValue::Counter(v) => v.to_string(),
            DebugValue::Gauge(v) => format!("{:.2}", v.into_inner()),
            DebugValue::Histogram(samples) => format!("{} samples", samples.len()),
        };
        lines.push(format!("{}{} = {}", key.name(), label_str, rendered));
    }
    lines.sort();
    for line in lines {
        println!("  {}", line);
    }
}
