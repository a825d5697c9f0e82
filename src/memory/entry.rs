// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Memory tier entries and size accounting.

use serde_json::Value;
use std::time::Duration;
use tokio::time::Instant;

/// Longest lifetime an entry can be given (ten years).
pub(crate) const MAX_TTL: Duration = Duration::from_secs(10 * 365 * 24 * 3600);

/// Approximate size of a value for memory accounting.
pub trait SizedValue {
    fn size_bytes(&self) -> usize;
}

impl SizedValue for Value {
    fn size_bytes(&self) -> usize {
        json_size(self)
    }
}

impl SizedValue for String {
    fn size_bytes(&self) -> usize {
        self.len()
    }
}

impl SizedValue for Vec<u8> {
    fn size_bytes(&self) -> usize {
        self.len()
    }
}

// Serialized-length estimate without allocating.
fn json_size(value: &Value) -> usize {
    match value {
        Value::Null => 4,
        Value::Bool(_) => 5,
        Value::Number(_) => 8,
        Value::String(s) => s.len() + 2,
        Value::Array(items) => 2 + items.iter().map(|v| json_size(v) + 1).sum::<usize>(),
        Value::Object(map) => {
            2 + map
                .iter()
                .map(|(k, v)| k.len() + 4 + json_size(v))
                .sum::<usize>()
        }
    }
}

/// One cached value under a (primary, secondary) key pair.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub expires_at: Instant,
    /// Write sequence number; ties ledger references to this exact write.
    pub stamp: u64,
    pub size_bytes: usize,
}

impl<V: SizedValue> CacheEntry<V> {
    pub(crate) fn new(primary_key: &str, secondary_key: &str, value: V, ttl: Duration, stamp: u64) -> Self {
        let size_bytes = std::mem::size_of::<Self>()
            + primary_key.len()
            + secondary_key.len()
            + value.size_bytes();
        Self {
            value,
            expires_at: Instant::now() + ttl.min(MAX_TTL),
            stamp,
            size_bytes,
        }
    }
}

impl<V> CacheEntry<V> {
    #[must_use]
    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at <= now
    }

    /// Time left before expiry, zero once expired.
    #[must_use]
    pub fn remaining(&self, now: Instant) -> Duration {
        self.expires_at.saturating_duration_since(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_size_tracks_content() {
        let small = json!({"name": "a"});
        let large = json!({"name": "a".repeat(1000)});
        assert!(large.size_bytes() > small.size_bytes() + 900);
    }

    #[test]
    fn test_entry_size_includes_keys() {
        let short = CacheEntry::new("u", "p", json!(1), Duration::from_secs(60), 0);
        let long = CacheEntry::new("user-with-long-id", "profile", json!(1), Duration::from_secs(60), 0);
        assert_eq!(long.size_bytes - short.size_bytes, "user-with-long-id".len() + "profile".len() - 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_boundary() {
        let entry = CacheEntry::new("u1", "profile", json!("v"), Duration::from_secs(10), 0);
        let now = Instant::now();
        assert!(!entry.is_expired(now));
        assert_eq!(entry.remaining(now), Duration::from_secs(10));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(entry.is_expired(Instant::now()));
        assert_eq!(entry.remaining(Instant::now()), Duration::ZERO);
    }

    #[test]
    fn test_huge_ttl_is_clamped() {
        let entry = CacheEntry::new("k", "k", json!(null), Duration::from_secs(u64::MAX), 0);
        assert!(entry.remaining(Instant::now()) <= MAX_TTL);
    }
}
