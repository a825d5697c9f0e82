// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Request payloads accepted by the engine.
//!
//! A [`SetRequest`] is also what travels over the replication channel, so
//! peers apply exactly the write the origin accepted.
//!
//! # Example
//!
//! ```
//! use tiered_cache::SetRequest;
//! use serde_json::json;
//!
//! let request = SetRequest::new("u1", "profile", json!({"name": "a"})).with_ttl(3600);
//! assert!(request.validate().is_ok());
//!
//! // TTL below one hour is refused
//! assert!(SetRequest::new("u1", "profile", json!(1)).with_ttl(60).validate().is_err());
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::error::CacheError;

pub const MAX_KEY_CHARS: usize = 255;
pub const MIN_TTL_SECS: u64 = 3600;
pub const MAX_TTL_SECS: u64 = 2_592_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetRequest {
    pub primary_key: String,
    pub secondary_key: String,
    pub value: Value,
    /// Lifetime in seconds; `None` means the configured default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_secs: Option<u64>,
}

impl SetRequest {
    pub fn new(primary_key: impl Into<String>, secondary_key: impl Into<String>, value: Value) -> Self {
        Self {
            primary_key: primary_key.into(),
            secondary_key: secondary_key.into(),
            value,
            ttl_secs: None,
        }
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl_secs: u64) -> Self {
        self.ttl_secs = Some(ttl_secs);
        self
    }

    #[must_use]
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_secs.map(Duration::from_secs)
    }

    pub fn validate(&self) -> Result<(), CacheError> {
        validate_key("primary_key", &self.primary_key)?;
        validate_key("secondary_key", &self.secondary_key)?;
        if let Some(ttl) = self.ttl_secs {
            if !(MIN_TTL_SECS..=MAX_TTL_SECS).contains(&ttl) {
                return Err(CacheError::InvalidRequest(format!(
                    "ttl_secs must be within {}..={}, got {}",
                    MIN_TTL_SECS, MAX_TTL_SECS, ttl
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetRequest {
    pub primary_key: String,
    pub secondary_key: String,
}

impl GetRequest {
    pub fn new(primary_key: impl Into<String>, secondary_key: impl Into<String>) -> Self {
        Self {
            primary_key: primary_key.into(),
            secondary_key: secondary_key.into(),
        }
    }

    pub fn validate(&self) -> Result<(), CacheError> {
        validate_key("primary_key", &self.primary_key)?;
        validate_key("secondary_key", &self.secondary_key)
    }
}

pub(crate) fn validate_key(field: &str, key: &str) -> Result<(), CacheError> {
    let chars = key.chars().count();
    if chars == 0 || chars > MAX_KEY_CHARS {
        return Err(CacheError::InvalidRequest(format!(
            "{} must be 1..={} characters, got {}",
            field, MAX_KEY_CHARS, chars
        )));
    }
    Ok(())
}
