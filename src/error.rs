// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Errors surfaced at the engine boundary.

use thiserror::Error;

use crate::replication::ReplicationError;
use crate::storage::traits::StorageError;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("no value cached for key1={primary_key}, key2={secondary_key}")]
    NotFound {
        primary_key: String,
        secondary_key: String,
    },
    #[error("write rejected: memory tier is reclaiming space")]
    WriteRejected,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Replication(#[from] ReplicationError),
    #[error("job '{job}' abandoned after {attempts} attempts: {reason}")]
    JobAbandoned {
        job: &'static str,
        attempts: usize,
        reason: String,
    },
    #[error("internal error: {0}")]
    Internal(String),
}

impl CacheError {
    pub(crate) fn not_found(primary_key: &str, secondary_key: &str) -> Self {
        Self::NotFound {
            primary_key: primary_key.to_string(),
            secondary_key: secondary_key.to_string(),
        }
    }

    /// Status code the request layer should answer with.
    #[must_use]
    pub fn http_status(&self) -> u16 {
        match self {
            Self::NotFound { .. } => 404,
            Self::InvalidRequest(_) => 400,
            Self::WriteRejected => 503,
            Self::Storage(_) | Self::Replication(_) | Self::JobAbandoned { .. } | Self::Internal(_) => 500,
        }
    }

    /// Short label used as the `error_type` metric dimension.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::WriteRejected => "write_rejected",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Storage(_) => "storage",
            Self::Replication(_) => "replication",
            Self::JobAbandoned { .. } => "job_abandoned",
            Self::Internal(_) => "internal",
        }
    }
}
