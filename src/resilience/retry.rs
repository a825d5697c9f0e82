// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bounded retry with exponential backoff.
//!
//! Used for backend connections at startup and for scheduled jobs, where
//! a failed pass is restarted from scratch a bounded number of times.
//!
//! # Example
//!
//! ```
//! use tiered_cache::RetryConfig;
//! use std::time::Duration;
//!
//! let startup = RetryConfig::startup();
//! assert_eq!(startup.max_attempts, 5);
//!
//! let job = RetryConfig::job(5);
//! assert_eq!(job.backoff(0), Duration::from_secs(1));
//! assert_eq!(job.backoff(1), Duration::from_secs(2));
//! ```

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// How many times to run an operation and how long to wait in between.
///
/// `max_attempts` counts every run, including the first.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::job(5)
    }
}

impl RetryConfig {
    /// Initial backend connections. Gives up after roughly three seconds so
    /// a bad URL surfaces from `start()` instead of hanging it.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Whole-pass restarts for reconciliation and purge.
    #[must_use]
    pub fn job(max_attempts: usize) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            factor: 2.0,
        }
    }

    /// Millisecond delays, for tests and demos.
    #[must_use]
    pub fn fast(max_attempts: usize) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
        }
    }

    /// Delay after the failure of attempt `failed` (0-indexed).
    #[must_use]
    pub fn backoff(&self, failed: u32) -> Duration {
        let scaled = self.initial_delay.as_secs_f64() * self.factor.powi(failed as i32);
        if !scaled.is_finite() || scaled >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(scaled)
        }
    }
}

/// Run `operation` until it succeeds or `config.max_attempts` runs fail.
///
/// The last error is returned unchanged.
pub async fn retry<F, Fut, T, E>(name: &str, config: &RetryConfig, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max = config.max_attempts.max(1);
    let mut failed: u32 = 0;

    loop {
        match operation().await {
            Ok(value) => {
                if failed > 0 {
                    info!(operation = name, attempts = failed + 1, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if (failed as usize) + 1 >= max => return Err(err),
            Err(err) => {
                let delay = config.backoff(failed);
                failed += 1;
                warn!(
                    operation = name,
                    attempt = failed,
                    max_attempts = max,
                    error = %err,
                    retry_in_ms = delay.as_millis() as u64,
                    "Attempt failed, retrying"
                );
                sleep(delay).await;
            }
        }
    }
}
