// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Backpressure primitives for the memory tier.
//!
//! Two flags are shared between request tasks and the eviction worker:
//! the write permission (revoked under sustained memory pressure) and the
//! single-flight guard that keeps at most one eviction cycle running.
//! Both are plain atomics flipped with compare-and-swap so the request
//! path never takes a lock.
//!
//! # Example
//!
//! ```
//! use tiered_cache::backpressure::{SingleFlight, WritePermission};
//!
//! let permission = WritePermission::new();
//! assert!(permission.is_granted());
//!
//! // Only the first revoke flips the flag
//! assert!(permission.revoke());
//! assert!(!permission.revoke());
//! assert!(!permission.is_granted());
//!
//! assert!(permission.restore());
//! assert!(permission.is_granted());
//! assert_eq!(permission.revocations(), 1);
//!
//! let flight = SingleFlight::new();
//! let guard = flight.try_acquire().expect("idle");
//! assert!(flight.try_acquire().is_none());
//! drop(guard);
//! assert!(!flight.is_running());
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Write permission toggled by the eviction worker.
#[derive(Debug)]
pub struct WritePermission {
    granted: AtomicBool,
    revocations: AtomicU64,
}

impl WritePermission {
    #[must_use]
    pub fn new() -> Self {
        Self {
            granted: AtomicBool::new(true),
            revocations: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn is_granted(&self) -> bool {
        self.granted.load(Ordering::Acquire)
    }

    /// Revoke permission. Returns `true` only for the call that flipped it.
    pub fn revoke(&self) -> bool {
        let flipped = self
            .granted
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if flipped {
            self.revocations.fetch_add(1, Ordering::Relaxed);
        }
        flipped
    }

    /// Restore permission. Returns `true` only for the call that flipped it.
    pub fn restore(&self) -> bool {
        self.granted
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Total revocations since construction.
    #[must_use]
    pub fn revocations(&self) -> u64 {
        self.revocations.load(Ordering::Relaxed)
    }

    /// Suggested HTTP status for a write refused by this permission.
    #[must_use]
    pub fn http_status_code(&self) -> Option<u16> {
        if self.is_granted() { None } else { Some(503) }
    }
}

impl Default for WritePermission {
    fn default() -> Self {
        Self::new()
    }
}

/// At-most-one guard for background cycles.
#[derive(Debug, Default)]
pub struct SingleFlight {
    running: AtomicBool,
}

impl SingleFlight {
    #[must_use]
    pub fn new() -> Self {
        Self { running: AtomicBool::new(false) }
    }

    /// Claim the flight, or `None` if another cycle holds it.
    #[must_use]
    pub fn try_acquire(&self) -> Option<FlightGuard<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlightGuard { flag: &self.running })
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// Clears the running flag on drop, including on unwind.
#[must_use = "the flight is released as soon as the guard is dropped"]
pub struct FlightGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_permission_starts_granted() {
        let permission = WritePermission::new();
        assert!(permission.is_granted());
        assert_eq!(permission.http_status_code(), None);
        assert_eq!(permission.revocations(), 0);
    }

    #[test]
    fn test_restore_without_revoke_is_noop() {
        let permission = WritePermission::new();
        assert!(!permission.restore());
        assert!(permission.is_granted());
    }

    #[test]
    fn test_revoked_permission_maps_to_503() {
        let permission = WritePermission::new();
        permission.revoke();
        assert_eq!(permission.http_status_code(), Some(503));
    }

    #[test]
    fn test_concurrent_revoke_flips_once() {
        let permission = Arc::new(WritePermission::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let p = permission.clone();
                std::thread::spawn(move || p.revoke())
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|flipped| *flipped)
            .count();

        assert_eq!(winners, 1);
        assert_eq!(permission.revocations(), 1);
    }

    #[test]
    fn test_single_flight_released_on_drop() {
        let flight = SingleFlight::new();
        {
            let _guard = flight.try_acquire().unwrap();
            assert!(flight.is_running());
            assert!(flight.try_acquire().is_none());
        }
        assert!(!flight.is_running());
        assert!(flight.try_acquire().is_some());
    }
}
