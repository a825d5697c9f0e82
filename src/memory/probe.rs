// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Process memory measurement through `sysinfo`.
//!
//! Used when no explicit byte budget is configured: the threshold becomes a
//! fraction of the host's memory and usage is the process's resident set.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use sysinfo::{Pid, System};
use tracing::debug;

use super::MemoryProbe;

/// How long a resident-set sample is reused before `/proc` is read again.
const SAMPLE_TTL: Duration = Duration::from_millis(100);

/// Total physical memory of the host in bytes, or `None` if unavailable.
#[must_use]
pub fn system_memory_bytes() -> Option<usize> {
    let mut system = System::new();
    system.refresh_memory();
    match system.total_memory() {
        0 => None,
        total => Some(total as usize),
    }
}

/// Resident set size of the current process.
///
/// Samples are cached for a short interval so the per-write capacity check
/// does not hit the OS on every call. Concurrent callers that find a
/// refresh in progress get the previous sample.
pub struct ProcessMemoryProbe {
    pid: Pid,
    system: Mutex<(System, Option<Instant>)>,
    last_sample: AtomicUsize,
}

impl ProcessMemoryProbe {
    #[must_use]
    pub fn new() -> Self {
        Self {
            pid: Pid::from(std::process::id() as usize),
            system: Mutex::new((System::new(), None)),
            last_sample: AtomicUsize::new(0),
        }
    }
}

impl Default for ProcessMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for ProcessMemoryProbe {
    fn used_bytes(&self) -> usize {
        let Some(mut guard) = self.system.try_lock() else {
            return self.last_sample.load(Ordering::Acquire);
        };
        let (system, sampled_at) = &mut *guard;
        if sampled_at.is_some_and(|at| at.elapsed() < SAMPLE_TTL) {
            return self.last_sample.load(Ordering::Acquire);
        }

        system.refresh_process(self.pid);
        let rss = match system.process(self.pid) {
            Some(process) => process.memory() as usize,
            None => {
                debug!(pid = %self.pid, "Process not visible to sysinfo, keeping last sample");
                self.last_sample.load(Ordering::Acquire)
            }
        };
        *sampled_at = Some(Instant::now());
        self.last_sample.store(rss, Ordering::Release);
        rss
    }
}
