// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Insertion-ordered eviction ledger.
//!
//! The ledger is a hint: a reference may point at an entry that was
//! overwritten, removed or swept since it was appended. Consumers compare
//! the reference's stamp against the live entry and treat a mismatch as
//! a no-op.

use parking_lot::Mutex;
use std::collections::VecDeque;

/// Points at the write that produced an entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerRef {
    pub primary_key: String,
    pub secondary_key: String,
    pub stamp: u64,
}

#[derive(Debug, Default)]
pub struct EvictionLedger {
    refs: Mutex<VecDeque<LedgerRef>>,
}

impl EvictionLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: LedgerRef) {
        self.refs.lock().push_back(entry);
    }

    /// Oldest reference, or `None` when the ledger is exhausted.
    pub fn pop_oldest(&self) -> Option<LedgerRef> {
        self.refs.lock().pop_front()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.refs.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.refs.lock().is_empty()
    }

    /// Drop references for which `is_live` returns false, keeping order.
    /// Returns the number of references dropped.
    pub fn compact(&self, mut is_live: impl FnMut(&LedgerRef) -> bool) -> usize {
        let mut refs = self.refs.lock();
        let before = refs.len();
        refs.retain(|r| is_live(r));
        refs.shrink_to_fit();
        before - refs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(k1: &str, k2: &str, stamp: u64) -> LedgerRef {
        LedgerRef {
            primary_key: k1.to_string(),
            secondary_key: k2.to_string(),
            stamp,
        }
    }

    #[test]
    fn test_pops_in_insertion_order() {
        let ledger = EvictionLedger::new();
        ledger.push(r("a", "1", 0));
        ledger.push(r("b", "1", 1));
        ledger.push(r("a", "2", 2));

        assert_eq!(ledger.pop_oldest(), Some(r("a", "1", 0)));
        assert_eq!(ledger.pop_oldest(), Some(r("b", "1", 1)));
        assert_eq!(ledger.pop_oldest(), Some(r("a", "2", 2)));
        assert_eq!(ledger.pop_oldest(), None);
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_compact_keeps_order_of_live_refs() {
        let ledger = EvictionLedger::new();
        for stamp in 0..6 {
            ledger.push(r("k", &stamp.to_string(), stamp));
        }

        let dropped = ledger.compact(|r| r.stamp % 2 == 1);

        assert_eq!(dropped, 3);
        assert_eq!(ledger.len(), 3);
        assert_eq!(ledger.pop_oldest().map(|r| r.stamp), Some(1));
        assert_eq!(ledger.pop_oldest().map(|r| r.stamp), Some(3));
        assert_eq!(ledger.pop_oldest().map(|r| r.stamp), Some(5));
    }
}
