//! Correlation counters
//!
//! Lock-free counters kept by each cache and pair timer. They are only read
//! back as snapshots; nothing here exports them anywhere.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters owned by an expiring cache
#[derive(Debug, Default)]
pub struct CacheCounters {
    pub inserted: AtomicU64,
    pub overwritten: AtomicU64,
    pub removed: AtomicU64,
    pub evicted: AtomicU64,
    pub sweeps: AtomicU64,
}

impl CacheCounters {
    pub fn snapshot(&self, entries: usize, disposed: bool) -> CacheStats {
        CacheStats {
            entries,
            inserted: self.inserted.load(Ordering::Relaxed),
            overwritten: self.overwritten.load(Ordering::Relaxed),
            removed: self.removed.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            sweeps: self.sweeps.load(Ordering::Relaxed),
            disposed,
        }
    }
}

/// Point-in-time view of a cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Entries currently held
    pub entries: usize,
    pub inserted: u64,
    /// Inserts that replaced an existing key
    pub overwritten: u64,
    /// Explicit removals that found an entry
    pub removed: u64,
    /// Entries dropped by a sweep
    pub evicted: u64,
    /// Completed sweep passes
    pub sweeps: u64,
    pub disposed: bool,
}

/// Counters owned by a pair timer
#[derive(Debug, Default)]
pub struct PairCounters {
    pub starts: AtomicU64,
    pub matched: AtomicU64,
    pub unmatched: AtomicU64,
    pub ignored: AtomicU64,
}

impl PairCounters {
    pub fn snapshot(&self, pending: usize, cache: CacheStats) -> PairStats {
        PairStats {
            starts: self.starts.load(Ordering::Relaxed),
            matched: self.matched.load(Ordering::Relaxed),
            unmatched: self.unmatched.load(Ordering::Relaxed),
            ignored: self.ignored.load(Ordering::Relaxed),
            pending,
            evicted: cache.evicted,
        }
    }
}

/// Point-in-time view of a pair timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PairStats {
    pub starts: u64,
    pub matched: u64,
    /// Ends with no pending start
    pub unmatched: u64,
    /// Events that belong to neither side of the pair
    pub ignored: u64,
    /// Starts still awaiting their end
    pub pending: usize,
    /// Starts dropped by the sweep before their end arrived
    pub evicted: u64,
}
