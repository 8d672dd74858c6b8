//! Time-bounded concurrent cache
//!
//! Entries carry the timestamp they were inserted with. A dedicated sweeper
//! thread wakes once per time-to-live and drops every entry older than the
//! time-to-live, so keys that are never explicitly removed eventually go away.
//! Callers only ever observe that old keys disappear; they never wait on the
//! sweeper.

use crate::error::{CoreError, CoreResult};
use crate::metrics::{CacheCounters, CacheStats};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, Thread};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// A value together with the time it was inserted
#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    inserted_at: DateTime<Utc>,
}

type EntryMap<K, V> = DashMap<K, CacheEntry<V>>;

/// Concurrent map whose entries expire after a fixed time-to-live
///
/// Eviction is bounded-stale: an entry is removed by the first sweep that
/// runs after it has outlived the time-to-live, typically within one sweep
/// interval. No entry is ever evicted before that age.
pub struct ExpiringCache<K, V> {
    entries: Arc<EntryMap<K, V>>,
    ttl: Duration,
    ttl_delta: chrono::Duration,
    counters: Arc<CacheCounters>,
    sweeper: Sweeper,
}

impl<K, V> ExpiringCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Create a cache and start its sweeper
    ///
    /// Fails with [`CoreError::InvalidConfiguration`] when `ttl` is zero or
    /// too large to compare against wall-clock timestamps.
    pub fn new(ttl: Duration, initial_capacity: usize) -> CoreResult<Self> {
        if ttl.is_zero() {
            return Err(CoreError::invalid("time-to-live must be greater than zero"));
        }
        let ttl_delta = chrono::Duration::from_std(ttl)
            .map_err(|_| CoreError::invalid(format!("time-to-live {:?} is out of range", ttl)))?;

        let entries: Arc<EntryMap<K, V>> = Arc::new(DashMap::with_capacity(initial_capacity));
        let counters = Arc::new(CacheCounters::default());
        let running = Arc::new(AtomicBool::new(true));

        let handle = {
            let entries = Arc::downgrade(&entries);
            let counters = counters.clone();
            let running = running.clone();
            thread::Builder::new()
                .name("pairtrace-sweep".to_string())
                .spawn(move || run_sweeper(entries, ttl, ttl_delta, running, counters))?
        };

        debug!(ttl_ms = ttl.as_millis() as u64, "Started cache sweeper");

        Ok(Self {
            entries,
            ttl,
            ttl_delta,
            counters,
            sweeper: Sweeper {
                running,
                thread: handle.thread().clone(),
            },
        })
    }

    /// Insert or overwrite `key`
    ///
    /// The entry is stamped with `timestamp`, or the current time when none
    /// is given. Overwrites replace the value and timestamp together in one
    /// step, so concurrent readers see either the old entry or the new one.
    pub fn set(&self, key: K, value: V, timestamp: Option<DateTime<Utc>>) {
        let entry = CacheEntry {
            value,
            inserted_at: timestamp.unwrap_or_else(Utc::now),
        };

        if self.entries.insert(key, entry).is_some() {
            self.counters.overwritten.fetch_add(1, Ordering::Relaxed);
        }
        self.counters.inserted.fetch_add(1, Ordering::Relaxed);
    }

    /// Remove `key` and return its value and insertion time
    ///
    /// At most one caller can take a given entry.
    pub fn try_remove(&self, key: &K) -> Option<(V, DateTime<Utc>)> {
        let (_, entry) = self.entries.remove(key)?;
        self.counters.removed.fetch_add(1, Ordering::Relaxed);
        Some((entry.value, entry.inserted_at))
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Run one eviction pass on the calling thread
    ///
    /// Returns the number of entries evicted.
    pub fn sweep_expired(&self) -> usize {
        sweep(&self.entries, self.ttl_delta, &self.counters)
    }

    /// Stop the sweeper
    ///
    /// Idempotent. A sweep pass already in progress is allowed to finish.
    /// Entries remain readable and writable afterwards but are no longer
    /// evicted automatically.
    pub fn dispose(&self) {
        self.sweeper.stop();
    }

    pub fn is_disposed(&self) -> bool {
        !self.sweeper.running.load(Ordering::Acquire)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        self.counters.snapshot(self.entries.len(), self.is_disposed())
    }
}

impl<K, V> ExpiringCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Look up `key` without removing it
    pub fn try_get(&self, key: &K) -> Option<(V, DateTime<Utc>)> {
        self.entries
            .get(key)
            .map(|entry| (entry.value.clone(), entry.inserted_at))
    }
}

impl<K, V> Drop for ExpiringCache<K, V> {
    fn drop(&mut self) {
        self.sweeper.stop();
    }
}

impl<K: Eq + Hash, V> fmt::Debug for ExpiringCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExpiringCache")
            .field("ttl", &self.ttl)
            .field("entries", &self.entries.len())
            .field("disposed", &!self.sweeper.running.load(Ordering::Acquire))
            .finish()
    }
}

/// Handle to the background sweep thread
struct Sweeper {
    running: Arc<AtomicBool>,
    thread: Thread,
}

impl Sweeper {
    fn stop(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            // Wake the thread so it observes the flag now instead of at the
            // end of its current wait.
            self.thread.unpark();
            debug!("Stopping cache sweeper");
        }
    }
}

fn run_sweeper<K, V>(
    entries: Weak<EntryMap<K, V>>,
    interval: Duration,
    ttl: chrono::Duration,
    running: Arc<AtomicBool>,
    counters: Arc<CacheCounters>,
) where
    K: Eq + Hash + Clone,
{
    loop {
        // Deadline-based so spurious unparks do not shorten the interval.
        let deadline = Instant::now().checked_add(interval);
        loop {
            if !running.load(Ordering::Acquire) {
                info!("Cache sweeper stopped");
                return;
            }
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    thread::park_timeout(deadline - now);
                }
                None => thread::park(),
            }
        }

        let Some(entries) = entries.upgrade() else {
            debug!("Cache dropped, sweeper exiting");
            return;
        };
        sweep(&entries, ttl, &counters);
    }
}

fn sweep<K, V>(entries: &EntryMap<K, V>, ttl: chrono::Duration, counters: &CacheCounters) -> usize
where
    K: Eq + Hash + Clone,
{
    let Some(cutoff) = Utc::now().checked_sub_signed(ttl) else {
        return 0;
    };

    let stale: Vec<K> = entries
        .iter()
        .filter(|entry| entry.value().inserted_at < cutoff)
        .map(|entry| entry.key().clone())
        .collect();

    // Re-check under the shard lock: the key may have been re-set since the
    // scan above.
    let evicted = stale
        .iter()
        .filter(|key| {
            entries
                .remove_if(*key, |_, entry| entry.inserted_at < cutoff)
                .is_some()
        })
        .count();

    counters.evicted.fetch_add(evicted as u64, Ordering::Relaxed);
    counters.sweeps.fetch_add(1, Ordering::Relaxed);

    if evicted > 0 {
        debug!(evicted, remaining = entries.len(), "Evicted stale cache entries");
    }

    evicted
}
