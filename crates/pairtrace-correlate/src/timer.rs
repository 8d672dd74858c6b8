//! Start/end pair timing
//!
//! A [`PairTimer`] watches two event ids, one marking the start of an
//! operation and one marking its end. Starts are parked in an expiring cache
//! under a correlation key; the matching end takes the start back out and
//! the difference between the two timestamps is the operation's duration.
//!
//! The state of a key is implied by cache membership:
//!
//! - no entry: nothing pending
//! - entry present: a start is waiting for its end
//! - entry removed by an end: consumed
//! - entry removed by the sweep: the start is forgotten, a late end is unmatched
//!
//! Keys are assumed not to overlap within one pair. Two starts for the same
//! key without an end in between keep only the second.

use chrono::Duration;
use pairtrace_core::cache::ExpiringCache;
use pairtrace_core::error::{CoreError, CoreResult};
use pairtrace_core::events::{EventId, RawEvent, TimedEvent};
use pairtrace_core::metrics::{PairCounters, PairStats};
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::Ordering;
use tracing::{debug, trace};

/// Time-to-live used when none is given
pub const DEFAULT_TTL: std::time::Duration = std::time::Duration::from_secs(60);

/// Initial cache capacity used when none is given
pub const DEFAULT_CAPACITY: usize = 32;

/// Extracts the correlation key from an event
pub type KeySelector<E, K> = Box<dyn Fn(&E) -> K + Send + Sync>;

/// Outcome of feeding one event to a [`PairTimer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurationResult {
    /// A start was recorded
    Start,
    /// An end matched a pending start
    FinalWithDuration(Duration),
    /// An end arrived with no pending start (never seen, or already swept)
    Unmatched,
    /// The event is neither this pair's start nor its end
    Ignored,
}

impl DurationResult {
    /// The elapsed time, for matched ends only
    ///
    /// May be zero or negative when the source clock misbehaves.
    pub fn duration(&self) -> Option<Duration> {
        match self {
            DurationResult::FinalWithDuration(duration) => Some(*duration),
            _ => None,
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(self, DurationResult::FinalWithDuration(_))
    }
}

/// Correlates start and end events of one pair
pub struct PairTimer<K, E = RawEvent> {
    start_id: EventId,
    end_id: EventId,
    key_selector: KeySelector<E, K>,
    pending: ExpiringCache<K, ()>,
    counters: PairCounters,
}

impl<K, E> PairTimer<K, E>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    E: TimedEvent,
{
    /// Create a timer with the default time-to-live
    pub fn new<F>(start_id: EventId, end_id: EventId, key_selector: F) -> CoreResult<Self>
    where
        F: Fn(&E) -> K + Send + Sync + 'static,
    {
        Self::with_capacity(start_id, end_id, DEFAULT_TTL, DEFAULT_CAPACITY, key_selector)
    }

    /// Create a timer whose unmatched starts expire after `ttl`
    pub fn with_ttl<F>(
        start_id: EventId,
        end_id: EventId,
        ttl: std::time::Duration,
        key_selector: F,
    ) -> CoreResult<Self>
    where
        F: Fn(&E) -> K + Send + Sync + 'static,
    {
        Self::with_capacity(start_id, end_id, ttl, DEFAULT_CAPACITY, key_selector)
    }

    pub fn with_capacity<F>(
        start_id: EventId,
        end_id: EventId,
        ttl: std::time::Duration,
        initial_capacity: usize,
        key_selector: F,
    ) -> CoreResult<Self>
    where
        F: Fn(&E) -> K + Send + Sync + 'static,
    {
        if start_id == end_id {
            return Err(CoreError::invalid(format!(
                "start and end event ids must differ (both are {})",
                start_id
            )));
        }

        Ok(Self {
            start_id,
            end_id,
            key_selector: Box::new(key_selector),
            pending: ExpiringCache::new(ttl, initial_capacity)?,
            counters: PairCounters::default(),
        })
    }

    /// Classify `event` and update the pending starts
    ///
    /// Never blocks on other keys and never filters durations; a zero or
    /// negative duration is returned as is.
    pub fn try_get_duration(&self, event: &E) -> DurationResult {
        let event_id = event.event_id();

        if event_id == self.start_id {
            let key = self.key_of(event);
            trace!(?key, event_id, "Recording start");
            self.pending.set(key, (), Some(event.timestamp()));
            self.counters.starts.fetch_add(1, Ordering::Relaxed);
            return DurationResult::Start;
        }

        if event_id == self.end_id {
            let key = self.key_of(event);
            return match self.pending.try_remove(&key) {
                Some((_, started_at)) => {
                    let duration = event.timestamp() - started_at;
                    trace!(?key, ?duration, "Matched end");
                    self.counters.matched.fetch_add(1, Ordering::Relaxed);
                    DurationResult::FinalWithDuration(duration)
                }
                None => {
                    debug!(?key, event_id, "End without pending start");
                    self.counters.unmatched.fetch_add(1, Ordering::Relaxed);
                    DurationResult::Unmatched
                }
            };
        }

        self.counters.ignored.fetch_add(1, Ordering::Relaxed);
        DurationResult::Ignored
    }

    /// The correlation key this timer would use for `event`
    pub fn key_of(&self, event: &E) -> K {
        (self.key_selector)(event)
    }

    pub fn start_id(&self) -> EventId {
        self.start_id
    }

    pub fn end_id(&self) -> EventId {
        self.end_id
    }

    /// Starts currently waiting for their end
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, key: &K) -> bool {
        self.pending.contains_key(key)
    }

    /// Evict stale starts now instead of waiting for the sweeper
    pub fn sweep_expired(&self) -> usize {
        self.pending.sweep_expired()
    }

    pub fn stats(&self) -> PairStats {
        self.counters.snapshot(self.pending.len(), self.pending.stats())
    }

    /// Stop evicting stale starts; idempotent
    pub fn dispose(&self) {
        self.pending.dispose();
    }
}

impl<K, E> fmt::Debug for PairTimer<K, E>
where
    K: Eq + Hash,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PairTimer")
            .field("start_id", &self.start_id)
            .field("end_id", &self.end_id)
            .field("pending", &self.pending)
            .finish()
    }
}

/// Key selector matching on the emitting OS thread
pub fn by_thread(event: &RawEvent) -> u64 {
    event.os_thread_id
}

/// Key selector for pairs that never overlap, such as process-wide
/// suspend/resume; every event maps to the same slot
pub fn constant<E>(_event: &E) -> u32 {
    1
}

/// Key selector reading an unsigned payload field
///
/// A missing field maps to key 0.
pub fn by_payload(index: usize) -> impl Fn(&RawEvent) -> u64 + Send + Sync + 'static {
    move |event: &RawEvent| event.payload_u64(index).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::Arc;

    const START: EventId = 81;
    const END: EventId = 91;

    fn timer(ttl_ms: u64) -> PairTimer<u64> {
        PairTimer::with_ttl(START, END, std::time::Duration::from_millis(ttl_ms), by_thread)
            .unwrap()
    }

    fn event(id: EventId, thread: u64, ts: chrono::DateTime<Utc>) -> RawEvent {
        RawEvent::new(id, ts).with_thread(thread)
    }

    #[test]
    fn test_start_then_end_yields_duration() {
        let timer = timer(100);
        let t0 = Utc::now();

        assert_eq!(timer.try_get_duration(&event(START, 7, t0)), DurationResult::Start);
        assert!(timer.is_pending(&7));

        let result = timer.try_get_duration(&event(END, 7, t0 + Duration::milliseconds(40)));
        assert_eq!(result, DurationResult::FinalWithDuration(Duration::milliseconds(40)));
        assert_eq!(result.duration(), Some(Duration::milliseconds(40)));
        assert!(!timer.is_pending(&7));
    }

    #[test]
    fn test_end_without_start_is_unmatched() {
        let timer = timer(100);
        let result = timer.try_get_duration(&event(END, 7, Utc::now()));
        assert_eq!(result, DurationResult::Unmatched);
        assert_eq!(result.duration(), None);
    }

    #[test]
    fn test_end_consumes_start_once() {
        let timer = timer(60_000);
        let t0 = Utc::now();
        timer.try_get_duration(&event(START, 7, t0));

        assert!(timer
            .try_get_duration(&event(END, 7, t0 + Duration::milliseconds(1)))
            .is_final());
        assert_eq!(
            timer.try_get_duration(&event(END, 7, t0 + Duration::milliseconds(2))),
            DurationResult::Unmatched
        );
    }

    #[test]
    fn test_second_start_wins() {
        let timer = timer(60_000);
        let t0 = Utc::now();

        timer.try_get_duration(&event(START, 7, t0));
        timer.try_get_duration(&event(START, 7, t0 + Duration::milliseconds(10)));
        let result = timer.try_get_duration(&event(END, 7, t0 + Duration::milliseconds(25)));

        assert_eq!(result, DurationResult::FinalWithDuration(Duration::milliseconds(15)));
        assert_eq!(timer.pending(), 0);
    }

    #[test]
    fn test_other_events_are_ignored() {
        let timer = timer(60_000);
        assert_eq!(timer.try_get_duration(&event(5, 7, Utc::now())), DurationResult::Ignored);
        assert_eq!(timer.pending(), 0);
        assert_eq!(timer.stats().ignored, 1);
    }

    #[test]
    fn test_swept_start_leaves_end_unmatched() {
        let timer = timer(100);
        let t0 = Utc::now() - Duration::milliseconds(150);

        timer.try_get_duration(&event(START, 7, t0));
        assert_eq!(timer.sweep_expired(), 1);

        let result = timer.try_get_duration(&event(END, 7, t0 + Duration::milliseconds(160)));
        assert_eq!(result, DurationResult::Unmatched);
        assert_eq!(timer.stats().evicted, 1);
    }

    #[test]
    fn test_background_sweep_forgets_start() {
        let timer = timer(50);
        timer.try_get_duration(&event(START, 7, Utc::now()));

        std::thread::sleep(std::time::Duration::from_millis(300));

        assert_eq!(
            timer.try_get_duration(&event(END, 7, Utc::now())),
            DurationResult::Unmatched
        );
    }

    #[test]
    fn test_negative_duration_is_reported() {
        let timer = timer(60_000);
        let t0 = Utc::now();

        timer.try_get_duration(&event(START, 7, t0));
        let result = timer.try_get_duration(&event(END, 7, t0 - Duration::milliseconds(3)));
        assert_eq!(result, DurationResult::FinalWithDuration(Duration::milliseconds(-3)));
    }

    #[test]
    fn test_keys_do_not_interfere() {
        let timer = timer(60_000);
        let t0 = Utc::now();

        timer.try_get_duration(&event(START, 1, t0));
        timer.try_get_duration(&event(START, 2, t0 + Duration::milliseconds(5)));

        assert_eq!(
            timer.try_get_duration(&event(END, 2, t0 + Duration::milliseconds(6))),
            DurationResult::FinalWithDuration(Duration::milliseconds(1))
        );
        assert_eq!(
            timer.try_get_duration(&event(END, 1, t0 + Duration::milliseconds(9))),
            DurationResult::FinalWithDuration(Duration::milliseconds(9))
        );
    }

    #[test]
    fn test_constant_key_pairs_across_threads() {
        let timer: PairTimer<u32> = PairTimer::new(9, 3, constant::<RawEvent>).unwrap();
        let t0 = Utc::now();

        timer.try_get_duration(&event(9, 100, t0));
        let result = timer.try_get_duration(&event(3, 200, t0 + Duration::milliseconds(2)));
        assert_eq!(result, DurationResult::FinalWithDuration(Duration::milliseconds(2)));
    }

    #[test]
    fn test_payload_key() {
        let timer: PairTimer<u64> = PairTimer::new(1, 2, by_payload(0)).unwrap();
        let t0 = Utc::now();

        timer.try_get_duration(&RawEvent::new(1, t0).with_payload(vec![json!(12)]));
        timer.try_get_duration(&RawEvent::new(1, t0).with_payload(vec![json!(13)]));
        assert_eq!(timer.pending(), 2);

        let result = timer.try_get_duration(
            &RawEvent::new(2, t0 + Duration::milliseconds(8)).with_payload(vec![json!(13)]),
        );
        assert_eq!(result, DurationResult::FinalWithDuration(Duration::milliseconds(8)));
        assert!(timer.is_pending(&12));
    }

    #[test]
    fn test_same_start_and_end_rejected() {
        let result: CoreResult<PairTimer<u64>> = PairTimer::new(4, 4, by_thread);
        assert!(matches!(result, Err(CoreError::InvalidConfiguration(_))));
    }

    #[test]
    fn test_zero_ttl_rejected() {
        let result: CoreResult<PairTimer<u64>> =
            PairTimer::with_ttl(1, 2, std::time::Duration::ZERO, by_thread);
        assert!(matches!(result, Err(CoreError::InvalidConfiguration(_))));
    }

    #[test]
    fn test_custom_event_type() {
        struct Tick {
            id: EventId,
            at: chrono::DateTime<Utc>,
            lane: u8,
        }

        impl TimedEvent for Tick {
            fn event_id(&self) -> EventId {
                self.id
            }

            fn timestamp(&self) -> chrono::DateTime<Utc> {
                self.at
            }
        }

        let timer: PairTimer<u8, Tick> = PairTimer::new(1, 2, |tick: &Tick| tick.lane).unwrap();
        let t0 = Utc::now();

        timer.try_get_duration(&Tick { id: 1, at: t0, lane: 3 });
        let result = timer.try_get_duration(&Tick {
            id: 2,
            at: t0 + Duration::milliseconds(4),
            lane: 3,
        });
        assert_eq!(result.duration(), Some(Duration::milliseconds(4)));
    }

    #[test]
    fn test_stats() {
        let timer = timer(60_000);
        let t0 = Utc::now();

        timer.try_get_duration(&event(START, 1, t0));
        timer.try_get_duration(&event(START, 2, t0));
        timer.try_get_duration(&event(END, 1, t0));
        timer.try_get_duration(&event(END, 3, t0));

        let stats = timer.stats();
        assert_eq!(stats.starts, 2);
        assert_eq!(stats.matched, 1);
        assert_eq!(stats.unmatched, 1);
        assert_eq!(stats.pending, 1);
    }

    #[test]
    fn test_concurrent_disjoint_keys() {
        let timer = Arc::new(timer(60_000));
        let base = Utc::now();

        let handles: Vec<_> = (0..8u64)
            .map(|thread| {
                let timer = timer.clone();
                std::thread::spawn(move || {
                    for i in 0..200i64 {
                        let started = base + Duration::milliseconds(i);
                        timer.try_get_duration(&event(START, thread, started));
                        let result = timer.try_get_duration(&event(
                            END,
                            thread,
                            started + Duration::microseconds(thread as i64 * 10 + 1),
                        ));
                        assert_eq!(
                            result,
                            DurationResult::FinalWithDuration(Duration::microseconds(
                                thread as i64 * 10 + 1
                            ))
                        );
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let stats = timer.stats();
        assert_eq!(stats.matched, 1600);
        assert_eq!(stats.unmatched, 0);
        assert_eq!(timer.pending(), 0);
    }

    #[test]
    fn test_dispose_keeps_pending_starts() {
        let timer = timer(50);
        timer.dispose();
        timer.dispose();

        let t0 = Utc::now() - Duration::seconds(5);
        timer.try_get_duration(&event(START, 7, t0));
        std::thread::sleep(std::time::Duration::from_millis(200));

        assert!(timer.is_pending(&7));
        assert!(timer
            .try_get_duration(&event(END, 7, t0 + Duration::seconds(1)))
            .is_final());
    }
}
