//! Configuration-driven event parser
//!
//! Owns one [`PairTimer`] per configured pair plus a set of marker events,
//! routes each incoming raw event by id, and publishes the outcome to
//! subscribers on the delivering thread.

use crate::subscribers::Subscribers;
use crate::timer::{DurationResult, PairTimer};
use chrono::{DateTime, Duration, Utc};
use pairtrace_core::config::{MarkerDefinition, PairDefinition, SensorConfig};
use pairtrace_core::error::{CoreError, CoreResult};
use pairtrace_core::events::{EventId, RawEvent};
use pairtrace_core::metrics::PairStats;
use pairtrace_core::plugins::{EventParser, PluginInfo};
use pairtrace_core::PAIRTRACE_VERSION;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, trace};

/// A pair's start was recorded
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PairStarted {
    pub pair: Arc<str>,
    pub key: u64,
    pub at: DateTime<Utc>,
    /// Payload of the start event
    pub payload: Vec<serde_json::Value>,
}

/// A pair's end matched its start
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PairCompleted {
    pub pair: Arc<str>,
    pub key: u64,
    #[serde(serialize_with = "serialize_duration_us")]
    pub duration: Duration,
    pub ended_at: DateTime<Utc>,
    /// Payload of the end event
    pub payload: Vec<serde_json::Value>,
}

/// An uncorrelated marker event was seen
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Marker {
    pub name: Arc<str>,
    pub event_id: EventId,
    pub at: DateTime<Utc>,
    pub payload: Vec<serde_json::Value>,
}

fn serialize_duration_us<S: serde::Serializer>(
    duration: &Duration,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_i64(duration.num_microseconds().unwrap_or(i64::MAX))
}

struct PairSlot {
    name: Arc<str>,
    definition: PairDefinition,
    timer: PairTimer<u64>,
}

enum Route {
    Pair(usize),
    Marker(Arc<str>),
}

/// Times configured start/end pairs and forwards marker events
pub struct PairedEventParser {
    pairs: Vec<PairSlot>,
    routes: HashMap<EventId, Route>,
    started: Subscribers<PairStarted>,
    completed: Subscribers<PairCompleted>,
    markers: Subscribers<Marker>,
}

impl PairedEventParser {
    /// Build a parser
    ///
    /// Every event id may drive at most one pair or marker; a definition that
    /// reuses an id, or a duplicate pair name, fails with
    /// [`CoreError::InvalidConfiguration`].
    pub fn new(
        pairs: Vec<PairDefinition>,
        markers: Vec<MarkerDefinition>,
        ttl: std::time::Duration,
        initial_capacity: usize,
    ) -> CoreResult<Self> {
        let mut routes = HashMap::new();
        let mut slots: Vec<PairSlot> = Vec::with_capacity(pairs.len());

        for definition in pairs {
            if slots.iter().any(|slot| *slot.name == *definition.name) {
                return Err(CoreError::invalid(format!(
                    "duplicate pair name: {}",
                    definition.name
                )));
            }

            let index = slots.len();
            for event_id in [definition.start_id, definition.end_id] {
                if routes.insert(event_id, Route::Pair(index)).is_some() {
                    return Err(CoreError::invalid(format!(
                        "event {} is claimed by more than one definition (pair {})",
                        event_id, definition.name
                    )));
                }
            }

            let strategy = definition.key;
            let timer = PairTimer::with_capacity(
                definition.start_id,
                definition.end_id,
                ttl,
                initial_capacity,
                move |event: &RawEvent| strategy.key_for(event),
            )?;

            debug!(
                pair = %definition.name,
                start_id = definition.start_id,
                end_id = definition.end_id,
                "Registered pair"
            );

            slots.push(PairSlot {
                name: Arc::from(definition.name.as_str()),
                definition,
                timer,
            });
        }

        for marker in markers {
            let name: Arc<str> = Arc::from(marker.name.as_str());
            if routes.insert(marker.event_id, Route::Marker(name)).is_some() {
                return Err(CoreError::invalid(format!(
                    "event {} is claimed by more than one definition (marker {})",
                    marker.event_id, marker.name
                )));
            }
        }

        info!(
            pairs = slots.len(),
            routes = routes.len(),
            ttl_ms = ttl.as_millis() as u64,
            "Event parser ready"
        );

        Ok(Self {
            pairs: slots,
            routes,
            started: Subscribers::new(),
            completed: Subscribers::new(),
            markers: Subscribers::new(),
        })
    }

    pub fn from_config(config: &SensorConfig) -> CoreResult<Self> {
        Self::new(
            config.pairs.clone(),
            config.markers.clone(),
            config.correlation.ttl(),
            config.correlation.initial_capacity,
        )
    }

    /// Subscribers notified when a start is recorded
    pub fn on_started(&self) -> &Subscribers<PairStarted> {
        &self.started
    }

    /// Subscribers notified when an end matches its start
    pub fn on_completed(&self) -> &Subscribers<PairCompleted> {
        &self.completed
    }

    /// Subscribers notified for marker events
    pub fn on_marker(&self) -> &Subscribers<Marker> {
        &self.markers
    }

    /// Route one event
    pub fn process_event(&self, event: &RawEvent) {
        match self.routes.get(&event.event_id) {
            Some(Route::Pair(index)) => self.process_pair(&self.pairs[*index], event),
            Some(Route::Marker(name)) => {
                if self.markers.is_empty() {
                    return;
                }
                self.markers.publish(&Marker {
                    name: name.clone(),
                    event_id: event.event_id,
                    at: event.ts,
                    payload: event.payload.clone(),
                });
            }
            None => trace!(event_id = event.event_id, "No route for event"),
        }
    }

    fn process_pair(&self, slot: &PairSlot, event: &RawEvent) {
        let definition = &slot.definition;

        if event.event_id == definition.start_id {
            if let Some(filter) = &definition.start_filter {
                if !filter.matches(event) {
                    trace!(pair = %slot.name, "Start rejected by filter");
                    return;
                }
            }
        }

        match slot.timer.try_get_duration(event) {
            DurationResult::Start => {
                if self.started.is_empty() {
                    return;
                }
                self.started.publish(&PairStarted {
                    pair: slot.name.clone(),
                    key: slot.timer.key_of(event),
                    at: event.ts,
                    payload: event.payload.clone(),
                });
            }
            DurationResult::FinalWithDuration(duration) => {
                if definition.discard_non_positive && duration <= Duration::zero() {
                    debug!(pair = %slot.name, ?duration, "Discarding non-positive duration");
                    return;
                }
                if let Some(filter) = &definition.end_filter {
                    if !filter.matches(event) {
                        trace!(pair = %slot.name, "Completion rejected by filter");
                        return;
                    }
                }
                self.completed.publish(&PairCompleted {
                    pair: slot.name.clone(),
                    key: slot.timer.key_of(event),
                    duration,
                    ended_at: event.ts,
                    payload: event.payload.clone(),
                });
            }
            DurationResult::Unmatched | DurationResult::Ignored => {}
        }
    }

    /// Names of the configured pairs, in definition order
    pub fn pair_names(&self) -> Vec<&str> {
        self.pairs.iter().map(|slot| &*slot.name).collect()
    }

    pub fn stats(&self) -> Vec<(String, PairStats)> {
        self.pairs
            .iter()
            .map(|slot| (slot.name.to_string(), slot.timer.stats()))
            .collect()
    }

    /// Evict stale starts in every pair now
    pub fn sweep_expired(&self) -> usize {
        self.pairs.iter().map(|slot| slot.timer.sweep_expired()).sum()
    }

    /// Stop every pair's sweeper; idempotent
    pub fn dispose(&self) {
        for slot in &self.pairs {
            slot.timer.dispose();
        }
    }
}

impl PluginInfo for PairedEventParser {
    fn name(&self) -> &str {
        "paired-event-parser"
    }

    fn version(&self) -> &str {
        PAIRTRACE_VERSION
    }

    fn description(&self) -> &str {
        "Times start/end event pairs and forwards marker events"
    }
}

impl EventParser for PairedEventParser {
    fn event_ids(&self) -> Vec<EventId> {
        let mut ids: Vec<EventId> = self.routes.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn handles(&self, event_id: EventId) -> bool {
        self.routes.contains_key(&event_id)
    }

    fn process_event(&self, event: &RawEvent) {
        PairedEventParser::process_event(self, event);
    }
}
