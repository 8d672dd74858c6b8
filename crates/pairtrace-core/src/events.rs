//! Raw event model
//!
//! The opaque record an external decoder hands to the correlation core:
//! an event id, a timestamp, the emitting OS thread, and a positional
//! payload. The core never interprets the payload itself.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of an event kind as emitted by the instrumented runtime
pub type EventId = u32;

/// Anything that carries an event id and a timestamp
///
/// The pair timer is generic over this trait so decoders can pass their own
/// record types instead of converting to [`RawEvent`].
pub trait TimedEvent {
    fn event_id(&self) -> EventId;

    fn timestamp(&self) -> DateTime<Utc>;
}

/// A raw runtime event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    /// Event kind
    pub event_id: EventId,

    /// When the runtime emitted the event
    pub ts: DateTime<Utc>,

    /// OS thread that emitted the event
    #[serde(default)]
    pub os_thread_id: u64,

    /// Positional payload fields
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub payload: Vec<serde_json::Value>,
}

impl RawEvent {
    /// Create an event with an empty payload
    pub fn new(event_id: EventId, ts: DateTime<Utc>) -> Self {
        Self {
            event_id,
            ts,
            os_thread_id: 0,
            payload: Vec::new(),
        }
    }

    /// Create an event stamped with the current time
    pub fn now(event_id: EventId) -> Self {
        Self::new(event_id, Utc::now())
    }

    pub fn with_thread(mut self, os_thread_id: u64) -> Self {
        self.os_thread_id = os_thread_id;
        self
    }

    pub fn with_payload(mut self, payload: Vec<serde_json::Value>) -> Self {
        self.payload = payload;
        self
    }

    /// Read a payload field as an unsigned integer
    ///
    /// Booleans map to 0/1. Negative numbers, floats and strings yield `None`.
    pub fn payload_u64(&self, index: usize) -> Option<u64> {
        match self.payload.get(index)? {
            serde_json::Value::Number(n) => n.as_u64(),
            serde_json::Value::Bool(b) => Some(u64::from(*b)),
            _ => None,
        }
    }

    /// Read a payload field as a string
    pub fn payload_str(&self, index: usize) -> Option<&str> {
        self.payload.get(index)?.as_str()
    }
}

impl TimedEvent for RawEvent {
    fn event_id(&self) -> EventId {
        self.event_id
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.ts
    }
}
