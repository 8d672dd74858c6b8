//! Parser plugin traits
//!
//! Decoders that consume raw events implement [`EventParser`]. Delivery is
//! synchronous: `process_event` runs on whichever thread delivered the event.

use crate::events::{EventId, RawEvent};

/// Basic plugin information
pub trait PluginInfo {
    /// Plugin name
    fn name(&self) -> &str;

    /// Plugin version
    fn version(&self) -> &str;

    /// Plugin description
    fn description(&self) -> &str {
        ""
    }
}

/// A decoder fed with raw events
pub trait EventParser: PluginInfo + Send + Sync {
    /// Event ids this parser reacts to
    fn event_ids(&self) -> Vec<EventId>;

    /// Whether `event_id` is one this parser reacts to
    fn handles(&self, event_id: EventId) -> bool {
        self.event_ids().contains(&event_id)
    }

    /// Consume one event
    fn process_event(&self, event: &RawEvent);
}
