//! pairtrace correlation - matching start events to end events
//!
//! - [`PairTimer`] times one start/end pair keyed by a correlation key
//! - [`Subscribers`] fans results out to interested callbacks
//! - [`PairedEventParser`] drives a set of configured pairs and markers

pub mod parser;
pub mod subscribers;
pub mod timer;

pub use parser::{Marker, PairCompleted, PairStarted, PairedEventParser};
pub use subscribers::{SubscriptionId, Subscribers};
pub use timer::{by_payload, by_thread, constant, DurationResult, KeySelector, PairTimer};
