//! pairtrace core - raw events, expiring cache, and configuration
//!
//! This crate provides the foundations the correlation engine is built on:
//!
//! - **Events**: the raw event record handed over by external decoders
//! - **Cache**: a concurrent map whose entries expire after a time-to-live
//! - **Config**: TOML configuration with pair and marker definitions
//! - **Replay**: feeding recorded JSONL events to a parser

pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod metrics;
pub mod plugins;
pub mod replay;

// Re-export commonly used types
pub use cache::ExpiringCache;
pub use config::{
    ConfigLoader, KeyStrategy, MarkerDefinition, PairDefinition, PayloadFilter, SensorConfig,
};
pub use error::{CoreError, CoreResult};
pub use events::{EventId, RawEvent, TimedEvent};
pub use metrics::{CacheStats, PairStats};
pub use plugins::{EventParser, PluginInfo};

/// pairtrace version
pub const PAIRTRACE_VERSION: &str = env!("CARGO_PKG_VERSION");
