//! Configuration system for pairtrace
//!
//! Provides:
//! - Config file discovery (CLI flag, env var, standard paths)
//! - TOML parsing with serde
//! - Environment variable overrides
//! - Pair and marker definitions for the event parser

use crate::events::{EventId, RawEvent};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Complete configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    /// General settings
    pub sensor: SensorSettings,

    /// Correlation cache settings
    pub correlation: CorrelationSettings,

    /// Replay settings
    pub replay: ReplaySettings,

    /// Start/end pairs to time
    pub pairs: Vec<PairDefinition>,

    /// Single events forwarded without correlation
    pub markers: Vec<MarkerDefinition>,
}

/// General settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorSettings {
    /// Log level: trace, debug, info, warn, error
    pub log_level: String,
}

impl Default for SensorSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Correlation cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelationSettings {
    /// How long an unmatched start is kept before eviction (ms)
    pub ttl_ms: u64,

    /// Initial capacity hint for each pair's cache
    pub initial_capacity: usize,
}

impl CorrelationSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

impl Default for CorrelationSettings {
    fn default() -> Self {
        Self {
            ttl_ms: 60_000,
            initial_capacity: 32,
        }
    }
}

/// Replay settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplaySettings {
    /// 1.0 = recorded pace, 0.0 = no delays
    pub speed_multiplier: f64,

    /// Restart from the beginning when the file ends
    pub loop_playback: bool,

    /// Shift recorded timestamps so the first event lands at replay start
    pub rebase_timestamps: bool,
}

impl Default for ReplaySettings {
    fn default() -> Self {
        Self {
            speed_multiplier: 0.0,
            loop_playback: false,
            rebase_timestamps: true,
        }
    }
}

/// How a pair derives its correlation key from an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStrategy {
    /// Match on the emitting OS thread
    #[default]
    Thread,
    /// Single slot; only valid for pairs that never overlap
    Constant,
    /// Match on an unsigned payload field
    Payload(usize),
}

impl KeyStrategy {
    /// Extract the key for `event`
    ///
    /// A missing or non-numeric payload field yields key 0.
    pub fn key_for(&self, event: &RawEvent) -> u64 {
        match self {
            KeyStrategy::Thread => event.os_thread_id,
            KeyStrategy::Constant => 1,
            KeyStrategy::Payload(index) => event.payload_u64(*index).unwrap_or_default(),
        }
    }
}

/// Predicate over one payload field
///
/// Passes when `payload[index] & mask` equals `equals`, or is non-zero when
/// `equals` is unset. A missing field never passes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadFilter {
    pub index: usize,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mask: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub equals: Option<u64>,
}

impl PayloadFilter {
    pub fn matches(&self, event: &RawEvent) -> bool {
        let Some(value) = event.payload_u64(self.index) else {
            return false;
        };
        let masked = value & self.mask.unwrap_or(u64::MAX);
        match self.equals {
            Some(expected) => masked == expected,
            None => masked != 0,
        }
    }
}

/// A start/end event pair to time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairDefinition {
    /// Name used in notifications and stats
    pub name: String,

    pub start_id: EventId,

    pub end_id: EventId,

    #[serde(default)]
    pub key: KeyStrategy,

    /// Suppress completions whose duration is zero or negative
    #[serde(default = "default_true")]
    pub discard_non_positive: bool,

    /// Starts failing this filter never reach the timer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_filter: Option<PayloadFilter>,

    /// Ends failing this filter still consume the pending start but are not published
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_filter: Option<PayloadFilter>,
}

impl PairDefinition {
    pub fn new(name: impl Into<String>, start_id: EventId, end_id: EventId) -> Self {
        Self {
            name: name.into(),
            start_id,
            end_id,
            key: KeyStrategy::default(),
            discard_non_positive: true,
            start_filter: None,
            end_filter: None,
        }
    }

    pub fn with_key(mut self, key: KeyStrategy) -> Self {
        self.key = key;
        self
    }

    pub fn with_start_filter(mut self, filter: PayloadFilter) -> Self {
        self.start_filter = Some(filter);
        self
    }

    pub fn with_end_filter(mut self, filter: PayloadFilter) -> Self {
        self.end_filter = Some(filter);
        self
    }

    pub fn keep_non_positive(mut self) -> Self {
        self.discard_non_positive = false;
        self
    }
}

fn default_true() -> bool {
    true
}

/// A single event forwarded as a marker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerDefinition {
    pub name: String,
    pub event_id: EventId,
}

/// Configuration loader
pub struct ConfigLoader {
    /// Path to config file (if specified via CLI)
    cli_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new config loader
    pub fn new() -> Self {
        Self { cli_path: None }
    }

    /// Set the config path from CLI argument
    pub fn with_cli_path(mut self, path: Option<PathBuf>) -> Self {
        self.cli_path = path;
        self
    }

    /// Load configuration with the following precedence:
    /// 1. CLI --config flag
    /// 2. PAIRTRACE_CONFIG environment variable
    /// 3. ~/.config/pairtrace/config.toml
    /// 4. /etc/pairtrace/config.toml
    /// 5. Default values
    pub fn load(&self) -> ConfigResult<SensorConfig> {
        let config_path = self.find_config_file();

        let mut config = if let Some(path) = config_path {
            info!("Loading configuration from: {}", path.display());
            self.load_from_file(&path)?
        } else {
            debug!("No config file found, using defaults");
            SensorConfig::default()
        };

        self.apply_env_overrides(&mut config);
        self.validate(&config)?;

        Ok(config)
    }

    /// Find the config file to use
    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.cli_path {
            if path.exists() {
                return Some(path.clone());
            }
            warn!("CLI config path does not exist: {}", path.display());
        }

        if let Ok(env_path) = std::env::var("PAIRTRACE_CONFIG") {
            let path = PathBuf::from(&env_path);
            if path.exists() {
                return Some(path);
            }
            warn!("PAIRTRACE_CONFIG path does not exist: {}", env_path);
        }

        if let Some(path) = Self::default_config_path() {
            if path.exists() {
                return Some(path);
            }
        }

        #[cfg(unix)]
        {
            let path = PathBuf::from("/etc/pairtrace/config.toml");
            if path.exists() {
                return Some(path);
            }
        }

        None
    }

    /// Load configuration from a TOML file
    pub fn load_from_file(&self, path: &Path) -> ConfigResult<SensorConfig> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path)?;
        let config: SensorConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&self, config: &mut SensorConfig) {
        if let Ok(val) = std::env::var("PAIRTRACE_LOG_LEVEL") {
            config.sensor.log_level = val;
        }

        if let Ok(val) = std::env::var("PAIRTRACE_TTL_MS") {
            match val.parse() {
                Ok(ttl_ms) => config.correlation.ttl_ms = ttl_ms,
                Err(_) => warn!("Ignoring unparsable PAIRTRACE_TTL_MS: {}", val),
            }
        }

        if let Ok(val) = std::env::var("PAIRTRACE_REPLAY_SPEED") {
            match val.parse() {
                Ok(speed) => config.replay.speed_multiplier = speed,
                Err(_) => warn!("Ignoring unparsable PAIRTRACE_REPLAY_SPEED: {}", val),
            }
        }
    }

    /// Validate configuration
    pub fn validate(&self, config: &SensorConfig) -> ConfigResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&config.sensor.log_level.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log level: {}. Must be one of: {:?}",
                config.sensor.log_level, valid_levels
            )));
        }

        if config.correlation.ttl_ms == 0 {
            return Err(ConfigError::ValidationError(
                "correlation.ttl_ms must be greater than 0".to_string(),
            ));
        }

        let speed = config.replay.speed_multiplier;
        if !speed.is_finite() || speed < 0.0 {
            return Err(ConfigError::ValidationError(format!(
                "Invalid replay speed multiplier: {}",
                speed
            )));
        }

        let mut names = HashSet::new();
        let mut claimed: HashMap<EventId, &str> = HashMap::new();
        for pair in &config.pairs {
            if pair.name.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "Pair name cannot be empty".to_string(),
                ));
            }
            if !names.insert(pair.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate pair name: {}",
                    pair.name
                )));
            }
            if pair.start_id == pair.end_id {
                return Err(ConfigError::ValidationError(format!(
                    "Pair {} uses event {} as both start and end",
                    pair.name, pair.start_id
                )));
            }
            for event_id in [pair.start_id, pair.end_id] {
                if let Some(owner) = claimed.insert(event_id, pair.name.as_str()) {
                    return Err(ConfigError::ValidationError(format!(
                        "Event {} is used by both {} and {}",
                        event_id, owner, pair.name
                    )));
                }
            }
        }

        for marker in &config.markers {
            if marker.name.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "Marker name cannot be empty".to_string(),
                ));
            }
            if let Some(owner) = claimed.insert(marker.event_id, marker.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "Event {} is used by both {} and {}",
                    marker.event_id, owner, marker.name
                )));
            }
        }

        Ok(())
    }

    /// Save configuration to a file
    pub fn save(&self, config: &SensorConfig, path: &Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(config).map_err(|e| {
            ConfigError::ValidationError(format!("Failed to serialize config: {}", e))
        })?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, content)?;
        info!("Configuration saved to: {}", path.display());
        Ok(())
    }

    /// Get the default config file path for the current platform
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("pairtrace").join("config.toml"))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Helper module for platform-specific directories
mod dirs {
    use std::path::PathBuf;

    /// Get the user's config directory
    pub fn config_dir() -> Option<PathBuf> {
        #[cfg(target_os = "macos")]
        {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join(".config"))
        }

        #[cfg(target_os = "linux")]
        {
            std::env::var("XDG_CONFIG_HOME")
                .ok()
                .map(PathBuf::from)
                .or_else(|| {
                    std::env::var("HOME")
                        .ok()
                        .map(|h| PathBuf::from(h).join(".config"))
                })
        }

        #[cfg(target_os = "windows")]
        {
            std::env::var("APPDATA").ok().map(PathBuf::from)
        }

        #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
        {
            None
        }
    }
}
