//! Event replay from JSONL files
//!
//! Feeds recorded raw events to a parser, enabling development and testing
//! without a live runtime to trace.

use crate::events::RawEvent;
use crate::plugins::EventParser;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

/// Longest pause inserted between two replayed events
const MAX_DELAY_MS: u64 = 10_000;

/// Configuration for event replay
#[derive(Debug, Clone)]
pub struct ReplayConfig {
    /// Path to the JSONL file containing raw events
    pub input_file: PathBuf,

    /// Speed multiplier for replay timing
    /// - 1.0 = real-time (preserve original timing between events)
    /// - 0.0 = instant (no delays between events)
    /// - 2.0 = 2x speed (half the delay)
    pub speed_multiplier: f64,

    /// Whether to loop playback continuously
    pub loop_playback: bool,

    /// Shift timestamps so the first event of each pass lands at the moment
    /// the pass starts. Recorded timestamps are usually older than the
    /// correlation time-to-live and would otherwise be swept immediately.
    pub rebase_timestamps: bool,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            input_file: PathBuf::new(),
            speed_multiplier: 0.0,
            loop_playback: false,
            rebase_timestamps: true,
        }
    }
}

/// Event replay engine
pub struct EventReplay {
    config: ReplayConfig,
    running: Arc<AtomicBool>,
}

impl EventReplay {
    /// Create a new event replay instance
    pub fn new(config: ReplayConfig) -> Self {
        Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Check if replay is currently running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Stop the replay
    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    /// Get a handle to stop the replay from another task
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    /// Run the replay, handing every event to `parser`
    ///
    /// Returns the number of events replayed.
    pub async fn run(&self, parser: &dyn EventParser) -> anyhow::Result<u64> {
        self.running.store(true, Ordering::Relaxed);

        let mut total_events = 0u64;

        loop {
            let events_this_pass = match self.replay_file(parser).await {
                Ok(count) => count,
                Err(e) => {
                    self.running.store(false, Ordering::Relaxed);
                    return Err(e);
                }
            };
            total_events += events_this_pass;

            if !self.config.loop_playback
                || !self.running.load(Ordering::Relaxed)
                || events_this_pass == 0
            {
                break;
            }

            info!("Looping replay, restarting from beginning...");
        }

        self.running.store(false, Ordering::Relaxed);
        Ok(total_events)
    }

    /// Replay a single pass through the file
    async fn replay_file(&self, parser: &dyn EventParser) -> anyhow::Result<u64> {
        let file = tokio::fs::File::open(&self.config.input_file).await?;
        let mut lines = BufReader::new(file).lines();

        let mut event_count = 0u64;
        let mut last_timestamp: Option<DateTime<Utc>> = None;
        let mut offset: Option<chrono::Duration> = None;
        let mut line_number = 0u64;

        info!(
            "Starting replay from {:?} (speed: {}x, loop: {})",
            self.config.input_file, self.config.speed_multiplier, self.config.loop_playback
        );

        while let Some(line) = lines.next_line().await? {
            line_number += 1;

            if !self.running.load(Ordering::Relaxed) {
                info!("Replay stopped at line {}", line_number);
                break;
            }

            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let mut event: RawEvent = match serde_json::from_str(line) {
                Ok(e) => e,
                Err(err) => {
                    warn!("Failed to parse event at line {}: {}", line_number, err);
                    debug!("Line content: {}", line);
                    continue;
                }
            };

            let recorded_ts = event.ts;
            if let Some(last_ts) = last_timestamp {
                self.pace(recorded_ts - last_ts).await;
            }
            last_timestamp = Some(recorded_ts);

            if self.config.rebase_timestamps {
                let shift = *offset.get_or_insert_with(|| Utc::now() - recorded_ts);
                event.ts = recorded_ts + shift;
            }

            parser.process_event(&event);
            event_count += 1;
        }

        info!(
            "Replay complete: {} events from {:?}",
            event_count, self.config.input_file
        );

        Ok(event_count)
    }

    /// Sleep for the recorded gap scaled by the speed multiplier
    async fn pace(&self, gap: chrono::Duration) {
        if self.config.speed_multiplier <= 0.0 {
            return;
        }

        let gap_ms = gap.num_milliseconds();
        if gap_ms <= 0 {
            return;
        }

        let delay_ms = ((gap_ms as f64 / self.config.speed_multiplier) as u64).min(MAX_DELAY_MS);
        if delay_ms > 0 {
            tokio::time::sleep(tokio::time::Duration::from_millis(delay_ms)).await;
        }
    }
}

/// Read events from a JSONL file without replaying (for validation/testing)
pub async fn read_events_from_file(path: &Path) -> anyhow::Result<Vec<RawEvent>> {
    let file = tokio::fs::File::open(path).await?;
    let mut lines = BufReader::new(file).lines();
    let mut events = Vec::new();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match serde_json::from_str::<RawEvent>(line) {
            Ok(event) => events.push(event),
            Err(err) => warn!("Skipping unparsable event: {}", err),
        }
    }

    Ok(events)
}
