//! pairtrace - start/end event pair correlation
//!
//! Replays recorded runtime events through the pair correlation engine and
//! reports how long each configured operation took.

use anyhow::Context;
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use pairtrace_core::config::{ConfigLoader, SensorConfig};
use pairtrace_core::events::RawEvent;
use pairtrace_core::replay::{EventReplay, ReplayConfig};
use pairtrace_correlate::{by_thread, DurationResult, PairCompleted, PairTimer, PairedEventParser};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "pairtrace")]
#[command(version)]
#[command(about = "Start/end event pair correlation", long_about = None)]
struct Cli {
    /// Increase verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Log format (json, text)
    #[arg(short, long, default_value = "text")]
    format: String,

    /// Path to configuration file
    #[arg(short, long, global = true, env = "PAIRTRACE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay recorded events (JSONL) through the configured pairs
    Replay {
        /// Input file (JSONL)
        #[arg(short, long)]
        input: PathBuf,

        /// Speed multiplier (0 = no delays, 1 = recorded pace)
        #[arg(short, long)]
        speed: Option<f64>,

        /// Restart from the beginning when the file ends
        #[arg(long = "loop")]
        loop_playback: bool,
    },

    /// Hammer one pair timer from several threads
    Demo {
        /// Number of producer threads
        #[arg(long, default_value = "4")]
        threads: u64,

        /// Start/end pairs issued by each thread
        #[arg(long, default_value = "1000")]
        iterations: u64,

        /// Time-to-live of unmatched starts in milliseconds
        #[arg(long, default_value = "60000")]
        ttl_ms: u64,
    },

    /// Print the effective configuration, or save it
    Config {
        /// Write the configuration here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration file
    let sensor_config = load_config(cli.config.clone());

    // Setup logging - CLI verbose flag takes precedence, then config, then default
    let log_level = if cli.verbose > 0 {
        match cli.verbose {
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        }
    } else {
        match sensor_config.sensor.log_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::WARN,
        }
    };

    let builder = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_file(false)
        .with_line_number(false);

    if cli.format == "json" {
        tracing::subscriber::set_global_default(builder.json().finish())?;
    } else {
        tracing::subscriber::set_global_default(builder.finish())?;
    }

    match cli.command {
        Commands::Replay {
            input,
            speed,
            loop_playback,
        } => replay_command(&sensor_config, input, speed, loop_playback).await,
        Commands::Demo {
            threads,
            iterations,
            ttl_ms,
        } => demo_command(threads, iterations, ttl_ms).await,
        Commands::Config { output } => config_command(&sensor_config, output),
    }
}

/// Load configuration from file, falling back to defaults
fn load_config(cli_path: Option<PathBuf>) -> SensorConfig {
    let loader = ConfigLoader::new().with_cli_path(cli_path);
    match loader.load() {
        Ok(config) => {
            info!("Configuration loaded successfully");
            config
        }
        Err(e) => {
            warn!("Failed to load configuration: {}, using defaults", e);
            SensorConfig::default()
        }
    }
}

/// Per-pair completion totals
#[derive(Debug)]
struct PairSummary {
    count: u64,
    total: Duration,
    max: Duration,
}

impl Default for PairSummary {
    fn default() -> Self {
        Self {
            count: 0,
            total: Duration::zero(),
            max: Duration::zero(),
        }
    }
}

impl PairSummary {
    fn record(&mut self, duration: Duration) {
        self.count += 1;
        self.total = self.total + duration;
        if duration > self.max {
            self.max = duration;
        }
    }
}

fn format_duration(duration: Duration) -> String {
    match duration.num_microseconds() {
        Some(us) => format!("{:.3} ms", us as f64 / 1000.0),
        None => format!("{} ms", duration.num_milliseconds()),
    }
}

async fn replay_command(
    config: &SensorConfig,
    input: PathBuf,
    speed: Option<f64>,
    loop_playback: bool,
) -> anyhow::Result<()> {
    if config.pairs.is_empty() && config.markers.is_empty() {
        anyhow::bail!(
            "No pairs or markers configured; add [[pairs]] to the configuration file (see `pairtrace config`)"
        );
    }

    let parser = PairedEventParser::from_config(config).context("Invalid pair configuration")?;

    let summaries: Arc<Mutex<BTreeMap<String, PairSummary>>> = Arc::default();
    {
        let summaries = summaries.clone();
        parser.on_completed().subscribe(move |done: &PairCompleted| {
            info!(
                pair = %done.pair,
                key = done.key,
                duration = %format_duration(done.duration),
                "Pair completed"
            );
            summaries
                .lock()
                .entry(done.pair.to_string())
                .or_default()
                .record(done.duration);
        });
    }
    parser.on_marker().subscribe(|marker| {
        info!(marker = %marker.name, at = %marker.at, "Marker");
    });

    let replay = EventReplay::new(ReplayConfig {
        input_file: input,
        speed_multiplier: speed.unwrap_or(config.replay.speed_multiplier),
        loop_playback: loop_playback || config.replay.loop_playback,
        rebase_timestamps: config.replay.rebase_timestamps,
    });

    let stop = replay.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, stopping replay");
            stop.store(false, Ordering::Relaxed);
        }
    });

    let total = replay.run(&parser).await?;

    println!();
    println!("Replayed {} events", total);
    println!();
    println!("  {:<24} {:>8} {:>14} {:>14}", "pair", "count", "total", "max");
    let totals = summaries.lock();
    for name in parser.pair_names() {
        let summary = totals.get(name);
        println!(
            "  {:<24} {:>8} {:>14} {:>14}",
            name,
            summary.map_or(0, |s| s.count),
            format_duration(summary.map_or_else(Duration::zero, |s| s.total)),
            format_duration(summary.map_or_else(Duration::zero, |s| s.max)),
        );
    }

    println!();
    println!(
        "  {:<24} {:>8} {:>8} {:>10} {:>8} {:>8} {:>8}",
        "pair", "starts", "matched", "unmatched", "ignored", "pending", "evicted"
    );
    for (name, stats) in parser.stats() {
        println!(
            "  {:<24} {:>8} {:>8} {:>10} {:>8} {:>8} {:>8}",
            name,
            stats.starts,
            stats.matched,
            stats.unmatched,
            stats.ignored,
            stats.pending,
            stats.evicted
        );
    }
    println!();

    parser.dispose();
    Ok(())
}

async fn demo_command(threads: u64, iterations: u64, ttl_ms: u64) -> anyhow::Result<()> {
    const START: u32 = 1;
    const END: u32 = 2;

    info!(threads, iterations, ttl_ms, "Starting demo");

    let timer = Arc::new(PairTimer::with_ttl(
        START,
        END,
        std::time::Duration::from_millis(ttl_ms),
        by_thread,
    )?);
    let matched = Arc::new(AtomicU64::new(0));
    let unmatched = Arc::new(AtomicU64::new(0));

    let handles: Vec<_> = (0..threads)
        .map(|thread_id| {
            let timer = timer.clone();
            let matched = matched.clone();
            let unmatched = unmatched.clone();
            tokio::task::spawn_blocking(move || {
                for _ in 0..iterations {
                    let started = Utc::now();
                    timer.try_get_duration(&RawEvent::new(START, started).with_thread(thread_id));
                    std::thread::sleep(std::time::Duration::from_micros(100));
                    let end = RawEvent::now(END).with_thread(thread_id);
                    match timer.try_get_duration(&end) {
                        DurationResult::FinalWithDuration(_) => {
                            matched.fetch_add(1, Ordering::Relaxed);
                        }
                        _ => {
                            unmatched.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.await?;
    }

    let stats = timer.stats();
    println!();
    println!("  Threads:    {}", threads);
    println!("  Iterations: {}", iterations);
    println!("  Matched:    {}", matched.load(Ordering::Relaxed));
    println!("  Unmatched:  {}", unmatched.load(Ordering::Relaxed));
    println!("  Pending:    {}", stats.pending);
    println!("  Evicted:    {}", stats.evicted);
    println!();

    timer.dispose();
    info!("Demo finished");
    Ok(())
}

fn config_command(config: &SensorConfig, output: Option<PathBuf>) -> anyhow::Result<()> {
    match output {
        Some(path) => {
            ConfigLoader::new().save(config, &path)?;
            println!("Configuration written to {}", path.display());
        }
        None => print!("{}", toml::to_string_pretty(config)?),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_summary_tracks_max_and_total() {
        let mut summary = PairSummary::default();
        summary.record(Duration::milliseconds(5));
        summary.record(Duration::milliseconds(20));
        summary.record(Duration::milliseconds(10));

        assert_eq!(summary.count, 3);
        assert_eq!(summary.total, Duration::milliseconds(35));
        assert_eq!(summary.max, Duration::milliseconds(20));
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::microseconds(1500)), "1.500 ms");
        assert_eq!(format_duration(Duration::zero()), "0.000 ms");
    }

    #[test]
    fn test_cli_parses_replay() {
        let cli = Cli::try_parse_from([
            "pairtrace",
            "-vv",
            "replay",
            "--input",
            "events.jsonl",
            "--speed",
            "2",
            "--loop",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Replay {
                input,
                speed,
                loop_playback,
            } => {
                assert_eq!(input, PathBuf::from("events.jsonl"));
                assert_eq!(speed, Some(2.0));
                assert!(loop_playback);
            }
            _ => panic!("expected replay"),
        }
    }
}
