//! # lorasim-runner
//!
//! CLI runner for lorasim simulations.
//!
//! Loads a JSON configuration, registers the configured nodes, optionally
//! drives an NS-2 mobility script against them and writes the event trace
//! as JSON-Lines.

mod config;

use clap::{Parser, Subcommand};
use lorasim_emu::{Emulator, Event, Mobility};
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// ============================================================================
// Errors
// ============================================================================

/// Errors that abort a run.
#[derive(Debug, Error)]
enum RunnerError {
    /// Configuration error.
    #[error(transparent)]
    Config(#[from] config::ConfigError),

    /// Emulator error.
    #[error("emulator error: {0}")]
    Emu(#[from] lorasim_emu::EmuError),

    /// Mobility script error.
    #[error("mobility script error: {0}")]
    Mobility(#[from] lorasim_mobility::ParseError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

// ============================================================================
// CLI Configuration
// ============================================================================

/// lorasim - a LoRa network emulator using log-distance path loss,
/// collision detection and NS-2 mobility scripts.
#[derive(Parser, Debug)]
#[command(name = "lorasim")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a simulation from a JSON config file
    Run(RunArgs),
}

/// Configuration for a simulation run.
#[derive(Parser, Debug)]
struct RunArgs {
    /// Path to the simulation config
    config: PathBuf,

    /// Write the JSON-Lines event trace to this file
    #[arg(short, long)]
    trace: Option<PathBuf>,

    /// Stop after this much wall time (e.g. "30s", "2m"); without it the
    /// run lasts until the mobility script finishes
    #[arg(short, long, value_parser = parse_duration)]
    duration: Option<f64>,

    /// Log debug information
    #[arg(short, long)]
    verbose: bool,
}

/// Parse a duration like `90`, `30s`, `5m` or `1h` into seconds.
fn parse_duration(s: &str) -> Result<f64, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }
    if let Ok(secs) = s.parse::<f64>() {
        return Ok(secs);
    }

    let unit_len = s.chars().last().map_or(0, |c| c.len_utf8());
    let (value, unit) = s.split_at(s.len() - unit_len);
    let value: f64 = value
        .parse()
        .map_err(|_| format!("invalid duration {s:?}"))?;
    let multiplier = match unit {
        "s" => 1.0,
        "m" => 60.0,
        "h" => 3600.0,
        _ => return Err(format!("unknown duration unit {unit:?}. Use s, m or h.")),
    };

    Ok(value * multiplier)
}

// ============================================================================
// Event Statistics
// ============================================================================

/// Per-event counters reported at the end of a run.
#[derive(Default)]
struct EventStats {
    updated: AtomicU64,
    sending: AtomicU64,
    received: AtomicU64,
    collisions: AtomicU64,
    oversize: AtomicU64,
}

impl EventStats {
    fn record(&self, event: Event) {
        let counter = match event {
            Event::NodeUpdated => &self.updated,
            Event::NodeSending => &self.sending,
            Event::NodeReceived => &self.received,
            Event::NodeCollision => &self.collisions,
            Event::NodePayloadSizeExceeded => &self.oversize,
            Event::NodeAdded | Event::NodeRemoved => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn report(&self) {
        tracing::info!(
            sending = self.sending.load(Ordering::Relaxed),
            received = self.received.load(Ordering::Relaxed),
            collisions = self.collisions.load(Ordering::Relaxed),
            oversize = self.oversize.load(Ordering::Relaxed),
            node_updates = self.updated.load(Ordering::Relaxed),
            "simulation finished"
        );
    }
}

// ============================================================================
// Entry Point
// ============================================================================

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => {
            if let Err(err) = run(args) {
                eprintln!("error: {err}");
                std::process::exit(1);
            }
        }
    }
}

fn run(args: RunArgs) -> Result<(), RunnerError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if args.verbose { "debug" } else { "info" }));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let config = config::load(&args.config)?;

    let emu = Emulator::new(
        config.freq,
        config.gamma,
        config.ref_distance,
        config.km_range,
        config.packet_config.clone(),
    );
    emu.set_time_scaling(config.time_scaling)?;
    emu.set_snr_offset(config.snr_offset);
    emu.set_ignore_collisions(config.ignore_collisions);

    let stats = Arc::new(EventStats::default());
    let seen = Arc::clone(&stats);
    emu.set_on_event(move |event, _, _| seen.record(event));

    if let Some(path) = &args.trace {
        // Unbuffered: trace lines land on disk as they happen.
        emu.set_trace_writer(File::create(path)?);
        tracing::info!(trace = %path.display(), "writing event trace");
    }

    for node in config.nodes.iter().cloned() {
        let id = node.id.clone();
        emu.add_node(node)?;
        tracing::debug!(node = %id, "registered node");
    }
    tracing::info!(
        nodes = config.nodes.len(),
        freq = config.freq,
        gamma = config.gamma,
        time_scaling = config.time_scaling,
        "simulation ready"
    );

    let mut mobility = match &config.mobility {
        Some(mobility_config) => {
            let file = File::open(&mobility_config.file)?;
            let commands = lorasim_mobility::parse(BufReader::new(file))?;
            tracing::info!(
                commands = commands.len(),
                file = %mobility_config.file.display(),
                "mobility script loaded"
            );

            let mut mobility = Mobility::new(emu.clone(), commands)
                .with_tickrate(mobility_config.tickrate)
                .with_loop(mobility_config.looping);
            mobility.set_time_scaling(config.time_scaling)?;
            mobility.start();
            Some(mobility)
        }
        None => None,
    };

    match (args.duration, mobility.as_mut()) {
        (Some(secs), mobility) => {
            std::thread::sleep(Duration::from_secs_f64(secs));
            if let Some(mobility) = mobility {
                mobility.stop();
                mobility.join();
            }
        }
        (None, Some(mobility)) => mobility.join(),
        (None, None) => {
            tracing::warn!("no mobility script and no duration given, nothing to drive");
        }
    }

    emu.wait();
    stats.report();

    Ok(())
}
