//! JSON configuration for a simulation run.

use lorasim_emu::Node;
use lorasim_lora::PacketConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur while loading a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("can't read config file: {0}")]
    Io(#[from] std::io::Error),

    /// The file is not valid JSON or has the wrong shape.
    #[error("can't parse config file: {0}")]
    Json(#[from] serde_json::Error),
}

/// A simulation run configuration.
///
/// Every field has a default, so a minimal config only lists its nodes.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Carrier frequency in MHz.
    pub freq: f64,
    /// Log-distance path loss exponent.
    pub gamma: f64,
    /// Reference distance for the log-distance model.
    pub ref_distance: f64,
    /// Display-only maximum range hint in kilometers.
    pub km_range: f64,
    /// LoRa parameters for all transmissions.
    pub packet_config: PacketConfig,
    /// Deliver everything, never collide.
    pub ignore_collisions: bool,
    /// Static offset added to every computed SNR.
    pub snr_offset: i32,
    /// Simulator speedup factor.
    pub time_scaling: u32,
    /// Nodes registered before the simulation starts.
    pub nodes: Vec<Node>,
    /// Optional mobility script wiring.
    pub mobility: Option<MobilityConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            freq: 868.0,
            gamma: 2.0,
            ref_distance: 1.0,
            km_range: 10.0,
            packet_config: PacketConfig::default(),
            ignore_collisions: false,
            snr_offset: 0,
            time_scaling: 1,
            nodes: Vec::new(),
            mobility: None,
        }
    }
}

/// Mobility section of the configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MobilityConfig {
    /// Path to the NS-2 movement script.
    pub file: PathBuf,
    /// Movement sub-steps per simulator second.
    pub tickrate: f64,
    /// Restart the script once it finishes.
    #[serde(rename = "loop")]
    pub looping: bool,
}

impl Default for MobilityConfig {
    fn default() -> Self {
        MobilityConfig {
            file: PathBuf::new(),
            tickrate: 10.0,
            looping: false,
        }
    }
}

/// Load a configuration from a JSON file.
pub fn load(path: &Path) -> Result<Config, ConfigError> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}
