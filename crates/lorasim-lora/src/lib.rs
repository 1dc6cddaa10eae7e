//! # lorasim-lora
//!
//! LoRa PHY math for the lorasim emulator.
//!
//! This crate provides:
//! - Packet configuration and airtime calculation ([`PacketConfig`])
//! - Free-space path loss ([`free_space_path_loss`])
//! - Log-distance path loss ([`log_distance`])
//!
//! All airtime results are in milliseconds, all attenuations in dB.

use serde::{Deserialize, Serialize};

// ============================================================================
// Packet Configuration
// ============================================================================

/// A LoRa packet configuration, carrying everything needed to calculate
/// the time a packet stays on air.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PacketConfig {
    /// Payload length in bytes.
    pub payload_len: usize,
    /// Preamble length in symbols.
    pub preamble_len: u32,
    /// Spreading factor (7-12).
    pub spreading_factor: u8,
    /// Bandwidth in kHz.
    pub band_width: f64,
    /// Coding rate (5-8, representing 4/5 to 4/8).
    pub coding_rate: u8,
    /// Whether a CRC is appended to the payload.
    pub crc: bool,
    /// Whether the explicit header is sent.
    pub explicit_header: bool,
    /// Whether the low data rate optimization is active.
    pub low_data_rate_optimization: bool,
}

impl Default for PacketConfig {
    fn default() -> Self {
        PacketConfig {
            payload_len: 1,
            preamble_len: 6,
            spreading_factor: 7,
            band_width: 125.0,
            coding_rate: 5,
            crc: false,
            explicit_header: false,
            low_data_rate_optimization: false,
        }
    }
}

impl PacketConfig {
    /// Check that the payload length fits a single LoRa packet.
    pub fn payload_valid(&self) -> bool {
        self.payload_len >= 1 && self.payload_len < 255
    }

    /// Check that the preamble length is within the modem limits.
    pub fn preamble_valid(&self) -> bool {
        self.preamble_len >= 6 && self.preamble_len <= 655365
    }

    /// Duration of a single symbol in milliseconds.
    pub fn symbol_time(&self) -> f64 {
        2f64.powi(self.spreading_factor as i32) / self.band_width
    }

    /// Symbols per second at this configuration.
    pub fn symbol_rate(&self) -> f64 {
        1000.0 / self.symbol_time()
    }

    /// Number of preamble symbols, including sync word and start frame delimiter.
    pub fn n_preamble(&self) -> f64 {
        self.preamble_len as f64 + 4.25
    }

    /// Number of payload symbols.
    pub fn n_payload(&self) -> f64 {
        let sf = self.spreading_factor as f64;

        let mut payload_bits = 8.0 * self.payload_len as f64 - 4.0 * sf + 28.0;
        if self.crc {
            payload_bits += 16.0;
        }
        if self.explicit_header {
            payload_bits += 20.0;
        }
        payload_bits = payload_bits.max(0.0);

        let bits_per_symbol = if self.low_data_rate_optimization {
            sf - 2.0
        } else {
            sf
        };

        (payload_bits / 4.0 / bits_per_symbol).ceil() * self.coding_rate as f64 + 8.0
    }

    /// Time the preamble alone stays on air, in milliseconds.
    pub fn time_preamble(&self) -> f64 {
        self.n_preamble() * self.symbol_time()
    }

    /// Time the payload alone stays on air, in milliseconds.
    pub fn time_payload(&self) -> f64 {
        self.n_payload() * self.symbol_time()
    }

    /// Total time the packet stays on air, in milliseconds.
    pub fn time_total(&self) -> f64 {
        self.time_preamble() + self.time_payload()
    }

    /// Effective throughput in bits per second.
    pub fn throughput(&self) -> f64 {
        8.0 * self.payload_len as f64 / self.time_total() * 1000.0
    }
}

// ============================================================================
// Path Loss
// ============================================================================

/// Free-space path loss in dB for a given distance and a frequency in MHz.
///
/// <https://en.wikipedia.org/wiki/Free-space_path_loss>
pub fn free_space_path_loss(distance: f64, freq: f64) -> f64 {
    20.0 * distance.log10() + 20.0 * freq.log10() + 32.45
}

/// Log-distance path loss in dB.
///
/// - `distance` is the distance between the nodes
/// - `distance_ref` is the reference distance in the same unit as `distance`
///   (usually 1 km for a large cell and 1 m to 10 m for a microcell)
/// - `gamma` is the path loss exponent (free space = 2, urban area = 2.7-3.5,
///   obstructed in building = 4-6)
/// - `freq` is the signal frequency in MHz
///
/// <https://en.wikipedia.org/wiki/Log-distance_path_loss_model>
pub fn log_distance(distance: f64, distance_ref: f64, gamma: f64, freq: f64) -> f64 {
    free_space_path_loss(distance_ref, freq) + 10.0 * gamma * (distance / distance_ref).log10()
}
