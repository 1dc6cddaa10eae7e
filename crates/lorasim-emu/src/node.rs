//! The node model: a LoRa device with a position, radio parameters and the
//! private channel state the emulator tracks for it.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::EmuError;

/// An in-progress reception window at a node.
///
/// Windows are appended when a transmission reaches the node and are only
/// consulted by start-time overlap, so stale entries are harmless.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct ReceiveWindow {
    /// Simulator millisecond at which the transmission started.
    pub start: i64,
    /// Simulator millisecond at which the transmission ends.
    pub stop: i64,
    /// Signal gain in dB the transmission arrives with.
    pub gain: f64,
}

/// A LoRa device in the emulator.
///
/// Public fields describe the device as configured; positions are in
/// kilometers, gains in dBm. The channel state (`receiving`, `sending_until`)
/// is owned by the emulator and not part of the serialized shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    /// Unique, non-empty identifier.
    pub id: String,
    /// Whether the node takes part in the simulation.
    #[serde(default)]
    pub online: bool,
    /// Position x in kilometers.
    #[serde(default)]
    pub x: f64,
    /// Position y in kilometers.
    #[serde(default)]
    pub y: f64,
    /// Position z in kilometers.
    #[serde(default)]
    pub z: f64,
    /// Transmit gain in dBm.
    #[serde(default)]
    pub tx_gain: f64,
    /// Receive sensitivity in dBm; weaker signals are out of range.
    #[serde(default)]
    pub rx_sens: f64,
    /// Per-node SNR bias added to every received packet.
    #[serde(default)]
    pub snr: i32,
    /// Display icon, passed through to frontends untouched.
    #[serde(default)]
    pub icon: String,
    /// Free-form metadata, passed through untouched.
    #[serde(default)]
    pub meta: HashMap<String, serde_json::Value>,

    /// Reception windows currently tracked for this node.
    #[serde(skip)]
    pub(crate) receiving: Vec<ReceiveWindow>,
    /// Simulator millisecond until which the node transmits; zero when idle.
    #[serde(skip)]
    pub(crate) sending_until: i64,
}

impl Node {
    /// Create an online node with the given id and zeroed radio parameters.
    pub fn new(id: impl Into<String>) -> Self {
        Node {
            id: id.into(),
            online: true,
            ..Node::default()
        }
    }

    /// Set the online flag.
    pub fn with_online(mut self, online: bool) -> Self {
        self.online = online;
        self
    }

    /// Place the node, in kilometers.
    pub fn with_position(mut self, x: f64, y: f64, z: f64) -> Self {
        self.x = x;
        self.y = y;
        self.z = z;
        self
    }

    /// Set the transmit gain in dBm.
    pub fn with_tx_gain(mut self, tx_gain: f64) -> Self {
        self.tx_gain = tx_gain;
        self
    }

    /// Set the receive sensitivity in dBm.
    pub fn with_rx_sens(mut self, rx_sens: f64) -> Self {
        self.rx_sens = rx_sens;
        self
    }

    /// Set the per-node SNR bias.
    pub fn with_snr(mut self, snr: i32) -> Self {
        self.snr = snr;
        self
    }

    /// Set the display icon.
    pub fn with_icon(mut self, icon: impl Into<String>) -> Self {
        self.icon = icon.into();
        self
    }

    /// Euclidean distance to another node in kilometers.
    pub fn distance_to(&self, other: &Node) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }

    pub(crate) fn validate(&self) -> Result<(), EmuError> {
        if self.id.is_empty() {
            return Err(EmuError::InvalidNode);
        }
        Ok(())
    }
}
