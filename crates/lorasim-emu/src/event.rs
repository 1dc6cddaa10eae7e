//! Event tags, event payloads and the JSON-Lines trace entry shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Everything observable the emulator does is reported as one of these tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Event {
    /// A new node was registered.
    NodeAdded,
    /// A node was deleted.
    NodeRemoved,
    /// An updater was applied to a node.
    NodeUpdated,
    /// A transmission began.
    NodeSending,
    /// A delivery succeeded.
    NodeReceived,
    /// A delivery was dropped due to collision.
    NodeCollision,
    /// An oversize payload was rejected.
    NodePayloadSizeExceeded,
}

/// A received packet with its signal information.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RxPacket {
    /// Received signal strength in dB, truncated to an integer.
    pub rssi: i32,
    /// Signal-to-noise ratio: `rssi + node.snr + global offset`.
    pub snr: i32,
    /// Delivered payload bytes.
    pub data: Vec<u8>,
    /// Unix seconds at scaled simulator time.
    pub recv_time: i64,
    /// Total on-air time of the packet in milliseconds.
    pub airtime: f64,
}

/// Event-specific payload attached to an emitted event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventData {
    /// Attached to [`Event::NodeSending`].
    Sending {
        /// Simulator millisecond the transmission started.
        start: i64,
        /// Simulator millisecond the transmission ends.
        stop: i64,
        /// Total on-air time in milliseconds.
        airtime: f64,
        /// Sender x in kilometers.
        x: f64,
        /// Sender y in kilometers.
        y: f64,
        /// Sender z in kilometers.
        z: f64,
    },
    /// Attached to [`Event::NodeReceived`] and [`Event::NodeCollision`].
    Packet(RxPacket),
    /// Attached to [`Event::NodePayloadSizeExceeded`].
    Oversize {
        /// Payload plus preamble length in bytes/symbols.
        size: usize,
        /// What the airtime would have been, in milliseconds.
        theoretical_airtime: f64,
    },
}

/// One line of the trace log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    /// Scaled simulator time, RFC-3339.
    pub time: DateTime<Utc>,
    /// Event tag.
    pub event: Event,
    /// Node the event concerns.
    pub node_id: String,
    /// Event-specific payload, `null` for registry events.
    pub data: Option<EventData>,
}
