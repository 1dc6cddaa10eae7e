//! # lorasim-emu
//!
//! The LoRa network emulator engine.
//!
//! This crate provides:
//! - The node model ([`Node`])
//! - The emulator: registry, send arbitration, collision resolution,
//!   scheduled delivery, trace writing and time scaling ([`Emulator`])
//! - Event tags and payloads ([`Event`], [`EventData`], [`RxPacket`],
//!   [`LogEntry`])
//! - The tick-driven mobility driver ([`Mobility`])
//!
//! A transmission from one node fans out into one delayed delivery task per
//! reachable receiver. Each task independently decides deliver-or-collide
//! against the receiver's reception windows once the packet's on-air time
//! has elapsed, scaled down by the configured time scaling factor.

mod emulator;
mod event;
mod mobility;
mod node;

pub use emulator::{
    EmuError, Emulator, OnEventFn, OnReceivedFn, COLLISION_DECODEABLE_LEVEL, MAX_PACKET_LEN,
    MAX_TIME_SCALING,
};
pub use event::{Event, EventData, LogEntry, RxPacket};
pub use mobility::Mobility;
pub use node::Node;
