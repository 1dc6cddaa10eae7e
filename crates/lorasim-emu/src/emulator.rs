//! The emulator engine: node registry, channel arbitration and event fan-out.
//!
//! One readers-writer lock protects the registry; a separate mutex keeps
//! trace lines whole. Every transmission spawns one delivery task per
//! reachable receiver plus at most one retry task for a busy sender, and a
//! task tracker lets callers block until the channel is quiet again.

use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;

use lorasim_lora::{log_distance, PacketConfig};

use crate::event::{Event, EventData, LogEntry, RxPacket};
use crate::node::{Node, ReceiveWindow};

/// dB margin a packet needs over an overlapping one to stay decodeable.
/// Below this the receiver cannot separate the signals and both are lost.
pub const COLLISION_DECODEABLE_LEVEL: f64 = 6.0;

/// Maximum length of a single LoRa packet, payload bytes plus preamble symbols.
pub const MAX_PACKET_LEN: usize = 255;

/// Upper bound for the time scaling factor.
pub const MAX_TIME_SCALING: u32 = 1000;

// ============================================================================
// Errors
// ============================================================================

/// Errors produced by the emulator. All leave the engine state untouched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EmuError {
    /// A node id was empty.
    #[error("node id must not be empty")]
    InvalidNode,

    /// A node with the same id is already registered.
    #[error("node {0:?} already exists")]
    AlreadyExists(String),

    /// No node with the given id is registered.
    #[error("node {0:?} not found")]
    NotFound(String),

    /// The sending node is offline.
    #[error("node {0:?} is not online")]
    NotOnline(String),

    /// Time scaling outside of (0, 1000].
    #[error("time scaling {0} out of range (1..={MAX_TIME_SCALING})")]
    ScaleOutOfRange(u32),
}

// ============================================================================
// Callbacks
// ============================================================================

/// Callback invoked for every emitted event.
pub type OnEventFn = Box<dyn Fn(Event, &Node, Option<&EventData>) + Send + Sync>;

/// Callback invoked when a node successfully receives a packet.
pub type OnReceivedFn = Box<dyn Fn(&Node, &RxPacket) + Send + Sync>;

// ============================================================================
// Task Tracking
// ============================================================================

/// Counts in-flight delivery and retry tasks so `wait()` can block until
/// the simulation is quiescent.
#[derive(Default)]
struct TaskTracker {
    pending: Mutex<usize>,
    idle: Condvar,
}

impl TaskTracker {
    fn add(&self) {
        *self.pending.lock() += 1;
    }

    fn done(&self) {
        let mut pending = self.pending.lock();
        *pending -= 1;
        if *pending == 0 {
            self.idle.notify_all();
        }
    }

    fn wait(&self) {
        let mut pending = self.pending.lock();
        while *pending > 0 {
            self.idle.wait(&mut pending);
        }
    }
}

// ============================================================================
// Emulator
// ============================================================================

struct Inner {
    freq: f64,
    gamma: f64,
    ref_distance: f64,
    km_range: f64,
    packet_config: PacketConfig,

    // Simulator clock: unix millisecond at construction plus the scaled
    // monotonic time elapsed since.
    start_ms: i64,
    started: Instant,
    time_scaling: AtomicU32,

    snr_offset: AtomicI32,
    ignore_collisions: AtomicBool,

    nodes: RwLock<HashMap<String, Node>>,
    on_event: RwLock<Option<OnEventFn>>,
    on_received: RwLock<Option<OnReceivedFn>>,
    trace: Mutex<Option<Box<dyn Write + Send>>>,
    tasks: TaskTracker,
}

/// A LoRa network emulator.
///
/// The handle is cheap to clone; all clones share one engine. Spawned
/// delivery tasks hold clones, so dropping the last user handle only after
/// [`Emulator::wait`] returns guarantees a clean shutdown.
#[derive(Clone)]
pub struct Emulator {
    inner: Arc<Inner>,
}

impl Emulator {
    /// Create a new emulator.
    ///
    /// `freq` is the carrier frequency in MHz, `gamma` the log-distance path
    /// loss exponent, `ref_distance` the model's reference distance in the
    /// unit of node coordinates, `km_range` a display-only range hint and
    /// `packet_config` the LoRa parameters applied to every transmission.
    pub fn new(
        freq: f64,
        gamma: f64,
        ref_distance: f64,
        km_range: f64,
        packet_config: PacketConfig,
    ) -> Self {
        let start_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);

        Emulator {
            inner: Arc::new(Inner {
                freq,
                gamma,
                ref_distance,
                km_range,
                packet_config,
                start_ms,
                started: Instant::now(),
                time_scaling: AtomicU32::new(1),
                snr_offset: AtomicI32::new(0),
                ignore_collisions: AtomicBool::new(false),
                nodes: RwLock::new(HashMap::new()),
                on_event: RwLock::new(None),
                on_received: RwLock::new(None),
                trace: Mutex::new(None),
                tasks: TaskTracker::default(),
            }),
        }
    }

    // ------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------

    /// Carrier frequency in MHz.
    pub fn freq(&self) -> f64 {
        self.inner.freq
    }

    /// Log-distance path loss exponent.
    pub fn gamma(&self) -> f64 {
        self.inner.gamma
    }

    /// Reference distance of the path loss model.
    pub fn ref_distance(&self) -> f64 {
        self.inner.ref_distance
    }

    /// Display-only maximum range hint in kilometers.
    pub fn km_range(&self) -> f64 {
        self.inner.km_range
    }

    /// LoRa parameters applied to every transmission.
    pub fn packet_config(&self) -> &PacketConfig {
        &self.inner.packet_config
    }

    /// Unix millisecond at which the emulator was created.
    pub fn start_time(&self) -> i64 {
        self.inner.start_ms
    }

    /// Current time scaling factor.
    pub fn time_scaling(&self) -> u32 {
        self.inner.time_scaling.load(Ordering::Relaxed)
    }

    /// Run the simulator clock `value` times faster than wall time.
    ///
    /// A value of 10 means one wall second covers ten simulator seconds.
    pub fn set_time_scaling(&self, value: u32) -> Result<(), EmuError> {
        if value == 0 || value > MAX_TIME_SCALING {
            return Err(EmuError::ScaleOutOfRange(value));
        }
        self.inner.time_scaling.store(value, Ordering::Relaxed);
        Ok(())
    }

    /// Static offset added to every computed SNR
    /// (`snr = rssi + node.snr + offset`).
    pub fn set_snr_offset(&self, value: i32) {
        self.inner.snr_offset.store(value, Ordering::Relaxed);
    }

    /// Disable collision detection; every delivery then succeeds.
    pub fn set_ignore_collisions(&self, state: bool) {
        self.inner.ignore_collisions.store(state, Ordering::Relaxed);
    }

    /// Install the event callback. It runs synchronously on engine threads
    /// and must not call back into the emulator.
    pub fn set_on_event(&self, f: impl Fn(Event, &Node, Option<&EventData>) + Send + Sync + 'static) {
        *self.inner.on_event.write() = Some(Box::new(f));
    }

    /// Install the receive callback, invoked for every successful delivery.
    /// Same reentrancy rule as [`Emulator::set_on_event`].
    pub fn set_on_received(&self, f: impl Fn(&Node, &RxPacket) + Send + Sync + 'static) {
        *self.inner.on_received.write() = Some(Box::new(f));
    }

    /// Write one JSON trace line per event to `writer`. Write failures are
    /// dropped; the engine stays live.
    pub fn set_trace_writer(&self, writer: impl Write + Send + 'static) {
        *self.inner.trace.lock() = Some(Box::new(writer));
    }

    // ------------------------------------------------------------------
    // Simulator clock
    // ------------------------------------------------------------------

    /// Current scaled simulator time as unix milliseconds.
    pub fn sim_time_ms(&self) -> i64 {
        let elapsed = self.inner.started.elapsed().as_millis() as i64;
        self.inner.start_ms + elapsed * self.time_scaling() as i64
    }

    // ------------------------------------------------------------------
    // Node registry
    // ------------------------------------------------------------------

    /// Ids of all registered nodes, in no particular order.
    pub fn node_ids(&self) -> Vec<String> {
        self.inner.nodes.read().keys().cloned().collect()
    }

    /// Snapshots of all registered nodes, in no particular order.
    pub fn nodes(&self) -> Vec<Node> {
        self.inner.nodes.read().values().cloned().collect()
    }

    /// Whether a node with the given id exists.
    pub fn has_node(&self, id: &str) -> bool {
        self.inner.nodes.read().contains_key(id)
    }

    /// Snapshot of a node by id.
    pub fn get_node(&self, id: &str) -> Option<Node> {
        self.inner.nodes.read().get(id).cloned()
    }

    /// Register a node. Emits [`Event::NodeAdded`].
    pub fn add_node(&self, node: Node) -> Result<(), EmuError> {
        node.validate()?;

        let mut nodes = self.inner.nodes.write();
        if nodes.contains_key(&node.id) {
            return Err(EmuError::AlreadyExists(node.id));
        }

        nodes.insert(node.id.clone(), node.clone());
        self.emit_event(Event::NodeAdded, &node, None);

        Ok(())
    }

    /// Mutate a node through `updater`, which receives a copy of the current
    /// state. The id cannot be changed; any attempt is silently reverted.
    /// Emits [`Event::NodeUpdated`] on commit.
    ///
    /// `updater` runs under the registry lock. Do not call other emulator
    /// operations from inside it.
    pub fn update_node(&self, id: &str, updater: impl FnOnce(&mut Node)) -> Result<(), EmuError> {
        let mut nodes = self.inner.nodes.write();
        let Some(current) = nodes.get(id) else {
            return Err(EmuError::NotFound(id.to_string()));
        };

        let mut updated = current.clone();
        updater(&mut updated);
        updated.id = id.to_string();
        updated.validate()?;

        nodes.insert(id.to_string(), updated.clone());
        self.emit_event(Event::NodeUpdated, &updated, None);

        Ok(())
    }

    /// Delete a node by id. Emits [`Event::NodeRemoved`].
    pub fn remove_node(&self, id: &str) -> Result<(), EmuError> {
        let mut nodes = self.inner.nodes.write();
        let Some(node) = nodes.remove(id) else {
            return Err(EmuError::NotFound(id.to_string()));
        };

        self.emit_event(Event::NodeRemoved, &node, None);

        Ok(())
    }

    /// Remove all nodes without emitting events.
    pub fn clear(&self) {
        self.inner.nodes.write().clear();
    }

    /// Block until all in-flight delivery and retry tasks have resolved.
    pub fn wait(&self) {
        self.inner.tasks.wait();
    }

    // ------------------------------------------------------------------
    // Transmission
    // ------------------------------------------------------------------

    /// Transmit `msg` from the node with the given id.
    ///
    /// Oversize payloads are reported as [`Event::NodePayloadSizeExceeded`]
    /// and the call still succeeds. A sender that is mid-transmission gets
    /// the message re-queued once for when its channel frees up.
    pub fn send_message(&self, id: &str, msg: &[u8]) -> Result<(), EmuError> {
        let mut nodes = self.inner.nodes.write();
        let Some(sender) = nodes.get_mut(id) else {
            return Err(EmuError::NotFound(id.to_string()));
        };
        if !sender.online {
            return Err(EmuError::NotOnline(id.to_string()));
        }

        let mut packet = self.inner.packet_config.clone();
        packet.payload_len = msg.len();

        let preamble_len = self.inner.packet_config.preamble_len as usize;
        if msg.len() + preamble_len >= MAX_PACKET_LEN {
            let sender = sender.clone();
            let data = EventData::Oversize {
                size: msg.len() + preamble_len,
                theoretical_airtime: packet.time_total(),
            };
            self.emit_event(Event::NodePayloadSizeExceeded, &sender, Some(&data));
            return Ok(());
        }

        let scaling = self.time_scaling();
        let airtime = packet.time_total();
        let start = self.sim_time_ms();
        let stop = start + airtime as i64;

        // The sender is still on air; retry once its current send finishes.
        if start <= sender.sending_until {
            let wait_us = (sender.sending_until - start + 1) as f64 * 1000.0 / scaling as f64;
            let emu = self.clone();
            let id = id.to_string();
            let payload = msg.to_vec();

            self.inner.tasks.add();
            thread::spawn(move || {
                thread::sleep(Duration::from_micros(wait_us as u64));
                if let Err(err) = emu.send_message(&id, &payload) {
                    tracing::debug!(node = %id, %err, "re-queued send failed");
                }
                // Deliveries of the retried send are tracked before this
                // drops the count, so wait() cannot wake early.
                emu.inner.tasks.done();
            });

            return Ok(());
        }

        sender.sending_until = stop;
        let sender = sender.clone();

        let data = EventData::Sending {
            start,
            stop,
            airtime,
            x: sender.x,
            y: sender.y,
            z: sender.z,
        };
        self.emit_event(Event::NodeSending, &sender, Some(&data));

        let payload: Arc<Vec<u8>> = Arc::new(msg.to_vec());
        let sleep_us = (airtime * 1000.0 / scaling as f64) as u64;

        for (key, receiver) in nodes.iter_mut() {
            if key == id || !receiver.online {
                continue;
            }

            let distance = sender.distance_to(receiver);
            let reached_gain = sender.tx_gain
                - log_distance(distance, self.inner.ref_distance, self.inner.gamma, self.inner.freq);
            if reached_gain <= receiver.rx_sens {
                continue;
            }

            tracing::debug!(
                from = %id,
                to = %key,
                gain = reached_gain,
                margin = reached_gain - receiver.rx_sens,
                distance_km = distance,
                "transmission reaches receiver"
            );

            let window = ReceiveWindow {
                start,
                stop,
                gain: reached_gain,
            };
            receiver.receiving.push(window);

            let emu = self.clone();
            let receiver_id = key.clone();
            let payload = Arc::clone(&payload);

            self.inner.tasks.add();
            thread::spawn(move || {
                thread::sleep(Duration::from_micros(sleep_us));
                emu.resolve_delivery(&receiver_id, window, reached_gain, &payload, airtime);
                emu.inner.tasks.done();
            });
        }

        Ok(())
    }

    /// Decide deliver-or-collide for one scheduled delivery.
    ///
    /// Runs after the packet's on-air time has elapsed. The receiver state
    /// is snapshotted under the read lock; the decision and the callbacks
    /// happen outside of it.
    fn resolve_delivery(
        &self,
        id: &str,
        window: ReceiveWindow,
        gain: f64,
        payload: &[u8],
        airtime: f64,
    ) {
        let receiver = {
            let nodes = self.inner.nodes.read();
            match nodes.get(id) {
                Some(node) => node.clone(),
                // Receiver disappeared mid-flight; the packet just fades.
                None => return,
            }
        };

        let mut collisions = 0;

        // The receiver was transmitting itself when this window opened.
        if window.start <= receiver.sending_until {
            collisions += 1;
        }

        // Every overlapping window within the decodeable margin blocks this
        // packet. The packet's own window is among them, so a clean channel
        // counts exactly one.
        for other in &receiver.receiving {
            if window.start >= other.start
                && window.start <= other.stop
                && gain - other.gain < COLLISION_DECODEABLE_LEVEL
            {
                collisions += 1;
            }
        }

        let packet = RxPacket {
            rssi: gain as i32,
            snr: gain as i32 + receiver.snr + self.inner.snr_offset.load(Ordering::Relaxed),
            data: payload.to_vec(),
            recv_time: self.sim_time_ms() / 1000,
            airtime,
        };

        if self.inner.ignore_collisions.load(Ordering::Relaxed) || collisions <= 1 {
            if let Some(on_received) = self.inner.on_received.read().as_ref() {
                on_received(&receiver, &packet);
            }
            let data = EventData::Packet(packet);
            self.emit_event(Event::NodeReceived, &receiver, Some(&data));
        } else {
            let data = EventData::Packet(packet);
            self.emit_event(Event::NodeCollision, &receiver, Some(&data));
        }
    }

    // ------------------------------------------------------------------
    // Event emission
    // ------------------------------------------------------------------

    fn emit_event(&self, event: Event, node: &Node, data: Option<&EventData>) {
        if let Some(on_event) = self.inner.on_event.read().as_ref() {
            on_event(event, node, data);
        }

        let mut trace = self.inner.trace.lock();
        if let Some(writer) = trace.as_mut() {
            let entry = LogEntry {
                time: chrono::DateTime::from_timestamp_millis(self.sim_time_ms())
                    .unwrap_or_default(),
                event,
                node_id: node.id.clone(),
                data: data.cloned(),
            };
            if let Ok(line) = serde_json::to_string(&entry) {
                let _ = writeln!(writer, "{line}");
            }
        }
    }
}
