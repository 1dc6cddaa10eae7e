//! Tick-driven execution of NS-2 movement commands against the emulator.
//!
//! The driver runs on its own thread. Each run first applies all `set`
//! commands as initial positions, then walks the time-sorted `setdest`
//! queue, interpolating active movements in sub-steps of `1/tickrate`
//! simulator seconds. Script units are meters and meters per second; the
//! node registry works in kilometers, so everything is divided by 1000 on
//! the way in.

use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use lorasim_mobility::{Axis, Command, SetDestCommand};

use crate::{EmuError, Emulator, MAX_TIME_SCALING};

/// Executes a set of parsed mobility commands on an emulator.
pub struct Mobility {
    emu: Emulator,
    commands: Vec<Command>,
    tickrate: f64,
    time_scaling: u32,
    looping: bool,
    pause: Arc<AtomicBool>,
    stop_tx: Option<Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Mobility {
    /// Create a driver bound to `emu` with a tickrate of 10 sub-steps per
    /// simulator second and no looping.
    pub fn new(emu: Emulator, commands: Vec<Command>) -> Self {
        Mobility {
            emu,
            commands,
            tickrate: 10.0,
            time_scaling: 1,
            looping: false,
            pause: Arc::new(AtomicBool::new(false)),
            stop_tx: None,
            handle: None,
        }
    }

    /// Set the movement sub-steps per simulator second.
    pub fn with_tickrate(mut self, tickrate: f64) -> Self {
        self.tickrate = tickrate;
        self
    }

    /// Restart the command script once it finishes.
    pub fn with_loop(mut self, looping: bool) -> Self {
        self.looping = looping;
        self
    }

    /// Run the driver `value` times faster than wall time. Use the same
    /// factor as on the emulator to keep movement and airtime aligned.
    pub fn set_time_scaling(&mut self, value: u32) -> Result<(), EmuError> {
        if value == 0 || value > MAX_TIME_SCALING {
            return Err(EmuError::ScaleOutOfRange(value));
        }
        self.time_scaling = value;
        Ok(())
    }

    /// Suspend or resume movement. The ticker keeps running while paused;
    /// ticks simply do nothing.
    pub fn set_pause(&self, paused: bool) {
        self.pause.store(paused, Ordering::Relaxed);
    }

    /// Whether movement is currently suspended.
    pub fn paused(&self) -> bool {
        self.pause.load(Ordering::Relaxed)
    }

    /// Start the driver thread. Does nothing when already started.
    pub fn start(&mut self) {
        if self.handle.is_some() {
            return;
        }

        let (stop_tx, stop_rx) = mpsc::channel();
        self.stop_tx = Some(stop_tx);

        let worker = Worker {
            emu: self.emu.clone(),
            commands: self.commands.clone(),
            tickrate: self.tickrate,
            time_scaling: self.time_scaling,
            looping: self.looping,
            pause: Arc::clone(&self.pause),
        };

        self.handle = Some(thread::spawn(move || worker.run(stop_rx)));
    }

    /// Request the driver to stop. Call [`Mobility::join`] afterwards to
    /// wait for the thread to exit.
    pub fn stop(&self) {
        if let Some(stop_tx) = &self.stop_tx {
            let _ = stop_tx.send(());
        }
    }

    /// Block until the driver thread has finished.
    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

struct Worker {
    emu: Emulator,
    commands: Vec<Command>,
    tickrate: f64,
    time_scaling: u32,
    looping: bool,
    pause: Arc<AtomicBool>,
}

impl Worker {
    fn run(&self, stop: Receiver<()>) {
        loop {
            let mut dests = self.apply_initial_positions();
            if dests.is_empty() {
                break;
            }
            dests.sort_by(|a, b| a.time.partial_cmp(&b.time).unwrap_or(CmpOrdering::Equal));

            let tick = Duration::from_secs_f64(1.0 / (self.time_scaling as f64 * self.tickrate));
            let mut elapsed = 0.0_f64;
            let mut active: HashMap<String, SetDestCommand> = HashMap::new();

            loop {
                match stop.recv_timeout(tick) {
                    // Stop requested, or every handle to the driver is gone.
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                    Err(RecvTimeoutError::Timeout) => {}
                }

                if self.pause.load(Ordering::Relaxed) {
                    continue;
                }

                elapsed += 1.0 / self.tickrate;

                // Promote due destinations; a later destination replaces an
                // earlier active one for the same node.
                let (due, rest): (Vec<_>, Vec<_>) =
                    dests.into_iter().partition(|d| d.time <= elapsed);
                dests = rest;
                for dest in due {
                    active.insert(dest.node.clone(), dest);
                }

                let mut finished: Vec<String> = Vec::new();
                for (node_id, dest) in &active {
                    if self.advance(node_id, dest) {
                        finished.push(node_id.clone());
                    }
                }
                for node_id in finished {
                    active.remove(&node_id);
                }

                if active.is_empty() && dests.is_empty() {
                    break;
                }
            }

            if !self.looping {
                break;
            }
        }

        tracing::debug!("mobility run finished");
    }

    /// Apply all `set` commands and collect the `setdest` queue, converting
    /// meters to kilometers.
    fn apply_initial_positions(&self) -> Vec<SetDestCommand> {
        let mut dests = Vec::new();

        for command in &self.commands {
            match command {
                Command::Set(set) => {
                    let val = set.val / 1000.0;
                    let axis = set.axis;
                    let result = self.emu.update_node(&set.node, |node| match axis {
                        Axis::X => node.x = val,
                        Axis::Y => node.y = val,
                        Axis::Z => node.z = val,
                    });
                    if let Err(err) = result {
                        tracing::debug!(node = %set.node, %err, "skipping initial position");
                    }
                }
                Command::SetDest(dest) => {
                    let mut dest = dest.clone();
                    dest.x /= 1000.0;
                    dest.y /= 1000.0;
                    dest.speed /= 1000.0;
                    dests.push(dest);
                }
            }
        }

        dests
    }

    /// Move a node one sub-step towards its destination. Returns true when
    /// the destination is reached or has to be dropped.
    fn advance(&self, node_id: &str, dest: &SetDestCommand) -> bool {
        // A speed that can't reach the destination drops it.
        if dest.speed <= 0.0 {
            return true;
        }

        let step = dest.speed / self.tickrate;
        let mut arrived = false;

        let result = self.emu.update_node(node_id, |node| {
            let dx = dest.x - node.x;
            let dy = dest.y - node.y;
            let len = (dx * dx + dy * dy).sqrt();

            if len < step {
                node.x = dest.x;
                node.y = dest.y;
                arrived = true;
            } else {
                node.x += dx / len * step;
                node.y += dy / len * step;
            }
        });

        arrived || result.is_err()
    }
}
