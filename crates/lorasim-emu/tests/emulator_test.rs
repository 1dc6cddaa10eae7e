//! End-to-end transmission scenarios for the emulator engine, run across
//! the supported range of time scaling factors.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use lorasim_emu::{Emulator, Event, EventData, LogEntry, Node};
use lorasim_lora::PacketConfig;
use parking_lot::Mutex;

const TIME_SCALING: &[u32] = &[1, 10, 20, 50, 100];

fn test_emulator(scale: u32) -> Emulator {
    let emu = Emulator::new(868.0, 10.0, 1.0, 10.0, PacketConfig::default());
    emu.set_time_scaling(scale).unwrap();
    emu
}

fn test_node(id: &str, x: f64) -> Node {
    Node::new(id)
        .with_position(x, 1.0, 0.0)
        .with_tx_gain(40.0)
        .with_rx_sens(-200.0)
}

fn payload() -> Vec<u8> {
    "HELLO WORLD".repeat(10).into_bytes()
}

#[derive(Default)]
struct Counters {
    sending: AtomicUsize,
    received: AtomicUsize,
    collisions: AtomicUsize,
    oversize: AtomicUsize,
    send_starts: Mutex<Vec<i64>>,
}

fn count_events(emu: &Emulator) -> Arc<Counters> {
    let counters = Arc::new(Counters::default());
    let seen = Arc::clone(&counters);
    emu.set_on_event(move |event, _, data| {
        if let Some(EventData::Sending { start, .. }) = data {
            seen.send_starts.lock().push(*start);
        }
        let counter = match event {
            Event::NodeSending => &seen.sending,
            Event::NodeReceived => &seen.received,
            Event::NodeCollision => &seen.collisions,
            Event::NodePayloadSizeExceeded => &seen.oversize,
            _ => return,
        };
        counter.fetch_add(1, Ordering::SeqCst);
    });
    counters
}

/// Wait for a fresh simulator millisecond so two back-to-back sends land in
/// the same one and their reception windows share a start time.
fn align_to_ms(emu: &Emulator) {
    let now = emu.sim_time_ms();
    while emu.sim_time_ms() == now {
        std::hint::spin_loop();
    }
}

/// Send from "1" and "3" in the same simulator millisecond.
///
/// The two sends only count as concurrent when their transmission windows
/// open on the same timestamp; when scheduler noise pushes them apart the
/// whole topology is rebuilt and tried again.
fn concurrent_sends(make_emulator: impl Fn() -> Emulator) -> Arc<Counters> {
    for attempt in 0..10 {
        let emu = make_emulator();
        let counters = count_events(&emu);

        align_to_ms(&emu);
        emu.send_message("1", &payload()).unwrap();
        emu.send_message("3", &payload()).unwrap();

        let starts = counters.send_starts.lock().clone();
        emu.wait();

        if starts.len() == 2 && starts[0] == starts[1] {
            return counters;
        }
        assert!(
            attempt < 9,
            "couldn't land two sends in the same simulator millisecond"
        );
    }
    unreachable!()
}

// Two simultaneous transmissions at equal power: nobody decodes anything.
// The senders are busy themselves and the node in the middle sees both
// packets within the decodeable margin.
#[test]
fn test_collision() {
    for &scale in TIME_SCALING {
        let counters = concurrent_sends(|| {
            let emu = test_emulator(scale);
            emu.add_node(test_node("1", 1.0)).unwrap();
            emu.add_node(test_node("2", 1.2)).unwrap();
            emu.add_node(test_node("3", 1.4)).unwrap();
            emu
        });

        assert_eq!(
            counters.collisions.load(Ordering::SeqCst),
            4,
            "collisions not detected at scale {scale}"
        );
        assert_eq!(
            counters.received.load(Ordering::SeqCst),
            0,
            "node received a message it shouldn't at scale {scale}"
        );
    }
}

// Same setup, but one sender is 40 dB stronger. The middle node decodes the
// strong packet despite the overlap; the weak one still collides everywhere.
#[test]
fn test_collision_power_level() {
    for &scale in TIME_SCALING {
        let counters = concurrent_sends(|| {
            let emu = test_emulator(scale);
            emu.add_node(test_node("1", 1.0)).unwrap();
            emu.add_node(test_node("2", 1.2)).unwrap();
            emu.add_node(test_node("3", 1.4).with_tx_gain(80.0)).unwrap();
            emu
        });

        assert_eq!(
            counters.collisions.load(Ordering::SeqCst),
            3,
            "collisions not detected at scale {scale}"
        );
        assert_eq!(
            counters.received.load(Ordering::SeqCst),
            1,
            "strong packet not decoded at scale {scale}"
        );
    }
}

// Two transmissions far enough apart in time never collide.
#[test]
fn test_no_collision() {
    for &scale in TIME_SCALING {
        let emu = test_emulator(scale);
        emu.add_node(test_node("1", 1.0)).unwrap();
        emu.add_node(test_node("2", 1.2)).unwrap();
        emu.add_node(test_node("3", 1.4)).unwrap();

        let collided = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&collided);
        emu.set_on_event(move |event, node, _| {
            if node.id == "2" && event == Event::NodeCollision {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        });

        emu.send_message("1", &payload()).unwrap();
        thread::sleep(Duration::from_millis(1000 / scale as u64));
        emu.send_message("3", &payload()).unwrap();

        emu.wait();

        assert_eq!(
            collided.load(Ordering::SeqCst),
            0,
            "collision detected at scale {scale}"
        );
    }
}

// An oversize payload is reported and nothing goes on air.
#[test]
fn test_payload_size_exceeded() {
    for &scale in TIME_SCALING {
        let emu = test_emulator(scale);
        emu.add_node(test_node("1", 1.0)).unwrap();
        emu.add_node(test_node("2", 1.2)).unwrap();

        let counters = count_events(&emu);

        emu.send_message("1", "HELLO WORLD".repeat(100).as_bytes())
            .unwrap();

        emu.wait();

        assert_eq!(counters.oversize.load(Ordering::SeqCst), 1);
        assert_eq!(counters.sending.load(Ordering::SeqCst), 0);
        assert_eq!(counters.received.load(Ordering::SeqCst), 0);
    }
}

// Rapid-fire sends from one node serialize through the busy-sender queue
// and all arrive.
#[test]
fn test_multiple_sends() {
    for &scale in TIME_SCALING {
        let emu = test_emulator(scale);
        emu.add_node(test_node("1", 1.0)).unwrap();
        emu.add_node(test_node("2", 1.3)).unwrap();

        let received = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&received);
        emu.set_on_event(move |event, node, _| {
            if node.id == "2" && event == Event::NodeReceived {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        });

        for _ in 0..20 {
            emu.send_message("1", &payload()).unwrap();
        }

        emu.wait();

        assert_eq!(
            received.load(Ordering::SeqCst),
            20,
            "didn't get all packets at scale {scale}"
        );
    }
}

// With collision detection off, overlapping transmissions all deliver.
#[test]
fn test_ignore_collisions() {
    let emu = test_emulator(10);
    emu.set_ignore_collisions(true);
    emu.add_node(test_node("1", 1.0)).unwrap();
    emu.add_node(test_node("2", 1.2)).unwrap();
    emu.add_node(test_node("3", 1.4)).unwrap();

    let counters = count_events(&emu);

    emu.send_message("1", &payload()).unwrap();
    emu.send_message("3", &payload()).unwrap();

    emu.wait();

    assert_eq!(counters.collisions.load(Ordering::SeqCst), 0);
    assert_eq!(counters.received.load(Ordering::SeqCst), 4);
}

// A receiver below the sensitivity floor is out of range and never hears
// the packet.
#[test]
fn test_out_of_range() {
    let emu = test_emulator(10);
    emu.add_node(test_node("1", 1.0)).unwrap();
    emu.add_node(test_node("2", 1.2).with_rx_sens(100.0)).unwrap();

    let counters = count_events(&emu);

    emu.send_message("1", &payload()).unwrap();
    emu.wait();

    assert_eq!(counters.sending.load(Ordering::SeqCst), 1);
    assert_eq!(counters.received.load(Ordering::SeqCst), 0);
    assert_eq!(counters.collisions.load(Ordering::SeqCst), 0);
}

// The on_received callback carries the packet with the computed signal
// numbers and the delivered bytes.
#[test]
fn test_on_received_packet() {
    let emu = test_emulator(10);
    emu.set_snr_offset(5);
    emu.add_node(test_node("1", 1.0)).unwrap();
    emu.add_node(test_node("2", 1.2).with_snr(3)).unwrap();

    let packets = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&packets);
    emu.set_on_received(move |node, packet| {
        sink.lock().push((node.id.clone(), packet.clone()));
    });

    emu.send_message("1", &payload()).unwrap();
    emu.wait();

    let packets = packets.lock();
    assert_eq!(packets.len(), 1);
    let (node_id, packet) = &packets[0];
    assert_eq!(node_id, "2");
    assert_eq!(packet.data, payload());
    assert_eq!(packet.snr, packet.rssi + 3 + 5);
    assert!(packet.airtime > 0.0);
}

#[derive(Clone, Default)]
struct TraceBuf(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for TraceBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

// The trace log is one JSON object per line with non-decreasing timestamps.
#[test]
fn test_trace_log() {
    let emu = test_emulator(10);
    let buf = TraceBuf::default();
    emu.set_trace_writer(buf.clone());

    emu.add_node(test_node("1", 1.0)).unwrap();
    emu.add_node(test_node("2", 1.2)).unwrap();
    emu.send_message("1", &payload()).unwrap();
    emu.wait();
    emu.remove_node("2").unwrap();

    let raw = buf.0.lock();
    let text = String::from_utf8(raw.clone()).unwrap();
    let entries: Vec<LogEntry> = text
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();

    let events: Vec<Event> = entries.iter().map(|e| e.event).collect();
    assert_eq!(
        events,
        vec![
            Event::NodeAdded,
            Event::NodeAdded,
            Event::NodeSending,
            Event::NodeReceived,
            Event::NodeRemoved,
        ]
    );

    for pair in entries.windows(2) {
        assert!(pair[0].time <= pair[1].time, "trace times went backwards");
    }
}
