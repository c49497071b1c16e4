//! LIN master exchanges against a scripted slave

mod common;

use cis3_lib::lin::EngineState;
use cis3_lib::serial::SimulatedResponder;
use common::*;
use std::collections::BTreeMap;
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::watch;

fn sensor_pids() -> Vec<PidConfig> {
    vec![PidConfig::new(0x50, "Temperature"), PidConfig::new(0x51, "Humidity")]
}

fn master(transport: MockTransport) -> (LinMaster<MockTransport>, TelemetryStore) {
    let store = TelemetryStore::new();
    let master = LinMaster::new(transport, fast_lin_config(sensor_pids()), store.clone());
    (master, store)
}

#[test]
fn test_valid_frame_is_committed() {
    let transport = MockTransport::new().reply(0x50, vec![vec![SYNC, 0x50, 0x10, 0x00, 0x9F]]);
    let (mut master, store) = master(transport);

    let outcome = master.poll_pid(&PidConfig::new(0x50, "Temperature"));

    assert_eq!(outcome, PidOutcome::Committed(0.16));
    assert_eq!(store.snapshot().sensor("Temperature"), Some(0.16));
    assert_eq!(master.state(), EngineState::Idle);
}

#[test]
fn test_bad_checksum_keeps_previous_value() {
    let transport = MockTransport::new().reply(0x50, vec![vec![SYNC, 0x50, 0x10, 0x00, 0x9E]]);
    let (mut master, store) = master(transport);
    store.set_sensor("Temperature", 21.5);

    let outcome = master.poll_pid(&PidConfig::new(0x50, "Temperature"));

    assert_eq!(
        outcome,
        PidOutcome::ChecksumMismatch {
            expected: 0x9F,
            received: 0x9E
        }
    );
    assert_eq!(store.snapshot().sensor("Temperature"), Some(21.5));
}

#[test]
fn test_garbage_before_preamble_is_skipped() {
    init_tracing();
    for n in 0..16usize {
        let mut wire: Vec<u8> = (0..n).map(|i| (i as u8).wrapping_mul(29) | 0x80).collect();
        wire.extend_from_slice(&Frame::new(0x51, &[0x34, 0x12]).wire_bytes(SYNC));
        let (mut master, store) = master(MockTransport::new().reply(0x51, vec![wire]));

        let outcome = master.poll_pid(&PidConfig::new(0x51, "Humidity"));

        assert!(outcome.is_committed(), "prefix of {n} bytes: {:?}", outcome);
        assert_eq!(store.snapshot().sensor("Humidity"), Some(46.6));
    }
}

#[test]
fn test_response_split_across_reads() {
    let chunks = vec![vec![0x00], vec![SYNC], vec![0x50, 0x10], vec![0x00], vec![0x9F]];
    let (mut master, store) = master(MockTransport::new().reply(0x50, chunks));

    let outcome = master.poll_pid(&PidConfig::new(0x50, "Temperature"));

    assert_eq!(outcome, PidOutcome::Committed(0.16));
    assert_eq!(store.snapshot().sensor("Temperature"), Some(0.16));
}

#[test]
fn test_silent_slave_times_out_and_cycle_continues() {
    init_tracing();
    let transport = MockTransport::new().reply(0x51, vec![Frame::new(0x51, &[0xA8, 0x11]).wire_bytes(SYNC)]);
    let (mut master, store) = master(transport);

    let start = Instant::now();
    let report = master.run_cycle();
    let elapsed = start.elapsed();

    assert_eq!(report.outcome(0x50), Some(&PidOutcome::Timeout));
    assert_eq!(report.outcome(0x51), Some(&PidOutcome::Committed(45.2)));
    assert_eq!(report.committed(), 1);
    assert!(elapsed >= Duration::from_millis(60), "gave up after {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(1), "cycle took {:?}", elapsed);

    let snapshot = store.snapshot();
    assert_eq!(snapshot.sensor("Temperature"), None);
    assert_eq!(snapshot.sensor("Humidity"), Some(45.2));
}

#[test]
fn test_pids_polled_in_table_order() {
    let transport = MockTransport::new();
    let log = transport.log.clone();
    let (mut master, _store) = master(transport);

    let report = master.run_cycle();

    let pids: Vec<u8> = report.outcomes.iter().map(|(pid, _)| *pid).collect();
    assert_eq!(pids, vec![0x50, 0x51]);

    let log = log.lock().unwrap();
    assert_eq!(log.writes, vec![vec![SYNC, 0x50], vec![SYNC, 0x51]]);
    assert_eq!(log.breaks, 2);
    assert_eq!(log.clears, 2);
}

#[test]
fn test_write_failure_abandons_only_that_pid() {
    let transport = MockTransport::new()
        .fail_write(0x50)
        .reply(0x51, vec![Frame::new(0x51, &[0xA8, 0x11]).wire_bytes(SYNC)]);
    let (mut master, store) = master(transport);

    let report = master.run_cycle();

    assert!(matches!(report.outcome(0x50), Some(PidOutcome::Transport(_))));
    assert_eq!(report.outcome(0x51), Some(&PidOutcome::Committed(45.2)));
    assert_eq!(store.snapshot().sensor("Humidity"), Some(45.2));
}

#[test]
fn test_raised_shutdown_skips_every_pid() {
    let (tx, rx) = watch::channel(false);
    let transport = MockTransport::new();
    let log = transport.log.clone();
    let (master, _store) = master(transport);
    let mut master = master.with_shutdown(rx);

    tx.send(true).unwrap();
    let report = master.run_cycle();

    assert!(report.outcomes.iter().all(|(_, o)| *o == PidOutcome::Cancelled));
    assert!(log.lock().unwrap().writes.is_empty());
}

#[test]
fn test_shutdown_interrupts_pending_response() {
    let (tx, rx) = watch::channel(false);
    let store = TelemetryStore::new();
    let config = LinConfig {
        response_timeout_ms: 5_000,
        ..fast_lin_config(sensor_pids())
    };
    let mut master = LinMaster::new(MockTransport::new(), config, store).with_shutdown(rx);

    let trigger = thread::spawn(move || {
        thread::sleep(Duration::from_millis(30));
        tx.send(true).unwrap();
        tx
    });

    let start = Instant::now();
    let report = master.run_cycle();
    let elapsed = start.elapsed();
    let _tx = trigger.join().unwrap();

    assert_eq!(report.outcome(0x50), Some(&PidOutcome::Cancelled));
    assert_eq!(report.outcome(0x51), Some(&PidOutcome::Cancelled));
    assert!(elapsed < Duration::from_secs(1), "shutdown took {:?}", elapsed);
}

#[test]
fn test_simulated_responder_full_cycle() {
    let responder = SimulatedResponder::new(SYNC, BTreeMap::from([(0x50, 2150), (0x51, 4520)]));
    let store = TelemetryStore::new();
    let mut master = LinMaster::new(responder, fast_lin_config(sensor_pids()), store.clone());

    let report = master.run_cycle();
    assert_eq!(report.committed(), 2);

    master.transport_mut().set_value(0x50, 1875);
    master.run_cycle();

    let snapshot = store.snapshot();
    assert_eq!(snapshot.sensor("Temperature"), Some(18.75));
    assert_eq!(snapshot.sensor("Humidity"), Some(45.2));
}

#[test]
fn test_break_precedes_clear_and_header() {
    let transport = MockTransport::new().reply(0x51, vec![Frame::new(0x51, &[0x34, 0x12]).wire_bytes(SYNC)]);
    let log = transport.log.clone();
    let (mut master, _store) = master(transport);

    master.run_cycle();

    let expected = [0x50u8, 0x51]
        .iter()
        .flat_map(|pid| {
            vec![
                WireEvent::BreakOn,
                WireEvent::BreakOff,
                WireEvent::Clear,
                WireEvent::Write(vec![SYNC, *pid]),
            ]
        })
        .collect::<Vec<_>>();
    let log = log.lock().unwrap();
    assert_eq!(log.event_kinds(), expected);

    // Break held for at least the configured 50 us.
    let (on, _) = &log.events[0];
    let (off, _) = &log.events[1];
    assert!(off.duration_since(*on) >= Duration::from_micros(50));
}

#[test]
fn test_pause_follows_every_pid() {
    let transport = MockTransport::new()
        .reply(0x50, vec![Frame::new(0x50, &[0x10, 0x00]).wire_bytes(SYNC)])
        .reply(0x51, vec![Frame::new(0x51, &[0x34, 0x12]).wire_bytes(SYNC)]);
    let log = transport.log.clone();
    let config = LinConfig {
        inter_request_pause_ms: 40,
        ..fast_lin_config(sensor_pids())
    };
    let mut master = LinMaster::new(transport, config, TelemetryStore::new());

    let start = Instant::now();
    let report = master.run_cycle();
    let elapsed = start.elapsed();

    assert_eq!(report.committed(), 2);
    let writes = log.lock().unwrap().write_times();
    assert_eq!(writes.len(), 2);
    let gap = writes[1].duration_since(writes[0]);
    assert!(gap >= Duration::from_millis(40), "PIDs only {:?} apart", gap);
    // The pause also runs after the last PID, even though it answered.
    assert!(elapsed >= Duration::from_millis(80), "cycle took {:?}", elapsed);
}

#[test]
fn test_wide_payload_uses_configured_length() {
    let wide = PidConfig {
        payload_len: 5,
        scale: 10.0,
        ..PidConfig::new(0x52, "Pressure")
    };
    let frame = Frame::new(0x52, &[0x10, 0x27, 0x00, 0x00]);
    let transport = MockTransport::new().reply(0x52, vec![frame.wire_bytes(SYNC)]);
    let store = TelemetryStore::new();
    let mut master = LinMaster::new(transport, fast_lin_config(vec![wide.clone()]), store.clone());

    assert_eq!(master.poll_pid(&wide), PidOutcome::Committed(1000.0));
    assert_eq!(store.snapshot().sensor("Pressure"), Some(1000.0));
}
