//! End-to-end behavior of a session driven by the manual clock.

use crossbeam_channel::Receiver;
use stagehand_core::{
    BreakpointTarget, ClockMode, ControlState, DebuggerState, EngineConfig, EngineError,
    EventAction, EventRow, HaltReason, MidiBinding, MidiSource, Notification, PerformanceEngine,
    PerformanceEvent, RowTarget, ScoreEvent, SessionHandle, SessionState, SheetCommand, Value,
    WriterKind,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// 100 cycles per second.
const ORC: &str = "sr = 1000\nksmps = 10\ninstr 1\n  kx = p4\n  ky = kx * 2\nendin\ninstr 2\n  kz = 1 / p4\nendin\n";

/// Two cycles per second: half a beat per cycle at 60 BPM.
const SLOW_ORC: &str = "sr = 100\nksmps = 50\ninstr 1\n  kx = p4\nendin\n";

/// 100 cycles per second; the score starts instr 1 at 0, 0.05 and 0.1 s.
const SCORED_ORC: &str = "sr = 1000\nksmps = 10\nnchnls = 2\ninstr 1\n  kn = p4\nendin\ni 1 0 0.01 1\ni 1 0.05 0.01 2\ni 1 0.1 0.01 3\n";

fn manual_engine() -> PerformanceEngine {
    PerformanceEngine::new(EngineConfig::default().with_clock(ClockMode::Manual))
}

fn run(engine: &PerformanceEngine, session: SessionHandle, cycles: u64) {
    engine.advance(session, cycles).unwrap();
    engine.flush(session).unwrap();
}

fn note(instrument: u32, start: f64, duration: f64, p4: f64) -> PerformanceEvent {
    PerformanceEvent::note(
        ScoreEvent::new(instrument, duration)
            .with_start(start)
            .with_pfield(p4),
    )
}

/// Values written to `channel`, in order.
fn channel_writes(rx: &Receiver<Notification>, channel: &str) -> Vec<f64> {
    rx.try_iter()
        .filter_map(|n| match n {
            Notification::ChannelChanged { name, value, .. } if name == channel => {
                value.as_scalar()
            }
            _ => None,
        })
        .collect()
}

/// Record `(cycle, p4)` for every instance on its first pass.
fn record_starts(engine: &PerformanceEngine) -> Arc<Mutex<Vec<(u64, f64)>>> {
    let starts = Arc::new(Mutex::new(Vec::new()));
    let sink = starts.clone();
    engine.on_cycle(move |info| {
        let mut sink = sink.lock().unwrap();
        for activation in info.activations.iter().filter(|a| a.k_count == 1) {
            if let Some(p4) = activation.pfields.get(3).and_then(Value::as_scalar) {
                sink.push((info.cycle, p4));
            }
        }
    });
    starts
}

fn wait_for_state(rx: &Receiver<Notification>, state: SessionState) -> Vec<Notification> {
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut seen = Vec::new();
    while Instant::now() < deadline {
        if let Ok(n) = rx.recv_timeout(Duration::from_millis(50)) {
            let done = n == Notification::SessionStateChanged(state);
            seen.push(n);
            if done {
                return seen;
            }
        }
    }
    panic!("session never reached {:?}; saw {:?}", state, seen);
}

#[test]
fn test_instrument_breakpoint_halts_with_one_frame() {
    let engine = manual_engine();
    let rx = engine.subscribe();
    let session = engine.start(ORC).unwrap();
    let id = engine
        .add_breakpoint(session, BreakpointTarget::Instrument(1), 0)
        .unwrap();
    engine.send_event(session, note(1, 0.0, 1.0, 0.25)).unwrap();
    run(&engine, session, 10);

    assert_eq!(engine.session_state(session), SessionState::Paused);
    let halt = engine.last_halt(session).unwrap().unwrap();
    assert_eq!(halt.cycle, 0);
    assert_eq!(halt.reason, HaltReason::Breakpoint(vec![id]));
    assert_eq!(halt.frames.len(), 1);
    let frame = &halt.frames[0];
    assert_eq!(frame.instrument, 1);
    assert_eq!(frame.k_count, 1);
    assert_eq!(frame.variables.get("ky"), Some(&Value::Scalar(0.5)));

    let hits: Vec<_> = rx
        .try_iter()
        .filter(|n| matches!(n, Notification::BreakpointHit(_)))
        .collect();
    assert_eq!(hits, vec![Notification::BreakpointHit(halt)]);
    engine.stop(session);
}

#[test]
fn test_skip_count_halts_on_following_entry() {
    for skip in 0..4u32 {
        let engine = manual_engine();
        let session = engine.start(ORC).unwrap();
        engine
            .add_breakpoint(session, BreakpointTarget::Instrument(1), skip)
            .unwrap();
        for i in 0..=skip {
            let start = i as f64 * 0.05;
            engine
                .send_event(session, note(1, start, 0.02, i as f64))
                .unwrap();
        }
        run(&engine, session, 1000);

        let halt = engine.last_halt(session).unwrap().unwrap();
        assert_eq!(halt.cycle, 5 * skip as u64, "skip {}", skip);
        assert_eq!(halt.frames.len(), 1);
        assert_eq!(halt.frames[0].pfields.last(), Some(&Value::Scalar(skip as f64)));
        let breakpoints = engine.breakpoints(session).unwrap();
        assert_eq!(breakpoints[0].remaining, skip);
        engine.stop(session);
    }
}

#[test]
fn test_step_advances_exactly_one_cycle() {
    let engine = manual_engine();
    let session = engine.start(ORC).unwrap();
    engine
        .add_breakpoint(session, BreakpointTarget::Instrument(1), 0)
        .unwrap();
    engine.send_event(session, note(1, 0.0, 1.0, 1.0)).unwrap();
    run(&engine, session, 10);
    assert_eq!(engine.last_halt(session).unwrap().unwrap().cycle, 0);

    for expected in 1..4u64 {
        engine.step(session).unwrap();
        engine.flush(session).unwrap();
        let halt = engine.last_halt(session).unwrap().unwrap();
        assert_eq!(halt.cycle, expected);
        assert_eq!(halt.reason, HaltReason::Step);
        assert_eq!(halt.frames.len(), 1);
        assert_eq!(halt.frames[0].k_count, expected + 1);
    }
    assert_eq!(engine.snapshot(session).unwrap().cycle, 4);
    engine.stop(session);
}

#[test]
fn test_resume_runs_until_next_entry() {
    let engine = manual_engine();
    let session = engine.start(ORC).unwrap();
    engine
        .add_breakpoint(session, BreakpointTarget::Instrument(1), 0)
        .unwrap();
    engine.send_event(session, note(1, 0.0, 0.02, 1.0)).unwrap();
    engine.send_event(session, note(1, 0.1, 0.02, 2.0)).unwrap();
    run(&engine, session, 100);
    assert_eq!(engine.last_halt(session).unwrap().unwrap().cycle, 0);

    engine.resume(session).unwrap();
    run(&engine, session, 100);
    assert_eq!(engine.last_halt(session).unwrap().unwrap().cycle, 10);
    engine.stop(session);
}

#[test]
fn test_line_breakpoint_reports_line() {
    let engine = manual_engine();
    let session = engine.start(ORC).unwrap();
    engine
        .add_breakpoint(
            session,
            BreakpointTarget::Line {
                instrument: 1,
                line: 5,
            },
            1,
        )
        .unwrap();
    engine.send_event(session, note(1, 0.0, 1.0, 1.0)).unwrap();
    run(&engine, session, 10);

    let halt = engine.last_halt(session).unwrap().unwrap();
    assert_eq!(halt.cycle, 1);
    assert_eq!(halt.frames[0].line, Some(5));
    engine.stop(session);
}

#[test]
fn test_stop_while_paused() {
    let engine = manual_engine();
    let session = engine.start(ORC).unwrap();
    engine
        .add_breakpoint(session, BreakpointTarget::Instrument(1), 0)
        .unwrap();
    engine.send_event(session, note(1, 0.0, 1.0, 1.0)).unwrap();
    run(&engine, session, 10);
    assert_eq!(engine.session_state(session), SessionState::Paused);

    engine.stop(session);
    assert_eq!(engine.session_state(session), SessionState::Stopped);
    assert_eq!(
        engine.send_event(session, note(1, 0.0, 1.0, 1.0)),
        Err(EngineError::NotRunning)
    );
    assert_eq!(engine.resume(session), Err(EngineError::NotRunning));
}

#[test]
fn test_unknown_instrument_event_rejected() {
    let engine = manual_engine();
    let session = engine.start(ORC).unwrap();
    assert!(matches!(
        engine.send_event(session, note(9, 0.0, 1.0, 1.0)),
        Err(EngineError::InvalidTarget(_))
    ));
    engine.stop(session);
}

#[test]
fn test_channel_type_mismatch_keeps_value() {
    let engine = manual_engine();
    let session = engine.start(ORC).unwrap();
    engine
        .set_channel(session, "mode", Value::from("verse"), WriterKind::Widget)
        .unwrap();
    engine.flush(session).unwrap();

    let err = engine
        .set_channel(session, "mode", Value::Scalar(1.0), WriterKind::Midi)
        .unwrap_err();
    assert!(matches!(err, EngineError::TypeMismatch { .. }));
    let entry = engine.channels(session).unwrap().entry("mode").unwrap();
    assert_eq!(entry.value, Value::from("verse"));
    assert_eq!(entry.last_writer, WriterKind::Widget);
    engine.stop(session);
}

#[test]
fn test_timed_channel_event() {
    let engine = manual_engine();
    let session = engine.start(ORC).unwrap();
    engine
        .send_event(
            session,
            PerformanceEvent::at(
                0.05,
                EventAction::SetChannel {
                    name: "gain".to_string(),
                    value: Value::Scalar(0.8),
                },
            ),
        )
        .unwrap();
    run(&engine, session, 3);
    assert_eq!(engine.get_channel(session, "gain").unwrap(), None);
    run(&engine, session, 5);
    assert_eq!(
        engine.get_channel(session, "gain").unwrap(),
        Some(Value::Scalar(0.8))
    );
    engine.stop(session);
}

#[test]
fn test_loop_region_repeats_rows() {
    let engine = manual_engine();
    let rx = engine.subscribe();
    let session = engine.start(SLOW_ORC).unwrap();
    engine.create_sheet(session, "seq").unwrap();
    for beat in [0.0, 1.0, 2.0] {
        let row = EventRow::new(beat, RowTarget::Channel("step".to_string())).with_payload(beat);
        engine.insert_row(session, "seq", row).unwrap();
    }
    engine.set_loop(session, "seq", 0.0, 2.0, true).unwrap();
    engine.start_sheet(session, "seq").unwrap();
    run(&engine, session, 8);

    let steps: Vec<f64> = rx
        .try_iter()
        .filter_map(|n| match n {
            Notification::ChannelChanged { name, value, .. } if name == "step" => {
                value.as_scalar()
            }
            _ => None,
        })
        .collect();
    assert_eq!(steps, vec![0.0, 1.0, 2.0, 0.0, 1.0, 2.0]);
    engine.stop(session);
}

#[test]
fn test_reversed_loop_rejected() {
    let engine = manual_engine();
    let session = engine.start(SLOW_ORC).unwrap();
    engine.create_sheet(session, "seq").unwrap();
    assert!(matches!(
        engine.set_loop(session, "seq", 4.0, 2.0, true),
        Err(EngineError::InvalidArgument(_))
    ));
    engine.stop(session);
}

#[test]
fn test_evaluate_extends_program() {
    let engine = manual_engine();
    let rx = engine.subscribe();
    let session = engine.start(ORC).unwrap();

    engine.evaluate(session, "instr 3\n  kq = p4\nendin\n").unwrap();
    engine.evaluate(session, "instr 4\n  kq = \nendin\n").unwrap();
    engine.flush(session).unwrap();

    assert!(engine.program(session).unwrap().has_instrument(3));
    assert!(!engine.program(session).unwrap().has_instrument(4));
    assert!(rx.try_iter().any(|n| matches!(
        n,
        Notification::CommandRejected(EngineError::Compile { .. })
    )));
    engine.send_event(session, note(3, 0.0, 1.0, 1.0)).unwrap();
    engine.stop(session);
}

#[test]
fn test_runtime_fault_stops_session() {
    let engine = manual_engine();
    let rx = engine.subscribe();
    let session = engine.start(ORC).unwrap();
    engine.send_event(session, note(2, 0.0, 1.0, 0.0)).unwrap();
    engine.advance(session, 5).unwrap();

    let seen = wait_for_state(&rx, SessionState::Stopped);
    assert!(seen
        .iter()
        .any(|n| matches!(n, Notification::RuntimeFault(f) if f.cycle == 0)));
    assert!(seen.contains(&Notification::SessionStateChanged(SessionState::Failed)));
    assert_eq!(engine.session_state(session), SessionState::Stopped);
    assert_eq!(engine.advance(session, 1), Err(EngineError::NotRunning));

    let next = engine.start(ORC).unwrap();
    assert_ne!(next, session);
    engine.stop(next);
}

#[test]
fn test_midi_binding_writes_channel() {
    let engine = manual_engine();
    let session = engine.start(ORC).unwrap();
    engine.bind_midi(MidiBinding::new(
        MidiSource::Controller(74),
        "cutoff",
        0.0,
        100.0,
    ));
    assert_eq!(engine.midi_input(session, &[0xB0, 74, 127]).unwrap(), 1);
    assert_eq!(engine.midi_input(session, &[0xB0, 10, 127]).unwrap(), 0);
    engine.flush(session).unwrap();

    let entry = engine.channels(session).unwrap().entry("cutoff").unwrap();
    assert_eq!(entry.value, Value::Scalar(100.0));
    assert_eq!(entry.last_writer, WriterKind::Midi);
    engine.stop(session);
}

#[test]
fn test_control_state_carries_between_sessions() {
    let engine = manual_engine();
    let session = engine.start(SLOW_ORC).unwrap();
    let id = engine
        .add_breakpoint(session, BreakpointTarget::Instrument(1), 2)
        .unwrap();
    engine.set_breakpoint_enabled(session, id, false).unwrap();
    engine.create_sheet(session, "seq").unwrap();
    engine
        .insert_row(
            session,
            "seq",
            EventRow::new(0.5, RowTarget::Instrument(1)).with_payload(1.0),
        )
        .unwrap();
    engine.flush(session).unwrap();

    let state = engine.export_state(session).unwrap();
    assert_eq!(state.breakpoints.len(), 1);
    assert_eq!(state.sheets.len(), 1);
    let text = state.to_toml_string().unwrap();
    engine.stop(session);

    let session = engine.start(SLOW_ORC).unwrap();
    engine
        .import_state(session, ControlState::from_toml_str(&text).unwrap())
        .unwrap();
    engine.flush(session).unwrap();
    assert_eq!(engine.export_state(session).unwrap(), state);

    let fresh = engine
        .add_breakpoint(session, BreakpointTarget::Instrument(1), 0)
        .unwrap();
    assert!(fresh > id);
    engine.stop(session);
}

#[test]
fn test_import_rejects_missing_instrument() {
    let engine = manual_engine();
    let session = engine.start(ORC).unwrap();
    engine
        .add_breakpoint(session, BreakpointTarget::Instrument(2), 0)
        .unwrap();
    engine.flush(session).unwrap();
    let state = engine.export_state(session).unwrap();
    engine.stop(session);

    let session = engine.start(SLOW_ORC).unwrap();
    assert!(matches!(
        engine.import_state(session, state),
        Err(EngineError::InvalidTarget(_))
    ));
    engine.flush(session).unwrap();
    assert!(engine.breakpoints(session).unwrap().is_empty());
    engine.stop(session);
}

#[test]
fn test_free_clock_runs_observers() {
    let engine = PerformanceEngine::new(EngineConfig::default().with_clock(ClockMode::Free));
    let cycles = Arc::new(AtomicU64::new(0));
    let counter = cycles.clone();
    engine.on_cycle(move |_| {
        counter.fetch_add(1, Ordering::Relaxed);
    });
    let session = engine.start(ORC).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while cycles.load(Ordering::Relaxed) < 50 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(1));
    }
    engine.stop(session);
    assert!(cycles.load(Ordering::Relaxed) >= 50);
}

#[test]
fn test_conflicting_channel_write_before_flush() {
    let engine = manual_engine();
    let session = engine.start(ORC).unwrap();
    engine
        .set_channel(session, "gain", Value::Scalar(0.5), WriterKind::Widget)
        .unwrap();
    let err = engine
        .set_channel(session, "gain", Value::from("loud"), WriterKind::Midi)
        .unwrap_err();
    assert!(matches!(err, EngineError::TypeMismatch { .. }));

    engine.flush(session).unwrap();
    let entry = engine.channels(session).unwrap().entry("gain").unwrap();
    assert_eq!(entry.value, Value::Scalar(0.5));
    assert_eq!(entry.last_writer, WriterKind::Widget);
    engine.stop(session);
}

#[test]
fn test_loop_with_uneven_cycle_delta() {
    let engine = manual_engine();
    let rx = engine.subscribe();
    let session = engine.start(SLOW_ORC).unwrap();
    engine.create_sheet(session, "seq").unwrap();
    for beat in [0.0, 0.5] {
        let row = EventRow::new(beat, RowTarget::Channel("step".to_string())).with_payload(beat);
        engine.insert_row(session, "seq", row).unwrap();
    }
    // 0.1 beats per cycle.
    engine
        .sheet_command(
            session,
            SheetCommand::SetTempo {
                sheet: "seq".to_string(),
                bpm: 12.0,
            },
        )
        .unwrap();
    engine.set_loop(session, "seq", 0.0, 1.0, true).unwrap();
    engine.start_sheet(session, "seq").unwrap();
    run(&engine, session, 30);

    assert_eq!(
        channel_writes(&rx, "step"),
        vec![0.0, 0.5, 0.0, 0.5, 0.0, 0.5]
    );
    engine.stop(session);
}

#[test]
fn test_loop_wrap_keeps_overshoot_and_rearms() {
    let engine = manual_engine();
    let rx = engine.subscribe();
    let session = engine.start(SLOW_ORC).unwrap();
    engine.create_sheet(session, "seq").unwrap();
    for beat in [2.0, 4.5] {
        let row = EventRow::new(beat, RowTarget::Channel("step".to_string())).with_payload(beat);
        engine.insert_row(session, "seq", row).unwrap();
    }
    // 0.75 beats per cycle.
    engine
        .sheet_command(
            session,
            SheetCommand::SetTempo {
                sheet: "seq".to_string(),
                bpm: 90.0,
            },
        )
        .unwrap();
    engine.set_loop(session, "seq", 2.0, 5.0, true).unwrap();
    engine
        .sheet_command(
            session,
            SheetCommand::Seek {
                sheet: "seq".to_string(),
                position: 4.5,
            },
        )
        .unwrap();
    engine.start_sheet(session, "seq").unwrap();

    run(&engine, session, 1);
    let playhead = engine.sheets(session).unwrap()[0].playhead;
    assert!((playhead - 2.25).abs() < 1e-9, "playhead {}", playhead);

    run(&engine, session, 5);
    assert_eq!(channel_writes(&rx, "step"), vec![4.5, 2.0, 4.5, 2.0]);
    engine.stop(session);
}

#[test]
fn test_events_queued_before_stop_do_not_replay() {
    let engine = manual_engine();
    let session = engine.start(ORC).unwrap();
    engine.send_event(session, note(1, 0.05, 1.0, 1.0)).unwrap();
    engine
        .send_event(
            session,
            PerformanceEvent::at(
                0.05,
                EventAction::SetChannel {
                    name: "gain".to_string(),
                    value: Value::Scalar(0.8),
                },
            ),
        )
        .unwrap();
    engine.stop(session);

    let starts = record_starts(&engine);
    let session = engine.start(ORC).unwrap();
    run(&engine, session, 20);
    assert!(starts.lock().unwrap().is_empty());
    assert_eq!(engine.get_channel(session, "gain").unwrap(), None);
    engine.stop(session);
}

#[test]
fn test_targets_defined_by_unflushed_evaluate() {
    let engine = manual_engine();
    let session = engine.start(ORC).unwrap();
    engine
        .evaluate(session, "instr 7
  ka = p4
endin
f 3 0 2 -2 1 2
")
        .unwrap();
    assert!(engine
        .add_breakpoint(session, BreakpointTarget::Instrument(7), 0)
        .is_ok());
    assert_eq!(engine.table_length(session, 3).unwrap(), 2);
    engine.send_event(session, note(7, 0.0, 1.0, 1.0)).unwrap();
    run(&engine, session, 5);
    assert_eq!(engine.session_state(session), SessionState::Paused);
    engine.stop(session);
}

#[test]
fn test_score_transport() {
    let engine = manual_engine();
    let starts = record_starts(&engine);
    let session = engine.start(SCORED_ORC).unwrap();
    assert_eq!(engine.program(session).unwrap().nchnls, 2);

    run(&engine, session, 12);
    assert_eq!(
        *starts.lock().unwrap(),
        vec![(0, 1.0), (5, 2.0), (10, 3.0)]
    );
    assert!((engine.score_state(session).unwrap().time - 0.12).abs() < 1e-9);

    engine.set_score_pending(session, false).unwrap();
    engine.rewind_score(session).unwrap();
    run(&engine, session, 5);
    assert_eq!(starts.lock().unwrap().len(), 3);
    let score = engine.score_state(session).unwrap();
    assert!(!score.pending);
    assert!(score.time.abs() < 1e-9);

    engine.set_score_pending(session, true).unwrap();
    run(&engine, session, 6);
    assert_eq!(starts.lock().unwrap()[3..], [(17, 1.0), (22, 2.0)]);

    engine.set_score_offset(session, 0.1).unwrap();
    engine.rewind_score(session).unwrap();
    run(&engine, session, 1);
    assert_eq!(starts.lock().unwrap().last(), Some(&(23, 3.0)));
    engine.stop(session);
}

#[test]
fn test_table_access() {
    let engine = manual_engine();
    let session = engine
        .start("sr = 1000\nksmps = 10\ninstr 1\n  kv table p4, 1\nendin\nf 1 0 4 -2 10 20 30\n")
        .unwrap();
    assert_eq!(engine.table_length(session, 1).unwrap(), 4);
    assert_eq!(engine.table_get(session, 1, 2).unwrap(), 30.0);
    assert_eq!(engine.table_get(session, 1, 3).unwrap(), 0.0);

    engine.table_set(session, 1, 3, 7.0).unwrap();
    assert_eq!(engine.table_get(session, 1, 3).unwrap(), 7.0);
    assert!(matches!(
        engine.table_get(session, 9, 0),
        Err(EngineError::InvalidTarget(_))
    ));
    assert!(matches!(
        engine.table_set(session, 1, 4, 1.0),
        Err(EngineError::InvalidArgument(_))
    ));
    engine.stop(session);
}

#[test]
fn test_print_output_is_notified() {
    let engine = manual_engine();
    let rx = engine.subscribe();
    let session = engine
        .start("sr = 1000\nksmps = 10\ninstr 2\n  iamp = p4\n  print iamp\nendin\n")
        .unwrap();
    engine.send_event(session, note(2, 0.0, 0.05, 0.5)).unwrap();
    run(&engine, session, 2);

    let messages: Vec<String> = rx
        .try_iter()
        .filter_map(|n| match n {
            Notification::Message(text) => Some(text),
            _ => None,
        })
        .collect();
    assert_eq!(messages, vec!["instr 2:  iamp = 0.500".to_string()]);
    engine.stop(session);
}

#[test]
fn test_debugger_state_follows_commands() {
    let engine = manual_engine();
    let session = engine.start(ORC).unwrap();
    assert_eq!(engine.debugger_state(session).unwrap(), DebuggerState::Running);
    engine
        .add_breakpoint(session, BreakpointTarget::Instrument(1), 0)
        .unwrap();
    engine.send_event(session, note(1, 0.0, 1.0, 1.0)).unwrap();
    run(&engine, session, 10);
    assert_eq!(engine.debugger_state(session).unwrap(), DebuggerState::Paused);

    engine.step(session).unwrap();
    engine.flush(session).unwrap();
    assert_eq!(engine.debugger_state(session).unwrap(), DebuggerState::Paused);

    engine.resume(session).unwrap();
    engine.flush(session).unwrap();
    assert_eq!(engine.debugger_state(session).unwrap(), DebuggerState::Running);
    engine.stop(session);
}
