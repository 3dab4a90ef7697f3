//! Performance engine: owns the session and its engine thread.
//!
//! [`PerformanceEngine`] is the command side. Every operation takes the
//! [`SessionHandle`] returned by [`PerformanceEngine::start`], validates
//! what it can synchronously and queues the rest for the engine thread,
//! which applies commands between control cycles.
//!
//! # Example
//!
//! ```no_run
//! use stagehand_core::{EngineConfig, PerformanceEngine, PerformanceEvent, ScoreEvent};
//!
//! let engine = PerformanceEngine::new(EngineConfig::default());
//! let session = engine.start("instr 1\n  kx = p4\nendin\n")?;
//! engine.send_event(session, PerformanceEvent::note(ScoreEvent::new(1, 2.0).with_pfield(0.5)))?;
//! engine.stop(session);
//! # Ok::<(), stagehand_core::EngineError>(())
//! ```

mod hooks;
mod messages;
mod session;
mod thread;

pub use hooks::{CycleContext, CycleHook, CycleObserver, HookOutcome};
pub use messages::{EventAction, PerformanceEvent, ScoreCommand};
pub use session::{SessionHandle, SessionMonitor, SessionSnapshot, SessionState};

use crate::channels::{ChannelBus, WriterKind};
use crate::config::EngineConfig;
use crate::debugger::{
    Breakpoint, BreakpointId, BreakpointTarget, DebugCommand, DebuggerState, HaltReport,
};
use crate::error::{EngineError, Result};
use crate::midi::{MidiBinding, MidiLearnBinder, MidiMessage};
use crate::notify::{Notification, Notifier};
use crate::records::{BreakpointRecord, ControlState};
use crate::runtime::{sim_factory, CycleInfo, ProgramInfo, RuntimeFactory, ScoreState, TableId};
use crate::scheduler::{
    EventRow, LoopRegion, SendMode, SheetCommand, SheetRecord, SheetView, SyncMode,
    TransportCommand, TransportView,
};
use crate::value::Value;
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use messages::Command;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use thread::EngineThread;

/// One started session and the thread driving it.
struct Session {
    handle: SessionHandle,
    command_tx: Sender<Command>,
    monitor: SessionMonitor,
    channels: Arc<ChannelBus>,
    shutdown: Arc<AtomicBool>,
    /// Breakpoint ids known to the command side, for synchronous checks.
    breakpoint_ids: BTreeSet<BreakpointId>,
    thread: Option<JoinHandle<()>>,
}

impl Session {
    fn send(&self, command: Command) -> Result<()> {
        self.command_tx
            .send(command)
            .map_err(|_| EngineError::NotRunning)
    }

    fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("[ENGINE] {} thread panicked", self.handle);
            }
        }
    }
}

/// Live-performance engine.
pub struct PerformanceEngine {
    config: EngineConfig,
    factory: RuntimeFactory,
    notifier: Notifier,
    session: Mutex<Option<Session>>,
    observers: Mutex<Vec<CycleObserver>>,
    midi: Mutex<MidiLearnBinder>,
    next_session: AtomicU64,
    next_breakpoint: AtomicU64,
}

impl PerformanceEngine {
    /// Create an engine driving the built-in simulated runtime.
    pub fn new(config: EngineConfig) -> Self {
        Self::with_runtime(config, sim_factory())
    }

    /// Create an engine with a custom runtime factory.
    pub fn with_runtime(config: EngineConfig, factory: RuntimeFactory) -> Self {
        Self {
            config,
            factory,
            notifier: Notifier::new(),
            session: Mutex::new(None),
            observers: Mutex::new(Vec::new()),
            midi: Mutex::new(MidiLearnBinder::new()),
            next_session: AtomicU64::new(1),
            next_breakpoint: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Subscribe to notifications from every current and future session.
    pub fn subscribe(&self) -> Receiver<Notification> {
        self.notifier.subscribe()
    }

    /// Register a callback run once per control cycle on the engine thread.
    ///
    /// Observers persist across sessions.
    pub fn on_cycle<F>(&self, observer: F)
    where
        F: Fn(&CycleInfo) + Send + Sync + 'static,
    {
        let observer: CycleObserver = Arc::new(observer);
        self.observers
            .lock()
            .expect("Observer lock poisoned")
            .push(observer.clone());
        let slot = self.session.lock().expect("Session lock poisoned");
        if let Some(session) = slot.as_ref() {
            let _ = session.send(Command::AddObserver(observer));
        }
    }

    /// Run `f` against the session identified by `handle` if it is live.
    fn with_session<F, R>(&self, handle: SessionHandle, f: F) -> Result<R>
    where
        F: FnOnce(&mut Session) -> Result<R>,
    {
        let mut slot = self.session.lock().expect("Session lock poisoned");
        match slot.as_mut() {
            Some(session) if session.handle == handle && session.monitor.state().is_live() => {
                f(session)
            }
            _ => Err(EngineError::NotRunning),
        }
    }

    fn send(&self, handle: SessionHandle, command: Command) -> Result<()> {
        self.with_session(handle, |session| session.send(command))
    }

    /// Evaluate `check` against the published program. A miss is checked
    /// once more after the engine thread has applied every queued command,
    /// so targets defined by a pending `evaluate` are found. The wait
    /// happens outside the session lock.
    fn program_satisfies<F>(&self, handle: SessionHandle, check: F) -> Result<bool>
    where
        F: Fn(&ProgramInfo) -> bool,
    {
        let (monitor, command_tx) =
            self.with_session(handle, |s| Ok((s.monitor.clone(), s.command_tx.clone())))?;
        if monitor.with_read(|v| check(&v.program)) {
            return Ok(true);
        }
        let (tx, rx) = bounded(1);
        command_tx
            .send(Command::Sync(tx))
            .map_err(|_| EngineError::NotRunning)?;
        rx.recv().map_err(|_| EngineError::NotRunning)?;
        Ok(monitor.with_read(|v| check(&v.program)))
    }

    // ---- lifecycle ----

    /// Compile `code` and start a session.
    pub fn start(&self, code: &str) -> Result<SessionHandle> {
        let mut slot = self.session.lock().expect("Session lock poisoned");
        if let Some(session) = slot.as_mut() {
            if session.monitor.state().is_live() {
                return Err(EngineError::AlreadyRunning);
            }
            session.join();
        }
        *slot = None;

        let handle = SessionHandle::new(self.next_session.fetch_add(1, Ordering::Relaxed));
        let monitor = SessionMonitor::new();
        monitor.transition(SessionState::Starting, &self.notifier);

        let mut runtime = (self.factory)(&self.config);
        let program = match runtime.compile(code).and_then(|program| {
            runtime.start()?;
            Ok(program)
        }) {
            Ok(program) => program,
            Err(e) => {
                log::warn!("[ENGINE] {} failed to start: {}", handle, e);
                monitor.transition(SessionState::Stopped, &self.notifier);
                return Err(e);
            }
        };

        let channels = Arc::new(ChannelBus::with_notifier(self.notifier.clone()));
        let (command_tx, command_rx) = unbounded();
        let shutdown = Arc::new(AtomicBool::new(false));
        let score = runtime.score_state();
        monitor.with_write(|s| {
            s.program = program.clone();
            s.score = score;
        });
        monitor.transition(SessionState::Running, &self.notifier);

        let observers = self.observers.lock().expect("Observer lock poisoned").clone();
        let engine_thread = EngineThread::new(
            &self.config,
            runtime,
            channels.clone(),
            self.notifier.clone(),
            monitor.clone(),
            command_rx,
            shutdown.clone(),
            observers,
        );
        let thread = std::thread::Builder::new()
            .name(format!("stagehand-session-{}", handle.id()))
            .spawn(move || engine_thread.run())
            .map_err(|e| {
                monitor.transition(SessionState::Stopped, &self.notifier);
                EngineError::StartupFailure(format!("cannot spawn engine thread: {}", e))
            })?;

        log::info!(
            "[ENGINE] {} running: {} instrument(s), {} Hz, ksmps {}",
            handle,
            program.instruments.len(),
            program.sample_rate,
            program.ksmps
        );
        *slot = Some(Session {
            handle,
            command_tx,
            monitor,
            channels,
            shutdown,
            breakpoint_ids: BTreeSet::new(),
            thread: Some(thread),
        });
        Ok(handle)
    }

    /// Stop a session. Stopping a stopped or unknown session is a no-op.
    ///
    /// Honored even while paused at a breakpoint; queued events and
    /// commands of the session are discarded.
    pub fn stop(&self, handle: SessionHandle) {
        let session = {
            let mut slot = self.session.lock().expect("Session lock poisoned");
            match slot.as_ref() {
                Some(session) if session.handle == handle => slot.take(),
                _ => None,
            }
        };
        let Some(mut session) = session else {
            log::debug!("[ENGINE] stop: {} is not active", handle);
            return;
        };

        if session.monitor.state().is_live() {
            session.monitor.transition(SessionState::Stopping, &self.notifier);
            session.shutdown.store(true, Ordering::Relaxed);
            let _ = session.send(Command::Stop);
            session.join();
            session.monitor.transition(SessionState::Stopped, &self.notifier);
            log::info!("[ENGINE] {} stopped", handle);
        } else {
            session.join();
        }
    }

    /// Lifecycle state of `handle`; unknown handles are `Stopped`.
    pub fn session_state(&self, handle: SessionHandle) -> SessionState {
        let slot = self.session.lock().expect("Session lock poisoned");
        match slot.as_ref() {
            Some(session) if session.handle == handle => session.monitor.state(),
            _ => SessionState::Stopped,
        }
    }

    /// The handle of the current live session, if any.
    pub fn current_session(&self) -> Option<SessionHandle> {
        let slot = self.session.lock().expect("Session lock poisoned");
        slot.as_ref()
            .filter(|s| s.monitor.state().is_live())
            .map(|s| s.handle)
    }

    /// Full published view of a live session.
    pub fn snapshot(&self, handle: SessionHandle) -> Result<SessionSnapshot> {
        self.with_session(handle, |s| Ok(s.monitor.snapshot()))
    }

    /// Instruments and executable lines currently defined.
    pub fn program(&self, handle: SessionHandle) -> Result<ProgramInfo> {
        self.with_session(handle, |s| Ok(s.monitor.with_read(|v| v.program.clone())))
    }

    /// Compile a fragment into the running program at the next cycle
    /// boundary. Compile errors arrive as `CommandRejected`.
    pub fn evaluate(&self, handle: SessionHandle, code: &str) -> Result<()> {
        self.send(handle, Command::Evaluate(code.to_string()))
    }

    /// Queue an event for the next cycle at or after its intended time.
    ///
    /// Notes for undefined instruments fail with `InvalidTarget`, counting
    /// instruments from fragments that are still queued. A channel write
    /// claims the channel's type now.
    pub fn send_event(&self, handle: SessionHandle, event: PerformanceEvent) -> Result<()> {
        if let EventAction::Note(note) = &event.action {
            if !self.program_satisfies(handle, |p| p.has_instrument(note.instrument))? {
                return Err(EngineError::InvalidTarget(format!(
                    "instr {} is not defined",
                    note.instrument
                )));
            }
        }
        self.with_session(handle, |session| {
            if let EventAction::SetChannel { name, value } = &event.action {
                session.channels.claim(name, value)?;
            }
            session.send(Command::SendEvent(event))
        })
    }

    /// Allow `cycles` more control cycles under the manual clock.
    pub fn advance(&self, handle: SessionHandle, cycles: u64) -> Result<()> {
        self.send(handle, Command::Advance(cycles))
    }

    /// Block until every command queued so far has been applied and the
    /// engine is idle (manual budget spent, or paused).
    pub fn flush(&self, handle: SessionHandle) -> Result<()> {
        let (tx, rx) = bounded(1);
        self.send(handle, Command::Barrier(tx))?;
        // A session that ends while flushing has nothing left to apply.
        let _ = rx.recv();
        Ok(())
    }

    // ---- channels ----

    /// The channel bus of a live session.
    pub fn channels(&self, handle: SessionHandle) -> Result<Arc<ChannelBus>> {
        self.with_session(handle, |s| Ok(s.channels.clone()))
    }

    /// Read a channel of a live session.
    pub fn get_channel(&self, handle: SessionHandle, name: &str) -> Result<Option<Value>> {
        self.with_session(handle, |s| Ok(s.channels.get(name)))
    }

    /// Type-check a channel write now and apply it at the next cycle boundary.
    ///
    /// The first write to a channel fixes its type as soon as it is queued,
    /// so a second write of another type fails with `TypeMismatch` even
    /// before the first has landed.
    pub fn set_channel(
        &self,
        handle: SessionHandle,
        name: &str,
        value: Value,
        writer: WriterKind,
    ) -> Result<()> {
        self.with_session(handle, |session| {
            session.channels.claim(name, &value)?;
            session.send(Command::WriteChannel {
                name: name.to_string(),
                value,
                writer,
            })
        })
    }

    // ---- MIDI ----

    /// Route raw MIDI bytes through the bindings into queued channel
    /// writes. Returns the number of writes queued.
    pub fn midi_input(&self, handle: SessionHandle, bytes: &[u8]) -> Result<usize> {
        let Some(message) = MidiMessage::from_bytes(bytes) else {
            return Err(EngineError::InvalidArgument(format!(
                "unrecognized MIDI message {:02X?}",
                bytes
            )));
        };
        self.with_session(handle, |_| Ok(()))?;

        let writes = self.midi.lock().expect("MIDI lock poisoned").handle(&message);
        let mut queued = 0;
        for (name, value) in writes {
            match self.set_channel(handle, &name, Value::Scalar(value), WriterKind::Midi) {
                Ok(()) => queued += 1,
                Err(e) => log::warn!("[MIDI] write to '{}' rejected: {}", name, e),
            }
        }
        Ok(queued)
    }

    pub fn bind_midi(&self, binding: MidiBinding) {
        self.midi.lock().expect("MIDI lock poisoned").bind(binding);
    }

    /// Bind the next controller received to `target`.
    pub fn learn_midi(&self, target: &str, min: f64, max: f64) {
        self.midi
            .lock()
            .expect("MIDI lock poisoned")
            .learn(target, min, max);
    }

    pub fn cancel_midi_learn(&self) {
        self.midi.lock().expect("MIDI lock poisoned").cancel_learn();
    }

    /// Remove the bindings of `target`; returns how many were removed.
    pub fn unbind_midi(&self, target: &str) -> usize {
        self.midi.lock().expect("MIDI lock poisoned").unbind(target)
    }

    pub fn midi_bindings(&self) -> Vec<MidiBinding> {
        self.midi
            .lock()
            .expect("MIDI lock poisoned")
            .bindings()
            .to_vec()
    }

    // ---- debugger ----

    fn check_target(&self, handle: SessionHandle, target: &BreakpointTarget) -> Result<()> {
        let valid = self.program_satisfies(handle, |program| match target {
            BreakpointTarget::Instrument(id) => program.has_instrument(*id),
            BreakpointTarget::Line { instrument, line } => program.has_line(*instrument, *line),
        })?;
        if valid {
            Ok(())
        } else {
            Err(EngineError::InvalidTarget(target.to_string()))
        }
    }

    fn check_breakpoint(session: &Session, id: BreakpointId) -> Result<()> {
        if session.breakpoint_ids.contains(&id) {
            Ok(())
        } else {
            Err(EngineError::InvalidTarget(format!("breakpoint {}", id)))
        }
    }

    /// Register a breakpoint. Fails with `InvalidTarget` if the instrument
    /// (or line) does not exist in the session.
    pub fn add_breakpoint(
        &self,
        handle: SessionHandle,
        target: BreakpointTarget,
        skip_count: u32,
    ) -> Result<BreakpointId> {
        self.check_target(handle, &target)?;
        self.with_session(handle, |session| {
            let id = self.next_breakpoint.fetch_add(1, Ordering::Relaxed);
            let breakpoint = Breakpoint::new(id, target).with_skip_count(skip_count);
            session.send(Command::Debug(DebugCommand::Add(breakpoint)))?;
            session.breakpoint_ids.insert(id);
            Ok(id)
        })
    }

    pub fn remove_breakpoint(&self, handle: SessionHandle, id: BreakpointId) -> Result<()> {
        self.with_session(handle, |session| {
            Self::check_breakpoint(session, id)?;
            session.send(Command::Debug(DebugCommand::Remove(id)))?;
            session.breakpoint_ids.remove(&id);
            Ok(())
        })
    }

    pub fn set_breakpoint_enabled(
        &self,
        handle: SessionHandle,
        id: BreakpointId,
        enabled: bool,
    ) -> Result<()> {
        self.with_session(handle, |session| {
            Self::check_breakpoint(session, id)?;
            session.send(Command::Debug(DebugCommand::SetEnabled { id, enabled }))
        })
    }

    pub fn set_skip_count(
        &self,
        handle: SessionHandle,
        id: BreakpointId,
        skip_count: u32,
    ) -> Result<()> {
        self.with_session(handle, |session| {
            Self::check_breakpoint(session, id)?;
            session.send(Command::Debug(DebugCommand::SetSkipCount { id, skip_count }))
        })
    }

    pub fn clear_breakpoints(&self, handle: SessionHandle) -> Result<()> {
        self.with_session(handle, |session| {
            session.send(Command::Debug(DebugCommand::Clear))?;
            session.breakpoint_ids.clear();
            Ok(())
        })
    }

    /// Breakpoints as last published by the engine thread.
    pub fn breakpoints(&self, handle: SessionHandle) -> Result<Vec<Breakpoint>> {
        self.with_session(handle, |s| Ok(s.monitor.with_read(|v| v.breakpoints.clone())))
    }

    /// Run/pause/step state as last published by the engine thread.
    pub fn debugger_state(&self, handle: SessionHandle) -> Result<DebuggerState> {
        self.with_session(handle, |s| Ok(s.monitor.with_read(|v| v.debugger)))
    }

    /// The most recent halt of the session.
    pub fn last_halt(&self, handle: SessionHandle) -> Result<Option<HaltReport>> {
        self.with_session(handle, |s| Ok(s.monitor.with_read(|v| v.last_halt.clone())))
    }

    /// Suspend cycle advancement at the next cycle boundary.
    pub fn pause(&self, handle: SessionHandle) -> Result<()> {
        self.send(handle, Command::Debug(DebugCommand::Pause))
    }

    /// Leave a halt and run freely.
    pub fn resume(&self, handle: SessionHandle) -> Result<()> {
        self.send(handle, Command::Debug(DebugCommand::Continue))
    }

    /// Advance exactly one control cycle, then halt again.
    pub fn step(&self, handle: SessionHandle) -> Result<()> {
        self.send(handle, Command::Debug(DebugCommand::Step))
    }

    // ---- event sheets ----

    /// Queue a sheet edit. Reversed loop regions are rejected here with
    /// `InvalidArgument`; unknown sheets are reported as `CommandRejected`
    /// when the edit is applied.
    pub fn sheet_command(&self, handle: SessionHandle, command: SheetCommand) -> Result<()> {
        match &command {
            SheetCommand::SetLoop { start, end, .. } => {
                LoopRegion::new(*start, *end)?;
            }
            SheetCommand::Create(record) => {
                LoopRegion::new(record.loop_region.start, record.loop_region.end)?;
            }
            _ => {}
        }
        self.send(handle, Command::Sheet(command))
    }

    /// Create (or replace) an empty sheet at the configured default tempo.
    pub fn create_sheet(&self, handle: SessionHandle, name: &str) -> Result<()> {
        self.sheet_command(
            handle,
            SheetCommand::Create(SheetRecord {
                name: name.to_string(),
                rows: Vec::new(),
                tempo: self.config.default_tempo,
                loop_region: LoopRegion::default(),
                sync: SyncMode::Free,
            }),
        )
    }

    pub fn insert_row(&self, handle: SessionHandle, sheet: &str, row: EventRow) -> Result<()> {
        self.sheet_command(
            handle,
            SheetCommand::InsertRow {
                sheet: sheet.to_string(),
                index: None,
                row,
            },
        )
    }

    pub fn set_loop(
        &self,
        handle: SessionHandle,
        sheet: &str,
        start: f64,
        end: f64,
        enabled: bool,
    ) -> Result<()> {
        self.sheet_command(
            handle,
            SheetCommand::SetLoop {
                sheet: sheet.to_string(),
                start,
                end,
            },
        )?;
        self.sheet_command(
            handle,
            SheetCommand::EnableLoop {
                sheet: sheet.to_string(),
                enabled,
            },
        )
    }

    pub fn start_sheet(&self, handle: SessionHandle, sheet: &str) -> Result<()> {
        self.sheet_command(
            handle,
            SheetCommand::Start {
                sheet: sheet.to_string(),
            },
        )
    }

    pub fn stop_sheet(&self, handle: SessionHandle, sheet: &str) -> Result<()> {
        self.sheet_command(
            handle,
            SheetCommand::Stop {
                sheet: sheet.to_string(),
            },
        )
    }

    /// Dispatch a whole sheet once without moving its playhead.
    pub fn send_sheet(&self, handle: SessionHandle, sheet: &str, mode: SendMode) -> Result<()> {
        self.sheet_command(
            handle,
            SheetCommand::Send {
                sheet: sheet.to_string(),
                mode,
            },
        )
    }

    pub fn transport(&self, handle: SessionHandle, command: TransportCommand) -> Result<()> {
        self.sheet_command(handle, SheetCommand::Transport(command))
    }

    /// Jump the shared transport; backward jumps re-arm synced sheets.
    pub fn seek_transport(&self, handle: SessionHandle, beat: f64) -> Result<()> {
        self.transport(handle, TransportCommand::Seek(beat))
    }

    pub fn sheets(&self, handle: SessionHandle) -> Result<Vec<SheetView>> {
        self.with_session(handle, |s| Ok(s.monitor.with_read(|v| v.sheets.clone())))
    }

    pub fn transport_state(&self, handle: SessionHandle) -> Result<TransportView> {
        self.with_session(handle, |s| Ok(s.monitor.with_read(|v| v.transport)))
    }

    // ---- score and tables ----

    pub fn score_command(&self, handle: SessionHandle, command: ScoreCommand) -> Result<()> {
        if let ScoreCommand::SetOffset(seconds) = command {
            if !(seconds.is_finite() && seconds >= 0.0) {
                return Err(EngineError::InvalidArgument(format!(
                    "score offset {} must be a non-negative number of seconds",
                    seconds
                )));
            }
        }
        self.send(handle, Command::Score(command))
    }

    /// Restart the compiled score at its offset.
    pub fn rewind_score(&self, handle: SessionHandle) -> Result<()> {
        self.score_command(handle, ScoreCommand::Rewind)
    }

    /// Start the score at `seconds` (now and on every rewind).
    pub fn set_score_offset(&self, handle: SessionHandle, seconds: f64) -> Result<()> {
        self.score_command(handle, ScoreCommand::SetOffset(seconds))
    }

    /// Hold or resume score playback. Sent events keep running.
    pub fn set_score_pending(&self, handle: SessionHandle, pending: bool) -> Result<()> {
        self.score_command(handle, ScoreCommand::SetPending(pending))
    }

    pub fn score_state(&self, handle: SessionHandle) -> Result<ScoreState> {
        self.with_session(handle, |s| Ok(s.monitor.with_read(|v| v.score)))
    }

    /// Length of a function table; unknown tables are `InvalidTarget`.
    pub fn table_length(&self, handle: SessionHandle, table: TableId) -> Result<usize> {
        if !self.program_satisfies(handle, |p| p.table_len(table).is_some())? {
            return Err(EngineError::InvalidTarget(format!("table {}", table)));
        }
        self.with_session(handle, |s| {
            s.monitor
                .with_read(|v| v.program.table_len(table))
                .ok_or_else(|| EngineError::InvalidTarget(format!("table {}", table)))
        })
    }

    /// Read a table value. Waits for the engine thread to reach the next
    /// cycle boundary.
    pub fn table_get(&self, handle: SessionHandle, table: TableId, index: usize) -> Result<f64> {
        let (tx, rx) = bounded(1);
        self.send(
            handle,
            Command::TableGet {
                table,
                index,
                reply: tx,
            },
        )?;
        rx.recv().map_err(|_| EngineError::NotRunning)?
    }

    /// Write a table value at the next cycle boundary.
    pub fn table_set(
        &self,
        handle: SessionHandle,
        table: TableId,
        index: usize,
        value: f64,
    ) -> Result<()> {
        let len = self.table_length(handle, table)?;
        if index >= len {
            return Err(EngineError::InvalidArgument(format!(
                "index {} is past the end of table {} ({} values)",
                index, table, len
            )));
        }
        self.send(
            handle,
            Command::TableSet {
                table,
                index,
                value,
            },
        )
    }

    // ---- persisted state ----

    /// Breakpoints, sheets and MIDI bindings as plain records.
    pub fn export_state(&self, handle: SessionHandle) -> Result<ControlState> {
        let (breakpoints, sheets): (Vec<BreakpointRecord>, Vec<SheetRecord>) =
            self.with_session(handle, |s| {
                Ok(s.monitor.with_read(|v| {
                    (
                        v.breakpoints.iter().map(BreakpointRecord::from).collect(),
                        v.sheets.iter().map(|sheet| sheet.record.clone()).collect(),
                    )
                }))
            })?;
        Ok(ControlState {
            breakpoints,
            sheets,
            midi_bindings: self.midi_bindings(),
        })
    }

    /// Replace breakpoints and MIDI bindings and create the given sheets.
    ///
    /// Every breakpoint target and loop region is validated before anything
    /// is queued, so a rejected import leaves the session untouched.
    pub fn import_state(&self, handle: SessionHandle, state: ControlState) -> Result<()> {
        for record in &state.breakpoints {
            record.validate()?;
            self.check_target(handle, &record.target)?;
        }
        for sheet in &state.sheets {
            LoopRegion::new(sheet.loop_region.start, sheet.loop_region.end)?;
        }
        self.with_session(handle, |session| {
            session.send(Command::Debug(DebugCommand::Clear))?;
            session.breakpoint_ids.clear();
            for record in state.breakpoints {
                self.next_breakpoint.fetch_max(record.id + 1, Ordering::Relaxed);
                session.breakpoint_ids.insert(record.id);
                session.send(Command::Debug(DebugCommand::Add(record.into())))?;
            }
            for sheet in state.sheets {
                session.send(Command::Sheet(SheetCommand::Create(sheet)))?;
            }
            Ok(())
        })?;

        self.midi
            .lock()
            .expect("MIDI lock poisoned")
            .set_bindings(state.midi_bindings);
        log::info!("[ENGINE] control state imported into {}", handle);
        Ok(())
    }
}

impl Drop for PerformanceEngine {
    fn drop(&mut self) {
        if let Some(handle) = self.current_session() {
            self.stop(handle);
        }
    }
}

impl std::fmt::Debug for PerformanceEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerformanceEngine")
            .field("config", &self.config)
            .field("session", &self.current_session())
            .finish_non_exhaustive()
    }
}
