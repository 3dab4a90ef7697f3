//! The engine thread.
//!
//! One thread per session. It owns the runtime, the debugger and the
//! scheduler, drains the command queue between cycles and drives the
//! per-cycle hooks:
//!
//! 1. apply queued channel events that came due
//! 2. `SynthRuntime::perform_cycle`, then forward runtime output
//! 3. scheduler, then debugger, then observers
//! 4. publish the session snapshot

use super::hooks::{CycleContext, CycleHook, CycleObserver, HookOutcome};
use super::messages::{Command, EventAction, PerformanceEvent, ScoreCommand};
use super::session::{SessionMonitor, SessionState};
use crate::channels::{ChannelBus, WriterKind};
use crate::config::{ClockMode, EngineConfig};
use crate::debugger::{DebugCommand, Debugger};
use crate::error::{EngineError, Result, RuntimeFault};
use crate::notify::{Notification, Notifier};
use crate::runtime::{CycleInfo, SynthRuntime};
use crate::scheduler::EventScheduler;
use crate::timing::EPSILON;
use crate::value::Value;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A channel write waiting for its session time.
struct TimedWrite {
    at: f64,
    seq: u64,
    name: String,
    value: Value,
}

pub(crate) struct EngineThread {
    runtime: Box<dyn SynthRuntime>,
    channels: Arc<ChannelBus>,
    notifier: Notifier,
    monitor: SessionMonitor,
    command_rx: Receiver<Command>,
    shutdown: Arc<AtomicBool>,
    clock: ClockMode,
    idle_poll: Duration,
    scheduler: EventScheduler,
    debugger: Debugger,
    observers: Vec<CycleObserver>,
    timed_writes: Vec<TimedWrite>,
    next_write_seq: u64,
    /// Cycles still allowed under the manual clock.
    budget: u64,
    barriers: Vec<Sender<()>>,
    stop_requested: bool,
}

impl EngineThread {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: &EngineConfig,
        runtime: Box<dyn SynthRuntime>,
        channels: Arc<ChannelBus>,
        notifier: Notifier,
        monitor: SessionMonitor,
        command_rx: Receiver<Command>,
        shutdown: Arc<AtomicBool>,
        observers: Vec<CycleObserver>,
    ) -> Self {
        Self {
            runtime,
            channels,
            notifier,
            monitor,
            command_rx,
            shutdown,
            clock: config.clock,
            idle_poll: config.idle_poll(),
            scheduler: EventScheduler::new(config.default_tempo),
            debugger: Debugger::new(),
            observers,
            timed_writes: Vec::new(),
            next_write_seq: 0,
            budget: 0,
            barriers: Vec::new(),
            stop_requested: false,
        }
    }

    fn running(&self) -> bool {
        !self.stop_requested && !self.shutdown.load(Ordering::Relaxed)
    }

    /// Whether the next loop iteration may perform a cycle.
    fn can_cycle(&self) -> bool {
        if self.debugger.is_stepping() {
            return true;
        }
        if self.debugger.is_paused() {
            return false;
        }
        self.clock != ClockMode::Manual || self.budget > 0
    }

    /// Barriers wait for pending steps and, under the manual clock, for the
    /// advance budget to run out.
    fn idle(&self) -> bool {
        !self.debugger.is_stepping()
            && (self.clock != ClockMode::Manual || self.budget == 0 || self.debugger.is_paused())
    }

    fn release_barriers(&mut self) {
        if self.idle() {
            for barrier in self.barriers.drain(..) {
                let _ = barrier.send(());
            }
        }
    }

    pub(crate) fn run(mut self) {
        log::info!("[ENGINE] engine thread started ({:?} clock)", self.clock);
        self.forward_messages();
        let cycle_duration = Duration::from_secs_f64(self.runtime.cycle_duration().max(0.0));
        let mut deadline = Instant::now();

        while self.running() {
            self.drain_commands();
            self.release_barriers();
            if !self.running() {
                break;
            }

            if self.can_cycle() {
                if self.clock == ClockMode::Realtime {
                    let now = Instant::now();
                    if now < deadline {
                        // Stay responsive while waiting for the next cycle.
                        match self.command_rx.recv_timeout(deadline - now) {
                            Ok(command) => {
                                self.handle(command);
                                continue;
                            }
                            Err(RecvTimeoutError::Timeout) => {}
                            Err(RecvTimeoutError::Disconnected) => break,
                        }
                    }
                    deadline = deadline.max(Instant::now()) + cycle_duration;
                }
                if let Err(fault) = self.run_cycle() {
                    self.fail(fault);
                    return;
                }
                self.release_barriers();
            } else {
                match self.command_rx.recv_timeout(self.idle_poll) {
                    Ok(command) => self.handle(command),
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
                deadline = Instant::now();
            }
        }

        self.runtime.reset();
        self.timed_writes.clear();
        self.debugger.reset();
        log::info!("[ENGINE] engine thread stopped");
    }

    fn drain_commands(&mut self) {
        while let Ok(command) = self.command_rx.try_recv() {
            self.handle(command);
            if self.stop_requested {
                break;
            }
        }
    }

    fn reject(&self, error: EngineError) {
        log::warn!("[ENGINE] command rejected: {}", error);
        self.notifier.emit(Notification::CommandRejected(error));
    }

    fn handle(&mut self, command: Command) {
        log::debug!("[ENGINE] command: {}", command.label());
        let result = match command {
            Command::Evaluate(code) => self.evaluate(&code),
            Command::SendEvent(event) => self.send_event(event),
            Command::Debug(command) => self.debug(command),
            Command::Sheet(command) => {
                let mut ctx = CycleContext {
                    runtime: self.runtime.as_mut(),
                    channels: &self.channels,
                    notifier: &self.notifier,
                };
                let result = self.scheduler.apply(command, &mut ctx);
                self.publish_sheets();
                result
            }
            Command::WriteChannel {
                name,
                value,
                writer,
            } => self.channels.set(&name, value, writer),
            Command::AddObserver(observer) => {
                self.observers.push(observer);
                Ok(())
            }
            Command::Score(command) => self.score(command),
            Command::TableSet {
                table,
                index,
                value,
            } => self.runtime.table_set(table, index, value),
            Command::TableGet {
                table,
                index,
                reply,
            } => {
                let _ = reply.send(self.runtime.table_get(table, index));
                Ok(())
            }
            Command::Sync(reply) => {
                let _ = reply.send(());
                Ok(())
            }
            Command::Advance(cycles) => {
                self.budget = self.budget.saturating_add(cycles);
                Ok(())
            }
            Command::Barrier(reply) => {
                self.barriers.push(reply);
                Ok(())
            }
            Command::Stop => {
                self.stop_requested = true;
                Ok(())
            }
        };
        if let Err(e) = result {
            self.reject(e);
        }
    }

    fn evaluate(&mut self, code: &str) -> Result<()> {
        let program = self.runtime.evaluate(code);
        self.forward_messages();
        let program = program?;
        log::info!(
            "[ENGINE] evaluated fragment ({} instrument(s) defined)",
            program.instruments.len()
        );
        self.monitor.with_write(|s| s.program = program);
        Ok(())
    }

    fn score(&mut self, command: ScoreCommand) -> Result<()> {
        match command {
            ScoreCommand::Rewind => self.runtime.rewind_score(),
            ScoreCommand::SetOffset(seconds) => self.runtime.set_score_offset(seconds)?,
            ScoreCommand::SetPending(pending) => self.runtime.set_score_pending(pending),
        }
        let score = self.runtime.score_state();
        self.monitor.with_write(|s| s.score = score);
        Ok(())
    }

    /// Hand runtime console output to subscribers.
    fn forward_messages(&mut self) {
        for text in self.runtime.take_messages() {
            log::info!("[RUNTIME] {}", text);
            self.notifier.emit(Notification::Message(text));
        }
    }

    fn send_event(&mut self, event: PerformanceEvent) -> Result<()> {
        let now = self.runtime.time();
        let delay = event.at.map_or(0.0, |at| (at - now).max(0.0));
        match event.action {
            EventAction::Note(mut note) => {
                note.start += delay;
                self.runtime.schedule(note)
            }
            EventAction::SetChannel { name, value } if delay <= EPSILON => {
                self.channels.set(&name, value, WriterKind::Engine)
            }
            EventAction::SetChannel { name, value } => {
                self.channels.claim(&name, &value)?;
                self.timed_writes.push(TimedWrite {
                    at: now + delay,
                    seq: self.next_write_seq,
                    name,
                    value,
                });
                self.next_write_seq += 1;
                Ok(())
            }
        }
    }

    fn debug(&mut self, command: DebugCommand) -> Result<()> {
        let resume = command == DebugCommand::Continue;
        let pause = command == DebugCommand::Pause;
        self.debugger.apply(command)?;

        if resume && self.monitor.state() == SessionState::Paused {
            self.monitor.transition(SessionState::Running, &self.notifier);
        } else if pause && self.debugger.is_paused() {
            self.budget = 0;
            self.monitor.transition(SessionState::Paused, &self.notifier);
        }
        self.publish_debugger();
        Ok(())
    }

    fn apply_timed_writes(&mut self, time: f64) {
        if self.timed_writes.is_empty() {
            return;
        }
        self.timed_writes
            .sort_by(|a, b| a.at.total_cmp(&b.at).then(a.seq.cmp(&b.seq)));
        let due = self
            .timed_writes
            .iter()
            .take_while(|w| w.at <= time + EPSILON)
            .count();
        for write in self.timed_writes.drain(..due).collect::<Vec<_>>() {
            if let Err(e) = self.channels.set(&write.name, write.value, WriterKind::Engine) {
                self.reject(e);
            }
        }
    }

    fn run_cycle(&mut self) -> std::result::Result<(), RuntimeFault> {
        let stepping = self.debugger.is_stepping();
        self.apply_timed_writes(self.runtime.time());

        let info: CycleInfo = self.runtime.perform_cycle(&self.channels)?;
        self.forward_messages();
        log::trace!(
            "[ENGINE] cycle {} at {:.4}s: {} activation(s)",
            info.cycle,
            info.time,
            info.activations.len()
        );

        let outcome = {
            let mut ctx = CycleContext {
                runtime: self.runtime.as_mut(),
                channels: &self.channels,
                notifier: &self.notifier,
            };
            self.scheduler.on_cycle(&info, &mut ctx);
            self.debugger.on_cycle(&info, &mut ctx)
        };

        for observer in &self.observers {
            observer(&info);
        }

        if self.clock == ClockMode::Manual && !stepping {
            self.budget = self.budget.saturating_sub(1);
        }

        let time = self.runtime.time();
        let score = self.runtime.score_state();
        self.monitor.with_write(|s| {
            s.cycle = info.cycle + 1;
            s.time = time;
            s.score = score;
        });
        self.publish_sheets();
        self.publish_debugger();

        if let HookOutcome::Halt(report) = outcome {
            self.budget = 0;
            self.monitor.transition(SessionState::Paused, &self.notifier);
            self.notifier.emit(Notification::BreakpointHit(report));
        }
        Ok(())
    }

    fn publish_sheets(&self) {
        let sheets = self.scheduler.views();
        let transport = self.scheduler.transport_view();
        self.monitor.with_write(|s| {
            s.sheets = sheets;
            s.transport = transport;
        });
    }

    fn publish_debugger(&self) {
        let breakpoints = self.debugger.breakpoints().to_vec();
        let state = self.debugger.state();
        let last_halt = self.debugger.last_halt().cloned();
        self.monitor.with_write(|s| {
            s.breakpoints = breakpoints;
            s.debugger = state;
            s.last_halt = last_halt;
        });
    }

    /// Unrecoverable runtime failure: stop the session and drop everything
    /// still queued.
    fn fail(mut self, fault: RuntimeFault) {
        log::error!("[ENGINE] {}", fault);
        self.monitor.transition(SessionState::Failed, &self.notifier);
        self.notifier.emit(Notification::RuntimeFault(fault));

        self.runtime.reset();
        self.timed_writes.clear();
        self.debugger.reset();
        let discarded = self.command_rx.try_iter().count();
        if discarded > 0 {
            log::warn!("[ENGINE] discarded {} queued command(s)", discarded);
        }
        self.barriers.clear();
        self.monitor.transition(SessionState::Stopped, &self.notifier);
    }
}
