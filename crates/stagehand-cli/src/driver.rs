//! Drives one session from the command line and prints what happens.

use anyhow::{Context, Result};
use crossbeam_channel::Receiver;
use stagehand_core::{
    BreakpointTarget, ClockMode, ControlState, HaltReason, HaltReport, Notification,
    PerformanceEngine, SessionHandle, TransportCommand,
};
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Manual-clock cycles granted per step of the drive loop.
const ADVANCE_CHUNK: u64 = 64;

/// A breakpoint given on the command line: `INSTR[:LINE][/SKIP]`.
#[derive(Clone, Debug, PartialEq)]
pub struct BreakSpec {
    pub target: BreakpointTarget,
    pub skip_count: u32,
}

impl FromStr for BreakSpec {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (location, skip) = match s.split_once('/') {
            Some((location, skip)) => (location, Some(skip)),
            None => (s, None),
        };
        let skip_count = match skip {
            Some(skip) => skip
                .trim()
                .parse()
                .map_err(|_| format!("invalid skip count '{}'", skip))?,
            None => 0,
        };
        let parse_num = |text: &str, what: &str| {
            text.trim()
                .parse::<u32>()
                .map_err(|_| format!("invalid {} '{}'", what, text))
        };
        let target = match location.split_once(':') {
            Some((instr, line)) => BreakpointTarget::Line {
                instrument: parse_num(instr, "instrument")?,
                line: parse_num(line, "line")? as usize,
            },
            None => BreakpointTarget::Instrument(parse_num(location, "instrument")?),
        };
        Ok(Self { target, skip_count })
    }
}

/// What `stagehand run` should do after starting the session.
#[derive(Debug, Default)]
pub struct RunOptions {
    /// Control cycles to perform.
    pub cycles: u64,
    pub breakpoints: Vec<BreakSpec>,
    /// Control state to import before running.
    pub state: Option<PathBuf>,
    /// Where to export the control state when done.
    pub save_state: Option<PathBuf>,
    /// Start every sheet and the transport.
    pub start_sheets: bool,
    /// Stop after this many halts instead of continuing.
    pub max_halts: usize,
    /// Also print playhead and channel notifications.
    pub verbose: bool,
    /// Set by a signal handler to end the run early.
    pub interrupt: Option<Arc<AtomicBool>>,
}

impl RunOptions {
    fn interrupted(&self) -> bool {
        self.interrupt
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }
}

/// Outcome of a run.
#[derive(Debug, Default, PartialEq)]
pub struct RunSummary {
    pub cycles: u64,
    pub halts: usize,
    /// The session ended on a runtime fault.
    pub faulted: bool,
    /// The run was cut short by an interrupt.
    pub interrupted: bool,
}

/// Start a session for `code`, drive it, and stop it again.
pub fn run(engine: &PerformanceEngine, code: &str, options: &RunOptions) -> Result<RunSummary> {
    let rx = engine.subscribe();
    let session = engine.start(code).context("Failed to start session")?;
    let result = drive(engine, session, &rx, options);
    engine.stop(session);
    for notification in rx.try_iter() {
        report(&notification, options.verbose);
    }
    result
}

fn drive(
    engine: &PerformanceEngine,
    session: SessionHandle,
    rx: &Receiver<Notification>,
    options: &RunOptions,
) -> Result<RunSummary> {
    if let Some(path) = &options.state {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read state: {}", path.display()))?;
        let state = ControlState::from_toml_str(&content)
            .with_context(|| format!("Failed to parse state: {}", path.display()))?;
        engine
            .import_state(session, state)
            .context("Failed to import control state")?;
    }
    for spec in &options.breakpoints {
        let id = engine
            .add_breakpoint(session, spec.target.clone(), spec.skip_count)
            .with_context(|| format!("Cannot set breakpoint at {}", spec.target))?;
        println!("breakpoint {} at {} (skip {})", id, spec.target, spec.skip_count);
    }
    engine.flush(session)?;

    if options.start_sheets {
        for view in engine.sheets(session)? {
            engine.start_sheet(session, &view.record.name)?;
        }
        engine.transport(session, TransportCommand::Start)?;
    }

    let manual = engine.config().clock == ClockMode::Manual;
    let mut summary = RunSummary::default();
    loop {
        if !engine.session_state(session).is_live() {
            summary.faulted = true;
            break;
        }
        // A fault can end the session between these calls.
        let Ok(snapshot) = engine.snapshot(session) else {
            summary.faulted = true;
            break;
        };
        summary.cycles = snapshot.cycle;
        if snapshot.cycle >= options.cycles {
            break;
        }
        if options.interrupted() {
            log::info!("[CLI] interrupted at cycle {}", snapshot.cycle);
            summary.interrupted = true;
            break;
        }

        if manual {
            let chunk = (options.cycles - snapshot.cycle).min(ADVANCE_CHUNK);
            let advanced = engine
                .advance(session, chunk)
                .and_then(|_| engine.flush(session));
            if let Err(e) = advanced {
                if engine.session_state(session).is_live() {
                    return Err(e.into());
                }
            }
        } else if let Ok(notification) = rx.recv_timeout(Duration::from_millis(50)) {
            if handle(engine, session, &notification, &mut summary, options)? {
                break;
            }
        }
        let mut done = false;
        for notification in rx.try_iter() {
            done |= handle(engine, session, &notification, &mut summary, options)?;
        }
        if done {
            break;
        }
    }

    if let Some(path) = &options.save_state {
        if engine.session_state(session).is_live() {
            let content = engine.export_state(session)?.to_toml_string()?;
            fs::write(path, content)
                .with_context(|| format!("Failed to save state: {}", path.display()))?;
            println!("control state saved to {}", path.display());
        }
    }
    if engine.session_state(session).is_live() {
        for entry in engine.channels(session)?.list() {
            println!("channel {} = {}", entry.name, entry.value);
        }
    }
    Ok(summary)
}

/// Print a notification and resume after halts. Returns true when the run
/// should end.
fn handle(
    engine: &PerformanceEngine,
    session: SessionHandle,
    notification: &Notification,
    summary: &mut RunSummary,
    options: &RunOptions,
) -> Result<bool> {
    report(notification, options.verbose);
    match notification {
        Notification::BreakpointHit(_) => {
            summary.halts += 1;
            if options.max_halts > 0 && summary.halts >= options.max_halts {
                println!("halt limit reached");
                return Ok(true);
            }
            engine.resume(session)?;
        }
        Notification::RuntimeFault(_) => {
            summary.faulted = true;
            return Ok(true);
        }
        _ => {}
    }
    Ok(false)
}

fn report(notification: &Notification, verbose: bool) {
    match notification {
        Notification::SessionStateChanged(state) => println!("session {:?}", state),
        Notification::BreakpointHit(halt) => print_halt(halt),
        Notification::SheetError { sheet, cycle, error } => {
            println!("sheet '{}' cycle {}: {}", sheet, cycle, error)
        }
        Notification::CommandRejected(error) => println!("rejected: {}", error),
        Notification::RuntimeFault(fault) => println!("fault: {}", fault),
        Notification::Message(text) => println!("{}", text),
        Notification::SheetPlayheadChanged { sheet, position } if verbose => {
            println!("sheet '{}' at beat {:.3}", sheet, position)
        }
        Notification::ChannelChanged {
            name,
            value,
            writer,
        } if verbose => println!("channel {} = {} ({:?})", name, value, writer),
        _ => {}
    }
}

fn print_halt(halt: &HaltReport) {
    let reason = match &halt.reason {
        HaltReason::Breakpoint(ids) => format!("breakpoint {:?}", ids),
        HaltReason::Step => "step".to_string(),
    };
    println!("halt at cycle {} ({:.4}s): {}", halt.cycle, halt.time, reason);
    for frame in &halt.frames {
        let line = frame
            .line
            .map(|l| format!(" line {}", l))
            .unwrap_or_default();
        println!(
            "  instr {} #{}{} k={}",
            frame.instrument, frame.instance, line, frame.k_count
        );
        for (name, value) in &frame.variables {
            println!("    {} = {}", name, value);
        }
    }
}
