//! Breakpoint manager and debugger state machine.
//!
//! The debugger is a [`CycleHook`]: once per control cycle it matches every
//! enabled breakpoint against the cycle's activations, counts skips down and
//! decides whether the engine halts at the cycle boundary.
//!
//! ```text
//!            halt                       step
//! Running ---------> Paused ------------------> SteppingOne
//!    ^                 |  ^                          |
//!    +---- continue ---+  +---- one cycle, halt -----+
//! ```
//!
//! All edits arrive as [`DebugCommand`]s drained between cycles, so they
//! take effect from the next cycle and never on the one in flight.

use crate::engine::{CycleContext, CycleHook, HookOutcome};
use crate::error::{EngineError, Result};
use crate::runtime::{Activation, CycleInfo, InstrumentId};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Unique breakpoint identifier, allocated by the engine.
pub type BreakpointId = u64;

/// Breakpoint flavor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakpointKind {
    InstrumentEntry,
    LineNumber,
}

/// Where a breakpoint matches.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakpointTarget {
    /// First control pass of any instance of the instrument.
    Instrument(InstrumentId),
    /// Any cycle in which an instance of `instrument` executes `line`.
    Line { instrument: InstrumentId, line: usize },
}

impl BreakpointTarget {
    pub fn kind(&self) -> BreakpointKind {
        match self {
            BreakpointTarget::Instrument(_) => BreakpointKind::InstrumentEntry,
            BreakpointTarget::Line { .. } => BreakpointKind::LineNumber,
        }
    }

    pub fn instrument(&self) -> InstrumentId {
        match self {
            BreakpointTarget::Instrument(id) => *id,
            BreakpointTarget::Line { instrument, .. } => *instrument,
        }
    }

    fn line(&self) -> Option<usize> {
        match self {
            BreakpointTarget::Instrument(_) => None,
            BreakpointTarget::Line { line, .. } => Some(*line),
        }
    }

    fn matches(&self, activation: &Activation) -> bool {
        match self {
            BreakpointTarget::Instrument(id) => {
                activation.instrument == *id && activation.k_count == 1
            }
            BreakpointTarget::Line { instrument, line } => {
                activation.instrument == *instrument && activation.lines.contains(line)
            }
        }
    }
}

impl std::fmt::Display for BreakpointTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakpointTarget::Instrument(id) => write!(f, "instr {}", id),
            BreakpointTarget::Line { instrument, line } => {
                write!(f, "instr {} line {}", instrument, line)
            }
        }
    }
}

/// A registered breakpoint.
#[derive(Clone, Debug, PartialEq)]
pub struct Breakpoint {
    pub id: BreakpointId,
    pub target: BreakpointTarget,
    /// Configured number of qualifying hits to let pass before halting.
    pub skip_count: u32,
    pub enabled: bool,
    /// Hits still to skip before the next halt.
    pub remaining: u32,
}

impl Breakpoint {
    pub fn new(id: BreakpointId, target: BreakpointTarget) -> Self {
        Self {
            id,
            target,
            skip_count: 0,
            enabled: true,
            remaining: 0,
        }
    }

    pub fn with_skip_count(mut self, skip_count: u32) -> Self {
        self.skip_count = skip_count;
        self.remaining = skip_count;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn kind(&self) -> BreakpointKind {
        self.target.kind()
    }

    /// Count one qualifying hit. Returns true when this hit halts.
    fn hit(&mut self) -> bool {
        if self.remaining == 0 {
            self.remaining = self.skip_count;
            true
        } else {
            self.remaining -= 1;
            false
        }
    }
}

/// Snapshot of one instrument instance at a halt.
#[derive(Clone, Debug, PartialEq)]
pub struct StackFrame {
    pub instrument: InstrumentId,
    pub instance: u64,
    /// p1 onward.
    pub pfields: Vec<Value>,
    /// Control cycles since activation, counting the halted one.
    pub k_count: u64,
    pub variables: BTreeMap<String, Value>,
    /// Set for frames captured by a line breakpoint.
    pub line: Option<usize>,
}

impl StackFrame {
    fn capture(activation: &Activation, line: Option<usize>) -> Self {
        Self {
            instrument: activation.instrument,
            instance: activation.instance,
            pfields: activation.pfields.clone(),
            k_count: activation.k_count,
            variables: activation.variables.clone(),
            line,
        }
    }
}

/// Why execution halted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HaltReason {
    /// The listed breakpoints fired in the halted cycle.
    Breakpoint(Vec<BreakpointId>),
    /// A single step completed without any breakpoint firing.
    Step,
}

/// Everything captured at one halt.
#[derive(Clone, Debug, PartialEq)]
pub struct HaltReport {
    pub cycle: u64,
    pub time: f64,
    pub reason: HaltReason,
    pub frames: Vec<StackFrame>,
}

/// Debugger execution state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DebuggerState {
    #[default]
    Running,
    Paused,
    SteppingOne,
}

/// Operator command, applied between cycles.
#[derive(Clone, Debug, PartialEq)]
pub enum DebugCommand {
    Add(Breakpoint),
    Remove(BreakpointId),
    SetEnabled { id: BreakpointId, enabled: bool },
    SetSkipCount { id: BreakpointId, skip_count: u32 },
    Clear,
    Pause,
    Continue,
    Step,
}

/// Breakpoint registry plus run/pause/step state machine.
#[derive(Debug, Default)]
pub struct Debugger {
    breakpoints: Vec<Breakpoint>,
    state: DebuggerState,
    last_halt: Option<HaltReport>,
}

impl Debugger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> DebuggerState {
        self.state
    }

    pub fn is_paused(&self) -> bool {
        self.state == DebuggerState::Paused
    }

    pub fn is_stepping(&self) -> bool {
        self.state == DebuggerState::SteppingOne
    }

    pub fn breakpoints(&self) -> &[Breakpoint] {
        &self.breakpoints
    }

    pub fn last_halt(&self) -> Option<&HaltReport> {
        self.last_halt.as_ref()
    }

    fn find(&mut self, id: BreakpointId) -> Result<&mut Breakpoint> {
        self.breakpoints
            .iter_mut()
            .find(|bp| bp.id == id)
            .ok_or_else(|| EngineError::InvalidTarget(format!("breakpoint {}", id)))
    }

    /// Apply an operator command.
    pub fn apply(&mut self, command: DebugCommand) -> Result<()> {
        log::debug!("[DEBUGGER] {:?}", command);
        match command {
            DebugCommand::Add(breakpoint) => {
                self.breakpoints.retain(|bp| bp.id != breakpoint.id);
                self.breakpoints.push(breakpoint);
            }
            DebugCommand::Remove(id) => {
                self.find(id)?;
                self.breakpoints.retain(|bp| bp.id != id);
            }
            DebugCommand::SetEnabled { id, enabled } => {
                self.find(id)?.enabled = enabled;
            }
            DebugCommand::SetSkipCount { id, skip_count } => {
                let breakpoint = self.find(id)?;
                breakpoint.skip_count = skip_count;
                breakpoint.remaining = skip_count;
            }
            DebugCommand::Clear => self.breakpoints.clear(),
            DebugCommand::Pause => {
                if self.state == DebuggerState::Running {
                    self.state = DebuggerState::Paused;
                }
            }
            DebugCommand::Continue => self.state = DebuggerState::Running,
            DebugCommand::Step => self.state = DebuggerState::SteppingOne,
        }
        Ok(())
    }

    /// Match breakpoints against one cycle and update the state machine.
    pub fn check_cycle(&mut self, cycle: &CycleInfo) -> Option<HaltReport> {
        let mut fired: Vec<BreakpointId> = Vec::new();
        let mut frames = Vec::new();

        for activation in &cycle.activations {
            for breakpoint in self.breakpoints.iter_mut() {
                if !breakpoint.enabled || !breakpoint.target.matches(activation) {
                    continue;
                }
                // A breakpoint that already fired this cycle reports every
                // further matching instance without consuming its countdown.
                let already = fired.contains(&breakpoint.id);
                if already || breakpoint.hit() {
                    if !already {
                        fired.push(breakpoint.id);
                    }
                    frames.push(StackFrame::capture(activation, breakpoint.target.line()));
                } else {
                    log::trace!(
                        "[DEBUGGER] breakpoint {} skipped ({} left)",
                        breakpoint.id,
                        breakpoint.remaining
                    );
                }
            }
        }

        let reason = if !fired.is_empty() {
            HaltReason::Breakpoint(fired)
        } else if self.state == DebuggerState::SteppingOne {
            frames = cycle
                .activations
                .iter()
                .map(|activation| StackFrame::capture(activation, None))
                .collect();
            HaltReason::Step
        } else {
            return None;
        };

        let report = HaltReport {
            cycle: cycle.cycle,
            time: cycle.time,
            reason,
            frames,
        };
        log::info!(
            "[DEBUGGER] halted at cycle {} ({:?}, {} frame(s))",
            report.cycle,
            report.reason,
            report.frames.len()
        );
        self.state = DebuggerState::Paused;
        self.last_halt = Some(report.clone());
        Some(report)
    }

    /// Drop every breakpoint and return to Running. Used when a session ends.
    pub fn reset(&mut self) {
        self.breakpoints.clear();
        self.state = DebuggerState::Running;
        self.last_halt = None;
    }
}

impl CycleHook for Debugger {
    fn on_cycle(&mut self, cycle: &CycleInfo, _ctx: &mut CycleContext<'_>) -> HookOutcome {
        match self.check_cycle(cycle) {
            Some(report) => HookOutcome::Halt(report),
            None => HookOutcome::Continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn activation(instrument: InstrumentId, instance: u64, k_count: u64, lines: &[usize]) -> Activation {
        Activation {
            instrument,
            instance,
            pfields: vec![Value::Scalar(instrument as f64)],
            k_count,
            lines: lines.to_vec(),
            variables: BTreeMap::new(),
        }
    }

    fn cycle(n: u64, activations: Vec<Activation>) -> CycleInfo {
        CycleInfo {
            cycle: n,
            time: n as f64 * 0.01,
            duration: 0.01,
            activations,
        }
    }

    #[test]
    fn test_instrument_entry_halts_on_first_pass() {
        let mut dbg = Debugger::new();
        dbg.apply(DebugCommand::Add(Breakpoint::new(1, BreakpointTarget::Instrument(1))))
            .unwrap();

        let report = dbg.check_cycle(&cycle(0, vec![activation(1, 7, 1, &[3])])).unwrap();
        assert_eq!(report.reason, HaltReason::Breakpoint(vec![1]));
        assert_eq!(report.frames.len(), 1);
        assert_eq!(report.frames[0].instrument, 1);
        assert_eq!(report.frames[0].instance, 7);
        assert!(dbg.is_paused());

        // Later passes of the same instance are not entries.
        dbg.apply(DebugCommand::Continue).unwrap();
        assert!(dbg.check_cycle(&cycle(1, vec![activation(1, 7, 2, &[3])])).is_none());
    }

    #[test]
    fn test_skip_count_countdown_and_reset() {
        for n in 0..5u32 {
            let mut dbg = Debugger::new();
            let target = BreakpointTarget::Line {
                instrument: 2,
                line: 4,
            };
            dbg.apply(DebugCommand::Add(Breakpoint::new(9, target).with_skip_count(n)))
                .unwrap();

            for hit in 0..n {
                let c = cycle(hit as u64, vec![activation(2, 1, hit as u64 + 1, &[4])]);
                assert!(dbg.check_cycle(&c).is_none(), "halted early at hit {}", hit + 1);
            }
            let c = cycle(n as u64, vec![activation(2, 1, n as u64 + 1, &[4])]);
            let report = dbg.check_cycle(&c).expect("halt on hit N+1");
            assert_eq!(report.frames[0].line, Some(4));
            assert_eq!(dbg.breakpoints()[0].remaining, n);
        }
    }

    #[test]
    fn test_simultaneous_breakpoints_share_one_halt() {
        let mut dbg = Debugger::new();
        dbg.apply(DebugCommand::Add(Breakpoint::new(1, BreakpointTarget::Instrument(1))))
            .unwrap();
        dbg.apply(DebugCommand::Add(Breakpoint::new(2, BreakpointTarget::Instrument(2))))
            .unwrap();

        let report = dbg
            .check_cycle(&cycle(
                0,
                vec![activation(1, 1, 1, &[]), activation(2, 2, 1, &[])],
            ))
            .unwrap();
        assert_eq!(report.reason, HaltReason::Breakpoint(vec![1, 2]));
        assert_eq!(report.frames.len(), 2);
    }

    #[test]
    fn test_disabled_breakpoint_ignored() {
        let mut dbg = Debugger::new();
        dbg.apply(DebugCommand::Add(
            Breakpoint::new(1, BreakpointTarget::Instrument(1)).with_enabled(false),
        ))
        .unwrap();
        assert!(dbg.check_cycle(&cycle(0, vec![activation(1, 1, 1, &[])])).is_none());
        dbg.apply(DebugCommand::SetEnabled { id: 1, enabled: true })
            .unwrap();
        assert!(dbg.check_cycle(&cycle(1, vec![activation(1, 2, 1, &[])])).is_some());
    }

    #[test]
    fn test_step_captures_all_activations() {
        let mut dbg = Debugger::new();
        dbg.apply(DebugCommand::Pause).unwrap();
        dbg.apply(DebugCommand::Step).unwrap();
        assert!(dbg.is_stepping());

        let report = dbg
            .check_cycle(&cycle(
                3,
                vec![activation(1, 1, 4, &[]), activation(5, 2, 1, &[])],
            ))
            .unwrap();
        assert_eq!(report.reason, HaltReason::Step);
        assert_eq!(report.frames.len(), 2);
        assert!(dbg.is_paused());

        // A step over an empty cycle still halts.
        dbg.apply(DebugCommand::Step).unwrap();
        let report = dbg.check_cycle(&cycle(4, Vec::new())).unwrap();
        assert!(report.frames.is_empty());
        assert_eq!(dbg.last_halt().unwrap().cycle, 4);
    }

    #[test]
    fn test_edit_unknown_breakpoint() {
        let mut dbg = Debugger::new();
        assert!(matches!(
            dbg.apply(DebugCommand::Remove(42)),
            Err(EngineError::InvalidTarget(_))
        ));
        assert!(matches!(
            dbg.apply(DebugCommand::SetSkipCount { id: 42, skip_count: 1 }),
            Err(EngineError::InvalidTarget(_))
        ));
    }

    #[test]
    fn test_set_skip_count_rearms() {
        let mut dbg = Debugger::new();
        dbg.apply(DebugCommand::Add(Breakpoint::new(1, BreakpointTarget::Instrument(1))))
            .unwrap();
        dbg.apply(DebugCommand::SetSkipCount { id: 1, skip_count: 2 })
            .unwrap();
        assert_eq!(dbg.breakpoints()[0].remaining, 2);
        assert_eq!(dbg.breakpoints()[0].kind(), BreakpointKind::InstrumentEntry);
    }
}
