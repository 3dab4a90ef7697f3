//! Boundary to the synthesis runtime.
//!
//! The engine only talks to the runtime through [`SynthRuntime`]; every
//! call is made from the engine thread, so implementations need not be
//! reentrant. [`SimRuntime`] is a small built-in runtime that interprets a
//! csound-like orchestra, enough to drive sessions end to end.

mod orchestra;
mod sim;

pub use orchestra::{parse_score_line, parse_table_line, Expr, Rate, StatementKind, TableDef};
pub use sim::SimRuntime;

use crate::channels::ChannelBus;
use crate::config::EngineConfig;
use crate::error::{Result, RuntimeFault};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Numeric instrument identifier (`instr 1`).
pub type InstrumentId = u32;

/// Function table number (`f 1 ...`).
pub type TableId = u32;

/// Playback state of the compiled score.
///
/// Score events run on their own clock. It advances with the session only
/// while `pending` is set, starts at `offset` on compile and returns there
/// on rewind.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScoreState {
    /// Score time in seconds.
    pub time: f64,
    pub offset: f64,
    pub pending: bool,
}

impl Default for ScoreState {
    fn default() -> Self {
        Self {
            time: 0.0,
            offset: 0.0,
            pending: true,
        }
    }
}

/// A score event: activate `instrument` for `duration` seconds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScoreEvent {
    pub instrument: InstrumentId,
    /// Delay in seconds from the cycle the event is handed to the runtime.
    pub start: f64,
    /// Duration in seconds. Negative durations are held until `turnoff`.
    pub duration: f64,
    /// p4 onward.
    pub pfields: Vec<Value>,
}

impl ScoreEvent {
    pub fn new(instrument: InstrumentId, duration: f64) -> Self {
        Self {
            instrument,
            start: 0.0,
            duration,
            pfields: Vec::new(),
        }
    }

    pub fn with_pfield(mut self, value: impl Into<Value>) -> Self {
        self.pfields.push(value.into());
        self
    }

    pub fn with_start(mut self, start: f64) -> Self {
        self.start = start;
        self
    }

    /// All p-fields, p1 through pN.
    pub fn all_pfields(&self) -> Vec<Value> {
        let mut all = Vec::with_capacity(self.pfields.len() + 3);
        all.push(Value::Scalar(self.instrument as f64));
        all.push(Value::Scalar(self.start));
        all.push(Value::Scalar(self.duration));
        all.extend(self.pfields.iter().cloned());
        all
    }
}

/// What one instrument instance did during one control cycle.
#[derive(Clone, Debug, PartialEq)]
pub struct Activation {
    pub instrument: InstrumentId,
    /// Unique per session.
    pub instance: u64,
    /// p1 onward.
    pub pfields: Vec<Value>,
    /// Control cycles this instance has run, counting this one (1 = first pass).
    pub k_count: u64,
    /// Source lines executed this cycle, in order.
    pub lines: Vec<usize>,
    /// Variable bindings after this cycle's pass.
    pub variables: BTreeMap<String, Value>,
}

/// Report of one performed control cycle.
#[derive(Clone, Debug, PartialEq)]
pub struct CycleInfo {
    /// Zero-based index of the cycle.
    pub cycle: u64,
    /// Session time in seconds at the start of the cycle.
    pub time: f64,
    /// Length of the cycle in seconds.
    pub duration: f64,
    /// Instances that ran, in execution order.
    pub activations: Vec<Activation>,
}

/// Source layout of one instrument.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstrumentInfo {
    pub id: InstrumentId,
    pub first_line: usize,
    pub last_line: usize,
    /// Lines holding executable statements.
    pub lines: Vec<usize>,
}

/// Instruments and tables currently defined in a session.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProgramInfo {
    pub sample_rate: f64,
    pub ksmps: u32,
    /// Output channels.
    pub nchnls: u32,
    pub instruments: BTreeMap<InstrumentId, InstrumentInfo>,
    /// Length of every function table.
    pub tables: BTreeMap<TableId, usize>,
}

impl ProgramInfo {
    pub fn has_instrument(&self, id: InstrumentId) -> bool {
        self.instruments.contains_key(&id)
    }

    pub fn table_len(&self, table: TableId) -> Option<usize> {
        self.tables.get(&table).copied()
    }

    /// Whether `line` holds an executable statement of instrument `id`.
    pub fn has_line(&self, id: InstrumentId, line: usize) -> bool {
        self.instruments
            .get(&id)
            .is_some_and(|info| info.lines.contains(&line))
    }

    /// Control cycle length in seconds.
    pub fn cycle_duration(&self) -> f64 {
        if self.sample_rate > 0.0 {
            self.ksmps as f64 / self.sample_rate
        } else {
            0.0
        }
    }
}

/// A synthesis runtime driven one control cycle at a time.
pub trait SynthRuntime: Send {
    /// Compile the initial orchestra. Fails with `EngineError::Compile`.
    fn compile(&mut self, code: &str) -> Result<ProgramInfo>;

    /// Acquire audio resources. Fails with `EngineError::StartupFailure`.
    fn start(&mut self) -> Result<()>;

    /// Compile and merge a code fragment into the running program.
    fn evaluate(&mut self, fragment: &str) -> Result<ProgramInfo>;

    /// Queue a score event. Fails with `EngineError::InvalidTarget` for
    /// unknown instruments.
    fn schedule(&mut self, event: ScoreEvent) -> Result<()>;

    /// Perform exactly one control cycle.
    fn perform_cycle(&mut self, channels: &ChannelBus) -> std::result::Result<CycleInfo, RuntimeFault>;

    /// Session time in seconds at the start of the next cycle.
    fn time(&self) -> f64;

    /// Control cycle length in seconds.
    fn cycle_duration(&self) -> f64;

    /// Drop every pending event and active instance.
    fn reset(&mut self);

    /// Read one value of a function table. Fails with
    /// `EngineError::InvalidTarget` for unknown tables and
    /// `EngineError::InvalidArgument` for indices past the end.
    fn table_get(&self, table: TableId, index: usize) -> Result<f64>;

    /// Write one value of a function table; same failures as `table_get`.
    fn table_set(&mut self, table: TableId, index: usize, value: f64) -> Result<()>;

    /// Restart the score at its offset. Score events not yet activated are
    /// dropped and replayed from there; running instances are untouched.
    fn rewind_score(&mut self);

    /// Move the score start to `seconds` and seek there. Score events
    /// before the offset are skipped.
    fn set_score_offset(&mut self, seconds: f64) -> Result<()>;

    /// Hold (`false`) or resume (`true`) score playback. Events sent while
    /// the score is held still run.
    fn set_score_pending(&mut self, pending: bool);

    fn score_state(&self) -> ScoreState;

    /// Console output produced since the last call, oldest first.
    fn take_messages(&mut self) -> Vec<String>;
}

/// Builds a fresh runtime for each session.
pub type RuntimeFactory = Box<dyn Fn(&EngineConfig) -> Box<dyn SynthRuntime> + Send + Sync>;

/// Factory for the built-in [`SimRuntime`].
pub fn sim_factory() -> RuntimeFactory {
    Box::new(|config: &EngineConfig| Box::new(SimRuntime::new(config.max_sample_rate)))
}
