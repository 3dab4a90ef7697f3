//! Built-in simulated runtime.
//!
//! Interprets the orchestra language parsed by [`super::orchestra`] one
//! control cycle at a time. There is no audio output: a cycle evaluates the
//! body of every active instance, moves channel and table values, and
//! reports what ran.
//!
//! Score lines of the compiled orchestra play on the score clock (see
//! [`ScoreState`]); score lines inside evaluated fragments are scheduled
//! relative to the moment they are evaluated.

use super::orchestra::{self, BinOp, Expr, InstrumentDef, ParsedCode, Rate, StatementKind};
use super::{
    Activation, CycleInfo, InstrumentId, InstrumentInfo, ProgramInfo, ScoreEvent, ScoreState,
    SynthRuntime, TableId,
};
use crate::channels::{ChannelBus, WriterKind};
use crate::error::{EngineError, Result, RuntimeFault};
use crate::value::{Value, ValueKind};
use std::collections::BTreeMap;

const DEFAULT_SAMPLE_RATE: f64 = 44100.0;
const DEFAULT_KSMPS: u32 = 10;
const DEFAULT_NCHNLS: u32 = 1;
const TIME_EPSILON: f64 = 1e-9;

struct PendingEvent {
    due: f64,
    seq: u64,
    event: ScoreEvent,
    /// Queued by the score clock rather than sent.
    from_score: bool,
}

struct Instance {
    id: u64,
    instrument: InstrumentId,
    pfields: Vec<Value>,
    variables: BTreeMap<String, Value>,
    k_count: u64,
    /// Session time at which the instance stops; `None` = held.
    end: Option<f64>,
    released: bool,
}

/// Simulated synthesis runtime.
pub struct SimRuntime {
    max_sample_rate: u32,
    sample_rate: f64,
    ksmps: u32,
    nchnls: u32,
    instruments: BTreeMap<InstrumentId, InstrumentDef>,
    tables: BTreeMap<TableId, Vec<f64>>,
    pending: Vec<PendingEvent>,
    active: Vec<Instance>,
    /// Compiled score, ordered by start time.
    score: Vec<ScoreEvent>,
    /// Index of the first score event not yet queued.
    score_cursor: usize,
    score_state: ScoreState,
    messages: Vec<String>,
    cycle: u64,
    next_instance: u64,
    next_seq: u64,
    compiled: bool,
}

impl SimRuntime {
    /// Create a runtime whose output device accepts sample rates up to
    /// `max_sample_rate`.
    pub fn new(max_sample_rate: u32) -> Self {
        Self {
            max_sample_rate,
            sample_rate: DEFAULT_SAMPLE_RATE,
            ksmps: DEFAULT_KSMPS,
            nchnls: DEFAULT_NCHNLS,
            instruments: BTreeMap::new(),
            tables: BTreeMap::new(),
            pending: Vec::new(),
            active: Vec::new(),
            score: Vec::new(),
            score_cursor: 0,
            score_state: ScoreState::default(),
            messages: Vec::new(),
            cycle: 0,
            next_instance: 1,
            next_seq: 0,
            compiled: false,
        }
    }

    fn program(&self) -> ProgramInfo {
        ProgramInfo {
            sample_rate: self.sample_rate,
            ksmps: self.ksmps,
            nchnls: self.nchnls,
            tables: self
                .tables
                .iter()
                .map(|(number, values)| (*number, values.len()))
                .collect(),
            instruments: self
                .instruments
                .values()
                .map(|def| {
                    (
                        def.id,
                        InstrumentInfo {
                            id: def.id,
                            first_line: def.first_line,
                            last_line: def.last_line,
                            lines: def.statements.iter().map(|s| s.line).collect(),
                        },
                    )
                })
                .collect(),
        }
    }

    /// Validate every score line of a parsed chunk against the instruments
    /// it will be merged with.
    fn check_score(&self, parsed: &ParsedCode) -> Result<()> {
        for (line, event) in &parsed.score {
            let defined = self.instruments.contains_key(&event.instrument)
                || parsed.instruments.iter().any(|i| i.id == event.instrument);
            if !defined {
                return Err(EngineError::compile(
                    *line,
                    format!("instr {} is not defined", event.instrument),
                ));
            }
        }
        Ok(())
    }

    /// Number of instances currently running.
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    fn define_tables(&mut self, parsed: &mut ParsedCode) {
        for (_, table) in parsed.tables.drain(..) {
            log::debug!(
                "[RUNTIME] table {} defined ({} values)",
                table.number,
                table.values.len()
            );
            self.tables.insert(table.number, table.values);
        }
    }

    fn table_slot(&self, table: TableId, index: usize) -> Result<&Vec<f64>> {
        let values = self
            .tables
            .get(&table)
            .ok_or_else(|| EngineError::InvalidTarget(format!("table {}", table)))?;
        if index >= values.len() {
            return Err(EngineError::InvalidArgument(format!(
                "index {} is past the end of table {} ({} values)",
                index,
                table,
                values.len()
            )));
        }
        Ok(values)
    }

    /// Drop queued score events and continue the score from `position`.
    fn seek_score(&mut self, position: f64) {
        self.pending.retain(|p| !p.from_score);
        self.score_cursor = self
            .score
            .partition_point(|event| event.start < position - TIME_EPSILON);
        self.score_state.time = position;
        log::debug!(
            "[RUNTIME] score at {:.4}s, {} event(s) ahead",
            position,
            self.score.len() - self.score_cursor
        );
    }

    /// Queue the score events that start within the next `duration` seconds
    /// of score time.
    fn feed_score(&mut self, now: f64, duration: f64) {
        if !self.score_state.pending {
            return;
        }
        let score_time = self.score_state.time;
        let window_end = score_time + duration;
        while let Some(event) = self.score.get(self.score_cursor) {
            if event.start >= window_end - TIME_EPSILON {
                break;
            }
            let event = event.clone();
            self.pending.push(PendingEvent {
                due: now + (event.start - score_time).max(0.0),
                seq: self.next_seq,
                event,
                from_score: true,
            });
            self.next_seq += 1;
            self.score_cursor += 1;
        }
        self.score_state.time = window_end;
    }

    fn run_instance(
        def: &InstrumentDef,
        instance: &mut Instance,
        channels: &ChannelBus,
        tables: &mut BTreeMap<TableId, Vec<f64>>,
        messages: &mut Vec<String>,
    ) -> std::result::Result<Vec<usize>, String> {
        let init_pass = instance.k_count == 0;
        let mut lines = Vec::with_capacity(def.statements.len());

        for statement in &def.statements {
            if statement.rate() == Rate::Init && !init_pass {
                continue;
            }
            lines.push(statement.line);
            let result = match &statement.kind {
                StatementKind::Assign { target, expr } => {
                    eval(expr, instance).map(|value| {
                        instance.variables.insert(target.clone(), value);
                    })
                }
                StatementKind::ChnGet { target, channel } => {
                    let value = channels
                        .get(channel)
                        .unwrap_or_else(|| Value::zero(variable_kind(target)));
                    instance.variables.insert(target.clone(), value);
                    Ok(())
                }
                StatementKind::ChnSet { expr, channel } => eval(expr, instance).map(|value| {
                    if let Err(e) = channels.set(channel, value, WriterKind::Engine) {
                        log::debug!("[RUNTIME] instr {} chnset skipped: {}", def.id, e);
                    }
                }),
                StatementKind::TableRead {
                    target,
                    index,
                    table,
                } => table_cell(tables, index, table, instance).map(|(values, slot)| {
                    let value = Value::Scalar(values[slot]);
                    instance.variables.insert(target.clone(), value);
                }),
                StatementKind::TableWrite {
                    value,
                    index,
                    table,
                } => eval_scalar(value, instance).and_then(|value| {
                    table_cell(tables, index, table, instance).map(|(values, slot)| {
                        values[slot] = value;
                    })
                }),
                StatementKind::Print { label, expr } => eval(expr, instance).map(|value| {
                    let text = match value {
                        Value::Scalar(v) => format!("{:.3}", v),
                        Value::Text(s) => s,
                    };
                    messages.push(format!("instr {}:  {} = {}", def.id, label, text));
                }),
                StatementKind::TurnOff => {
                    instance.released = true;
                    Ok(())
                }
            };
            result.map_err(|e| format!("instr {} line {}: {}", def.id, statement.line, e))?;
        }
        Ok(lines)
    }
}

fn variable_kind(name: &str) -> ValueKind {
    if name.starts_with('S') {
        ValueKind::Text
    } else {
        ValueKind::Scalar
    }
}

fn eval_scalar(expr: &Expr, instance: &Instance) -> std::result::Result<f64, String> {
    match eval(expr, instance)? {
        Value::Scalar(v) => Ok(v),
        Value::Text(_) => Err("table arguments must be numeric".to_string()),
    }
}

/// Resolve a table and a clamped index for `table`/`tablew`.
fn table_cell<'t>(
    tables: &'t mut BTreeMap<TableId, Vec<f64>>,
    index: &Expr,
    table: &Expr,
    instance: &Instance,
) -> std::result::Result<(&'t mut Vec<f64>, usize), String> {
    let number = eval_scalar(table, instance)?;
    if !(number >= 1.0 && number.fract() == 0.0 && number <= TableId::MAX as f64) {
        return Err(format!("table {} does not exist", number));
    }
    let values = tables
        .get_mut(&(number as TableId))
        .ok_or_else(|| format!("table {} does not exist", number))?;
    let index = eval_scalar(index, instance)?;
    let last = values.len().saturating_sub(1);
    let slot = if index.is_nan() || index <= 0.0 {
        0
    } else {
        (index.floor() as usize).min(last)
    };
    Ok((values, slot))
}

fn eval(expr: &Expr, instance: &Instance) -> std::result::Result<Value, String> {
    match expr {
        Expr::Number(v) => Ok(Value::Scalar(*v)),
        Expr::Text(s) => Ok(Value::Text(s.clone())),
        Expr::PField(n) => Ok(instance
            .pfields
            .get(n - 1)
            .cloned()
            .unwrap_or(Value::Scalar(0.0))),
        Expr::Var(name) => Ok(instance
            .variables
            .get(name)
            .cloned()
            .unwrap_or_else(|| Value::zero(variable_kind(name)))),
        Expr::Neg(inner) => match eval(inner, instance)? {
            Value::Scalar(v) => Ok(Value::Scalar(-v)),
            Value::Text(_) => Err("cannot negate a string".to_string()),
        },
        Expr::Binary(lhs, op, rhs) => {
            match (eval(lhs, instance)?, *op, eval(rhs, instance)?) {
                (Value::Scalar(a), BinOp::Add, Value::Scalar(b)) => Ok(Value::Scalar(a + b)),
                (Value::Scalar(a), BinOp::Sub, Value::Scalar(b)) => Ok(Value::Scalar(a - b)),
                (Value::Scalar(a), BinOp::Mul, Value::Scalar(b)) => Ok(Value::Scalar(a * b)),
                (Value::Scalar(_), BinOp::Div, Value::Scalar(b)) if b == 0.0 => {
                    Err("division by zero".to_string())
                }
                (Value::Scalar(a), BinOp::Div, Value::Scalar(b)) => Ok(Value::Scalar(a / b)),
                (Value::Text(a), BinOp::Add, Value::Text(b)) => Ok(Value::Text(a + &b)),
                (a, op, b) => Err(format!(
                    "cannot apply {:?} to {} and {}",
                    op,
                    a.kind(),
                    b.kind()
                )),
            }
        }
    }
}

impl SynthRuntime for SimRuntime {
    fn compile(&mut self, code: &str) -> Result<ProgramInfo> {
        let mut parsed = orchestra::parse(code)?;

        let sample_rate = parsed.sample_rate.unwrap_or(DEFAULT_SAMPLE_RATE);
        if !(sample_rate.is_finite() && sample_rate > 0.0) {
            return Err(EngineError::compile(0, "sr must be a positive number"));
        }
        let ksmps = match (parsed.ksmps, parsed.control_rate) {
            (Some(ksmps), _) => ksmps,
            (None, Some(kr)) => {
                let ratio = sample_rate / kr;
                let whole = ratio.fract() == 0.0 && (1.0..=u32::MAX as f64).contains(&ratio);
                if kr <= 0.0 || !whole {
                    return Err(EngineError::compile(0, "sr / kr must be an integer"));
                }
                ratio as u32
            }
            (None, None) => DEFAULT_KSMPS,
        };

        self.instruments.clear();
        self.check_score(&parsed)?;
        self.sample_rate = sample_rate;
        self.ksmps = ksmps;
        self.nchnls = parsed.nchnls.unwrap_or(DEFAULT_NCHNLS);
        self.tables.clear();
        self.define_tables(&mut parsed);
        self.instruments = orchestra::index(parsed.instruments);
        self.reset();
        self.messages.clear();
        self.cycle = 0;

        let mut score: Vec<ScoreEvent> = parsed.score.into_iter().map(|(_, e)| e).collect();
        score.sort_by(|a, b| a.start.total_cmp(&b.start));
        self.score = score;
        self.seek_score(self.score_state.offset);
        self.compiled = true;

        log::debug!(
            "[RUNTIME] compiled {} instrument(s), {} table(s), {} score event(s), sr={} ksmps={} nchnls={}",
            self.instruments.len(),
            self.tables.len(),
            self.score.len(),
            self.sample_rate,
            self.ksmps,
            self.nchnls
        );
        Ok(self.program())
    }

    fn start(&mut self) -> Result<()> {
        if !self.compiled {
            return Err(EngineError::StartupFailure("no orchestra compiled".to_string()));
        }
        if self.sample_rate > self.max_sample_rate as f64 {
            return Err(EngineError::StartupFailure(format!(
                "sample rate {} exceeds device maximum {}",
                self.sample_rate, self.max_sample_rate
            )));
        }
        Ok(())
    }

    fn evaluate(&mut self, fragment: &str) -> Result<ProgramInfo> {
        let mut parsed = orchestra::parse(fragment)?;
        if parsed.sample_rate.is_some()
            || parsed.ksmps.is_some()
            || parsed.control_rate.is_some()
            || parsed.nchnls.is_some()
        {
            log::warn!("[RUNTIME] header variables cannot change while running; ignored");
        }
        self.check_score(&parsed)?;
        self.define_tables(&mut parsed);
        for def in parsed.instruments {
            log::debug!("[RUNTIME] (re)defined instr {}", def.id);
            self.instruments.insert(def.id, def);
        }
        for (_, event) in parsed.score {
            self.schedule(event)?;
        }
        Ok(self.program())
    }

    fn schedule(&mut self, event: ScoreEvent) -> Result<()> {
        if !self.instruments.contains_key(&event.instrument) {
            return Err(EngineError::InvalidTarget(format!(
                "instr {} is not defined",
                event.instrument
            )));
        }
        let due = self.time() + event.start.max(0.0);
        self.pending.push(PendingEvent {
            due,
            seq: self.next_seq,
            event,
            from_score: false,
        });
        self.next_seq += 1;
        Ok(())
    }

    fn perform_cycle(&mut self, channels: &ChannelBus) -> std::result::Result<CycleInfo, RuntimeFault> {
        let time = self.time();
        let duration = self.cycle_duration();
        let cycle_end = time + duration;
        self.feed_score(time, duration);

        // Activate everything due before the end of this cycle
        self.pending.sort_by(|a, b| a.due.total_cmp(&b.due).then(a.seq.cmp(&b.seq)));
        let due_count = self
            .pending
            .iter()
            .take_while(|p| p.due < cycle_end - TIME_EPSILON)
            .count();
        for pending in self.pending.drain(..due_count) {
            let event = pending.event;
            let end = (event.duration >= 0.0).then(|| time + event.duration.max(duration));
            log::trace!(
                "[RUNTIME] activate instr {} as instance {}",
                event.instrument,
                self.next_instance
            );
            self.active.push(Instance {
                id: self.next_instance,
                instrument: event.instrument,
                pfields: event.all_pfields(),
                variables: BTreeMap::new(),
                k_count: 0,
                end,
                released: false,
            });
            self.next_instance += 1;
        }

        self.active.sort_by_key(|i| (i.instrument, i.id));

        let mut activations = Vec::with_capacity(self.active.len());
        for instance in self.active.iter_mut() {
            let Some(def) = self.instruments.get(&instance.instrument) else {
                instance.released = true;
                continue;
            };
            let lines = Self::run_instance(
                def,
                instance,
                channels,
                &mut self.tables,
                &mut self.messages,
            )
            .map_err(|message| {
                RuntimeFault {
                    cycle: self.cycle,
                    message,
                }
            })?;
            instance.k_count += 1;
            activations.push(Activation {
                instrument: instance.instrument,
                instance: instance.id,
                pfields: instance.pfields.clone(),
                k_count: instance.k_count,
                lines,
                variables: instance.variables.clone(),
            });
        }

        self.active.retain(|i| {
            !i.released && i.end.map_or(true, |end| end > cycle_end + TIME_EPSILON)
        });

        let info = CycleInfo {
            cycle: self.cycle,
            time,
            duration,
            activations,
        };
        self.cycle += 1;
        Ok(info)
    }

    fn time(&self) -> f64 {
        self.cycle as f64 * self.cycle_duration()
    }

    fn cycle_duration(&self) -> f64 {
        self.ksmps as f64 / self.sample_rate
    }

    fn reset(&mut self) {
        self.pending.clear();
        self.active.clear();
    }

    fn table_get(&self, table: TableId, index: usize) -> Result<f64> {
        Ok(self.table_slot(table, index)?[index])
    }

    fn table_set(&mut self, table: TableId, index: usize, value: f64) -> Result<()> {
        self.table_slot(table, index)?;
        if let Some(values) = self.tables.get_mut(&table) {
            values[index] = value;
        }
        Ok(())
    }

    fn rewind_score(&mut self) {
        log::debug!("[RUNTIME] score rewound");
        self.seek_score(self.score_state.offset);
    }

    fn set_score_offset(&mut self, seconds: f64) -> Result<()> {
        if !(seconds.is_finite() && seconds >= 0.0) {
            return Err(EngineError::InvalidArgument(format!(
                "score offset {} must be a non-negative number of seconds",
                seconds
            )));
        }
        self.score_state.offset = seconds;
        self.seek_score(seconds);
        Ok(())
    }

    fn set_score_pending(&mut self, pending: bool) {
        self.score_state.pending = pending;
    }

    fn score_state(&self) -> ScoreState {
        self.score_state
    }

    fn take_messages(&mut self) -> Vec<String> {
        std::mem::take(&mut self.messages)
    }
}
