//! A single event sheet: timed rows plus loop/tempo/sync playback state.
//!
//! Row times are in beats from the start of the sheet. A free-running
//! sheet advances its own playhead by the beat length of each control
//! cycle; a synced sheet copies its position from an external clock.

use crate::error::{EngineError, Result};
use crate::runtime::InstrumentId;
use crate::timing::{beats_to_seconds, clamp_bpm, EPSILON};
use crate::value::Value;
use serde::{Deserialize, Serialize};

/// What a row drives when it fires.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowTarget {
    /// Start an instrument. `payload[0]` is the duration in beats, the
    /// remaining fields become p4 onward.
    Instrument(InstrumentId),
    /// Write `payload[0]` to a channel.
    Channel(String),
}

impl std::fmt::Display for RowTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RowTarget::Instrument(id) => write!(f, "instr {}", id),
            RowTarget::Channel(name) => write!(f, "channel '{}'", name),
        }
    }
}

/// One row of a sheet.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventRow {
    /// Offset from the sheet start, in beats.
    pub time: f64,
    pub target: RowTarget,
    #[serde(default)]
    pub payload: Vec<Value>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl EventRow {
    pub fn new(time: f64, target: RowTarget) -> Self {
        Self {
            time,
            target,
            payload: Vec::new(),
            active: true,
        }
    }

    pub fn with_payload(mut self, value: impl Into<Value>) -> Self {
        self.payload.push(value.into());
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }
}

/// Loop bounds in beats, `[start, end)`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LoopRegion {
    pub start: f64,
    pub end: f64,
    pub enabled: bool,
}

impl LoopRegion {
    pub fn new(start: f64, end: f64) -> Result<Self> {
        if !(start.is_finite() && end.is_finite()) || start < 0.0 || start > end {
            return Err(EngineError::InvalidArgument(format!(
                "loop region [{}, {}) is invalid",
                start, end
            )));
        }
        Ok(Self {
            start,
            end,
            enabled: false,
        })
    }

    pub fn length(&self) -> f64 {
        self.end - self.start
    }

    /// Enabled and not empty; a zero-length region never loops.
    pub fn is_active(&self) -> bool {
        self.enabled && self.length() > EPSILON
    }

    /// Whether `position` has reached the loop end. Positions within
    /// `EPSILON` below the end count as reached.
    fn reached_end(&self, position: f64) -> bool {
        self.is_active() && position >= self.end - EPSILON
    }

    /// Fold a position at or past the end back into the region, keeping
    /// overshoot. A position just short of the end lands on `start`.
    fn wrap(&self, position: f64) -> f64 {
        let overshoot = (position - self.end).max(0.0);
        self.start + overshoot.rem_euclid(self.length())
    }
}

/// Where a sheet takes its playhead from.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Advance independently at the sheet tempo.
    #[default]
    Free,
    /// Follow the shared transport clock.
    Transport,
    /// Follow another sheet's playhead.
    Sheet(String),
}

/// One-shot dispatch of a whole sheet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendMode {
    /// Every active row now, in row order, ignoring row times.
    Immediate,
    /// Every active row, keeping relative spacing; the earliest row fires now.
    Relative,
}

/// Persisted shape of a sheet.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SheetRecord {
    pub name: String,
    #[serde(default)]
    pub rows: Vec<EventRow>,
    pub tempo: f64,
    #[serde(default)]
    pub loop_region: LoopRegion,
    #[serde(default)]
    pub sync: SyncMode,
}

#[derive(Clone, Debug)]
struct SheetRow {
    row: EventRow,
    seq: u64,
    emitted: bool,
    last_cycle: Option<u64>,
}

/// An editable, playable event sheet.
#[derive(Clone, Debug)]
pub struct EventSheet {
    name: String,
    rows: Vec<SheetRow>,
    next_seq: u64,
    tempo: f64,
    loop_region: LoopRegion,
    sync: SyncMode,
    playhead: f64,
    /// Rows before this position are out of the current pass.
    window_start: f64,
    /// Last external clock position seen while synced.
    last_source: Option<f64>,
    running: bool,
}

impl EventSheet {
    pub fn new(name: impl Into<String>, tempo: f64) -> Self {
        Self {
            name: name.into(),
            rows: Vec::new(),
            next_seq: 0,
            tempo: clamp_bpm(tempo),
            loop_region: LoopRegion::default(),
            sync: SyncMode::Free,
            playhead: 0.0,
            window_start: 0.0,
            last_source: None,
            running: false,
        }
    }

    pub fn from_record(record: SheetRecord) -> Result<Self> {
        let region = LoopRegion::new(record.loop_region.start, record.loop_region.end)?;
        let mut sheet = Self::new(record.name, record.tempo);
        sheet.loop_region = LoopRegion {
            enabled: record.loop_region.enabled,
            ..region
        };
        sheet.sync = record.sync;
        for row in record.rows {
            sheet.insert_row(None, row);
        }
        Ok(sheet)
    }

    pub fn to_record(&self) -> SheetRecord {
        SheetRecord {
            name: self.name.clone(),
            rows: self.rows(),
            tempo: self.tempo,
            loop_region: self.loop_region,
            sync: self.sync.clone(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rows(&self) -> Vec<EventRow> {
        self.rows.iter().map(|r| r.row.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn tempo(&self) -> f64 {
        self.tempo
    }

    pub fn set_tempo(&mut self, bpm: f64) {
        self.tempo = clamp_bpm(bpm);
    }

    pub fn loop_region(&self) -> LoopRegion {
        self.loop_region
    }

    pub fn set_loop(&mut self, start: f64, end: f64) -> Result<()> {
        let region = LoopRegion::new(start, end)?;
        self.loop_region = LoopRegion {
            enabled: self.loop_region.enabled,
            ..region
        };
        Ok(())
    }

    pub fn enable_loop(&mut self, enabled: bool) {
        self.loop_region.enabled = enabled;
    }

    pub fn sync(&self) -> &SyncMode {
        &self.sync
    }

    pub fn set_sync(&mut self, sync: SyncMode) {
        self.sync = sync;
        self.last_source = None;
    }

    pub fn playhead(&self) -> f64 {
        self.playhead
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn start(&mut self) {
        self.running = true;
        self.last_source = None;
    }

    pub fn stop(&mut self) {
        self.running = false;
    }

    /// Move the playhead. Rows at or after `position` fire again.
    pub fn seek(&mut self, position: f64) {
        self.playhead = position.max(0.0);
        self.window_start = self.playhead;
        self.last_source = None;
        for r in self.rows.iter_mut() {
            r.emitted = false;
        }
    }

    /// Insert a row at `index` (append when `None` or past the end).
    /// Returns the index the row landed at.
    pub fn insert_row(&mut self, index: Option<usize>, row: EventRow) -> usize {
        let index = index.unwrap_or(self.rows.len()).min(self.rows.len());
        let emitted = row.time < self.playhead - EPSILON;
        self.rows.insert(
            index,
            SheetRow {
                row,
                seq: self.next_seq,
                emitted,
                last_cycle: None,
            },
        );
        self.next_seq += 1;
        index
    }

    /// Replace a row in place. The row keeps its position in tie-breaks.
    pub fn update_row(&mut self, index: usize, row: EventRow) -> Result<()> {
        let playhead = self.playhead;
        let slot = self.row_mut(index)?;
        slot.emitted = row.time < playhead - EPSILON;
        slot.row = row;
        Ok(())
    }

    pub fn remove_row(&mut self, index: usize) -> Result<EventRow> {
        self.row_mut(index)?;
        Ok(self.rows.remove(index).row)
    }

    fn row_mut(&mut self, index: usize) -> Result<&mut SheetRow> {
        let name = &self.name;
        let len = self.rows.len();
        self.rows.get_mut(index).ok_or_else(|| {
            EngineError::InvalidArgument(format!(
                "sheet '{}' has no row {} ({} rows)",
                name, index, len
            ))
        })
    }

    /// Active rows for a one-shot send, each with its delay in seconds.
    pub fn send_rows(&self, mode: SendMode) -> Vec<(f64, EventRow)> {
        let mut active: Vec<&SheetRow> = self.rows.iter().filter(|r| r.row.active).collect();
        match mode {
            SendMode::Immediate => active.iter().map(|r| (0.0, r.row.clone())).collect(),
            SendMode::Relative => {
                let origin = active
                    .iter()
                    .map(|r| r.row.time)
                    .fold(f64::INFINITY, f64::min);
                active.sort_by(|a, b| a.row.time.total_cmp(&b.row.time).then(a.seq.cmp(&b.seq)));
                active
                    .iter()
                    .map(|r| (beats_to_seconds(r.row.time - origin, self.tempo), r.row.clone()))
                    .collect()
            }
        }
    }

    /// Rows due up to `upto` that have not fired in this pass, in time
    /// order with ties broken by insertion order.
    fn collect_due(&mut self, upto: f64, cycle: u64) -> Vec<EventRow> {
        let window_start = self.window_start;
        let mut due: Vec<&mut SheetRow> = self
            .rows
            .iter_mut()
            .filter(|r| {
                !r.emitted
                    && r.row.active
                    && r.row.time >= window_start - EPSILON
                    && r.row.time <= upto + EPSILON
            })
            .collect();
        due.sort_by(|a, b| a.row.time.total_cmp(&b.row.time).then(a.seq.cmp(&b.seq)));
        due.into_iter()
            .map(|r| {
                r.emitted = true;
                r.last_cycle = Some(cycle);
                r.row.clone()
            })
            .collect()
    }

    fn rearm_all(&mut self) {
        for r in self.rows.iter_mut() {
            r.emitted = false;
        }
    }

    /// Advance a free-running sheet by `delta` beats.
    ///
    /// Returns the rows that fire this cycle. When the playhead crosses the
    /// loop end, the remainder of the pass (including rows exactly at the
    /// end) fires first, then the playhead wraps with its overshoot kept and
    /// every row is re-armed.
    pub(crate) fn advance(&mut self, delta: f64, cycle: u64) -> Vec<EventRow> {
        let mut out = self.collect_due(self.playhead, cycle);
        let next = self.playhead + delta;
        let region = self.loop_region;

        if region.reached_end(next) {
            out.extend(self.collect_due(region.end, cycle));
            self.playhead = region.wrap(next);
            self.window_start = region.start;
            self.rearm_all();
            log::trace!("[SHEET] '{}' wrapped to {:.4}", self.name, self.playhead);
        } else {
            self.playhead = next;
        }
        out
    }

    /// Move a synced sheet to the external clock position `source`.
    ///
    /// A forward move that folds back through the loop behaves like a free
    /// wrap. A backward move of the source is a discontinuity: rows after
    /// the new position re-arm, and a row exactly at the new position
    /// re-arms unless it fired in this or the previous cycle.
    pub(crate) fn follow(&mut self, source: f64, cycle: u64) -> Vec<EventRow> {
        let region = self.loop_region;
        let position = if region.reached_end(source) {
            region.wrap(source)
        } else {
            source
        };

        let mut out = Vec::new();
        match self.last_source {
            None => self.window_start = position,
            Some(last) if source < last - EPSILON => {
                log::debug!(
                    "[SHEET] '{}' clock jumped back {:.4} -> {:.4}",
                    self.name,
                    last,
                    source
                );
                for r in self.rows.iter_mut() {
                    let at_boundary = (r.row.time - position).abs() <= EPSILON;
                    let recent = r
                        .last_cycle
                        .is_some_and(|c| c + 1 >= cycle);
                    if (r.row.time > position + EPSILON) || (at_boundary && !recent) {
                        r.emitted = false;
                    }
                }
                self.window_start = position;
            }
            Some(_) if position < self.playhead - EPSILON && region.is_active() => {
                out.extend(self.collect_due(region.end, cycle));
                self.rearm_all();
                self.window_start = region.start;
            }
            Some(_) => {}
        }

        self.last_source = Some(source);
        out.extend(self.collect_due(position, cycle));
        self.playhead = position;
        out
    }
}
