//! Cycle-driven event scheduler.
//!
//! The scheduler owns every [`EventSheet`] of a session plus the shared
//! [`TransportClock`] that synced sheets follow. Once per control cycle it
//! advances each running sheet, turns the rows that came due into runtime
//! events or channel writes, and reports playhead movement.

mod sheet;

pub use sheet::{
    EventRow, EventSheet, LoopRegion, RowTarget, SendMode, SheetRecord, SyncMode,
};

use crate::engine::{CycleContext, CycleHook, HookOutcome};
use crate::error::{EngineError, Result};
use crate::notify::Notification;
use crate::runtime::{CycleInfo, ScoreEvent};
use crate::timing::{beats_to_seconds, seconds_to_beats, TransportClock, EPSILON};
use crate::value::Value;
use std::collections::{BTreeMap, HashMap};

/// Operator edits to the sheet set, applied between cycles.
#[derive(Clone, Debug, PartialEq)]
pub enum SheetCommand {
    /// Create a sheet, replacing any sheet of the same name.
    Create(SheetRecord),
    Remove { sheet: String },
    InsertRow {
        sheet: String,
        index: Option<usize>,
        row: EventRow,
    },
    UpdateRow {
        sheet: String,
        index: usize,
        row: EventRow,
    },
    RemoveRow { sheet: String, index: usize },
    SetTempo { sheet: String, bpm: f64 },
    SetLoop { sheet: String, start: f64, end: f64 },
    EnableLoop { sheet: String, enabled: bool },
    SetSync { sheet: String, sync: SyncMode },
    Start { sheet: String },
    Stop { sheet: String },
    Seek { sheet: String, position: f64 },
    Send { sheet: String, mode: SendMode },
    Transport(TransportCommand),
}

/// Edits to the shared transport.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum TransportCommand {
    SetTempo(f64),
    Start,
    Stop,
    Seek(f64),
}

/// Published state of one sheet.
#[derive(Clone, Debug, PartialEq)]
pub struct SheetView {
    pub record: SheetRecord,
    pub playhead: f64,
    pub running: bool,
}

/// Published state of the shared transport.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TransportView {
    pub bpm: f64,
    pub running: bool,
    pub position: f64,
}

/// A channel write from a relative send, waiting for its time.
#[derive(Clone, Debug)]
struct DelayedWrite {
    due: f64,
    seq: u64,
    sheet: String,
    channel: String,
    value: Value,
}

/// Owner of all sheets of a session.
pub struct EventScheduler {
    sheets: BTreeMap<String, EventSheet>,
    transport: TransportClock,
    delayed: Vec<DelayedWrite>,
    next_delay_seq: u64,
    cycle: u64,
}

impl EventScheduler {
    /// Create a scheduler whose transport starts at `default_tempo`.
    pub fn new(default_tempo: f64) -> Self {
        Self {
            sheets: BTreeMap::new(),
            transport: TransportClock::new(default_tempo),
            delayed: Vec::new(),
            next_delay_seq: 0,
            cycle: 0,
        }
    }

    pub fn sheet(&self, name: &str) -> Option<&EventSheet> {
        self.sheets.get(name)
    }

    pub fn views(&self) -> Vec<SheetView> {
        self.sheets
            .values()
            .map(|sheet| SheetView {
                record: sheet.to_record(),
                playhead: sheet.playhead(),
                running: sheet.is_running(),
            })
            .collect()
    }

    pub fn transport_view(&self) -> TransportView {
        TransportView {
            bpm: self.transport.bpm(),
            running: self.transport.is_running(),
            position: self.transport.position(),
        }
    }

    fn sheet_mut(&mut self, name: &str) -> Result<&mut EventSheet> {
        self.sheets
            .get_mut(name)
            .ok_or_else(|| EngineError::InvalidTarget(format!("sheet '{}'", name)))
    }

    /// Check that `sheet` may follow `source` without forming a cycle.
    fn check_follow(&self, sheet: &str, source: &str) -> Result<()> {
        if !self.sheets.contains_key(source) {
            return Err(EngineError::InvalidTarget(format!("sheet '{}'", source)));
        }
        let mut current = source.to_string();
        for _ in 0..=self.sheets.len() {
            if current == sheet {
                return Err(EngineError::InvalidArgument(format!(
                    "sheet '{}' cannot follow '{}': sync loop",
                    sheet, source
                )));
            }
            match self.sheets.get(&current).map(EventSheet::sync) {
                Some(SyncMode::Sheet(next)) => current = next.clone(),
                _ => return Ok(()),
            }
        }
        Ok(())
    }

    /// Apply an operator edit.
    pub fn apply(&mut self, command: SheetCommand, ctx: &mut CycleContext<'_>) -> Result<()> {
        log::debug!("[SHEET] {:?}", command);
        match command {
            SheetCommand::Create(record) => {
                let mut sheet = EventSheet::from_record(record)?;
                if let SyncMode::Sheet(source) = sheet.sync().clone() {
                    if let Err(e) = self.check_follow(sheet.name(), &source) {
                        log::warn!("[SHEET] '{}' created unsynced: {}", sheet.name(), e);
                        sheet.set_sync(SyncMode::Free);
                    }
                }
                self.sheets.insert(sheet.name().to_string(), sheet);
            }
            SheetCommand::Remove { sheet } => {
                self.sheet_mut(&sheet)?;
                self.sheets.remove(&sheet);
                self.delayed.retain(|d| d.sheet != sheet);
            }
            SheetCommand::InsertRow { sheet, index, row } => {
                self.sheet_mut(&sheet)?.insert_row(index, row);
            }
            SheetCommand::UpdateRow { sheet, index, row } => {
                self.sheet_mut(&sheet)?.update_row(index, row)?;
            }
            SheetCommand::RemoveRow { sheet, index } => {
                self.sheet_mut(&sheet)?.remove_row(index)?;
            }
            SheetCommand::SetTempo { sheet, bpm } => self.sheet_mut(&sheet)?.set_tempo(bpm),
            SheetCommand::SetLoop { sheet, start, end } => {
                self.sheet_mut(&sheet)?.set_loop(start, end)?;
            }
            SheetCommand::EnableLoop { sheet, enabled } => {
                self.sheet_mut(&sheet)?.enable_loop(enabled);
            }
            SheetCommand::SetSync { sheet, sync } => {
                self.sheet_mut(&sheet)?;
                if let SyncMode::Sheet(source) = &sync {
                    self.check_follow(&sheet, source)?;
                }
                self.sheet_mut(&sheet)?.set_sync(sync);
            }
            SheetCommand::Start { sheet } => self.sheet_mut(&sheet)?.start(),
            SheetCommand::Stop { sheet } => self.sheet_mut(&sheet)?.stop(),
            SheetCommand::Seek { sheet, position } => {
                let sheet = self.sheet_mut(&sheet)?;
                sheet.seek(position);
                let position = sheet.playhead();
                let name = sheet.name().to_string();
                ctx.notify(Notification::SheetPlayheadChanged {
                    sheet: name,
                    position,
                });
            }
            SheetCommand::Send { sheet, mode } => self.send(&sheet, mode, ctx)?,
            SheetCommand::Transport(command) => match command {
                TransportCommand::SetTempo(bpm) => self.transport.set_bpm(bpm),
                TransportCommand::Start => self.transport.start(),
                TransportCommand::Stop => self.transport.stop(),
                TransportCommand::Seek(beat) => self.transport.seek(beat),
            },
        }
        Ok(())
    }

    /// One-shot dispatch of a whole sheet. The playhead does not move.
    fn send(&mut self, name: &str, mode: SendMode, ctx: &mut CycleContext<'_>) -> Result<()> {
        let sheet = self
            .sheets
            .get(name)
            .ok_or_else(|| EngineError::InvalidTarget(format!("sheet '{}'", name)))?;
        let tempo = sheet.tempo();
        let rows = sheet.send_rows(mode);

        log::debug!("[SHEET] send '{}' ({:?}, {} rows)", name, mode, rows.len());
        let mut first_error = None;
        for (delay, row) in rows {
            if let Err(e) = self.dispatch(name, &row, delay, tempo, ctx) {
                first_error.get_or_insert(e);
            }
        }
        self.report(name, first_error, ctx);
        Ok(())
    }

    /// Turn one row into a runtime event or channel write.
    fn dispatch(
        &mut self,
        sheet: &str,
        row: &EventRow,
        delay: f64,
        tempo: f64,
        ctx: &mut CycleContext<'_>,
    ) -> Result<()> {
        match &row.target {
            RowTarget::Instrument(id) => {
                let beats = match row.payload.first() {
                    None => 1.0,
                    Some(Value::Scalar(beats)) => *beats,
                    Some(Value::Text(_)) => {
                        return Err(EngineError::InvalidArgument(format!(
                            "duration of a row for instr {} must be numeric",
                            id
                        )))
                    }
                };
                let event = ScoreEvent {
                    instrument: *id,
                    start: delay,
                    duration: beats_to_seconds(beats, tempo),
                    pfields: row.payload.iter().skip(1).cloned().collect(),
                };
                ctx.send_event(event)
            }
            RowTarget::Channel(channel) => {
                let value = row.payload.first().cloned().ok_or_else(|| {
                    EngineError::InvalidArgument(format!(
                        "row for channel '{}' carries no value",
                        channel
                    ))
                })?;
                if delay <= EPSILON {
                    return ctx.write_channel(channel, value);
                }
                ctx.channels.check(channel, &value)?;
                self.delayed.push(DelayedWrite {
                    due: ctx.runtime.time() + delay,
                    seq: self.next_delay_seq,
                    sheet: sheet.to_string(),
                    channel: channel.clone(),
                    value,
                });
                self.next_delay_seq += 1;
                Ok(())
            }
        }
    }

    fn report(&self, sheet: &str, error: Option<EngineError>, ctx: &CycleContext<'_>) {
        if let Some(error) = error {
            log::warn!("[SHEET] '{}' dispatch failed: {}", sheet, error);
            ctx.notify(Notification::SheetError {
                sheet: sheet.to_string(),
                cycle: self.cycle,
                error,
            });
        }
    }

    /// Sheet names with every sync source ahead of its followers.
    fn processing_order(&self) -> Vec<String> {
        let depth = |name: &str| {
            let mut depth = 0;
            let mut current = name;
            while let Some(SyncMode::Sheet(source)) = self.sheets.get(current).map(EventSheet::sync) {
                depth += 1;
                if depth > self.sheets.len() {
                    break;
                }
                current = source.as_str();
            }
            depth
        };
        let mut names: Vec<(usize, String)> = self
            .sheets
            .keys()
            .map(|name| (depth(name), name.clone()))
            .collect();
        names.sort();
        names.into_iter().map(|(_, name)| name).collect()
    }

    /// Apply delayed writes due by `until`; returns the first failure per sheet.
    fn flush_delayed(
        &mut self,
        until: f64,
        ctx: &mut CycleContext<'_>,
    ) -> BTreeMap<String, EngineError> {
        let mut errors = BTreeMap::new();
        if self.delayed.is_empty() {
            return errors;
        }
        self.delayed
            .sort_by(|a, b| a.due.total_cmp(&b.due).then(a.seq.cmp(&b.seq)));
        let due = self
            .delayed
            .iter()
            .take_while(|d| d.due <= until + EPSILON)
            .count();
        for write in self.delayed.drain(..due).collect::<Vec<_>>() {
            if let Err(e) = ctx.write_channel(&write.channel, write.value) {
                errors.entry(write.sheet).or_insert(e);
            }
        }
        errors
    }

    /// Advance every running sheet by one control cycle.
    pub fn tick(&mut self, cycle: &CycleInfo, ctx: &mut CycleContext<'_>) {
        self.cycle = cycle.cycle;
        let mut delayed_errors = self.flush_delayed(cycle.time + cycle.duration, ctx);

        let mut cursors: HashMap<String, f64> = HashMap::new();
        let transport_position = self.transport.position();

        for name in self.processing_order() {
            let Some(sheet) = self.sheets.get_mut(&name) else {
                continue;
            };
            let before = sheet.playhead();
            if !sheet.is_running() {
                cursors.insert(name, before);
                continue;
            }

            let (cursor, rows) = match sheet.sync().clone() {
                SyncMode::Free => {
                    let delta = seconds_to_beats(cycle.duration, sheet.tempo());
                    (before, sheet.advance(delta, cycle.cycle))
                }
                SyncMode::Transport => {
                    let rows = sheet.follow(transport_position, cycle.cycle);
                    (sheet.playhead(), rows)
                }
                SyncMode::Sheet(source) => match cursors.get(&source) {
                    Some(position) => {
                        let rows = sheet.follow(*position, cycle.cycle);
                        (sheet.playhead(), rows)
                    }
                    None => (before, Vec::new()),
                },
            };
            cursors.insert(name.clone(), cursor);

            let tempo = sheet.tempo();
            let after = sheet.playhead();
            let mut first_error = delayed_errors.remove(&name);
            for row in &rows {
                log::trace!("[SHEET] '{}' fires {} at beat {}", name, row.target, row.time);
                if let Err(e) = self.dispatch(&name, row, 0.0, tempo, ctx) {
                    first_error.get_or_insert(e);
                }
            }
            self.report(&name, first_error, ctx);

            if (after - before).abs() > EPSILON {
                ctx.notify(Notification::SheetPlayheadChanged {
                    sheet: name,
                    position: after,
                });
            }
        }

        // Writes from sheets deleted after sending.
        for (sheet, error) in delayed_errors {
            self.report(&sheet, Some(error), ctx);
        }
        self.transport.advance(cycle.duration);
    }
}

impl CycleHook for EventScheduler {
    fn on_cycle(&mut self, cycle: &CycleInfo, ctx: &mut CycleContext<'_>) -> HookOutcome {
        self.tick(cycle, ctx);
        HookOutcome::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::{ChannelBus, WriterKind};
    use crate::notify::Notifier;
    use crate::runtime::{SimRuntime, SynthRuntime};

    const ORC: &str = "sr = 100\nksmps = 50\ninstr 1\n  kx = p4\nendin\n";

    struct Fixture {
        runtime: SimRuntime,
        channels: ChannelBus,
        notifier: Notifier,
        scheduler: EventScheduler,
    }

    impl Fixture {
        // Two cycles per second; at 60 BPM each cycle is half a beat.
        fn new() -> Self {
            let mut runtime = SimRuntime::new(192_000);
            runtime.compile(ORC).unwrap();
            Self {
                runtime,
                channels: ChannelBus::new(),
                notifier: Notifier::new(),
                scheduler: EventScheduler::new(60.0),
            }
        }

        fn apply(&mut self, command: SheetCommand) -> Result<()> {
            let mut ctx = CycleContext {
                runtime: &mut self.runtime,
                channels: &self.channels,
                notifier: &self.notifier,
            };
            self.scheduler.apply(command, &mut ctx)
        }

        fn cycle(&mut self) -> CycleInfo {
            let info = self.runtime.perform_cycle(&self.channels).unwrap();
            let mut ctx = CycleContext {
                runtime: &mut self.runtime,
                channels: &self.channels,
                notifier: &self.notifier,
            };
            self.scheduler.on_cycle(&info, &mut ctx);
            info
        }
    }

    fn create(name: &str, rows: Vec<EventRow>) -> SheetCommand {
        SheetCommand::Create(SheetRecord {
            name: name.to_string(),
            rows,
            tempo: 60.0,
            loop_region: LoopRegion::default(),
            sync: SyncMode::Free,
        })
    }

    fn start(name: &str) -> SheetCommand {
        SheetCommand::Start {
            sheet: name.to_string(),
        }
    }

    #[test]
    fn test_channel_rows_write_bus() {
        let mut fx = Fixture::new();
        let rows = vec![
            EventRow::new(0.0, RowTarget::Channel("cut".into())).with_payload(100.0),
            EventRow::new(1.0, RowTarget::Channel("cut".into())).with_payload(200.0),
        ];
        fx.apply(create("a", rows)).unwrap();
        fx.apply(start("a")).unwrap();

        fx.cycle();
        assert_eq!(fx.channels.get("cut"), Some(Value::Scalar(100.0)));
        fx.cycle();
        fx.cycle();
        assert_eq!(fx.channels.get("cut"), Some(Value::Scalar(200.0)));
    }

    #[test]
    fn test_instrument_rows_schedule_events() {
        let mut fx = Fixture::new();
        let row = EventRow::new(0.0, RowTarget::Instrument(1))
            .with_payload(1.0)
            .with_payload(7.0);
        fx.apply(create("a", vec![row])).unwrap();
        fx.apply(start("a")).unwrap();

        assert!(fx.cycle().activations.is_empty());
        let info = fx.cycle();
        assert_eq!(info.activations.len(), 1);
        assert_eq!(info.activations[0].variables.get("kx"), Some(&Value::Scalar(7.0)));
    }

    #[test]
    fn test_dispatch_errors_reported_once_per_sheet() {
        let mut fx = Fixture::new();
        let rx = fx.notifier.subscribe();
        let rows = vec![
            EventRow::new(0.0, RowTarget::Instrument(9)),
            EventRow::new(0.0, RowTarget::Instrument(8)),
        ];
        fx.apply(create("a", rows)).unwrap();
        fx.apply(start("a")).unwrap();
        fx.cycle();

        let errors: Vec<_> = rx
            .try_iter()
            .filter(|n| matches!(n, Notification::SheetError { .. }))
            .collect();
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn test_playhead_notifications() {
        let mut fx = Fixture::new();
        let rx = fx.notifier.subscribe();
        fx.apply(create("a", Vec::new())).unwrap();
        fx.cycle();
        assert_eq!(rx.try_iter().count(), 0);

        fx.apply(start("a")).unwrap();
        fx.cycle();
        let positions: Vec<f64> = rx
            .try_iter()
            .filter_map(|n| match n {
                Notification::SheetPlayheadChanged { position, .. } => Some(position),
                _ => None,
            })
            .collect();
        assert_eq!(positions, vec![0.5]);
    }

    #[test]
    fn test_transport_sync_and_backward_seek() {
        let mut fx = Fixture::new();
        let rows = vec![
            EventRow::new(0.0, RowTarget::Channel("n".into())).with_payload(0.0),
            EventRow::new(1.0, RowTarget::Channel("n".into())).with_payload(1.0),
        ];
        fx.apply(SheetCommand::Create(SheetRecord {
            name: "follow".to_string(),
            rows,
            tempo: 60.0,
            loop_region: LoopRegion::default(),
            sync: SyncMode::Transport,
        }))
        .unwrap();
        fx.apply(start("follow")).unwrap();
        fx.apply(SheetCommand::Transport(TransportCommand::Start)).unwrap();

        for _ in 0..3 {
            fx.cycle();
        }
        assert_eq!(fx.channels.get("n"), Some(Value::Scalar(1.0)));

        fx.apply(SheetCommand::Transport(TransportCommand::Seek(0.0))).unwrap();
        fx.cycle();
        assert_eq!(fx.channels.get("n"), Some(Value::Scalar(0.0)));
        assert!(fx.scheduler.sheet("follow").unwrap().playhead().abs() < 1e-9);
    }

    #[test]
    fn test_sheet_follows_sheet() {
        let mut fx = Fixture::new();
        fx.apply(create("lead", Vec::new())).unwrap();
        fx.apply(create(
            "follower",
            vec![EventRow::new(1.0, RowTarget::Channel("f".into())).with_payload(1.0)],
        ))
        .unwrap();
        fx.apply(SheetCommand::SetSync {
            sheet: "follower".into(),
            sync: SyncMode::Sheet("lead".into()),
        })
        .unwrap();
        fx.apply(start("lead")).unwrap();
        fx.apply(start("follower")).unwrap();

        fx.cycle();
        fx.cycle();
        assert!(fx.channels.get("f").is_none());
        fx.cycle();
        assert_eq!(fx.channels.get("f"), Some(Value::Scalar(1.0)));
    }

    #[test]
    fn test_sync_loop_rejected() {
        let mut fx = Fixture::new();
        fx.apply(create("a", Vec::new())).unwrap();
        fx.apply(create("b", Vec::new())).unwrap();
        fx.apply(SheetCommand::SetSync {
            sheet: "b".into(),
            sync: SyncMode::Sheet("a".into()),
        })
        .unwrap();
        let err = fx
            .apply(SheetCommand::SetSync {
                sheet: "a".into(),
                sync: SyncMode::Sheet("b".into()),
            })
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(_)));
        assert!(matches!(
            fx.apply(SheetCommand::SetSync {
                sheet: "a".into(),
                sync: SyncMode::Sheet("missing".into()),
            }),
            Err(EngineError::InvalidTarget(_))
        ));
    }

    #[test]
    fn test_relative_send_delays_channel_writes() {
        let mut fx = Fixture::new();
        let rows = vec![
            EventRow::new(2.0, RowTarget::Channel("r".into())).with_payload(1.0),
            EventRow::new(3.0, RowTarget::Channel("r".into())).with_payload(2.0),
        ];
        fx.apply(create("a", rows)).unwrap();
        fx.apply(SheetCommand::Send {
            sheet: "a".into(),
            mode: SendMode::Relative,
        })
        .unwrap();
        assert_eq!(fx.channels.get("r"), Some(Value::Scalar(1.0)));

        fx.cycle();
        assert_eq!(fx.channels.get("r"), Some(Value::Scalar(1.0)));
        fx.cycle();
        assert_eq!(fx.channels.get("r"), Some(Value::Scalar(2.0)));
        assert!(fx.scheduler.sheet("a").unwrap().playhead().abs() < 1e-9);
    }

    #[test]
    fn test_delayed_and_row_errors_share_one_report() {
        let mut fx = Fixture::new();
        let rx = fx.notifier.subscribe();
        let rows = vec![
            EventRow::new(0.0, RowTarget::Instrument(9)),
            EventRow::new(0.5, RowTarget::Channel("late".into())).with_payload(1.0),
        ];
        fx.apply(create("a", rows)).unwrap();
        fx.apply(SheetCommand::Send {
            sheet: "a".into(),
            mode: SendMode::Relative,
        })
        .unwrap();
        rx.try_iter().for_each(drop);

        fx.channels
            .set("late", Value::from("off"), WriterKind::Widget)
            .unwrap();
        fx.apply(start("a")).unwrap();
        fx.cycle();

        let errors: Vec<_> = rx
            .try_iter()
            .filter(|n| matches!(n, Notification::SheetError { .. }))
            .collect();
        assert_eq!(errors.len(), 1);
        assert_eq!(fx.channels.get("late"), Some(Value::from("off")));
    }

    #[test]
    fn test_unknown_sheet() {
        let mut fx = Fixture::new();
        assert!(matches!(
            fx.apply(start("nope")),
            Err(EngineError::InvalidTarget(_))
        ));
    }
}
