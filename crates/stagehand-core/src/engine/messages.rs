//! Commands sent from the operator side to the engine thread.
//!
//! Every cross-thread change goes through [`Command`]; the engine thread
//! drains them between control cycles, never mid-cycle.

use super::hooks::CycleObserver;
use crate::channels::WriterKind;
use crate::debugger::DebugCommand;
use crate::error::Result;
use crate::runtime::{ScoreEvent, TableId};
use crate::scheduler::SheetCommand;
use crate::value::Value;
use crossbeam_channel::Sender;

/// An event for the running performance.
#[derive(Clone, Debug, PartialEq)]
pub struct PerformanceEvent {
    /// Intended session time in seconds; `None` = as soon as possible.
    /// Times already in the past fire on the next cycle.
    pub at: Option<f64>,
    pub action: EventAction,
}

impl PerformanceEvent {
    pub fn now(action: EventAction) -> Self {
        Self { at: None, action }
    }

    pub fn at(time: f64, action: EventAction) -> Self {
        Self {
            at: Some(time),
            action,
        }
    }

    pub fn note(event: ScoreEvent) -> Self {
        Self::now(EventAction::Note(event))
    }

    pub fn set_channel(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::now(EventAction::SetChannel {
            name: name.into(),
            value: value.into(),
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum EventAction {
    /// Activate an instrument.
    Note(ScoreEvent),
    /// Write a channel on behalf of the engine.
    SetChannel { name: String, value: Value },
}

/// Score transport edits.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ScoreCommand {
    /// Restart the score at its offset.
    Rewind,
    /// Move the score start, in seconds.
    SetOffset(f64),
    /// Hold (`false`) or resume (`true`) score playback.
    SetPending(bool),
}

/// Messages consumed by the engine thread.
pub(crate) enum Command {
    Evaluate(String),
    SendEvent(PerformanceEvent),
    Debug(DebugCommand),
    Sheet(SheetCommand),
    WriteChannel {
        name: String,
        value: Value,
        writer: WriterKind,
    },
    AddObserver(CycleObserver),
    Score(ScoreCommand),
    TableSet {
        table: TableId,
        index: usize,
        value: f64,
    },
    TableGet {
        table: TableId,
        index: usize,
        reply: Sender<Result<f64>>,
    },
    /// Allow `n` more cycles under the manual clock.
    Advance(u64),
    /// Answered once every earlier command has been applied and the
    /// engine is idle.
    Barrier(Sender<()>),
    /// Answered as soon as every earlier command has been applied.
    Sync(Sender<()>),
    Stop,
}

impl Command {
    pub(crate) fn label(&self) -> &'static str {
        match self {
            Command::Evaluate(_) => "evaluate",
            Command::SendEvent(_) => "send-event",
            Command::Debug(_) => "debug",
            Command::Sheet(_) => "sheet",
            Command::WriteChannel { .. } => "write-channel",
            Command::AddObserver(_) => "add-observer",
            Command::Score(_) => "score",
            Command::TableSet { .. } => "table-set",
            Command::TableGet { .. } => "table-get",
            Command::Advance(_) => "advance",
            Command::Barrier(_) => "barrier",
            Command::Sync(_) => "sync",
            Command::Stop => "stop",
        }
    }
}
