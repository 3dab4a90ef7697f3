//! Stagehand Core - live-performance control for a synthesis runtime.
//!
//! This crate wraps a cycle-driven synthesis runtime with the controls a
//! performer needs while it plays:
//!
//! - **Engine** - Session lifecycle, the engine thread and its command queue
//! - **Channels** - Typed named values shared between the runtime and controls
//! - **Debugger** - Instrument/line breakpoints, skip counts, pause and step
//! - **Scheduler** - Event sheets with loops, tempo and transport sync
//! - **MIDI** - Controller bindings and MIDI learn onto channels
//! - **Runtime** - The runtime seam, score transport, function tables and a
//!   built-in simulated runtime
//!
//! # Architecture
//!
//! All mutations of a session flow through one command queue that the
//! engine thread drains between control cycles. After every cycle the
//! scheduler and then the debugger run as [`CycleHook`]s; the engine
//! publishes a [`SessionSnapshot`] for readers and emits [`Notification`]s
//! to subscribers.

pub mod channels;
pub mod config;
pub mod debugger;
pub mod engine;
pub mod error;
pub mod midi;
pub mod notify;
pub mod records;
pub mod runtime;
pub mod scheduler;
pub mod timing;
pub mod value;

pub use channels::{ChannelBus, ChannelEntry, WriterKind};
pub use config::{ClockMode, EngineConfig};
pub use debugger::{
    Breakpoint, BreakpointId, BreakpointKind, BreakpointTarget, DebugCommand, Debugger,
    DebuggerState, HaltReason, HaltReport, StackFrame,
};
pub use engine::{
    CycleContext, CycleHook, CycleObserver, EventAction, HookOutcome, PerformanceEngine,
    PerformanceEvent, ScoreCommand, SessionHandle, SessionMonitor, SessionSnapshot, SessionState,
};
pub use error::{EngineError, Result, RuntimeFault};
pub use midi::{MidiBinding, MidiLearnBinder, MidiMessage, MidiSource, ParameterCurve};
pub use notify::{Notification, Notifier};
pub use records::{BreakpointRecord, ControlState};
pub use runtime::{
    sim_factory, Activation, CycleInfo, InstrumentId, InstrumentInfo, ProgramInfo,
    RuntimeFactory, ScoreEvent, ScoreState, SimRuntime, SynthRuntime, TableDef, TableId,
};
pub use scheduler::{
    EventRow, EventScheduler, EventSheet, LoopRegion, RowTarget, SendMode, SheetCommand,
    SheetRecord, SheetView, SyncMode, TransportCommand, TransportView,
};
pub use timing::TransportClock;
pub use value::{Value, ValueKind};
