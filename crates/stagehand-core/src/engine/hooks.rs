//! Per-cycle callback interface.
//!
//! The engine thread invokes every [`CycleHook`] synchronously once per
//! control cycle, after the runtime has performed the cycle. Hooks never
//! poll the engine on their own.

use crate::channels::{ChannelBus, WriterKind};
use crate::debugger::HaltReport;
use crate::error::Result;
use crate::notify::{Notification, Notifier};
use crate::runtime::{CycleInfo, ScoreEvent, SynthRuntime};
use crate::value::Value;
use std::sync::Arc;

/// What a hook asks the engine to do after it ran.
#[derive(Clone, Debug, PartialEq)]
pub enum HookOutcome {
    Continue,
    /// Suspend cycle advancement at this boundary.
    Halt(HaltReport),
}

/// Engine facilities handed to hooks during a cycle.
pub struct CycleContext<'a> {
    pub(crate) runtime: &'a mut dyn SynthRuntime,
    pub(crate) channels: &'a ChannelBus,
    pub(crate) notifier: &'a Notifier,
}

impl CycleContext<'_> {
    /// Hand a score event to the runtime. It activates on the next cycle
    /// at or after its start offset.
    pub fn send_event(&mut self, event: ScoreEvent) -> Result<()> {
        self.runtime.schedule(event)
    }

    /// Write a channel on behalf of the engine.
    pub fn write_channel(&self, name: &str, value: Value) -> Result<()> {
        self.channels.set(name, value, WriterKind::Engine)
    }

    pub fn notify(&self, notification: Notification) {
        self.notifier.emit(notification);
    }
}

/// A component driven by the engine's cycle loop.
pub trait CycleHook: Send {
    fn on_cycle(&mut self, cycle: &CycleInfo, ctx: &mut CycleContext<'_>) -> HookOutcome;
}

/// Read-only observer registered through `PerformanceEngine::on_cycle`.
pub type CycleObserver = Arc<dyn Fn(&CycleInfo) + Send + Sync>;
