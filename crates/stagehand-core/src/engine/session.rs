//! Session identity, lifecycle state and the shared read view.

use crate::debugger::{Breakpoint, DebuggerState, HaltReport};
use crate::notify::{Notification, Notifier};
use crate::runtime::{ProgramInfo, ScoreState};
use crate::scheduler::{SheetView, TransportView};
use std::sync::{Arc, RwLock};

/// Identifies one session of a [`super::PerformanceEngine`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SessionHandle {
    id: u64,
}

impl SessionHandle {
    pub(crate) fn new(id: u64) -> Self {
        Self { id }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl std::fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session {}", self.id)
    }
}

/// Session lifecycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SessionState {
    #[default]
    Stopped,
    Starting,
    Running,
    Paused,
    Stopping,
    Failed,
}

impl SessionState {
    /// Whether the session accepts commands.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            SessionState::Starting | SessionState::Running | SessionState::Paused
        )
    }
}

/// Everything the engine thread publishes for the command side.
#[derive(Clone, Debug, Default)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub program: ProgramInfo,
    pub breakpoints: Vec<Breakpoint>,
    pub debugger: DebuggerState,
    pub last_halt: Option<HaltReport>,
    pub score: ScoreState,
    pub sheets: Vec<SheetView>,
    pub transport: TransportView,
    /// Control cycles performed so far.
    pub cycle: u64,
    /// Session time in seconds.
    pub time: f64,
}

/// Shared, lock-protected [`SessionSnapshot`].
///
/// Written by the engine thread, read by any thread.
#[derive(Clone, Default)]
pub struct SessionMonitor {
    snapshot: Arc<RwLock<SessionSnapshot>>,
}

impl SessionMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the snapshot with a closure.
    pub fn with_read<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&SessionSnapshot) -> R,
    {
        let snapshot = self.snapshot.read().expect("Session lock poisoned");
        f(&snapshot)
    }

    /// Write to the snapshot with a closure.
    pub fn with_write<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut SessionSnapshot) -> R,
    {
        let mut snapshot = self.snapshot.write().expect("Session lock poisoned");
        f(&mut snapshot)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.with_read(|s| s.clone())
    }

    pub fn state(&self) -> SessionState {
        self.with_read(|s| s.state)
    }

    /// Move to `state`, notifying subscribers if it changed.
    pub(crate) fn transition(&self, state: SessionState, notifier: &Notifier) {
        let previous = self.with_write(|s| std::mem::replace(&mut s.state, state));
        if previous != state {
            log::debug!("[ENGINE] {:?} -> {:?}", previous, state);
            notifier.emit(Notification::SessionStateChanged(state));
        }
    }
}

impl std::fmt::Debug for SessionMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionMonitor")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
