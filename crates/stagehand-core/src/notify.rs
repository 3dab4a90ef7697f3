//! Notifications delivered from the core to UI subscribers.
//!
//! Every subscriber gets its own unbounded channel, so a slow or absent
//! reader never blocks the engine thread. Subscribers whose receiver has
//! been dropped are pruned on the next emit.

use crate::channels::WriterKind;
use crate::debugger::HaltReport;
use crate::engine::SessionState;
use crate::error::{EngineError, RuntimeFault};
use crate::value::Value;
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::sync::{Arc, Mutex};

/// An event the UI layer may subscribe to.
#[derive(Clone, Debug, PartialEq)]
pub enum Notification {
    /// The session lifecycle state changed.
    SessionStateChanged(SessionState),
    /// Execution halted; carries every frame that contributed to the halt.
    BreakpointHit(HaltReport),
    /// A sheet's playhead moved.
    SheetPlayheadChanged { sheet: String, position: f64 },
    /// A channel value (or its last writer) changed.
    ChannelChanged {
        name: String,
        value: Value,
        writer: WriterKind,
    },
    /// Dispatching a sheet's rows failed. Sent at most once per sheet per cycle.
    SheetError {
        sheet: String,
        cycle: u64,
        error: EngineError,
    },
    /// A queued command was rejected when the engine applied it.
    CommandRejected(EngineError),
    /// The runtime failed inside a cycle; the session was forced to stop.
    RuntimeFault(RuntimeFault),
    /// A line of runtime console output.
    Message(String),
}

/// Fan-out of [`Notification`]s to any number of subscribers.
#[derive(Clone, Default)]
pub struct Notifier {
    subscribers: Arc<Mutex<Vec<Sender<Notification>>>>,
}

impl Notifier {
    /// Create a notifier with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to all future notifications.
    pub fn subscribe(&self) -> Receiver<Notification> {
        let (tx, rx) = unbounded();
        self.subscribers
            .lock()
            .expect("Notifier lock poisoned")
            .push(tx);
        rx
    }

    /// Deliver a notification to every live subscriber.
    pub fn emit(&self, notification: Notification) {
        let mut subscribers = self.subscribers.lock().expect("Notifier lock poisoned");
        subscribers.retain(|tx| tx.send(notification.clone()).is_ok());
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .expect("Notifier lock poisoned")
            .len()
    }
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
