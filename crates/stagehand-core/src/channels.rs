//! Named value store shared between the engine and external controllers.
//!
//! The outer map lock only guards channel membership. Each channel sits
//! behind its own mutex, so the channel (not the call) is the unit of
//! atomicity: a reader always observes the last fully committed write.
//!
//! Writes queued for a later cycle [`claim`](ChannelBus::claim) the type of a
//! channel that does not exist yet, so conflicting writers are turned away
//! when they call rather than when the write lands. Lock order is map, then
//! claims, then channel.

use crate::error::{EngineError, Result};
use crate::notify::{Notification, Notifier};
use crate::value::{Value, ValueKind};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

/// Who performed the most recent write to a channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriterKind {
    Engine,
    Widget,
    Midi,
}

/// A single named channel.
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelEntry {
    pub name: String,
    pub value: Value,
    pub last_writer: WriterKind,
}

impl ChannelEntry {
    /// The type this channel was fixed to at its first write.
    pub fn kind(&self) -> ValueKind {
        self.value.kind()
    }
}

/// Thread-safe channel store.
#[derive(Default)]
pub struct ChannelBus {
    channels: RwLock<HashMap<String, Arc<Mutex<ChannelEntry>>>>,
    /// Types reserved by queued first writes.
    claims: Mutex<HashMap<String, ValueKind>>,
    notifier: Option<Notifier>,
}

fn mismatch(name: &str, expected: ValueKind, found: ValueKind) -> EngineError {
    EngineError::TypeMismatch {
        name: name.to_string(),
        expected,
        found,
    }
}

impl ChannelBus {
    /// Create an empty bus without change notifications.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty bus that reports changes through `notifier`.
    pub fn with_notifier(notifier: Notifier) -> Self {
        Self {
            notifier: Some(notifier),
            ..Self::default()
        }
    }

    fn slot(&self, name: &str) -> Option<Arc<Mutex<ChannelEntry>>> {
        self.channels
            .read()
            .expect("Channel map lock poisoned")
            .get(name)
            .cloned()
    }

    /// Write a channel.
    ///
    /// The first write fixes the channel's type; a later write of another
    /// type fails with [`EngineError::TypeMismatch`] and leaves the stored
    /// value untouched.
    pub fn set(&self, name: &str, value: Value, writer: WriterKind) -> Result<()> {
        let slot = match self.slot(name) {
            Some(slot) => slot,
            None => {
                let mut channels = self.channels.write().expect("Channel map lock poisoned");
                if !channels.contains_key(name) {
                    let mut claims = self.claims.lock().expect("Channel claim lock poisoned");
                    if let Some(&claimed) = claims.get(name) {
                        if claimed != value.kind() {
                            return Err(mismatch(name, claimed, value.kind()));
                        }
                    }
                    claims.remove(name);
                    drop(claims);
                    channels.insert(
                        name.to_string(),
                        Arc::new(Mutex::new(ChannelEntry {
                            name: name.to_string(),
                            value: value.clone(),
                            last_writer: writer,
                        })),
                    );
                    drop(channels);
                    self.announce(name, value, writer);
                    return Ok(());
                }
                channels[name].clone()
            }
        };

        let changed = {
            let mut entry = slot.lock().expect("Channel lock poisoned");
            if entry.kind() != value.kind() {
                return Err(mismatch(name, entry.kind(), value.kind()));
            }
            let changed = entry.value != value || entry.last_writer != writer;
            entry.value = value.clone();
            entry.last_writer = writer;
            changed
        };

        if changed {
            self.announce(name, value, writer);
        }
        Ok(())
    }

    fn announce(&self, name: &str, value: Value, writer: WriterKind) {
        log::trace!("[CHANNEL] {} = {} ({:?})", name, value, writer);
        if let Some(notifier) = &self.notifier {
            notifier.emit(Notification::ChannelChanged {
                name: name.to_string(),
                value,
                writer,
            });
        }
    }

    /// Check that `value` could be written to `name` without a type conflict.
    /// Nothing is reserved.
    pub fn check(&self, name: &str, value: &Value) -> Result<()> {
        let expected = self.kind(name).or_else(|| {
            self.claims
                .lock()
                .expect("Channel claim lock poisoned")
                .get(name)
                .copied()
        });
        match expected {
            Some(kind) if kind != value.kind() => Err(mismatch(name, kind, value.kind())),
            _ => Ok(()),
        }
    }

    /// Check `value` against `name` and, if the channel does not exist yet,
    /// reserve its type for a write that will land later.
    ///
    /// Once claimed, a write of another type fails with
    /// [`EngineError::TypeMismatch`] exactly as if the channel existed.
    pub fn claim(&self, name: &str, value: &Value) -> Result<()> {
        let channels = self.channels.read().expect("Channel map lock poisoned");
        let mut claims = self.claims.lock().expect("Channel claim lock poisoned");
        let expected = match channels.get(name) {
            Some(slot) => Some(slot.lock().expect("Channel lock poisoned").kind()),
            None => claims.get(name).copied(),
        };
        match expected {
            Some(kind) if kind != value.kind() => Err(mismatch(name, kind, value.kind())),
            Some(_) => Ok(()),
            None => {
                log::trace!("[CHANNEL] {} claimed as {}", name, value.kind());
                claims.insert(name.to_string(), value.kind());
                Ok(())
            }
        }
    }

    /// Read the current value of a channel.
    pub fn get(&self, name: &str) -> Option<Value> {
        self.entry(name).map(|entry| entry.value)
    }

    /// Read a full channel entry (value plus last writer).
    pub fn entry(&self, name: &str) -> Option<ChannelEntry> {
        self.slot(name)
            .map(|slot| slot.lock().expect("Channel lock poisoned").clone())
    }

    /// The fixed type of a channel, if it exists.
    pub fn kind(&self, name: &str) -> Option<ValueKind> {
        self.entry(name).map(|entry| entry.kind())
    }

    /// Snapshot of every channel, sorted by name.
    pub fn list(&self) -> Vec<ChannelEntry> {
        let slots: Vec<_> = self
            .channels
            .read()
            .expect("Channel map lock poisoned")
            .values()
            .cloned()
            .collect();
        let mut entries: Vec<ChannelEntry> = slots
            .iter()
            .map(|slot| slot.lock().expect("Channel lock poisoned").clone())
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }

    /// Number of channels.
    pub fn len(&self) -> usize {
        self.channels.read().expect("Channel map lock poisoned").len()
    }

    /// Whether the bus holds no channels.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

}

impl std::fmt::Debug for ChannelBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelBus")
            .field("channels", &self.len())
            .finish_non_exhaustive()
    }
}
