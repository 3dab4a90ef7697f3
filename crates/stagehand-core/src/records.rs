//! Persisted control state.
//!
//! Breakpoints, event sheets and MIDI bindings can be exported from a
//! session and imported into a later one. Records convert to and from TOML
//! text; reading and writing files is left to the embedding program.

use crate::debugger::{Breakpoint, BreakpointId, BreakpointKind, BreakpointTarget};
use crate::error::{EngineError, Result};
use crate::midi::MidiBinding;
use crate::scheduler::SheetRecord;
use serde::{Deserialize, Serialize};

/// A breakpoint as a plain record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BreakpointRecord {
    pub id: BreakpointId,
    pub kind: BreakpointKind,
    pub target: BreakpointTarget,
    #[serde(default)]
    pub skip_count: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl BreakpointRecord {
    /// Reject records whose kind disagrees with their target.
    pub fn validate(&self) -> Result<()> {
        if self.kind != self.target.kind() {
            return Err(EngineError::InvalidArgument(format!(
                "breakpoint {}: kind {:?} does not match target {}",
                self.id, self.kind, self.target
            )));
        }
        Ok(())
    }
}

impl From<&Breakpoint> for BreakpointRecord {
    fn from(breakpoint: &Breakpoint) -> Self {
        Self {
            id: breakpoint.id,
            kind: breakpoint.kind(),
            target: breakpoint.target.clone(),
            skip_count: breakpoint.skip_count,
            enabled: breakpoint.enabled,
        }
    }
}

impl From<BreakpointRecord> for Breakpoint {
    fn from(record: BreakpointRecord) -> Self {
        Breakpoint::new(record.id, record.target)
            .with_skip_count(record.skip_count)
            .with_enabled(record.enabled)
    }
}

/// Everything an operator sets up around a performance.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlState {
    pub breakpoints: Vec<BreakpointRecord>,
    pub sheets: Vec<SheetRecord>,
    pub midi_bindings: Vec<MidiBinding>,
}

impl ControlState {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| EngineError::Config(e.to_string()))
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| EngineError::Config(e.to_string()))
    }

    pub fn is_empty(&self) -> bool {
        self.breakpoints.is_empty() && self.sheets.is_empty() && self.midi_bindings.is_empty()
    }
}
