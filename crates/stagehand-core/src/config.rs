//! Engine configuration.
//!
//! Configuration is stored in TOML. Every field has a default, so an empty
//! file (or no file at all) yields a usable configuration:
//!
//! ```toml
//! clock = "realtime"
//! idle_poll_ms = 5
//! max_sample_rate = 192000
//! default_tempo = 60.0
//! log_level = "info"
//! ```

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// How the engine thread paces control cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClockMode {
    /// One cycle per cycle duration of wall-clock time.
    #[default]
    Realtime,
    /// As fast as possible.
    Free,
    /// Cycles only advance on explicit `advance` commands.
    Manual,
}

/// Main configuration structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Cycle pacing.
    pub clock: ClockMode,
    /// Command poll interval while paused or idle, in milliseconds.
    pub idle_poll_ms: u64,
    /// Highest sample rate the output device accepts.
    pub max_sample_rate: u32,
    /// Tempo (BPM) given to new sheets and the shared transport.
    pub default_tempo: f64,
    /// Default log filter for binaries embedding the engine.
    pub log_level: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            clock: ClockMode::default(),
            idle_poll_ms: 5,
            max_sample_rate: 192_000,
            default_tempo: 60.0,
            log_level: "info".to_string(),
        }
    }
}

impl EngineConfig {
    /// Parse a configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| EngineError::Config(e.to_string()))
    }

    /// Serialize the configuration to TOML text.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| EngineError::Config(e.to_string()))
    }

    /// Load configuration from a file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    /// Load configuration or return the default if the file is missing or invalid.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                if path.exists() {
                    log::warn!("Ignoring invalid configuration: {}", e);
                }
                Self::default()
            }
        }
    }

    /// Use a different clock mode.
    pub fn with_clock(mut self, clock: ClockMode) -> Self {
        self.clock = clock;
        self
    }

    pub(crate) fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms.max(1))
    }
}
