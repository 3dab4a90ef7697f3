//! Error types for the stagehand core.

use crate::value::ValueKind;
use thiserror::Error;

/// Result type alias for stagehand operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors reported at the command boundary.
///
/// None of these are fatal: every one is returned to (or notified to) the
/// operator and the core keeps running.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    /// Malformed orchestra or score code. The session stays stopped.
    #[error("Compile error at line {line}: {message}")]
    Compile { line: usize, message: String },

    /// A session already exists for this engine.
    #[error("A session is already running")]
    AlreadyRunning,

    /// Resource or device acquisition failed. No automatic retry.
    #[error("Engine startup failed: {0}")]
    StartupFailure(String),

    /// The operation needs an active session.
    #[error("No session is running")]
    NotRunning,

    /// A breakpoint, event or sheet target does not exist in the session.
    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    /// A channel was written with a value of the wrong type.
    #[error("Type mismatch on channel '{name}': expected {expected}, got {found}")]
    TypeMismatch {
        name: String,
        expected: ValueKind,
        found: ValueKind,
    },

    /// An argument is out of its valid range (e.g. a reversed loop region).
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration could not be parsed.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl EngineError {
    pub(crate) fn compile(line: usize, message: impl Into<String>) -> Self {
        EngineError::Compile {
            line,
            message: message.into(),
        }
    }
}

/// An unrecoverable failure inside the runtime's cycle processing.
///
/// This is the one fatal condition: the session is forced to stopped and
/// all queued commands and pending events are flushed.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("Runtime fault in cycle {cycle}: {message}")]
pub struct RuntimeFault {
    pub cycle: u64,
    pub message: String,
}
