//! Error taxonomy for the chain engine.
//!
//! Following the error taxonomy laid out for the engine: configuration
//! errors are raised synchronously and drive a chain straight to `error`
//! without executing any tasks; task method errors are subject to a task's
//! retry policy before they become terminal; termination is a distinct,
//! cooperative condition; silo errors are fatal only at construction time.

use std::{error, fmt};

/// Errors a chain or its driver loop can produce.
///
/// Not intended to be exhaustively matched; new variants may be added
/// without a major version bump.
#[derive(Debug)]
pub enum ChainError {
    /// A malformed template, an unknown task kind, an unsupported file
    /// extension, or a missing required variable.
    Configuration(String),

    /// A task's method failed and its retry policy was exhausted.
    TaskMethod(String),

    /// The chain was asked to terminate.
    Terminated,

    /// The configured status silo could not be reached at construction time.
    Silo(String),

    #[doc(hidden)]
    __Unknown,
}

impl fmt::Display for ChainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainError::Configuration(msg) => write!(f, "configuration error: {}", msg),
            ChainError::TaskMethod(msg) => write!(f, "task error: {}", msg),
            ChainError::Terminated => write!(f, "chain was terminated"),
            ChainError::Silo(msg) => write!(f, "status silo error: {}", msg),
            ChainError::__Unknown => unreachable!(),
        }
    }
}

impl error::Error for ChainError {}

impl ChainError {
    /// Constructs a configuration error from any displayable message.
    pub fn configuration(msg: impl fmt::Display) -> Self {
        ChainError::Configuration(msg.to_string())
    }

    /// Constructs a task-method error from any displayable message.
    pub fn task_method(msg: impl fmt::Display) -> Self {
        ChainError::TaskMethod(msg.to_string())
    }

    /// Constructs a silo error from any displayable message.
    pub fn silo(msg: impl fmt::Display) -> Self {
        ChainError::Silo(msg.to_string())
    }
}
