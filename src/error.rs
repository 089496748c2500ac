//! Error types for the acceptance-test gates.
//!
//! The core gate operations (`acquire`, `release`, `enter`, `exit`) cannot
//! fail; they can only block. `GateError` covers the optional surfaces around
//! them: bounded waits, configuration, and the global singletons.

use std::time::Duration;

use thiserror::Error;

/// Errors produced by the optional gate surfaces.
#[derive(Debug, Error)]
pub enum GateError {
    /// Admission did not happen before the caller's deadline.
    #[error("Timed out after {waited:?} waiting for batch admission of '{key}'")]
    Timeout {
        /// The key the caller asked admission for.
        key: String,
        /// How long the caller actually waited.
        waited: Duration,
    },

    /// A configuration value was missing or malformed.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The global batch executor was already built.
    #[error("Global batch executor is already initialized")]
    AlreadyInitialized,

    /// A JSON configuration could not be deserialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A blocking task used to acquire or release a permit did not complete.
    #[error("Blocking task failed: {0}")]
    Join(String),
}

impl GateError {
    /// Get the error message as a string.
    pub fn message(&self) -> &str {
        match self {
            Self::Timeout { .. } => "timed out waiting for batch admission",
            Self::Configuration(msg) => msg,
            Self::AlreadyInitialized => "global batch executor is already initialized",
            Self::Serialization(_err) => "serialization error (see Debug output)",
            Self::Join(msg) => msg,
        }
    }

    /// Whether the error is a bounded-wait timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl From<tokio::task::JoinError> for GateError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Join(err.to_string())
    }
}
