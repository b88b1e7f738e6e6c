//! Registry error types

use super::capture::CaptureError;
use crate::encoder::ConfigError;

/// Error type for registry operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// A session with this id is already registered
    #[error("Session already exists: {0}")]
    DuplicateSession(String),

    /// The concurrent session limit is reached
    #[error("Session limit reached ({limit})")]
    CapacityExceeded { limit: usize },

    /// No capture resource could be allocated
    #[error("No capture resource for session {session}: {source}")]
    ResourceUnavailable {
        session: String,
        #[source]
        source: CaptureError,
    },

    /// No session with this id
    #[error("Session not found: {0}")]
    NotFound(String),

    /// The stream configuration was rejected
    #[error("Invalid config for session {session}: {source}")]
    InvalidConfig {
        session: String,
        #[source]
        source: ConfigError,
    },

    /// The encoder could not be started
    #[error("Session {session} failed to start: {reason}")]
    StartupFailure { session: String, reason: String },
}
