//! Session error types

/// Error type for session operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// The encoder could not be spawned or never produced output
    #[error("Session {session} failed to start: {reason}")]
    StartupFailure { session: String, reason: String },

    /// The session is being torn down and accepts no new subscribers
    #[error("Session is stopping: {0}")]
    SessionStopping(String),
}
