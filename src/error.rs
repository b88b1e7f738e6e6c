//! Error types
//!
//! Each layer has its own error enum; [`Error`] unifies them for callers that
//! drive the whole relay (typically the network layer).

use crate::encoder::{ConfigError, EncoderError};
use crate::registry::{CaptureError, RegistryError};
use crate::session::{CloseCode, SessionError};

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Encoder(#[from] EncoderError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Capture(#[from] CaptureError),
}

impl Error {
    /// WebSocket close code to report when this error ends a viewer connection
    pub fn close_code(&self) -> CloseCode {
        match self {
            Error::Registry(RegistryError::NotFound(_)) => CloseCode::NotFound,
            Error::Session(SessionError::SessionStopping(_)) => CloseCode::Normal,
            _ => CloseCode::NotReady,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_code_mapping() {
        let not_found: Error = RegistryError::NotFound("a".into()).into();
        assert_eq!(not_found.close_code(), CloseCode::NotFound);
        assert_eq!(not_found.close_code().code(), 4004);

        let stopping: Error = SessionError::SessionStopping("a".into()).into();
        assert_eq!(stopping.close_code(), CloseCode::Normal);

        let startup: Error = SessionError::StartupFailure {
            session: "a".into(),
            reason: "no output".into(),
        }
        .into();
        assert_eq!(startup.close_code(), CloseCode::NotReady);
        assert_eq!(startup.close_code().code(), 1011);
    }

    #[test]
    fn test_error_display_is_transparent() {
        let err: Error = RegistryError::DuplicateSession("cam".into()).into();
        assert_eq!(err.to_string(), "Session already exists: cam");
    }
}
