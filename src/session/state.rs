//! Session state machine
//!
//! Tracks a broadcast session from encoder spawn to confirmed termination.
//! Phases only move forward; a stopped session is never restarted.

use std::fmt;
use std::sync::{Mutex, PoisonError};

use tokio::sync::watch;

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SessionStatus {
    /// Encoder spawned, no output yet
    Starting,
    /// Encoder output is flowing to subscribers
    Streaming,
    /// Teardown in progress, no new subscribers
    Stopping,
    /// Encoder confirmed terminated
    Stopped,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Starting => "starting",
            SessionStatus::Streaming => "streaming",
            SessionStatus::Stopping => "stopping",
            SessionStatus::Stopped => "stopped",
        }
    }

    /// Starting or Streaming
    pub fn is_live(&self) -> bool {
        matches!(self, SessionStatus::Starting | SessionStatus::Streaming)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopCause {
    /// `stop()` was called
    Requested,
    /// The encoder closed its output on its own
    EncoderExited { code: Option<i32> },
    /// The encoder never produced output
    StartupFailure { reason: String },
}

impl fmt::Display for StopCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopCause::Requested => write!(f, "stop requested"),
            StopCause::EncoderExited { code: Some(code) } => {
                write!(f, "encoder exited with code {}", code)
            }
            StopCause::EncoderExited { code: None } => write!(f, "encoder killed by signal"),
            StopCause::StartupFailure { reason } => write!(f, "startup failed: {}", reason),
        }
    }
}

/// Status plus stop cause, shared between the pump and handles
#[derive(Debug)]
pub(crate) struct SessionState {
    status: watch::Sender<SessionStatus>,
    cause: Mutex<Option<StopCause>>,
}

impl SessionState {
    pub(crate) fn new() -> Self {
        let (status, _) = watch::channel(SessionStatus::Starting);
        Self {
            status,
            cause: Mutex::new(None),
        }
    }

    pub(crate) fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    pub(crate) fn watch(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    /// Move to `next` if it is later than the current phase
    ///
    /// Returns whether the phase changed.
    pub(crate) fn advance(&self, next: SessionStatus) -> bool {
        self.status.send_if_modified(|current| {
            if next > *current {
                *current = next;
                true
            } else {
                false
            }
        })
    }

    /// Record the stop cause; the first one recorded wins
    pub(crate) fn set_cause(&self, cause: StopCause) -> bool {
        let mut slot = self.cause.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return false;
        }
        *slot = Some(cause);
        true
    }

    pub(crate) fn cause(&self) -> Option<StopCause> {
        self.cause
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
