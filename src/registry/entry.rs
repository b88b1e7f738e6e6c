//! Registry entry and summary types
//!
//! This module defines the per-session state stored in the registry.

use std::time::SystemTime;

use tokio::sync::Mutex;

use super::capture::{CaptureProvider, CaptureSource};
use crate::session::{BroadcastSession, SessionStatus, StopCause};

/// Entry for a single session in the registry
#[derive(Debug)]
pub(super) struct SessionEntry {
    pub session: BroadcastSession,

    /// Capture resource id, kept for reporting after release
    pub capture_id: String,

    /// Capture resource until released; `None` afterwards
    lease: Mutex<Option<CaptureSource>>,
}

impl SessionEntry {
    pub(super) fn new(session: BroadcastSession, capture: CaptureSource) -> Self {
        Self {
            session,
            capture_id: capture.id().to_string(),
            lease: Mutex::new(Some(capture)),
        }
    }

    /// Give the capture resource back to the provider
    ///
    /// Only the first call releases; concurrent callers wait for it to
    /// complete. Returns whether this call did the release.
    pub(super) async fn release<P: CaptureProvider>(&self, provider: &P) -> bool {
        let mut lease = self.lease.lock().await;
        let Some(capture) = lease.take() else {
            return false;
        };

        if let Err(e) = provider.release(capture).await {
            tracing::warn!(
                session = %self.session.id(),
                capture = %self.capture_id,
                error = %e,
                "Failed to release capture resource"
            );
        }
        true
    }

    pub(super) fn summary(&self) -> SessionSummary {
        let stream = self.session.stream_config();
        SessionSummary {
            session_id: self.session.id().to_string(),
            status: self.session.status(),
            subscriber_count: self.session.subscriber_count(),
            width: stream.width,
            height: stream.height,
            framerate: stream.framerate,
            capture_id: self.capture_id.clone(),
            created_at: self.session.created_at(),
            stop_cause: self.session.stop_cause(),
        }
    }
}

/// Snapshot of one session for listings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub session_id: String,
    pub status: SessionStatus,
    pub subscriber_count: usize,
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
    /// Capture resource the encoder reads from
    pub capture_id: String,
    pub created_at: SystemTime,
    pub stop_cause: Option<StopCause>,
}

impl SessionSummary {
    /// Resolution as `WxH`
    pub fn resolution(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }
}
