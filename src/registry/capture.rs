//! Capture resource provisioning
//!
//! Every session captures from its own resource, typically a virtual X
//! display. The registry allocates one before spawning the encoder and
//! releases it after the session has stopped.

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::sync::{Mutex, PoisonError};

use crate::encoder::StreamConfig;

/// Capture provisioning errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CaptureError {
    #[error("all {limit} capture resources are in use")]
    Exhausted { limit: usize },

    #[error("capture resource {0} is not allocated")]
    NotAllocated(String),

    #[error("failed to provision capture resource: {0}")]
    Provision(String),
}

/// What a session needs to capture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureRequest {
    pub width: u32,
    pub height: u32,
}

impl CaptureRequest {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Request sized for a stream
    pub fn for_stream(stream: &StreamConfig) -> Self {
        Self::new(stream.width, stream.height)
    }
}

/// An allocated capture resource, e.g. the X display `:100`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CaptureSource {
    id: String,
}

impl CaptureSource {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    /// Identifier handed to the encoder as its input
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for CaptureSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// Allocates and releases capture resources
///
/// Implementations must hand out each resource to at most one session at a
/// time.
pub trait CaptureProvider: Send + Sync + 'static {
    fn allocate(
        &self,
        request: &CaptureRequest,
    ) -> impl Future<Output = Result<CaptureSource, CaptureError>> + Send;

    fn release(&self, source: CaptureSource)
        -> impl Future<Output = Result<(), CaptureError>> + Send;
}

/// Default first display number
pub const DEFAULT_BASE_DISPLAY: u32 = 100;

/// Default number of displays
pub const DEFAULT_MAX_DISPLAYS: usize = 5;

/// Fixed range of pre-provisioned X displays
///
/// Hands out `:base`, `:base+1`, ... exclusively, lowest free number first.
#[derive(Debug)]
pub struct DisplayPool {
    base: u32,
    max_displays: usize,
    in_use: Mutex<BTreeSet<u32>>,
}

impl DisplayPool {
    pub fn new() -> Self {
        Self::with_range(DEFAULT_BASE_DISPLAY, DEFAULT_MAX_DISPLAYS)
    }

    /// Pool of `max_displays` displays starting at `:base`
    pub fn with_range(base: u32, max_displays: usize) -> Self {
        Self {
            base,
            max_displays,
            in_use: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn max_displays(&self) -> usize {
        self.max_displays
    }

    /// Displays currently handed out
    pub fn active(&self) -> usize {
        self.in_use.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn available(&self) -> usize {
        self.max_displays - self.active()
    }

    fn parse(&self, source: &CaptureSource) -> Option<u32> {
        source.id().strip_prefix(':')?.parse().ok()
    }
}

impl Default for DisplayPool {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureProvider for DisplayPool {
    async fn allocate(&self, request: &CaptureRequest) -> Result<CaptureSource, CaptureError> {
        let mut in_use = self.in_use.lock().unwrap_or_else(PoisonError::into_inner);

        let number = (self.base..)
            .take(self.max_displays)
            .find(|n| !in_use.contains(n))
            .ok_or(CaptureError::Exhausted {
                limit: self.max_displays,
            })?;
        in_use.insert(number);

        let source = CaptureSource::new(format!(":{}", number));
        tracing::debug!(
            display = %source,
            width = request.width,
            height = request.height,
            active = in_use.len(),
            "Display allocated"
        );
        Ok(source)
    }

    async fn release(&self, source: CaptureSource) -> Result<(), CaptureError> {
        let number = self
            .parse(&source)
            .ok_or_else(|| CaptureError::NotAllocated(source.id().to_string()))?;

        let mut in_use = self.in_use.lock().unwrap_or_else(PoisonError::into_inner);
        if !in_use.remove(&number) {
            return Err(CaptureError::NotAllocated(source.id().to_string()));
        }

        tracing::debug!(display = %source, active = in_use.len(), "Display released");
        Ok(())
    }
}
