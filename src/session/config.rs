//! Session configuration

use std::time::Duration;

use crate::encoder::DEFAULT_CHUNK_CHANNEL_CAPACITY;
use crate::media::annexb::DEFAULT_MAX_UNIT_BYTES;
use crate::media::GopCacheConfig;

/// Per-session tuning
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Units buffered per subscriber beyond its late-join snapshot
    pub subscriber_queue_capacity: usize,

    /// How long to wait for the first encoder output
    pub startup_timeout: Duration,

    /// How long the encoder gets to exit after SIGTERM
    pub stop_grace_period: Duration,

    /// Extra time `stop()` waits for the pump beyond the grace period
    pub teardown_margin: Duration,

    /// Chunks buffered between the stdout reader and the pump
    pub chunk_channel_capacity: usize,

    /// Largest accepted unit; bigger units are dropped
    pub max_unit_bytes: usize,

    /// Late-join cache limits
    pub gop: GopCacheConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            subscriber_queue_capacity: 200,
            startup_timeout: Duration::from_secs(10),
            stop_grace_period: Duration::from_secs(5),
            teardown_margin: Duration::from_secs(2),
            chunk_channel_capacity: DEFAULT_CHUNK_CHANNEL_CAPACITY,
            max_unit_bytes: DEFAULT_MAX_UNIT_BYTES,
            gop: GopCacheConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Set the per-subscriber queue capacity
    pub fn subscriber_queue_capacity(mut self, units: usize) -> Self {
        self.subscriber_queue_capacity = units.max(1);
        self
    }

    /// Set the startup timeout
    pub fn startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    /// Set the encoder stop grace period
    pub fn stop_grace_period(mut self, grace: Duration) -> Self {
        self.stop_grace_period = grace;
        self
    }

    /// Set the teardown margin
    pub fn teardown_margin(mut self, margin: Duration) -> Self {
        self.teardown_margin = margin;
        self
    }

    /// Set the chunk channel capacity
    pub fn chunk_channel_capacity(mut self, chunks: usize) -> Self {
        self.chunk_channel_capacity = chunks.max(1);
        self
    }

    /// Set the maximum unit size
    pub fn max_unit_bytes(mut self, bytes: usize) -> Self {
        self.max_unit_bytes = bytes;
        self
    }

    /// Set the GOP cache limits
    pub fn gop(mut self, gop: GopCacheConfig) -> Self {
        self.gop = gop;
        self
    }

    /// Upper bound on how long `stop()` blocks
    pub fn stop_deadline(&self) -> Duration {
        self.stop_grace_period + self.teardown_margin
    }
}
