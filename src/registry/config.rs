//! Registry configuration

use crate::encoder::EncoderConfig;
use crate::session::SessionConfig;

/// Configuration for the session registry
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Maximum concurrent sessions, stopping ones included
    pub max_sessions: usize,

    /// Settings applied to every new session
    pub session: SessionConfig,

    /// How encoders are launched
    pub encoder: EncoderConfig,

    /// Recently removed session ids remembered for idempotent stop
    pub tombstone_capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_sessions: 5,
            session: SessionConfig::default(),
            encoder: EncoderConfig::default(),
            tombstone_capacity: 64,
        }
    }
}

impl RegistryConfig {
    /// Set the session limit
    pub fn max_sessions(mut self, limit: usize) -> Self {
        self.max_sessions = limit;
        self
    }

    /// Set the per-session configuration
    pub fn session(mut self, config: SessionConfig) -> Self {
        self.session = config;
        self
    }

    /// Set the encoder configuration
    pub fn encoder(mut self, config: EncoderConfig) -> Self {
        self.encoder = config;
        self
    }

    /// Set how many stopped ids are remembered
    pub fn tombstone_capacity(mut self, ids: usize) -> Self {
        self.tombstone_capacity = ids;
        self
    }
}
