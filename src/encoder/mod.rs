//! External encoder process
//!
//! [`StreamConfig`] and [`EncoderConfig`] describe what to run;
//! [`EncoderSource`] runs it and exposes its stdout as a [`ChunkStream`].

pub mod config;
pub mod source;

pub use config::{ConfigError, EncoderCommand, EncoderConfig, FfmpegSettings, StreamConfig};
pub use source::{
    ChunkStream, EncoderError, EncoderSource, DEFAULT_CHUNK_CHANNEL_CAPACITY, READ_CHUNK_SIZE,
};
