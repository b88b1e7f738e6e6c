//! Live H.264 relay
//!
//! Reads a raw Annex-B elementary stream from an external encoder process,
//! re-segments it into NAL units and fans it out to any number of viewers.
//! Viewers joining mid-stream receive the cached parameter sets, the latest
//! IDR picture and everything after it, so their decoder can start at once.
//!
//! # Layout
//!
//! ```text
//!   SessionRegistry ──creates──► BroadcastSession
//!                                   │
//!   EncoderSource ──chunks──► UnitExtractor ──units──► GopCache
//!                                   │                    │
//!                                   └──► SubscriberQueue (one per viewer,
//!                                        bounded, drop-oldest)
//! ```
//!
//! The network side (WebSocket, REST) is left to the caller; see
//! `demos/ws_relay.rs` for an axum based server.

pub mod encoder;
pub mod error;
pub mod media;
pub mod registry;
pub mod session;
pub mod stats;

pub use encoder::{EncoderCommand, EncoderConfig, EncoderSource, StreamConfig};
pub use error::{Error, Result};
pub use media::{CodedUnit, GopCache, UnitExtractor, UnitKind};
pub use registry::{
    CaptureProvider, CaptureRequest, CaptureSource, DisplayPool, RegistryConfig, SessionRegistry,
    SessionSummary,
};
pub use session::{
    BroadcastSession, CloseCode, SessionConfig, SessionStatus, StopCause, Subscription,
};
