//! Session registry
//!
//! The registry owns every running session, keyed by id. It limits how many
//! run at once and pairs each one with a capture resource for its lifetime.
//!
//! # Architecture
//!
//! ```text
//!                     Arc<SessionRegistry<P>>
//!                 ┌──────────────────────────────┐
//!                 │ sessions: HashMap<Id,        │
//!                 │   SessionEntry {             │
//!                 │     session,                 │
//!                 │     lease: CaptureSource,    │
//!                 │   }                          │
//!                 │ >                            │
//!                 │ provider: P                  │
//!                 └──────────────┬───────────────┘
//!                                │
//!        create ── allocate ── spawn encoder ── watcher task
//!                                                   │
//!        stop ─────────┬────────────────────────────┘
//!                      ▼
//!            session.stop ──► release capture ──► remove entry
//! ```
//!
//! A session that ends on its own (encoder exit, startup failure) is cleaned
//! up by its watcher; an explicit `stop` does the same synchronously. The
//! capture resource is released exactly once either way.

pub mod capture;
pub mod config;
pub mod entry;
pub mod error;
pub mod store;

pub use capture::{CaptureError, CaptureProvider, CaptureRequest, CaptureSource, DisplayPool};
pub use config::RegistryConfig;
pub use entry::SessionSummary;
pub use error::RegistryError;
pub use store::SessionRegistry;
