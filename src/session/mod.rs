//! Broadcast sessions
//!
//! A [`BroadcastSession`] ties one encoder process to any number of
//! [`Subscription`]s. Each subscription has its own bounded queue, so viewers
//! progress independently and a stalled viewer only loses its own units.

pub mod broadcast;
pub mod close;
pub mod config;
pub mod error;
pub mod state;
pub mod subscriber;

pub use broadcast::BroadcastSession;
pub use close::CloseCode;
pub use config::SessionConfig;
pub use error::SessionError;
pub use state::{SessionStatus, StopCause};
pub use subscriber::Subscription;
