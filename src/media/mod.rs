//! Media handling
//!
//! This module provides:
//! - H.264 NAL unit classification
//! - Annex-B stream segmentation
//! - GOP caching for late-joiner support

pub mod annexb;
pub mod gop;
pub mod h264;

pub use annexb::UnitExtractor;
pub use gop::{GopCache, GopCacheConfig};
pub use h264::{CodedUnit, NaluType, ParameterSlot, UnitKind, START_CODE};
