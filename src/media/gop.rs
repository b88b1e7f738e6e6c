//! GOP (Group of Pictures) cache for late-joiner support
//!
//! When a new viewer connects to a running session, it needs to receive:
//! 1. The latest parameter sets (SPS, PPS)
//! 2. The most recent IDR unit
//! 3. All units since that IDR unit
//!
//! This allows the decoder to start from the IDR unit without waiting for
//! the next one. The encoder runs with a short fixed GOP, so the tail is
//! normally small; the size caps only matter if key units stop arriving.

use std::collections::VecDeque;

use super::h264::{CodedUnit, ParameterSlot, UnitKind};

/// Default cap on units held after the key unit
pub const DEFAULT_MAX_TAIL_UNITS: usize = 300;

/// Default cap on bytes held in the cache (4MB)
pub const DEFAULT_MAX_CACHE_BYTES: usize = 4 * 1024 * 1024;

/// Cache size limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GopCacheConfig {
    /// Maximum number of units after the key unit
    pub max_tail_units: usize,
    /// Maximum bytes across key unit and tail
    pub max_bytes: usize,
}

impl Default for GopCacheConfig {
    fn default() -> Self {
        Self {
            max_tail_units: DEFAULT_MAX_TAIL_UNITS,
            max_bytes: DEFAULT_MAX_CACHE_BYTES,
        }
    }
}

impl GopCacheConfig {
    /// Set the tail length cap
    pub fn max_tail_units(mut self, units: usize) -> Self {
        self.max_tail_units = units;
        self
    }

    /// Set the byte cap
    pub fn max_bytes(mut self, bytes: usize) -> Self {
        self.max_bytes = bytes;
        self
    }
}

/// Bootstrap cache for new decoders
#[derive(Debug)]
pub struct GopCache {
    config: GopCacheConfig,
    /// Latest sequence parameter set
    sps: Option<CodedUnit>,
    /// Latest picture parameter set
    pps: Option<CodedUnit>,
    /// Anchor of the current GOP
    key_unit: Option<CodedUnit>,
    /// Units received after the anchor
    tail: VecDeque<CodedUnit>,
    /// Bytes held in `key_unit` + `tail`
    gop_bytes: usize,
    /// Tail units evicted by the caps
    evicted: u64,
}

impl GopCache {
    /// Create a cache with default limits
    pub fn new() -> Self {
        Self::with_config(GopCacheConfig::default())
    }

    /// Create a cache with custom limits
    pub fn with_config(config: GopCacheConfig) -> Self {
        Self {
            config,
            sps: None,
            pps: None,
            key_unit: None,
            tail: VecDeque::new(),
            gop_bytes: 0,
            evicted: 0,
        }
    }

    /// Record a unit produced by the encoder
    pub fn observe(&mut self, unit: &CodedUnit) {
        match unit.kind() {
            UnitKind::ParameterSet => match unit.parameter_slot() {
                Some(ParameterSlot::Sps) => self.sps = Some(unit.clone()),
                Some(ParameterSlot::Pps) => self.pps = Some(unit.clone()),
                None => {}
            },
            UnitKind::KeyUnit => {
                self.tail.clear();
                self.gop_bytes = unit.len();
                self.key_unit = Some(unit.clone());
            }
            UnitKind::DeltaUnit | UnitKind::Other => {
                // Not bootstrap-ready until the first key unit
                if self.key_unit.is_none() {
                    return;
                }
                self.tail.push_back(unit.clone());
                self.gop_bytes += unit.len();
                self.enforce_limits();
            }
        }
    }

    /// Drop the oldest tail units until both caps hold
    fn enforce_limits(&mut self) {
        let mut dropped = 0u64;
        while self.tail.len() > self.config.max_tail_units
            || (self.gop_bytes > self.config.max_bytes && !self.tail.is_empty())
        {
            if let Some(old) = self.tail.pop_front() {
                self.gop_bytes -= old.len();
                dropped += 1;
            }
        }

        if dropped > 0 {
            self.evicted += dropped;
            tracing::warn!(
                dropped = dropped,
                tail_units = self.tail.len(),
                gop_bytes = self.gop_bytes,
                "GOP cache over limit without a new key unit, dropping oldest units"
            );
        }
    }

    /// Copy of the current bootstrap sequence
    ///
    /// Returns parameter sets, key unit, then tail. Empty until the first
    /// key unit has been observed.
    pub fn snapshot(&self) -> Vec<CodedUnit> {
        let Some(key_unit) = &self.key_unit else {
            return Vec::new();
        };

        let mut units = Vec::with_capacity(self.tail.len() + 3);
        units.extend(self.parameter_sets());
        units.push(key_unit.clone());
        units.extend(self.tail.iter().cloned());
        units
    }

    /// Stored parameter sets, SPS first
    pub fn parameter_sets(&self) -> Vec<CodedUnit> {
        self.sps.iter().chain(self.pps.iter()).cloned().collect()
    }

    /// Whether a new decoder could start from this cache
    pub fn is_ready(&self) -> bool {
        self.key_unit.is_some()
    }

    /// Number of units a snapshot would contain
    pub fn len(&self) -> usize {
        if self.key_unit.is_none() {
            return 0;
        }
        self.sps.is_some() as usize + self.pps.is_some() as usize + 1 + self.tail.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes held by the key unit and tail
    pub fn gop_bytes(&self) -> usize {
        self.gop_bytes
    }

    /// Tail units evicted by the size caps so far
    pub fn evicted_units(&self) -> u64 {
        self.evicted
    }

    /// Clear everything including parameter sets
    pub fn clear(&mut self) {
        self.sps = None;
        self.pps = None;
        self.key_unit = None;
        self.tail.clear();
        self.gop_bytes = 0;
    }
}

impl Default for GopCache {
    fn default() -> Self {
        Self::new()
    }
}
