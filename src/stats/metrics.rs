//! Statistics for relay sessions

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::media::{CodedUnit, UnitKind};

/// Point-in-time statistics of one session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Bytes read from the encoder
    pub bytes_received: u64,
    /// Units produced by the extractor
    pub units_received: u64,
    /// Key units produced by the extractor
    pub key_units: u64,
    /// Units discarded by subscriber overflow, summed over subscribers
    pub units_dropped: u64,
    /// Subscribers ever attached
    pub subscribers_total: u64,
    /// Time since the session was started
    pub duration: Duration,
    /// Average encoder output bitrate (bits/sec)
    pub bitrate: u64,
}

impl SessionStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Calculate bitrate from bytes and duration
    pub fn calculate_bitrate(&mut self) {
        let secs = self.duration.as_secs();
        if secs > 0 {
            self.bitrate = (self.bytes_received * 8) / secs;
        }
    }
}

/// Live counters updated by the pump and subscribe paths
#[derive(Debug)]
pub struct SessionCounters {
    started_at: Instant,
    bytes_received: AtomicU64,
    units_received: AtomicU64,
    key_units: AtomicU64,
    units_dropped: AtomicU64,
    subscribers_total: AtomicU64,
}

impl SessionCounters {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            bytes_received: AtomicU64::new(0),
            units_received: AtomicU64::new(0),
            key_units: AtomicU64::new(0),
            units_dropped: AtomicU64::new(0),
            subscribers_total: AtomicU64::new(0),
        }
    }

    pub fn record_chunk(&self, len: usize) {
        self.bytes_received.fetch_add(len as u64, Ordering::Relaxed);
    }

    pub fn record_unit(&self, unit: &CodedUnit) {
        self.units_received.fetch_add(1, Ordering::Relaxed);
        if unit.kind() == UnitKind::KeyUnit {
            self.key_units.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_drop(&self) {
        self.units_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_subscriber(&self) {
        self.subscribers_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the counters into a [`SessionStats`]
    pub fn snapshot(&self) -> SessionStats {
        let mut stats = SessionStats {
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            units_received: self.units_received.load(Ordering::Relaxed),
            key_units: self.key_units.load(Ordering::Relaxed),
            units_dropped: self.units_dropped.load(Ordering::Relaxed),
            subscribers_total: self.subscribers_total.load(Ordering::Relaxed),
            duration: self.started_at.elapsed(),
            bitrate: 0,
        };
        stats.calculate_bitrate();
        stats
    }
}

impl Default for SessionCounters {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_stats_new() {
        let stats = SessionStats::new();
        assert_eq!(stats.bytes_received, 0);
        assert_eq!(stats.units_received, 0);
        assert_eq!(stats.key_units, 0);
        assert_eq!(stats.units_dropped, 0);
        assert_eq!(stats.bitrate, 0);
    }

    #[test]
    fn test_session_stats_calculate_bitrate() {
        let mut stats = SessionStats::new();
        stats.bytes_received = 1_000_000;
        stats.duration = Duration::from_secs(10);

        stats.calculate_bitrate();

        // 1,000,000 bytes * 8 bits / 10 seconds
        assert_eq!(stats.bitrate, 800_000);
    }

    #[test]
    fn test_session_stats_calculate_bitrate_zero_duration() {
        let mut stats = SessionStats::new();
        stats.bytes_received = 1_000_000;

        stats.calculate_bitrate();

        assert_eq!(stats.bitrate, 0);
    }

    #[test]
    fn test_counters_snapshot() {
        let counters = SessionCounters::new();

        counters.record_chunk(100);
        counters.record_chunk(28);
        counters.record_unit(&CodedUnit::from_nal(&[0x67, 0x42]));
        counters.record_unit(&CodedUnit::from_nal(&[0x65, 0x88]));
        counters.record_unit(&CodedUnit::from_nal(&[0x41, 0x9a]));
        counters.record_drop();
        counters.record_subscriber();
        counters.record_subscriber();

        let stats = counters.snapshot();

        assert_eq!(stats.bytes_received, 128);
        assert_eq!(stats.units_received, 3);
        assert_eq!(stats.key_units, 1);
        assert_eq!(stats.units_dropped, 1);
        assert_eq!(stats.subscribers_total, 2);
    }
}
