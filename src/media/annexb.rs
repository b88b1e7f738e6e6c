//! Annex-B byte stream segmentation
//!
//! The encoder's stdout arrives in reads of arbitrary size, so a unit (or its
//! start code) may be split across any number of chunks. The extractor keeps
//! everything after the last confirmed start code in a residual buffer and
//! only emits a unit once the following start code has been seen, or when
//! the stream is flushed at end of input.
//!
//! ```text
//!  chunk 1              chunk 2                 chunk 3
//! [00 00 00 01 67 ..][.. 00 00 | 00 01 68 ..][.. 00 00 00 01 65 ..]
//!  └──── SPS ──────────────────┘└──── PPS ──────┘└── residual ──
//! ```

use bytes::{Buf, BytesMut};

use super::h264::{CodedUnit, START_CODE};

/// Default upper bound for a single unit (4MB)
pub const DEFAULT_MAX_UNIT_BYTES: usize = 4 * 1024 * 1024;

/// Stateful Annex-B unit extractor
///
/// One instance per stream. Holds no state besides the residual buffer, so
/// [`reset`](Self::reset) returns it to a fresh state.
#[derive(Debug)]
pub struct UnitExtractor {
    /// Bytes seen but not yet emitted; begins with a start code once synced
    buf: BytesMut,
    /// Whether `buf` starts on a start code
    synced: bool,
    /// Offset at which scanning resumes on the next push
    scan_from: usize,
    /// Units larger than this are discarded
    max_unit_bytes: usize,
    /// Bytes thrown away (leading garbage, oversized units)
    discarded_bytes: u64,
}

impl UnitExtractor {
    /// Create an extractor with the default unit size limit
    pub fn new() -> Self {
        Self::with_max_unit_size(DEFAULT_MAX_UNIT_BYTES)
    }

    /// Create an extractor with a custom unit size limit
    pub fn with_max_unit_size(max_unit_bytes: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(64 * 1024),
            synced: false,
            scan_from: 0,
            max_unit_bytes: max_unit_bytes.max(START_CODE.len() + 1),
            discarded_bytes: 0,
        }
    }

    /// Feed the next chunk, returning every unit whose end is now known
    pub fn push(&mut self, chunk: &[u8]) -> Vec<CodedUnit> {
        let mut units = Vec::new();
        if chunk.is_empty() {
            return units;
        }

        self.buf.extend_from_slice(chunk);

        if !self.synced && !self.sync() {
            return units;
        }

        while let Some(pos) = find_start_code(&self.buf, self.scan_from) {
            let unit = self.buf.split_to(pos).freeze();
            self.scan_from = START_CODE.len();

            if unit.len() > self.max_unit_bytes {
                self.discard_oversized(unit.len());
                continue;
            }
            units.push(CodedUnit::new(unit));
        }

        // A start code may straddle this chunk and the next one
        self.scan_from = self
            .buf
            .len()
            .saturating_sub(START_CODE.len() - 1)
            .max(START_CODE.len());

        // The last bytes may be the start of the next start code
        let pending = self.buf.len().saturating_sub(START_CODE.len() - 1);
        if pending > self.max_unit_bytes {
            // Keep the tail so a start code split at the boundary is still found
            let drop = self.buf.len() - (START_CODE.len() - 1);
            self.buf.advance(drop);
            self.discard_oversized(drop);
            self.synced = false;
            self.scan_from = 0;
        }

        units
    }

    /// Emit the trailing unit at end of stream
    ///
    /// Returns nothing if the residual is only a start code or was never
    /// synced. The extractor is reset afterwards.
    pub fn flush(&mut self) -> Option<CodedUnit> {
        let unit = if self.synced && self.buf.len() > START_CODE.len() {
            Some(CodedUnit::new(self.buf.split().freeze()))
        } else {
            None
        };
        self.reset();
        unit
    }

    /// Discard the residual buffer
    pub fn reset(&mut self) {
        self.buf.clear();
        self.synced = false;
        self.scan_from = 0;
    }

    /// Number of bytes currently held awaiting a unit boundary
    pub fn residual_len(&self) -> usize {
        self.buf.len()
    }

    /// Total bytes dropped as leading garbage or oversized units
    pub fn discarded_bytes(&self) -> u64 {
        self.discarded_bytes
    }

    /// Align the buffer on the first start code. Returns false if none yet.
    fn sync(&mut self) -> bool {
        match find_start_code(&self.buf, 0) {
            Some(pos) => {
                if pos > 0 {
                    tracing::warn!(bytes = pos, "Discarding data before first start code");
                    self.buf.advance(pos);
                    self.discarded_bytes += pos as u64;
                }
                self.synced = true;
                self.scan_from = START_CODE.len();
                true
            }
            None => {
                let keep = self.buf.len().min(START_CODE.len() - 1);
                let junk = self.buf.len() - keep;
                if junk > 0 {
                    self.buf.advance(junk);
                    self.discarded_bytes += junk as u64;
                }
                false
            }
        }
    }

    fn discard_oversized(&mut self, len: usize) {
        tracing::warn!(
            bytes = len,
            limit = self.max_unit_bytes,
            "NAL unit too large, skipping"
        );
        self.discarded_bytes += len as u64;
    }
}

impl Default for UnitExtractor {
    fn default() -> Self {
        Self::new()
    }
}

/// Position of the next 4-byte start code at or after `from`
fn find_start_code(buf: &[u8], from: usize) -> Option<usize> {
    if from >= buf.len() {
        return None;
    }
    buf[from..]
        .windows(START_CODE.len())
        .position(|w| w == START_CODE)
        .map(|pos| pos + from)
}
