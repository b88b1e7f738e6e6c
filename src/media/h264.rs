//! H.264 NAL unit types
//!
//! The encoder writes Annex-B: every NAL unit is prefixed with the 4-byte
//! start code `00 00 00 01`, followed by the one-byte NAL header.
//!
//! ```text
//! +-------------+---+-----+------+----------------
//! | 00 00 00 01 | F | NRI | Type | RBSP payload...
//! |  (4 bytes)  |(1)| (2) | (5)  |
//! +-------------+---+-----+------+----------------
//! ```

use bytes::Bytes;

/// Annex-B start code prefix
pub const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// NAL unit type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NaluType {
    /// Non-IDR slice
    Slice = 1,
    /// Slice data partition A
    SlicePartA = 2,
    /// Slice data partition B
    SlicePartB = 3,
    /// Slice data partition C
    SlicePartC = 4,
    /// IDR slice (keyframe)
    Idr = 5,
    /// Supplemental enhancement information
    Sei = 6,
    /// Sequence parameter set
    Sps = 7,
    /// Picture parameter set
    Pps = 8,
    /// Access unit delimiter
    Aud = 9,
    /// End of sequence
    EndSeq = 10,
    /// End of stream
    EndStream = 11,
    /// Filler data
    Filler = 12,
}

impl NaluType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b & 0x1F {
            1 => Some(NaluType::Slice),
            2 => Some(NaluType::SlicePartA),
            3 => Some(NaluType::SlicePartB),
            4 => Some(NaluType::SlicePartC),
            5 => Some(NaluType::Idr),
            6 => Some(NaluType::Sei),
            7 => Some(NaluType::Sps),
            8 => Some(NaluType::Pps),
            9 => Some(NaluType::Aud),
            10 => Some(NaluType::EndSeq),
            11 => Some(NaluType::EndStream),
            12 => Some(NaluType::Filler),
            _ => None,
        }
    }

    pub fn is_keyframe(&self) -> bool {
        matches!(self, NaluType::Idr)
    }

    pub fn is_parameter_set(&self) -> bool {
        matches!(self, NaluType::Sps | NaluType::Pps)
    }
}

/// Coarse unit classification used for caching and late-join decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitKind {
    /// SPS or PPS
    ParameterSet,
    /// IDR slice; a decoder can start here
    KeyUnit,
    /// Non-IDR slice
    DeltaUnit,
    /// SEI, AUD and anything else
    Other,
}

impl UnitKind {
    /// Classify from the NAL header byte
    pub fn from_header(header: u8) -> Self {
        match NaluType::from_byte(header) {
            Some(NaluType::Sps | NaluType::Pps) => UnitKind::ParameterSet,
            Some(NaluType::Idr) => UnitKind::KeyUnit,
            Some(NaluType::Slice) => UnitKind::DeltaUnit,
            _ => UnitKind::Other,
        }
    }
}

/// Which cache slot a parameter set occupies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterSlot {
    Sps,
    Pps,
}

/// One Annex-B NAL unit, start code included
///
/// Cheap to clone: the payload is reference counted and never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodedUnit {
    kind: UnitKind,
    payload: Bytes,
}

impl CodedUnit {
    /// Wrap an Annex-B unit, classifying it from its NAL header
    ///
    /// A payload with nothing after the start code classifies as `Other`.
    pub fn new(payload: Bytes) -> Self {
        let kind = payload
            .get(START_CODE.len())
            .map(|&header| UnitKind::from_header(header))
            .unwrap_or(UnitKind::Other);
        Self { kind, payload }
    }

    /// Build a unit from a bare NAL (no start code)
    pub fn from_nal(nal: &[u8]) -> Self {
        let mut data = Vec::with_capacity(START_CODE.len() + nal.len());
        data.extend_from_slice(&START_CODE);
        data.extend_from_slice(nal);
        Self::new(Bytes::from(data))
    }

    pub fn kind(&self) -> UnitKind {
        self.kind
    }

    /// Wire bytes, start code included
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Size in bytes including the start code
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Raw NAL type, if a header byte is present
    pub fn nalu_type(&self) -> Option<NaluType> {
        self.payload
            .get(START_CODE.len())
            .and_then(|&header| NaluType::from_byte(header))
    }

    pub fn is_keyframe(&self) -> bool {
        self.kind == UnitKind::KeyUnit
    }

    pub fn parameter_slot(&self) -> Option<ParameterSlot> {
        match self.nalu_type()? {
            NaluType::Sps => Some(ParameterSlot::Sps),
            NaluType::Pps => Some(ParameterSlot::Pps),
            _ => None,
        }
    }
}
