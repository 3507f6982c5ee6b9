//! Coding units and the decoder boundary.
//!
//! A coding unit is one complete H.264 NAL unit: a parameter set or a coded
//! slice. The receive pipeline emits [`CodingUnit`]s and pushes them into a
//! [`DecodeSink`]; the sender side ([`h264`]) turns an Annex B bitstream into
//! datagrams.
//!
//! ## Unit types
//!
//! | Type | Kind | Meaning |
//! |------|------|---------|
//! | 7 | [`UnitKind::SequenceParameterSet`] | stream configuration, part A |
//! | 8 | [`UnitKind::PictureParameterSet`] | stream configuration, part B |
//! | 5 | [`UnitKind::KeyFrame`] | IDR slice |
//! | 1 | [`UnitKind::DeltaFrame`] | non-IDR slice |

pub mod h264;

/// Annex B 4-byte start code.
pub const START_CODE: [u8; 4] = [0, 0, 0, 1];

/// Classification of a 5-bit NAL unit type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitKind {
    SequenceParameterSet,
    PictureParameterSet,
    KeyFrame,
    DeltaFrame,
    Other(u8),
}

impl UnitKind {
    /// Whether the unit carries a picture (and counts as a frame).
    pub fn is_frame(self) -> bool {
        matches!(self, Self::KeyFrame | Self::DeltaFrame)
    }

    /// Units the decoder cannot start without. The sender may repeat these.
    pub fn is_critical(self) -> bool {
        matches!(
            self,
            Self::SequenceParameterSet | Self::PictureParameterSet | Self::KeyFrame
        )
    }
}

impl From<u8> for UnitKind {
    fn from(unit_type: u8) -> Self {
        match unit_type & 0x1f {
            7 => Self::SequenceParameterSet,
            8 => Self::PictureParameterSet,
            5 => Self::KeyFrame,
            1 => Self::DeltaFrame,
            other => Self::Other(other),
        }
    }
}

/// One reassembled NAL unit, ready for a decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodingUnit {
    pub unit_type: u8,
    pub data: Vec<u8>,
}

impl CodingUnit {
    pub fn new(unit_type: u8, data: Vec<u8>) -> Self {
        Self { unit_type, data }
    }

    pub fn kind(&self) -> UnitKind {
        UnitKind::from(self.unit_type)
    }

    /// The unit prefixed with a 4-byte start code, as decoders reading a
    /// byte stream expect it.
    pub fn to_annex_b(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(START_CODE.len() + self.data.len());
        out.extend_from_slice(&START_CODE);
        out.extend_from_slice(&self.data);
        out
    }
}

/// Consumer of reassembled units (a hardware or software decoder).
///
/// Push-only: the receive loop assumes `submit` returns quickly.
pub trait DecodeSink: Send {
    fn submit(&mut self, unit: CodingUnit);

    /// Frames the decoder reports as rendered, for statistics.
    fn frames_decoded(&self) -> u64 {
        0
    }
}

impl DecodeSink for std::sync::mpsc::Sender<CodingUnit> {
    fn submit(&mut self, unit: CodingUnit) {
        if self.send(unit).is_err() {
            tracing::trace!("decode sink channel closed, unit dropped");
        }
    }
}

impl<S: DecodeSink + ?Sized> DecodeSink for Box<S> {
    fn submit(&mut self, unit: CodingUnit) {
        (**self).submit(unit)
    }

    fn frames_decoded(&self) -> u64 {
        (**self).frames_decoded()
    }
}
