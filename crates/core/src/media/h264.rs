use crate::error::{Result, StreamError};
use crate::fec::{FEC_GROUP_SIZE, FecEncoder};
use crate::packet::{MAX_PAYLOAD, Packet};

use super::UnitKind;

/// H.264 sender: NAL units in, FEC-protected datagrams out.
///
/// The symmetric counterpart of the receive pipeline, used by the CLI sender
/// and by tests that need a realistic packet stream.
///
/// ## Fragmentation
///
/// NAL units that fit in `max_payload` bytes go out as one datagram with
/// both start and end bits set. Larger units are split into
/// `max_payload`-sized fragments; the first carries the start bit, the last
/// the end bit. Unlike RTP FU-A there is no extra fragment header: the NAL
/// header byte simply stays at the front of the first fragment, and every
/// fragment repeats the NAL type in the datagram header.
///
/// ## FEC
///
/// After every [`FEC_GROUP_SIZE`] media datagrams a parity datagram is
/// emitted with the next sequence number, the same group id, and the group
/// size in its type field. The group id then advances (wrapping at 256).
///
/// ## Repetition
///
/// With [`repeat_critical`](Self::repeat_critical) enabled, every datagram of
/// a parameter set or key frame is sent twice with the same sequence number.
/// The receiver's dedup window drops the copy when both arrive.
#[derive(Debug)]
pub struct H264Packetizer {
    sequence: u16,
    group_id: u8,
    max_payload: usize,
    fec: FecEncoder,
    repeat_critical: bool,
}

impl H264Packetizer {
    pub fn new() -> Self {
        Self::with_initial_sequence(0)
    }

    /// Start numbering at `sequence`, e.g. to exercise wraparound.
    pub fn with_initial_sequence(sequence: u16) -> Self {
        Self {
            sequence,
            group_id: 0,
            max_payload: MAX_PAYLOAD,
            fec: FecEncoder::new(FEC_GROUP_SIZE),
            repeat_critical: false,
        }
    }

    /// Override the per-datagram payload size (at most [`MAX_PAYLOAD`]).
    pub fn with_max_payload(mut self, max_payload: usize) -> Result<Self> {
        if max_payload == 0 || max_payload > MAX_PAYLOAD {
            return Err(StreamError::PayloadTooLarge {
                len: max_payload,
                max: MAX_PAYLOAD,
            });
        }
        self.max_payload = max_payload;
        Ok(self)
    }

    /// Override the FEC group size. Must fit the 5-bit count field.
    pub fn with_group_size(mut self, group_size: usize) -> Result<Self> {
        if group_size == 0 || group_size > 0x1f {
            return Err(StreamError::InvalidConfig(format!(
                "FEC group size {group_size} outside 1..=31"
            )));
        }
        self.fec = FecEncoder::new(group_size);
        Ok(self)
    }

    pub fn repeat_critical(mut self, enabled: bool) -> Self {
        self.repeat_critical = enabled;
        self
    }

    /// Sequence number the next datagram will carry.
    pub fn next_sequence(&self) -> u16 {
        self.sequence
    }

    /// Packetize every NAL unit of an Annex B bitstream.
    pub fn packetize(&mut self, encoded_data: &[u8]) -> Vec<Vec<u8>> {
        let nal_units = Self::extract_nal_units(encoded_data);
        let mut datagrams = Vec::new();
        for nal in &nal_units {
            datagrams.append(&mut self.packetize_nal(nal));
        }

        tracing::trace!(
            nal_count = nal_units.len(),
            datagrams = datagrams.len(),
            bytes = encoded_data.len(),
            seq = self.sequence,
            "bitstream packetized"
        );
        datagrams
    }

    /// Packetize a single NAL unit (without start code) into datagrams,
    /// interleaving parity datagrams as groups fill.
    pub fn packetize_nal(&mut self, nal_unit: &[u8]) -> Vec<Vec<u8>> {
        let mut datagrams = Vec::new();
        if nal_unit.is_empty() {
            return datagrams;
        }

        let nal_type = nal_unit[0] & 0x1f;
        let repeat = self.repeat_critical && UnitKind::from(nal_type).is_critical();
        let chunks: Vec<&[u8]> = nal_unit.chunks(self.max_payload).collect();
        let last = chunks.len() - 1;

        for (i, chunk) in chunks.into_iter().enumerate() {
            let packet = Packet::media(
                self.sequence,
                self.group_id,
                nal_type,
                i == 0,
                i == last,
                chunk.to_vec(),
            );
            self.sequence = self.sequence.wrapping_add(1);

            let bytes = packet.to_bytes();
            if repeat {
                datagrams.push(bytes.clone());
            }
            datagrams.push(bytes);

            if let Some(parity) = self.fec.push(chunk) {
                let count = self.fec.group_size() as u8;
                let fec = Packet::parity(self.sequence, self.group_id, count, parity);
                self.sequence = self.sequence.wrapping_add(1);
                datagrams.push(fec.to_bytes());
                self.group_id = self.group_id.wrapping_add(1);
            }
        }

        if last > 0 {
            tracing::trace!(
                nal_type,
                nal_size = nal_unit.len(),
                fragments = last + 1,
                "fragmented NAL unit"
            );
        }

        datagrams
    }

    /// Split an Annex B bitstream into NAL units, start codes removed.
    ///
    /// Both the 3-byte (`00 00 01`) and 4-byte (`00 00 00 01`) start code
    /// forms are accepted and may be mixed. Bytes before the first start code
    /// are ignored, as are empty units between back-to-back start codes.
    pub fn extract_nal_units(data: &[u8]) -> Vec<Vec<u8>> {
        let codes = start_codes(data);
        codes
            .iter()
            .enumerate()
            .filter_map(|(idx, &(_, body))| {
                let end = codes.get(idx + 1).map_or(data.len(), |&(next, _)| next);
                (body < end).then(|| data[body..end].to_vec())
            })
            .collect()
    }
}

/// `(code_offset, body_offset)` of every start code in `data`.
fn start_codes(data: &[u8]) -> Vec<(usize, usize)> {
    let mut found = Vec::new();
    let mut pos = 0;
    while let Some(rel) = data[pos..].windows(3).position(|w| w == [0, 0, 1]) {
        let hit = pos + rel;
        // A zero in front of `00 00 01` belongs to the 4-byte form.
        let code = if hit > pos && data[hit - 1] == 0 {
            hit - 1
        } else {
            hit
        };
        found.push((code, hit + 3));
        pos = hit + 3;
    }
    found
}

impl Default for H264Packetizer {
    fn default() -> Self {
        Self::new()
    }
}
