use crate::error::{Result, StreamError};

/// Size of the fixed datagram header.
pub const HEADER_LEN: usize = 4;

/// Largest payload the sender puts in one datagram.
pub const MAX_PAYLOAD: usize = 1400;

/// Largest well-formed datagram on the wire.
pub const MAX_DATAGRAM_LEN: usize = HEADER_LEN + MAX_PAYLOAD;

const FLAG_FEC: u8 = 0x80;
const FLAG_START: u8 = 0x40;
const FLAG_END: u8 = 0x20;
const TYPE_MASK: u8 = 0x1f;

/// Where a [`Packet`] came from on the receive side.
///
/// Never serialized. A [`Recovered`](Self::Recovered) packet was rebuilt
/// from FEC parity, so its start/end/type bits are unknown and left false/0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PacketOrigin {
    #[default]
    Received,
    Recovered,
}

/// One datagram of the stream.
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |        Sequence Number        |F|S|E|  Type   |    Group ID   |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                        Payload ...                            |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// - **Sequence number**: 16-bit big-endian, wraps at 65536. Parity packets
///   share the sequence space with media packets.
/// - **F**: parity (FEC) packet.
/// - **S / E**: first / last fragment of a coding unit. Both set means the
///   unit fits in a single datagram.
/// - **Type**: 5 bits. The NAL unit type for media packets, the number of
///   protected media packets for parity packets.
/// - **Group ID**: FEC group this packet belongs to, wraps at 256.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub sequence: u16,
    pub is_fec: bool,
    pub is_start: bool,
    pub is_end: bool,
    /// Unit type for media packets, group size for parity packets.
    pub type_or_count: u8,
    pub group_id: u8,
    pub payload: Vec<u8>,
    pub origin: PacketOrigin,
}

impl Packet {
    /// Build a media packet. `unit_type` is masked to 5 bits.
    pub fn media(
        sequence: u16,
        group_id: u8,
        unit_type: u8,
        is_start: bool,
        is_end: bool,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            sequence,
            is_fec: false,
            is_start,
            is_end,
            type_or_count: unit_type & TYPE_MASK,
            group_id,
            payload,
            origin: PacketOrigin::Received,
        }
    }

    /// Build a parity packet protecting `count` media packets.
    pub fn parity(sequence: u16, group_id: u8, count: u8, payload: Vec<u8>) -> Self {
        Self {
            sequence,
            is_fec: true,
            is_start: false,
            is_end: false,
            type_or_count: count & TYPE_MASK,
            group_id,
            payload,
            origin: PacketOrigin::Received,
        }
    }

    /// Build a media packet rebuilt from parity. Boundary flags and type are
    /// not recoverable from XOR and stay cleared.
    pub fn recovered(sequence: u16, group_id: u8, payload: Vec<u8>) -> Self {
        Self {
            origin: PacketOrigin::Recovered,
            ..Self::media(sequence, group_id, 0, false, false, payload)
        }
    }

    /// Parse a datagram. The payload is copied out of `data`.
    ///
    /// Returns [`StreamError::MalformedPacket`] when `data` is shorter than
    /// [`HEADER_LEN`]. An empty payload is valid.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(StreamError::MalformedPacket { len: data.len() });
        }

        let flags = data[2];
        Ok(Self {
            sequence: u16::from_be_bytes([data[0], data[1]]),
            is_fec: flags & FLAG_FEC != 0,
            is_start: flags & FLAG_START != 0,
            is_end: flags & FLAG_END != 0,
            type_or_count: flags & TYPE_MASK,
            group_id: data[3],
            payload: data[HEADER_LEN..].to_vec(),
            origin: PacketOrigin::Received,
        })
    }

    /// The flags byte as it appears on the wire.
    pub fn flags(&self) -> u8 {
        let mut flags = self.type_or_count & TYPE_MASK;
        if self.is_fec {
            flags |= FLAG_FEC;
        }
        if self.is_start {
            flags |= FLAG_START;
        }
        if self.is_end {
            flags |= FLAG_END;
        }
        flags
    }

    /// Serialize the 4-byte header.
    pub fn header(&self) -> [u8; HEADER_LEN] {
        let seq = self.sequence.to_be_bytes();
        [seq[0], seq[1], self.flags(), self.group_id]
    }

    /// Append the serialized datagram to `out`.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.reserve(HEADER_LEN + self.payload.len());
        out.extend_from_slice(&self.header());
        out.extend_from_slice(&self.payload);
    }

    /// Serialize into a fresh datagram buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
        self.write_to(&mut out);
        out
    }

    pub fn is_recovered(&self) -> bool {
        self.origin == PacketOrigin::Recovered
    }
}
