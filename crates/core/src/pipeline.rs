use crate::error::{Result, StreamError};
use crate::fec::{FecConfig, FecEngine};
use crate::media::CodingUnit;
use crate::packet::{HEADER_LEN, MAX_DATAGRAM_LEN, MAX_PAYLOAD, Packet};
use crate::reassembly::{Reassembler, ReassemblyConfig};
use crate::stats::StreamStats;

/// Datagram-to-unit processing chain: parse, FEC, reassembly.
///
/// Owns all per-stream receive state. The [`Receiver`](crate::Receiver)
/// worker drives one instance; tests can drive it directly without a socket.
#[derive(Debug)]
pub struct ReceivePipeline {
    fec: FecEngine,
    reassembler: Reassembler,
    packets_received: u64,
    bytes_received: u64,
    malformed: u64,
    frames_delivered: u64,
}

impl ReceivePipeline {
    pub fn new(fec: FecConfig, reassembly: ReassemblyConfig) -> Self {
        Self {
            fec: FecEngine::new(fec),
            reassembler: Reassembler::new(reassembly),
            packets_received: 0,
            bytes_received: 0,
            malformed: 0,
            frames_delivered: 0,
        }
    }

    /// Process one datagram and return the units it completed.
    ///
    /// The packet itself goes to the reassembler first, then any packet the
    /// FEC engine rebuilt. A datagram shorter than the header is counted and
    /// reported as [`StreamError::MalformedPacket`]; one longer than
    /// [`MAX_DATAGRAM_LEN`] as [`StreamError::PayloadTooLarge`]. Either way
    /// the pipeline state is untouched and the caller is expected to carry on.
    pub fn process_datagram(&mut self, datagram: &[u8]) -> Result<Vec<CodingUnit>> {
        if datagram.len() > MAX_DATAGRAM_LEN {
            self.malformed += 1;
            return Err(StreamError::PayloadTooLarge {
                len: datagram.len() - HEADER_LEN,
                max: MAX_PAYLOAD,
            });
        }
        let packet = match Packet::parse(datagram) {
            Ok(packet) => packet,
            Err(e) => {
                self.malformed += 1;
                return Err(e);
            }
        };
        self.packets_received += 1;
        self.bytes_received += datagram.len() as u64;

        Ok(self.process_packet(&packet))
    }

    /// Process an already parsed packet.
    pub fn process_packet(&mut self, packet: &Packet) -> Vec<CodingUnit> {
        let recovered = self.fec.process_packet(packet);

        let mut units = self.reassembler.process_packet(packet);
        for packet in &recovered {
            units.extend(self.reassembler.process_packet(packet));
        }

        self.frames_delivered += units.iter().filter(|u| u.kind().is_frame()).count() as u64;
        units
    }

    /// Snapshot of the counters. Rate and decoder fields are left at zero
    /// for the caller to fill in.
    pub fn stats(&self) -> StreamStats {
        let reassembly = self.reassembler.stats();
        StreamStats {
            packets_received: self.packets_received,
            bytes_received: self.bytes_received,
            malformed: self.malformed,
            fec_recovered: self.fec.recovered_count(),
            fec_unrecoverable: self.fec.unrecoverable_count(),
            units_reassembled: reassembly.units,
            deduplicated: reassembly.deduplicated,
            orphan_fragments: reassembly.orphans,
            type_mismatches: reassembly.type_mismatches,
            frames_delivered: self.frames_delivered,
            ..StreamStats::default()
        }
    }

    pub fn fec(&self) -> &FecEngine {
        &self.fec
    }

    pub fn reassembler(&self) -> &Reassembler {
        &self.reassembler
    }

    pub fn reset(&mut self) {
        self.fec.reset();
        self.reassembler.reset();
        self.packets_received = 0;
        self.bytes_received = 0;
        self.malformed = 0;
        self.frames_delivered = 0;
    }
}

impl Default for ReceivePipeline {
    fn default() -> Self {
        Self::new(FecConfig::default(), ReassemblyConfig::default())
    }
}
