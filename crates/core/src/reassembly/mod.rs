//! Fragment reassembly.
//!
//! Turns the media packet stream (received and FEC-recovered) back into
//! complete [`CodingUnit`]s. One fragment buffer may be open per header
//! type, so fragments of, say, a parameter set and a slice may interleave,
//! but two units of the same type may not. The type a unit is emitted with
//! is settled by its start fragment.
//!
//! ## Fragment state machine
//!
//! ```text
//! (start, end)
//! (1, 1)  single-datagram unit   -> emit payload
//! (1, 0)  first fragment         -> open buffer (replacing a stale one)
//! (0, 0)  middle fragment        -> append, or drop as orphan
//! (0, 1)  last fragment          -> append + emit + close, or drop as orphan
//! ```
//!
//! Sequence gaps are logged but never flush buffers: the missing datagram may
//! still show up via FEC recovery or late delivery.

pub mod dedup;

use std::collections::HashMap;

use crate::media::CodingUnit;
use crate::packet::Packet;

pub use dedup::{DEDUP_CAPACITY, DedupWindow};

/// Upper bound on one reassembled unit (a large key frame).
pub const MAX_UNIT_BYTES: usize = 200 * 1024;

#[derive(Debug, Clone)]
pub struct ReassemblyConfig {
    /// Buffers growing past this are discarded.
    pub max_unit_bytes: usize,
    /// Sequence numbers remembered for duplicate suppression.
    pub dedup_capacity: usize,
}

impl Default for ReassemblyConfig {
    fn default() -> Self {
        Self {
            max_unit_bytes: MAX_UNIT_BYTES,
            dedup_capacity: DEDUP_CAPACITY,
        }
    }
}

/// Counters kept by the [`Reassembler`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReassemblyStats {
    pub units: u64,
    pub deduplicated: u64,
    /// Middle/end fragments with no open buffer for their type.
    pub orphans: u64,
    /// Buffers discarded for exceeding `max_unit_bytes`.
    pub overflows: u64,
    /// Start fragments whose header type disagreed with the NAL header byte.
    pub type_mismatches: u64,
    pub recovered_used: u64,
    pub recovered_dropped: u64,
    pub discontinuities: u64,
}

#[derive(Debug)]
struct FragmentBuffer {
    /// Type resolved from the start fragment; stamped on the emitted unit.
    unit_type: u8,
    data: Vec<u8>,
    /// Sequence number of the last fragment appended.
    last_seq: u16,
}

/// Per-type fragment reassembler with duplicate suppression.
#[derive(Debug)]
pub struct Reassembler {
    config: ReassemblyConfig,
    /// Open buffers keyed by the header type their fragments carry.
    buffers: HashMap<u8, FragmentBuffer>,
    dedup: DedupWindow,
    last_seq: Option<u16>,
    stats: ReassemblyStats,
}

impl Reassembler {
    pub fn new(config: ReassemblyConfig) -> Self {
        let dedup = DedupWindow::new(config.dedup_capacity);
        Self {
            config,
            buffers: HashMap::new(),
            dedup,
            last_seq: None,
            stats: ReassemblyStats::default(),
        }
    }

    /// Feed one packet; returns the units it completed (zero or one).
    ///
    /// Parity packets only advance gap tracking. Recovered packets, whose
    /// boundary flags are unknown, are appended as a middle fragment when
    /// exactly one buffer is open and the packet directly follows that
    /// buffer's last fragment; otherwise they are dropped. A dropped
    /// recovered packet is not remembered, so the original may still arrive
    /// late and be used.
    pub fn process_packet(&mut self, packet: &Packet) -> Vec<CodingUnit> {
        if packet.is_fec {
            self.track_sequence(packet.sequence);
            return Vec::new();
        }

        if packet.is_recovered() {
            if self.dedup.contains(packet.sequence) {
                self.count_duplicate(packet.sequence);
            } else if self.absorb_recovered(packet) {
                self.dedup.insert(packet.sequence);
            }
            return Vec::new();
        }

        if !self.dedup.insert(packet.sequence) {
            self.count_duplicate(packet.sequence);
            return Vec::new();
        }

        self.track_sequence(packet.sequence);
        let key = packet.type_or_count;

        match (packet.is_start, packet.is_end) {
            (true, true) => {
                let unit_type = self.resolve_type(packet);
                self.emit(unit_type, packet.payload.clone())
            }
            (true, false) => {
                let buffer = FragmentBuffer {
                    unit_type: self.resolve_type(packet),
                    data: packet.payload.clone(),
                    last_seq: packet.sequence,
                };
                if self.buffers.insert(key, buffer).is_some() {
                    tracing::debug!(
                        unit_type = key,
                        seq = packet.sequence,
                        "stale fragment buffer replaced"
                    );
                }
                self.check_overflow(key);
                Vec::new()
            }
            (false, true) => {
                if !self.append(key, packet) {
                    return Vec::new();
                }
                match self.buffers.remove(&key) {
                    Some(buffer) => self.emit(buffer.unit_type, buffer.data),
                    None => Vec::new(),
                }
            }
            (false, false) => {
                self.append(key, packet);
                Vec::new()
            }
        }
    }

    fn count_duplicate(&mut self, seq: u16) {
        self.stats.deduplicated += 1;
        tracing::trace!(seq, "duplicate packet dropped");
    }

    /// Append a middle/end fragment to the buffer open under `key`.
    /// Returns whether a buffer was there to take it.
    fn append(&mut self, key: u8, packet: &Packet) -> bool {
        let Some(buffer) = self.buffers.get_mut(&key) else {
            self.stats.orphans += 1;
            tracing::warn!(
                unit_type = key,
                seq = packet.sequence,
                end = packet.is_end,
                "fragment without open buffer, dropped"
            );
            return false;
        };
        buffer.data.extend_from_slice(&packet.payload);
        buffer.last_seq = packet.sequence;
        self.check_overflow(key)
    }

    /// Drop the buffer under `key` if it outgrew the limit. Returns whether
    /// the buffer survived.
    fn check_overflow(&mut self, key: u8) -> bool {
        let len = match self.buffers.get(&key) {
            Some(buffer) => buffer.data.len(),
            None => return false,
        };
        if len <= self.config.max_unit_bytes {
            return true;
        }
        self.buffers.remove(&key);
        self.stats.overflows += 1;
        tracing::warn!(
            unit_type = key,
            len,
            max = self.config.max_unit_bytes,
            "fragment buffer overflow, unit discarded"
        );
        false
    }

    /// Returns whether the recovered packet found a place.
    fn absorb_recovered(&mut self, packet: &Packet) -> bool {
        let mut open = self.buffers.iter_mut();
        let target = match (open.next(), open.next()) {
            (Some((&key, buffer)), None)
                if buffer.last_seq.wrapping_add(1) == packet.sequence =>
            {
                buffer.data.extend_from_slice(&packet.payload);
                buffer.last_seq = packet.sequence;
                Some(key)
            }
            _ => None,
        };

        match target {
            Some(key) => {
                self.stats.recovered_used += 1;
                tracing::debug!(
                    unit_type = key,
                    seq = packet.sequence,
                    "recovered packet appended"
                );
                self.check_overflow(key);
                true
            }
            None => {
                self.stats.recovered_dropped += 1;
                tracing::debug!(
                    seq = packet.sequence,
                    open_buffers = self.buffers.len(),
                    "recovered packet has no unambiguous place, dropped"
                );
                false
            }
        }
    }

    /// The unit type for a start fragment, preferring the NAL header byte
    /// over the datagram header when they disagree.
    fn resolve_type(&mut self, packet: &Packet) -> u8 {
        let header_type = packet.type_or_count;
        let Some(&first) = packet.payload.first() else {
            return header_type;
        };
        let embedded = first & 0x1f;
        if embedded != header_type {
            self.stats.type_mismatches += 1;
            tracing::warn!(
                seq = packet.sequence,
                header_type,
                embedded,
                "unit type mismatch, using NAL header"
            );
        }
        embedded
    }

    fn track_sequence(&mut self, seq: u16) {
        if let Some(last) = self.last_seq {
            let expected = last.wrapping_add(1);
            if seq != expected {
                self.stats.discontinuities += 1;
                tracing::debug!(expected, got = seq, "sequence discontinuity");
            }
        }
        self.last_seq = Some(seq);
    }

    fn emit(&mut self, unit_type: u8, data: Vec<u8>) -> Vec<CodingUnit> {
        self.stats.units += 1;
        tracing::trace!(unit_type, len = data.len(), "coding unit reassembled");
        vec![CodingUnit::new(unit_type, data)]
    }

    pub fn stats(&self) -> ReassemblyStats {
        self.stats
    }

    /// Types with a fragment buffer currently open.
    pub fn open_buffers(&self) -> usize {
        self.buffers.len()
    }

    pub fn reset(&mut self) {
        self.buffers.clear();
        self.dedup.clear();
        self.last_seq = None;
        self.stats = ReassemblyStats::default();
    }
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new(ReassemblyConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pkt(seq: u16, unit_type: u8, start: bool, end: bool, payload: &[u8]) -> Packet {
        Packet::media(seq, 0, unit_type, start, end, payload.to_vec())
    }

    #[test]
    fn single_packet_unit() {
        let mut r = Reassembler::default();
        let out = r.process_packet(&pkt(1, 5, true, true, &[0x65, 0xAA]));
        assert_eq!(out, vec![CodingUnit::new(5, vec![0x65, 0xAA])]);
        assert_eq!(r.open_buffers(), 0);
        assert_eq!(r.stats().units, 1);
    }

    #[test]
    fn fragmented_unit_concatenates() {
        let mut r = Reassembler::default();
        assert!(r.process_packet(&pkt(10, 1, true, false, &[0x41, 1])).is_empty());
        assert!(r.process_packet(&pkt(11, 1, false, false, &[2, 3])).is_empty());
        assert!(r.process_packet(&pkt(12, 1, false, false, &[4])).is_empty());
        let out = r.process_packet(&pkt(13, 1, false, true, &[5, 6]));
        assert_eq!(out, vec![CodingUnit::new(1, vec![0x41, 1, 2, 3, 4, 5, 6])]);
        assert_eq!(r.open_buffers(), 0);
    }

    #[test]
    fn start_then_end_without_middle() {
        let mut r = Reassembler::default();
        r.process_packet(&pkt(0, 7, true, false, &[0x67]));
        let out = r.process_packet(&pkt(1, 7, false, true, &[0x42]));
        assert_eq!(out[0].data, vec![0x67, 0x42]);
    }

    #[test]
    fn different_types_interleave() {
        let mut r = Reassembler::default();
        r.process_packet(&pkt(0, 5, true, false, &[0x65, 1]));
        r.process_packet(&pkt(1, 7, true, false, &[0x67, 9]));
        r.process_packet(&pkt(2, 5, false, false, &[2]));
        let sps = r.process_packet(&pkt(3, 7, false, true, &[8]));
        let idr = r.process_packet(&pkt(4, 5, false, true, &[3]));
        assert_eq!(sps, vec![CodingUnit::new(7, vec![0x67, 9, 8])]);
        assert_eq!(idr, vec![CodingUnit::new(5, vec![0x65, 1, 2, 3])]);
    }

    #[test]
    fn orphans_do_not_disturb_other_buffers() {
        let mut r = Reassembler::default();
        r.process_packet(&pkt(0, 5, true, false, &[0x65, 1]));
        assert!(r.process_packet(&pkt(1, 1, false, false, &[7])).is_empty());
        assert!(r.process_packet(&pkt(2, 1, false, true, &[8])).is_empty());
        assert_eq!(r.stats().orphans, 2);

        let out = r.process_packet(&pkt(3, 5, false, true, &[2]));
        assert_eq!(out, vec![CodingUnit::new(5, vec![0x65, 1, 2])]);
    }

    #[test]
    fn new_start_replaces_stale_buffer() {
        let mut r = Reassembler::default();
        r.process_packet(&pkt(0, 1, true, false, &[0x41, 0xDE, 0xAD]));
        r.process_packet(&pkt(1, 1, true, false, &[0x41, 1]));
        let out = r.process_packet(&pkt(2, 1, false, true, &[2]));
        assert_eq!(out[0].data, vec![0x41, 1, 2]);
    }

    #[test]
    fn duplicates_are_suppressed() {
        let mut r = Reassembler::default();
        let p = pkt(42, 7, true, true, &[0x67, 0x42]);
        assert_eq!(r.process_packet(&p).len(), 1);
        assert!(r.process_packet(&p).is_empty());
        assert_eq!(r.stats().deduplicated, 1);
        assert_eq!(r.stats().units, 1);
    }

    #[test]
    fn duplicate_fragment_not_appended_twice() {
        let mut r = Reassembler::default();
        r.process_packet(&pkt(0, 5, true, false, &[0x65]));
        r.process_packet(&pkt(1, 5, false, false, &[1]));
        r.process_packet(&pkt(1, 5, false, false, &[1]));
        let out = r.process_packet(&pkt(2, 5, false, true, &[2]));
        assert_eq!(out[0].data, vec![0x65, 1, 2]);
    }

    #[test]
    fn gaps_keep_buffers_open() {
        let mut r = Reassembler::default();
        r.process_packet(&pkt(0, 1, true, false, &[0x41]));
        let out = r.process_packet(&pkt(5, 1, false, true, &[9]));
        assert_eq!(out[0].data, vec![0x41, 9]);
        assert_eq!(r.stats().discontinuities, 1);
    }

    #[test]
    fn wraparound_is_contiguous() {
        let mut r = Reassembler::default();
        r.process_packet(&pkt(65535, 1, true, false, &[0x41]));
        let out = r.process_packet(&pkt(0, 1, false, true, &[1]));
        assert_eq!(out.len(), 1);
        assert_eq!(r.stats().discontinuities, 0);
    }

    #[test]
    fn parity_packets_are_ignored_but_keep_sequence() {
        let mut r = Reassembler::default();
        r.process_packet(&pkt(3, 1, true, true, &[0x41]));
        assert!(r.process_packet(&Packet::parity(4, 0, 4, vec![1, 2])).is_empty());
        r.process_packet(&pkt(5, 1, true, true, &[0x41]));
        assert_eq!(r.stats().discontinuities, 0);
        assert_eq!(r.stats().units, 2);
    }

    #[test]
    fn payload_type_wins_on_mismatch() {
        let mut r = Reassembler::default();
        // Every fragment header says 1, the NAL header byte says 5 (IDR).
        assert!(r.process_packet(&pkt(0, 1, true, false, &[0x65, 1])).is_empty());
        assert!(r.process_packet(&pkt(1, 1, false, false, &[2])).is_empty());
        let out = r.process_packet(&pkt(2, 1, false, true, &[3]));
        assert_eq!(out, vec![CodingUnit::new(5, vec![0x65, 1, 2, 3])]);

        let stats = r.stats();
        assert_eq!(stats.type_mismatches, 1);
        assert_eq!(stats.orphans, 0);
        assert_eq!(stats.units, 1);
    }

    #[test]
    fn single_packet_mismatch_uses_payload_type() {
        let mut r = Reassembler::default();
        let out = r.process_packet(&pkt(0, 1, true, true, &[0x67, 0x42]));
        assert_eq!(out, vec![CodingUnit::new(7, vec![0x67, 0x42])]);
        assert_eq!(r.stats().type_mismatches, 1);
    }

    #[test]
    fn overflow_discards_buffer() {
        let mut r = Reassembler::new(ReassemblyConfig {
            max_unit_bytes: 4,
            ..ReassemblyConfig::default()
        });
        r.process_packet(&pkt(0, 1, true, false, &[0x41, 1, 2]));
        r.process_packet(&pkt(1, 1, false, false, &[3, 4]));
        assert_eq!(r.stats().overflows, 1);
        assert_eq!(r.open_buffers(), 0);
        assert!(r.process_packet(&pkt(2, 1, false, true, &[5])).is_empty());
        assert_eq!(r.stats().orphans, 1);
    }

    #[test]
    fn recovered_packet_fills_contiguous_gap() {
        let mut r = Reassembler::default();
        r.process_packet(&pkt(100, 1, true, false, &[0x41, 1]));
        r.process_packet(&pkt(101, 1, false, false, &[2]));
        r.process_packet(&Packet::recovered(102, 0, vec![3]));
        let out = r.process_packet(&pkt(103, 1, false, true, &[4]));
        assert_eq!(out[0].data, vec![0x41, 1, 2, 3, 4]);
        assert_eq!(r.stats().recovered_used, 1);
    }

    #[test]
    fn recovered_packet_without_place_is_dropped() {
        let mut r = Reassembler::default();
        // No buffer open.
        r.process_packet(&Packet::recovered(7, 0, vec![1]));
        // Buffer open but recovered packet is not its successor.
        r.process_packet(&pkt(10, 1, true, false, &[0x41]));
        r.process_packet(&Packet::recovered(12, 0, vec![2]));
        // Two buffers open: ambiguous.
        r.process_packet(&pkt(13, 7, true, false, &[0x67]));
        r.process_packet(&Packet::recovered(14, 0, vec![3]));
        assert_eq!(r.stats().recovered_dropped, 3);
        assert_eq!(r.stats().recovered_used, 0);
    }

    #[test]
    fn late_original_after_dropped_recovery_is_used() {
        let mut r = Reassembler::default();
        // Nowhere to put the rebuilt packet: it is dropped.
        r.process_packet(&Packet::recovered(1, 0, vec![0x41, 7]));
        assert_eq!(r.stats().recovered_dropped, 1);

        // The original, with its boundary flags, shows up afterwards.
        let out = r.process_packet(&pkt(1, 1, true, true, &[0x41, 7]));
        assert_eq!(out, vec![CodingUnit::new(1, vec![0x41, 7])]);
        assert_eq!(r.stats().deduplicated, 0);
    }

    #[test]
    fn late_original_after_recovery_is_deduplicated() {
        let mut r = Reassembler::default();
        r.process_packet(&pkt(1, 1, true, false, &[0x41]));
        r.process_packet(&Packet::recovered(2, 0, vec![2]));
        assert!(r.process_packet(&pkt(2, 1, false, false, &[2])).is_empty());
        assert_eq!(r.stats().deduplicated, 1);
    }

    #[test]
    fn reset_clears_state() {
        let mut r = Reassembler::default();
        r.process_packet(&pkt(0, 1, true, false, &[0x41]));
        r.process_packet(&pkt(1, 7, true, true, &[0x67]));
        r.reset();
        assert_eq!(r.open_buffers(), 0);
        assert_eq!(r.stats(), ReassemblyStats::default());
        // Same sequence number is no longer a duplicate.
        assert_eq!(r.process_packet(&pkt(1, 7, true, true, &[0x67])).len(), 1);
        // And the old fragment buffer is gone.
        assert!(r.process_packet(&pkt(2, 1, false, true, &[1])).is_empty());
    }
}
