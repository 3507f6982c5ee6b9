//! XOR forward error correction.
//!
//! The sender protects every run of [`FEC_GROUP_SIZE`] consecutive media
//! packets with one parity packet whose payload is the byte-wise XOR of the
//! group's payloads:
//!
//! ```text
//! seq:     100    101    102    103    104
//!          [a]    [b]    [c]    [d]    [P = a ^ b ^ c ^ d]   group_id = g
//! ```
//!
//! The parity packet takes the sequence number right after the last media
//! packet it protects and carries the group size in its type field, so the
//! receiver can derive the protected range without any extra header. Any one
//! missing member is `P ^` (the other three).
//!
//! Several groups may be in flight at once when packets arrive out of order.
//! [`FecEngine`] keeps up to [`MAX_TRACKED_GROUPS`] of them and evicts the
//! earliest-created group when a new one would exceed that.

pub mod encoder;

use std::collections::{HashMap, VecDeque};

use crate::packet::Packet;

pub use encoder::FecEncoder;

/// Media packets per parity packet.
pub const FEC_GROUP_SIZE: usize = 4;

/// Groups tracked in parallel before the oldest is evicted.
pub const MAX_TRACKED_GROUPS: usize = 4;

/// Completed groups remembered so late members do not reopen them.
const COMPLETED_HISTORY: usize = 8;

/// FEC engine settings.
#[derive(Debug, Clone)]
pub struct FecConfig {
    /// Ceiling on simultaneously tracked groups.
    pub max_groups: usize,
}

impl Default for FecConfig {
    fn default() -> Self {
        Self {
            max_groups: MAX_TRACKED_GROUPS,
        }
    }
}

#[derive(Debug, Default)]
struct FecGroup {
    media: HashMap<u16, Packet>,
    parity: Option<Packet>,
    /// Group size announced by the parity packet; 0 until it arrives.
    expected_count: usize,
}

impl FecGroup {
    fn is_complete(&self) -> bool {
        self.expected_count > 0 && self.media.len() >= self.expected_count
    }

    /// Rebuild the single missing media packet, if exactly one is missing.
    fn try_recover(&self, group_id: u8) -> Option<Packet> {
        let parity = self.parity.as_ref()?;
        if self.expected_count == 0 || self.media.len() + 1 != self.expected_count {
            return None;
        }

        let protected = protected_range(parity.sequence, self.expected_count);
        let missing: Vec<u16> = protected
            .iter()
            .copied()
            .filter(|seq| !self.media.contains_key(seq))
            .collect();
        let [lost] = missing[..] else {
            // A stray packet outside the protected range inflated the count.
            return None;
        };

        let mut payload = parity.payload.clone();
        for seq in &protected {
            if let Some(packet) = self.media.get(seq) {
                xor_into(&mut payload, &packet.payload);
            }
        }

        Some(Packet::recovered(lost, group_id, payload))
    }
}

/// A group that already completed, identified by where its parity sat.
#[derive(Debug, Clone, Copy)]
struct CompletedGroup {
    group_id: u8,
    parity_seq: u16,
    count: usize,
}

impl CompletedGroup {
    /// Whether `packet` is a late or repeated member of this group.
    fn covers(&self, packet: &Packet) -> bool {
        if packet.is_fec {
            return packet.sequence == self.parity_seq;
        }
        let back = self.parity_seq.wrapping_sub(packet.sequence) as usize;
        (1..=self.count).contains(&back)
    }
}

/// The `count` sequence numbers immediately preceding `parity_seq`, oldest
/// first, wrapping below zero.
pub fn protected_range(parity_seq: u16, count: usize) -> Vec<u16> {
    (1..=count)
        .rev()
        .map(|back| parity_seq.wrapping_sub(back as u16))
        .collect()
}

/// XOR `src` into `acc` byte by byte, up to the shorter of the two.
pub fn xor_into(acc: &mut [u8], src: &[u8]) {
    for (a, b) in acc.iter_mut().zip(src) {
        *a ^= b;
    }
}

/// Receive-side FEC group tracker and erasure decoder.
///
/// Not thread-safe by itself; owned by a single receive worker.
#[derive(Debug)]
pub struct FecEngine {
    config: FecConfig,
    groups: HashMap<u8, FecGroup>,
    /// Group ids in creation order, for eviction.
    created: VecDeque<u8>,
    completed: VecDeque<CompletedGroup>,
    recovered: u64,
    late: u64,
    evicted: u64,
    unrecoverable: u64,
}

impl FecEngine {
    pub fn new(config: FecConfig) -> Self {
        Self {
            config,
            groups: HashMap::new(),
            created: VecDeque::new(),
            completed: VecDeque::new(),
            recovered: 0,
            late: 0,
            evicted: 0,
            unrecoverable: 0,
        }
    }

    /// Feed one packet (media or parity) into its group.
    ///
    /// Returns the recovered media packet when this packet completes a group
    /// with exactly one member missing, otherwise an empty list. Recovered
    /// packets are tagged [`PacketOrigin::Recovered`](crate::packet::PacketOrigin::Recovered)
    /// and carry no boundary flags.
    ///
    /// Members of a group that already completed are ignored rather than
    /// reopening it.
    pub fn process_packet(&mut self, packet: &Packet) -> Vec<Packet> {
        let group_id = packet.group_id;
        if !self.groups.contains_key(&group_id) && self.is_late_member(packet) {
            self.late += 1;
            tracing::trace!(
                group_id,
                seq = packet.sequence,
                "packet for completed FEC group ignored"
            );
            return Vec::new();
        }
        if !self.groups.contains_key(&group_id) {
            self.created.push_back(group_id);
        }
        let group = self.groups.entry(group_id).or_default();

        if packet.is_fec {
            group.expected_count = packet.type_or_count as usize;
            group.parity = Some(packet.clone());
        } else {
            group
                .media
                .entry(packet.sequence)
                .or_insert_with(|| packet.clone());
        }

        let mut out = Vec::new();
        if let Some(recovered) = group.try_recover(group_id) {
            tracing::debug!(
                group_id,
                seq = recovered.sequence,
                len = recovered.payload.len(),
                "recovered packet from parity"
            );
            group.media.insert(recovered.sequence, recovered.clone());
            self.recovered += 1;
            out.push(recovered);
        }

        if group.is_complete() {
            let count = group.expected_count;
            let parity_seq = group.parity.as_ref().map(|p| p.sequence);
            self.groups.remove(&group_id);
            self.created.retain(|&id| id != group_id);
            if let Some(parity_seq) = parity_seq {
                self.remember_completed(CompletedGroup {
                    group_id,
                    parity_seq,
                    count,
                });
            }
            tracing::trace!(group_id, "FEC group complete");
        }

        self.evict_excess();
        out
    }

    /// Checks `packet` against the completed-group history. A packet that
    /// reuses a completed id for a new range retires that history entry.
    fn is_late_member(&mut self, packet: &Packet) -> bool {
        let Some(pos) = self
            .completed
            .iter()
            .position(|done| done.group_id == packet.group_id)
        else {
            return false;
        };
        if self.completed[pos].covers(packet) {
            return true;
        }
        self.completed.remove(pos);
        false
    }

    fn remember_completed(&mut self, done: CompletedGroup) {
        self.completed.retain(|old| old.group_id != done.group_id);
        if self.completed.len() == COMPLETED_HISTORY {
            self.completed.pop_front();
        }
        self.completed.push_back(done);
    }

    fn evict_excess(&mut self) {
        while self.groups.len() > self.config.max_groups {
            let Some(oldest) = self.created.pop_front() else {
                break;
            };
            let Some(group) = self.groups.remove(&oldest) else {
                continue;
            };
            self.evicted += 1;
            let missing = group.expected_count.saturating_sub(group.media.len());
            if group.parity.is_some() && missing > 1 {
                self.unrecoverable += 1;
            }
            tracing::debug!(
                group_id = oldest,
                received = group.media.len(),
                expected = group.expected_count,
                has_parity = group.parity.is_some(),
                "evicted FEC group"
            );
        }
    }

    /// Total packets rebuilt since creation or the last [`reset`](Self::reset).
    pub fn recovered_count(&self) -> u64 {
        self.recovered
    }

    /// Groups dropped incomplete because the tracking ceiling was hit.
    pub fn evicted_count(&self) -> u64 {
        self.evicted
    }

    /// Evicted groups that had parity but two or more members missing.
    pub fn unrecoverable_count(&self) -> u64 {
        self.unrecoverable
    }

    /// Packets dropped because their group had already completed.
    pub fn late_count(&self) -> u64 {
        self.late
    }

    pub fn tracked_groups(&self) -> usize {
        self.groups.len()
    }

    pub fn reset(&mut self) {
        self.groups.clear();
        self.created.clear();
        self.completed.clear();
        self.recovered = 0;
        self.late = 0;
        self.evicted = 0;
        self.unrecoverable = 0;
    }
}

impl Default for FecEngine {
    fn default() -> Self {
        Self::new(FecConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn media(seq: u16, group: u8, payload: &[u8]) -> Packet {
        Packet::media(seq, group, 1, false, false, payload.to_vec())
    }

    fn parity_of(seq: u16, group: u8, payloads: &[&[u8]]) -> Packet {
        let mut enc = FecEncoder::new(payloads.len());
        let mut parity = None;
        for p in payloads {
            parity = enc.push(p);
        }
        Packet::parity(seq, group, payloads.len() as u8, parity.unwrap())
    }

    #[test]
    fn recovers_missing_middle_packet() {
        let mut fec = FecEngine::default();
        assert!(fec.process_packet(&media(100, 3, &[0x01, 0x02])).is_empty());
        assert!(fec.process_packet(&media(101, 3, &[0x03, 0x04])).is_empty());
        assert!(fec.process_packet(&media(103, 3, &[0x07, 0x08])).is_empty());

        let out = fec.process_packet(&Packet::parity(104, 3, 4, vec![0x0F, 0x0E]));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].sequence, 102);
        assert_eq!(out[0].payload, vec![0x0A, 0x00]);
        assert!(out[0].is_recovered());
        assert!(!out[0].is_fec);
        assert_eq!(fec.recovered_count(), 1);
        assert_eq!(fec.tracked_groups(), 0);
    }

    #[test]
    fn recovers_regardless_of_which_member_is_missing() {
        let payloads: [&[u8]; 4] = [&[1, 2, 3], &[4, 5, 6], &[7, 8, 9], &[10, 11, 12]];
        for lost in 0..4 {
            let mut fec = FecEngine::default();
            for (i, p) in payloads.iter().enumerate() {
                if i != lost {
                    fec.process_packet(&media(10 + i as u16, 0, p));
                }
            }
            let out = fec.process_packet(&parity_of(14, 0, &payloads));
            assert_eq!(out.len(), 1, "lost index {lost}");
            assert_eq!(out[0].sequence, 10 + lost as u16);
            assert_eq!(out[0].payload, payloads[lost]);
        }
    }

    #[test]
    fn parity_before_media_still_recovers() {
        let payloads: [&[u8]; 4] = [&[9], &[8], &[7], &[6]];
        let mut fec = FecEngine::default();
        assert!(fec.process_packet(&parity_of(4, 1, &payloads)).is_empty());
        assert!(fec.process_packet(&media(0, 1, payloads[0])).is_empty());
        assert!(fec.process_packet(&media(3, 1, payloads[3])).is_empty());
        let out = fec.process_packet(&media(2, 1, payloads[2]));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].sequence, 1);
        assert_eq!(out[0].payload, vec![8]);
    }

    #[test]
    fn unequal_lengths_truncate_to_shorter() {
        // Longest member is the missing one: parity covers all of it.
        let payloads: [&[u8]; 4] = [&[1], &[2, 3], &[4, 5, 6, 7], &[8, 9]];
        let mut fec = FecEngine::default();
        fec.process_packet(&media(0, 0, payloads[0]));
        fec.process_packet(&media(1, 0, payloads[1]));
        fec.process_packet(&media(3, 0, payloads[3]));
        let out = fec.process_packet(&parity_of(4, 0, &payloads));
        assert_eq!(out[0].payload, vec![4, 5, 6, 7]);

        // Missing member shorter than parity: trailing bytes cancel to zero.
        let mut fec = FecEngine::default();
        fec.process_packet(&media(1, 0, payloads[1]));
        fec.process_packet(&media(2, 0, payloads[2]));
        fec.process_packet(&media(3, 0, payloads[3]));
        let out = fec.process_packet(&parity_of(4, 0, &payloads));
        assert_eq!(out[0].payload, vec![1, 0, 0, 0]);
    }

    #[test]
    fn two_missing_is_not_recovered() {
        let payloads: [&[u8]; 4] = [&[1], &[2], &[3], &[4]];
        let mut fec = FecEngine::default();
        fec.process_packet(&media(0, 0, payloads[0]));
        fec.process_packet(&media(3, 0, payloads[3]));
        assert!(fec.process_packet(&parity_of(4, 0, &payloads)).is_empty());
        assert_eq!(fec.recovered_count(), 0);
        assert_eq!(fec.tracked_groups(), 1);
    }

    #[test]
    fn nothing_missing_completes_without_recovery() {
        let payloads: [&[u8]; 4] = [&[1], &[2], &[3], &[4]];
        let mut fec = FecEngine::default();
        for (i, p) in payloads.iter().enumerate() {
            fec.process_packet(&media(i as u16, 0, p));
        }
        // Media alone never completes a group: its size is unknown.
        assert_eq!(fec.tracked_groups(), 1);
        assert!(fec.process_packet(&parity_of(4, 0, &payloads)).is_empty());
        assert_eq!(fec.tracked_groups(), 0);
    }

    #[test]
    fn duplicate_media_is_idempotent() {
        let payloads: [&[u8]; 4] = [&[1], &[2], &[3], &[4]];
        let mut fec = FecEngine::default();
        fec.process_packet(&media(0, 0, payloads[0]));
        fec.process_packet(&media(0, 0, payloads[0]));
        fec.process_packet(&media(1, 0, payloads[1]));
        // Two distinct members present, two missing: no recovery.
        assert!(fec.process_packet(&parity_of(4, 0, &payloads)).is_empty());
    }

    #[test]
    fn wraparound_matches_non_wrapping_group() {
        let payloads: [&[u8]; 4] = [&[0x10, 0x20], &[0x30], &[0x40, 0x50], &[0x60, 0x70]];

        let mut plain = FecEngine::default();
        plain.process_packet(&media(100, 0, payloads[0]));
        plain.process_packet(&media(101, 0, payloads[1]));
        plain.process_packet(&media(103, 0, payloads[3]));
        let expected = plain.process_packet(&parity_of(104, 0, &payloads));

        // 65534, 65535, 0, 1 protected by parity at 2; seq 0 lost.
        let mut wrapped = FecEngine::default();
        wrapped.process_packet(&media(65534, 0, payloads[0]));
        wrapped.process_packet(&media(65535, 0, payloads[1]));
        wrapped.process_packet(&media(1, 0, payloads[3]));
        let out = wrapped.process_packet(&parity_of(2, 0, &payloads));

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].sequence, 0);
        assert_eq!(out[0].payload, expected[0].payload);
    }

    #[test]
    fn protected_range_wraps() {
        assert_eq!(protected_range(104, 4), vec![100, 101, 102, 103]);
        assert_eq!(protected_range(1, 4), vec![65533, 65534, 65535, 0]);
    }

    #[test]
    fn evicts_in_creation_order_across_id_wrap() {
        let mut fec = FecEngine::new(FecConfig { max_groups: 2 });
        // 254, 255 then 0: numerically 0 is "oldest", chronologically 254 is.
        fec.process_packet(&media(0, 254, &[1]));
        fec.process_packet(&media(5, 255, &[1]));
        fec.process_packet(&media(10, 0, &[1]));
        assert_eq!(fec.tracked_groups(), 2);
        assert_eq!(fec.evicted_count(), 1);

        // Group 0 survived: completing it with parity recovers its missing members.
        let payloads: [&[u8]; 4] = [&[1], &[2], &[3], &[4]];
        fec.process_packet(&media(11, 0, payloads[1]));
        fec.process_packet(&media(12, 0, payloads[2]));
        let out = fec.process_packet(&parity_of(14, 0, &payloads));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].sequence, 13);
    }

    #[test]
    fn eviction_counts_unrecoverable_groups() {
        let payloads: [&[u8]; 4] = [&[1], &[2], &[3], &[4]];
        let mut fec = FecEngine::new(FecConfig { max_groups: 1 });
        fec.process_packet(&media(0, 0, payloads[0]));
        fec.process_packet(&parity_of(4, 0, &payloads));
        fec.process_packet(&media(5, 1, &[9]));
        assert_eq!(fec.evicted_count(), 1);
        assert_eq!(fec.unrecoverable_count(), 1);
    }

    #[test]
    fn late_members_do_not_reopen_completed_group() {
        let payloads: [&[u8]; 4] = [&[1], &[2], &[3], &[4]];
        let mut fec = FecEngine::new(FecConfig { max_groups: 1 });
        fec.process_packet(&media(0, 0, payloads[0]));
        fec.process_packet(&media(2, 0, payloads[2]));
        fec.process_packet(&media(3, 0, payloads[3]));
        assert_eq!(fec.process_packet(&parity_of(4, 0, &payloads)).len(), 1);
        assert_eq!(fec.tracked_groups(), 0);

        // Next group is in flight when group 0's original and a repeated
        // parity straggle in.
        fec.process_packet(&media(5, 1, &[9]));
        assert!(fec.process_packet(&media(1, 0, payloads[1])).is_empty());
        assert!(fec.process_packet(&parity_of(4, 0, &payloads)).is_empty());

        assert_eq!(fec.late_count(), 2);
        assert_eq!(fec.tracked_groups(), 1);
        assert_eq!(fec.evicted_count(), 0);
        assert_eq!(fec.unrecoverable_count(), 0);

        // Group 1 was not pushed out and still recovers.
        let next: [&[u8]; 4] = [&[9], &[8], &[7], &[6]];
        fec.process_packet(&media(6, 1, next[1]));
        fec.process_packet(&media(8, 1, next[3]));
        let out = fec.process_packet(&parity_of(9, 1, &next));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].sequence, 7);
    }

    #[test]
    fn completed_id_reused_for_new_range_opens_fresh_group() {
        let payloads: [&[u8]; 4] = [&[1], &[2], &[3], &[4]];
        let mut fec = FecEngine::default();
        for seq in 0..4u16 {
            fec.process_packet(&media(seq, 0, payloads[seq as usize]));
        }
        fec.process_packet(&parity_of(4, 0, &payloads));
        assert_eq!(fec.tracked_groups(), 0);

        // Group ids wrapped: id 0 now protects 1280..1283.
        fec.process_packet(&media(1280, 0, payloads[0]));
        assert_eq!(fec.late_count(), 0);
        assert_eq!(fec.tracked_groups(), 1);
    }

    #[test]
    fn reset_clears_groups_and_counters() {
        let mut fec = FecEngine::default();
        fec.process_packet(&media(100, 3, &[0x01, 0x02]));
        fec.process_packet(&media(101, 3, &[0x03, 0x04]));
        fec.process_packet(&media(103, 3, &[0x07, 0x08]));
        fec.process_packet(&Packet::parity(104, 3, 4, vec![0x0F, 0x0E]));
        fec.process_packet(&media(200, 9, &[1]));
        fec.reset();
        assert_eq!(fec.recovered_count(), 0);
        assert_eq!(fec.tracked_groups(), 0);
    }
}
