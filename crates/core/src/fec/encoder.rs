use super::FEC_GROUP_SIZE;

/// Sender-side parity generator.
///
/// Accumulates the XOR of each media payload pushed into the current group
/// and hands back the parity payload once `group_size` payloads have been
/// seen. Shorter payloads are treated as zero-padded, so the parity is as
/// long as the longest member.
#[derive(Debug)]
pub struct FecEncoder {
    group_size: usize,
    parity: Vec<u8>,
    count: usize,
}

impl FecEncoder {
    pub fn new(group_size: usize) -> Self {
        Self {
            group_size: group_size.max(1),
            parity: Vec::new(),
            count: 0,
        }
    }

    /// Add one media payload. Returns the parity payload when the group fills.
    pub fn push(&mut self, payload: &[u8]) -> Option<Vec<u8>> {
        if payload.len() > self.parity.len() {
            self.parity.resize(payload.len(), 0);
        }
        super::xor_into(&mut self.parity, payload);
        self.count += 1;

        if self.count < self.group_size {
            return None;
        }
        self.count = 0;
        Some(std::mem::take(&mut self.parity))
    }

    pub fn group_size(&self) -> usize {
        self.group_size
    }

    /// Media payloads accumulated in the unfinished group.
    pub fn pending(&self) -> usize {
        self.count
    }
}

impl Default for FecEncoder {
    fn default() -> Self {
        Self::new(FEC_GROUP_SIZE)
    }
}
