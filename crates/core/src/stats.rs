use std::time::Instant;

/// Point-in-time receive statistics, published about once per second.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StreamStats {
    /// Datagrams that parsed successfully.
    pub packets_received: u64,
    pub bytes_received: u64,
    /// Datagrams dropped for being shorter than the header.
    pub malformed: u64,
    pub fec_recovered: u64,
    /// FEC groups given up with two or more members missing.
    pub fec_unrecoverable: u64,
    pub units_reassembled: u64,
    pub deduplicated: u64,
    pub orphan_fragments: u64,
    pub type_mismatches: u64,
    /// Key and delta frames handed to the decode sink.
    pub frames_delivered: u64,
    /// Frames the decode sink reports as decoded.
    pub frames_decoded: u64,
    /// Frames delivered per second over the last publishing interval.
    pub frames_per_second: f64,
}

/// Turns a monotonic frame counter into a rate.
#[derive(Debug)]
pub struct RateMeter {
    last_at: Instant,
    last_count: u64,
}

impl RateMeter {
    pub fn new(now: Instant) -> Self {
        Self {
            last_at: now,
            last_count: 0,
        }
    }

    /// Rate since the previous sample. Returns 0 for a zero-length interval.
    pub fn sample(&mut self, now: Instant, count: u64) -> f64 {
        let elapsed = now.saturating_duration_since(self.last_at).as_secs_f64();
        let delta = count.saturating_sub(self.last_count);
        self.last_at = now;
        self.last_count = count;
        if elapsed <= 0.0 {
            return 0.0;
        }
        delta as f64 / elapsed
    }
}
