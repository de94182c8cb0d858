use std::time::Instant;

/// Counters for one operator session.
#[derive(Debug, Clone, Default)]
pub struct NetStats {
    pub rx_count: u64,
    pub last_seq: Option<u64>,
    /// Commands whose seq was not the previous one plus one.
    pub seq_gaps: u64,
    pub last_recv: Option<Instant>,
}

impl NetStats {
    pub fn record(&mut self, seq: u64, now: Instant) {
        if let Some(last) = self.last_seq {
            if last.checked_add(1) != Some(seq) {
                self.seq_gaps += 1;
            }
        }
        self.last_seq = Some(seq);
        self.rx_count += 1;
        self.last_recv = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gap_counting() {
        let now = Instant::now();
        let mut stats = NetStats::default();
        for seq in [0, 1, 2, 5, 6, 6, 3] {
            stats.record(seq, now);
        }
        assert_eq!(stats.rx_count, 7);
        assert_eq!(stats.seq_gaps, 3);
        assert_eq!(stats.last_seq, Some(3));
        assert_eq!(stats.last_recv, Some(now));
    }
}
