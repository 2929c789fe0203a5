//! Per-consumer timestamp monotonization.

pub const MAX_JITTER_MS: i64 = 250;
pub const DEFAULT_FRAME_TIME_MS: i64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JitterAlgorithm {
    /// Detect rewinds and jumps, rewrite into a continuous clock.
    #[default]
    Full,
    /// Shift so the stream starts at zero, keep the publisher's deltas.
    Zero,
    /// Only fix rewinds; forward jumps pass through.
    Middle,
    /// Pass timestamps through unaltered (ATC mode).
    Off,
}

/// Rewrites outgoing packet timestamps so downstream receivers observe a
/// monotone clock regardless of publisher discontinuities.
#[derive(Default)]
pub struct TimeJitter {
    last_pkt_time: i64,
    last_corrected: i64,
    base: Option<i64>,
    started: bool,
}

impl TimeJitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Corrects one timestamp under the given algorithm.
    pub fn correct(&mut self, timestamp: i64, algorithm: JitterAlgorithm) -> i64 {
        match algorithm {
            JitterAlgorithm::Off => timestamp,
            JitterAlgorithm::Zero => {
                let base = *self.base.get_or_insert(timestamp);
                timestamp - base
            }
            JitterAlgorithm::Full => {
                if !self.started {
                    self.started = true;
                    self.last_pkt_time = timestamp;
                    self.last_corrected = timestamp;
                    return timestamp;
                }
                let mut delta = timestamp - self.last_pkt_time;
                if !(0..=MAX_JITTER_MS).contains(&delta) {
                    delta = DEFAULT_FRAME_TIME_MS;
                }
                self.last_pkt_time = timestamp;
                self.last_corrected += delta;
                self.last_corrected
            }
            JitterAlgorithm::Middle => {
                if !self.started {
                    self.started = true;
                    self.last_pkt_time = timestamp;
                    self.last_corrected = timestamp;
                    return timestamp;
                }
                let delta = timestamp - self.last_pkt_time;
                self.last_pkt_time = timestamp;
                if delta < 0 {
                    self.last_corrected += DEFAULT_FRAME_TIME_MS;
                } else {
                    self.last_corrected += delta;
                }
                self.last_corrected
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_off_passthrough() {
        let mut j = TimeJitter::new();
        assert_eq!(j.correct(5000, JitterAlgorithm::Off), 5000);
        assert_eq!(j.correct(100, JitterAlgorithm::Off), 100);
    }

    #[test]
    fn test_zero_shifts_to_origin() {
        let mut j = TimeJitter::new();
        assert_eq!(j.correct(5000, JitterAlgorithm::Zero), 0);
        assert_eq!(j.correct(5040, JitterAlgorithm::Zero), 40);
    }

    #[test]
    fn test_full_fixes_rewind() {
        let mut j = TimeJitter::new();
        assert_eq!(j.correct(1000, JitterAlgorithm::Full), 1000);
        assert_eq!(j.correct(1040, JitterAlgorithm::Full), 1040);
        // publisher clock rewinds to zero: output keeps advancing
        let t = j.correct(0, JitterAlgorithm::Full);
        assert_eq!(t, 1040 + DEFAULT_FRAME_TIME_MS);
        let t2 = j.correct(40, JitterAlgorithm::Full);
        assert_eq!(t2, t + 40);
    }

    #[test]
    fn test_full_fixes_jump() {
        let mut j = TimeJitter::new();
        j.correct(0, JitterAlgorithm::Full);
        // 10 minute jump collapses to one frame time
        assert_eq!(
            j.correct(600_000, JitterAlgorithm::Full),
            DEFAULT_FRAME_TIME_MS
        );
    }

    #[test]
    fn test_full_monotone_under_noise() {
        let mut j = TimeJitter::new();
        let inputs = [0i64, 40, 80, 20, 120, 700_000, 700_040, 100];
        let mut last = i64::MIN;
        for ts in inputs {
            let out = j.correct(ts, JitterAlgorithm::Full);
            assert!(out >= last, "output went backwards at input {ts}");
            last = out;
        }
    }

    #[test]
    fn test_middle_passes_forward_jumps() {
        let mut j = TimeJitter::new();
        j.correct(0, JitterAlgorithm::Middle);
        assert_eq!(j.correct(600_000, JitterAlgorithm::Middle), 600_000);
        // but still fixes rewinds
        let t = j.correct(0, JitterAlgorithm::Middle);
        assert_eq!(t, 600_000 + DEFAULT_FRAME_TIME_MS);
    }
}
