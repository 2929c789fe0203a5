//! RFC 3550 interarrival jitter estimation.

use std::time::Instant;

/// Per-track jitter estimator, fed with each received packet's RTP
/// timestamp and arrival instant.
pub struct JitterEstimator {
    clock_rate: u32,
    last_transit: Option<i64>,
    /// Scaled by 16 per the RFC recurrence to keep integer math.
    jitter_q4: u64,
    epoch: Instant,
}

impl JitterEstimator {
    pub fn new(clock_rate: u32) -> Self {
        Self {
            clock_rate,
            last_transit: None,
            jitter_q4: 0,
            epoch: Instant::now(),
        }
    }

    pub fn on_packet(&mut self, rtp_timestamp: u32, arrival: Instant) {
        let arrival_units = (arrival.duration_since(self.epoch).as_secs_f64()
            * self.clock_rate as f64) as i64;
        let transit = arrival_units - rtp_timestamp as i64;
        if let Some(prev) = self.last_transit {
            let d = (transit - prev).unsigned_abs();
            // j += (|d| - j) / 16, carried at 16x scale
            self.jitter_q4 = self.jitter_q4 + d - self.jitter_q4 / 16;
        }
        self.last_transit = Some(transit);
    }

    /// Current estimate in RTP clock units, as carried in receiver reports.
    pub fn jitter(&self) -> u32 {
        (self.jitter_q4 / 16) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_steady_stream_low_jitter() {
        let mut j = JitterEstimator::new(90000);
        let t0 = Instant::now();
        // perfectly paced 40ms frames
        for i in 0..50u32 {
            j.on_packet(i * 3600, t0 + Duration::from_millis(40 * i as u64));
        }
        assert!(j.jitter() < 90); // under 1ms of jitter
    }

    #[test]
    fn test_bursty_stream_raises_jitter() {
        let mut j = JitterEstimator::new(90000);
        let t0 = Instant::now();
        for i in 0..50u32 {
            // alternate early/late arrivals by 20ms
            let skew = if i % 2 == 0 { 0 } else { 20 };
            j.on_packet(
                i * 3600,
                t0 + Duration::from_millis(40 * i as u64 + skew),
            );
        }
        assert!(j.jitter() > 500);
    }
}
