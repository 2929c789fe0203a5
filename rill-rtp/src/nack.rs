//! Receiver-side loss tracking: the ordered set of missing sequences and
//! the retry discipline that turns them into NACK requests.

use crate::sequence::{seq_distance, seq_newer};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Outcome of feeding one received sequence number to the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// First packet ever seen on this track.
    First,
    /// In-order or forward jump; the skipped range was marked missing.
    Fresh,
    /// A sequence that was on the missing list; the caller must also insert
    /// the packet into its ring buffer.
    Recovered,
    /// Duplicate or too old to track.
    Stale,
}

struct MissingEntry {
    first_nack_time: Instant,
    last_request: Option<Instant>,
    request_count: u16,
}

/// Per-SSRC NACK bookkeeping.
///
/// Entries retry while `request_count < max_count`; the retry interval is
/// the larger of the configured floor and the measured RTT, so a long path
/// is not flooded with duplicate requests.
pub struct NackList {
    missing: HashMap<u16, MissingEntry>,
    highest: u16,
    started: bool,
    max_count: u16,
    retry_floor: Duration,
    rtt: Duration,
    /// Cap on tracked entries; oldest are abandoned beyond it.
    capacity: usize,
}

impl NackList {
    pub fn new(max_count: u16, retry_floor: Duration, capacity: usize) -> Self {
        Self {
            missing: HashMap::new(),
            highest: 0,
            started: false,
            max_count,
            retry_floor,
            rtt: Duration::ZERO,
            capacity,
        }
    }

    pub fn update_rtt(&mut self, rtt: Duration) {
        self.rtt = rtt;
    }

    pub fn len(&self) -> usize {
        self.missing.len()
    }

    pub fn is_empty(&self) -> bool {
        self.missing.is_empty()
    }

    pub fn contains(&self, seq: u16) -> bool {
        self.missing.contains_key(&seq)
    }

    pub fn highest(&self) -> Option<u16> {
        self.started.then_some(self.highest)
    }

    /// Feeds a received sequence number; classifies it and updates the
    /// missing set.
    pub fn on_received(&mut self, seq: u16, now: Instant) -> ReceiveOutcome {
        if !self.started {
            self.started = true;
            self.highest = seq;
            return ReceiveOutcome::First;
        }

        if self.missing.remove(&seq).is_some() {
            return ReceiveOutcome::Recovered;
        }

        if !seq_newer(seq, self.highest) {
            return ReceiveOutcome::Stale;
        }

        // mark everything we jumped over as missing
        let gap = seq_distance(seq, self.highest);
        let mut s = self.highest.wrapping_add(1);
        for _ in 1..gap {
            if self.missing.len() >= self.capacity {
                self.abandon_oldest(now);
            }
            self.missing.insert(
                s,
                MissingEntry {
                    first_nack_time: now,
                    last_request: None,
                    request_count: 0,
                },
            );
            s = s.wrapping_add(1);
        }
        self.highest = seq;
        ReceiveOutcome::Fresh
    }

    /// Sequences due for a (re)request at `now`, in modular order. Entries
    /// that exhausted their retries are dropped rather than returned.
    pub fn poll_requests(&mut self, now: Instant) -> Vec<u16> {
        let interval = self.retry_floor.max(self.rtt);
        let highest = self.highest;
        let max_count = self.max_count;

        let mut expired = Vec::new();
        let mut due = Vec::new();
        for (seq, entry) in self.missing.iter_mut() {
            if entry.request_count >= max_count {
                expired.push(*seq);
                continue;
            }
            let ready = match entry.last_request {
                None => true,
                Some(at) => now.duration_since(at) >= interval,
            };
            if ready {
                entry.last_request = Some(now);
                entry.request_count += 1;
                due.push(*seq);
            }
        }
        for seq in expired {
            self.missing.remove(&seq);
        }
        // modular order: oldest (farthest behind highest) first
        due.sort_by_key(|s| u16::MAX - seq_distance(highest, *s));
        due
    }

    fn abandon_oldest(&mut self, _now: Instant) {
        let highest = self.highest;
        if let Some(oldest) = self
            .missing
            .keys()
            .copied()
            .max_by_key(|s| seq_distance(highest, *s))
        {
            self.missing.remove(&oldest);
        }
    }
}

/// Packs missing sequences into RFC 4585 (pid, blp) pairs.
pub fn pack_nack_pairs(seqs: &[u16]) -> Vec<(u16, u16)> {
    let mut pairs: Vec<(u16, u16)> = Vec::new();
    for &seq in seqs {
        if let Some((pid, blp)) = pairs.last_mut() {
            let d = seq.wrapping_sub(*pid);
            if d >= 1 && d <= 16 {
                *blp |= 1 << (d - 1);
                continue;
            }
        }
        pairs.push((seq, 0));
    }
    pairs
}

/// Expands (pid, blp) pairs back into individual sequences.
pub fn unpack_nack_pairs(pairs: &[(u16, u16)]) -> Vec<u16> {
    let mut out = Vec::new();
    for &(pid, blp) in pairs {
        out.push(pid);
        for i in 0..16u16 {
            if blp & (1 << i) != 0 {
                out.push(pid.wrapping_add(i + 1));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list() -> NackList {
        NackList::new(5, Duration::from_millis(20), 1024)
    }

    #[test]
    fn test_gap_marks_missing() {
        let mut l = list();
        let now = Instant::now();
        assert_eq!(l.on_received(10, now), ReceiveOutcome::First);
        assert_eq!(l.on_received(14, now), ReceiveOutcome::Fresh);
        assert!(l.contains(11));
        assert!(l.contains(12));
        assert!(l.contains(13));
        assert!(!l.contains(14));
        assert_eq!(l.len(), 3);
    }

    #[test]
    fn test_recovered_removes_entry() {
        let mut l = list();
        let now = Instant::now();
        l.on_received(699, now);
        l.on_received(702, now);
        assert_eq!(l.on_received(700, now), ReceiveOutcome::Recovered);
        assert_eq!(l.on_received(701, now), ReceiveOutcome::Recovered);
        assert!(l.is_empty());
    }

    #[test]
    fn test_duplicate_is_stale() {
        let mut l = list();
        let now = Instant::now();
        l.on_received(5, now);
        l.on_received(6, now);
        assert_eq!(l.on_received(6, now), ReceiveOutcome::Stale);
        assert_eq!(l.on_received(3, now), ReceiveOutcome::Stale);
    }

    #[test]
    fn test_wraparound_gap() {
        let mut l = list();
        let now = Instant::now();
        l.on_received(65534, now);
        assert_eq!(l.on_received(2, now), ReceiveOutcome::Fresh);
        assert!(l.contains(65535));
        assert!(l.contains(0));
        assert!(l.contains(1));
    }

    #[test]
    fn test_retry_interval_and_exhaustion() {
        let mut l = NackList::new(2, Duration::from_millis(20), 1024);
        let t0 = Instant::now();
        l.on_received(0, t0);
        l.on_received(2, t0); // 1 missing

        // first request fires immediately
        assert_eq!(l.poll_requests(t0), vec![1]);
        // too soon to retry
        assert!(l.poll_requests(t0 + Duration::from_millis(5)).is_empty());
        // second (and last) retry
        assert_eq!(l.poll_requests(t0 + Duration::from_millis(25)), vec![1]);
        // exhausted: dropped from the list
        assert!(l.poll_requests(t0 + Duration::from_millis(50)).is_empty());
        assert!(l.is_empty());
    }

    #[test]
    fn test_rtt_stretches_retry() {
        let mut l = list();
        let t0 = Instant::now();
        l.on_received(0, t0);
        l.on_received(2, t0);
        l.update_rtt(Duration::from_millis(100));

        assert_eq!(l.poll_requests(t0), vec![1]);
        // floor is 20ms but rtt is 100ms: not yet
        assert!(l.poll_requests(t0 + Duration::from_millis(50)).is_empty());
        assert_eq!(l.poll_requests(t0 + Duration::from_millis(100)), vec![1]);
    }

    #[test]
    fn test_pack_unpack_pairs() {
        let seqs = vec![100u16, 101, 103, 116, 200];
        let pairs = pack_nack_pairs(&seqs);
        assert_eq!(pairs, vec![(100, 0b1000_0000_0000_0101), (200, 0)]);
        assert_eq!(unpack_nack_pairs(&pairs), vec![100, 101, 103, 116, 200]);
    }

    #[test]
    fn test_capacity_abandons_oldest() {
        let mut l = NackList::new(5, Duration::from_millis(20), 4);
        let now = Instant::now();
        l.on_received(0, now);
        l.on_received(10, now); // 9 missing, capacity 4
        assert!(l.len() <= 5);
        // the newest misses survive
        assert!(l.contains(9));
    }
}
