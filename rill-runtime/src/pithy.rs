//! Rate-limited diagnostics.
//!
//! Hot paths call `can_print` on every event and only log when the stage
//! interval elapsed; the count of suppressed events since the last print is
//! reported alongside so nothing disappears silently.

use std::cell::Cell;
use std::time::{Duration, Instant};

pub struct PithyPrint {
    interval: Duration,
    last: Cell<Option<Instant>>,
    suppressed: Cell<u64>,
}

impl PithyPrint {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Cell::new(None),
            suppressed: Cell::new(0),
        }
    }

    pub fn can_print(&self) -> bool {
        self.can_print_at(Instant::now())
    }

    /// Clock-injectable variant for tests.
    pub fn can_print_at(&self, now: Instant) -> bool {
        match self.last.get() {
            None => {
                self.last.set(Some(now));
                true
            }
            Some(prev) if now.duration_since(prev) >= self.interval => {
                self.last.set(Some(now));
                self.suppressed.set(0);
                true
            }
            Some(_) => {
                self.suppressed.set(self.suppressed.get() + 1);
                false
            }
        }
    }

    /// Events swallowed since the last successful print.
    pub fn suppressed(&self) -> u64 {
        self.suppressed.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_event_prints() {
        let p = PithyPrint::new(Duration::from_secs(10));
        assert!(p.can_print_at(Instant::now()));
    }

    #[test]
    fn test_suppresses_until_interval() {
        let p = PithyPrint::new(Duration::from_secs(10));
        let t0 = Instant::now();
        assert!(p.can_print_at(t0));
        assert!(!p.can_print_at(t0 + Duration::from_secs(1)));
        assert!(!p.can_print_at(t0 + Duration::from_secs(2)));
        assert_eq!(p.suppressed(), 2);
        assert!(p.can_print_at(t0 + Duration::from_secs(10)));
        assert_eq!(p.suppressed(), 0);
    }
}
