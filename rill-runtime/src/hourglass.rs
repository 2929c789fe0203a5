//! Periodic dispatch: the per-owner HourGlass and the shared FastTimer bus.

use crate::coroutine::{Coroutine, CoroutineContext};
use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

/// Receiver of HourGlass ticks.
pub trait HourGlassHandler {
    fn on_hourglass(&self, event: u64, interval: Duration, total_elapse: Duration);
}

struct TickEntry {
    event: u64,
    interval: Duration,
}

/// Ticks at `resolution` and fires every registered event whose period
/// divides the accumulated elapsed time. One HourGlass serves any number of
/// periodic jobs of its owner without extra coroutines.
pub struct HourGlass {
    resolution: Duration,
    ticks: RefCell<Vec<TickEntry>>,
    total_elapse: RefCell<Duration>,
    handler: Weak<dyn HourGlassHandler>,
    co: RefCell<Option<Rc<Coroutine>>>,
}

impl HourGlass {
    pub fn new(handler: Weak<dyn HourGlassHandler>, resolution: Duration) -> Rc<Self> {
        Rc::new(Self {
            resolution,
            ticks: RefCell::new(Vec::new()),
            total_elapse: RefCell::new(Duration::ZERO),
            handler,
            co: RefCell::new(None),
        })
    }

    /// Registers an (event, period) pair. The period should be a multiple
    /// of the resolution; off-grid periods fire on the next divisible tick.
    pub fn tick(&self, event: u64, interval: Duration) {
        self.ticks.borrow_mut().push(TickEntry { event, interval });
    }

    pub fn start(self: &Rc<Self>, name: &str) {
        let co = Rc::new(Coroutine::new(name));
        let this = Rc::clone(self);
        co.start(move |ctx: CoroutineContext| async move {
            loop {
                ctx.sleep(this.resolution).await?;
                this.advance(this.resolution);
            }
        });
        *self.co.borrow_mut() = Some(co);
    }

    pub async fn stop(&self) {
        let co = self.co.borrow_mut().take();
        if let Some(co) = co {
            co.stop().await;
        }
    }

    /// One resolution step; split out so tests can drive time by hand.
    pub fn advance(&self, step: Duration) {
        let total = {
            let mut t = self.total_elapse.borrow_mut();
            *t += step;
            *t
        };
        let Some(handler) = self.handler.upgrade() else {
            return;
        };
        for entry in self.ticks.borrow().iter() {
            if !entry.interval.is_zero()
                && total.as_millis() % entry.interval.as_millis() == 0
            {
                handler.on_hourglass(entry.event, entry.interval, total);
            }
        }
    }
}

/// Receiver of FastTimer ticks.
pub trait FastTimerHandler {
    fn on_fast_timer(&self, interval: Duration);
}

/// Shared periodic bus; subscribers come and go dynamically. Dead (dropped)
/// subscribers are compacted on each tick.
pub struct FastTimer {
    interval: Duration,
    subscribers: RefCell<Vec<Weak<dyn FastTimerHandler>>>,
    co: RefCell<Option<Rc<Coroutine>>>,
}

impl FastTimer {
    pub fn new(interval: Duration) -> Rc<Self> {
        Rc::new(Self {
            interval,
            subscribers: RefCell::new(Vec::new()),
            co: RefCell::new(None),
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn subscribe(&self, handler: Weak<dyn FastTimerHandler>) {
        self.subscribers.borrow_mut().push(handler);
    }

    pub fn start(self: &Rc<Self>, name: &str) {
        let co = Rc::new(Coroutine::new(name));
        let this = Rc::clone(self);
        co.start(move |ctx: CoroutineContext| async move {
            loop {
                ctx.sleep(this.interval).await?;
                this.fire();
            }
        });
        *self.co.borrow_mut() = Some(co);
    }

    pub async fn stop(&self) {
        let co = self.co.borrow_mut().take();
        if let Some(co) = co {
            co.stop().await;
        }
    }

    /// One tick; exposed for tests.
    pub fn fire(&self) {
        let mut subs = self.subscribers.borrow_mut();
        subs.retain(|w| w.strong_count() > 0);
        let alive: Vec<_> = subs.iter().filter_map(|w| w.upgrade()).collect();
        drop(subs);
        for s in alive {
            s.on_fast_timer(self.interval);
        }
    }
}

/// Wall-clock histogram boundaries in milliseconds; the final bucket is
/// open-ended.
const WALL_CLOCK_BUCKETS_MS: [u64; 8] = [15, 20, 25, 30, 35, 40, 80, 160];

/// Subscriber of the 20 ms bus that buckets the observed gap between ticks.
/// A healthy scheduler lands almost everything in the first buckets; mass in
/// the tail means some coroutine held the thread.
pub struct ClockWallMonitor {
    last: RefCell<Option<Instant>>,
    buckets: RefCell<[u64; 9]>,
}

impl ClockWallMonitor {
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            last: RefCell::new(None),
            buckets: RefCell::new([0; 9]),
        })
    }

    pub fn snapshot(&self) -> [u64; 9] {
        *self.buckets.borrow()
    }

    fn observe(&self, now: Instant) {
        let mut last = self.last.borrow_mut();
        if let Some(prev) = *last {
            let elapsed_ms = now.duration_since(prev).as_millis() as u64;
            let mut buckets = self.buckets.borrow_mut();
            let idx = WALL_CLOCK_BUCKETS_MS
                .iter()
                .position(|b| elapsed_ms <= *b)
                .unwrap_or(WALL_CLOCK_BUCKETS_MS.len());
            buckets[idx] += 1;
        }
        *last = Some(now);
    }
}

impl FastTimerHandler for ClockWallMonitor {
    fn on_fast_timer(&self, _interval: Duration) {
        self.observe(Instant::now());
    }
}
