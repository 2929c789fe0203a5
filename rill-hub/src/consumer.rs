//! Per-subscriber attachment on a source: bounded queue, wakeup signal and
//! timestamp correction.

use crate::jitter::{JitterAlgorithm, TimeJitter};
use crate::packet::MediaPacket;
use runtime::CondWaiter;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::time::Duration;

/// Per-subscriber queue.
///
/// The publisher coroutine enqueues refcounted packet clones and signals
/// the consumer's condition; the subscriber coroutine wakes and drains a
/// batch (merged write). Overflow beyond `queue_size_ms` drops the oldest
/// packets, so a slow player can never block the publisher.
pub struct Consumer {
    queue: RefCell<VecDeque<MediaPacket>>,
    queue_size_ms: Cell<i64>,
    jitter: RefCell<TimeJitter>,
    wakeup: CondWaiter,
    paused: Cell<bool>,
    dropped: Cell<u64>,
    /// Set when the publisher changed, so the play loop can react (PLI for
    /// RTC, fresh sequence headers for RTMP).
    source_changed: Cell<bool>,
}

impl Consumer {
    pub fn new(queue_size_ms: i64) -> Self {
        Self {
            queue: RefCell::new(VecDeque::new()),
            queue_size_ms: Cell::new(queue_size_ms),
            jitter: RefCell::new(TimeJitter::new()),
            wakeup: CondWaiter::new(),
            paused: Cell::new(false),
            dropped: Cell::new(0),
            source_changed: Cell::new(false),
        }
    }

    pub fn set_queue_size_ms(&self, ms: i64) {
        self.queue_size_ms.set(ms);
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.set(paused);
        if !paused {
            self.wakeup.signal();
        }
    }

    pub fn paused(&self) -> bool {
        self.paused.get()
    }

    pub fn on_source_changed(&self) {
        self.source_changed.set(true);
        self.wakeup.signal();
    }

    /// Consumes the source-changed flag.
    pub fn take_source_changed(&self) -> bool {
        self.source_changed.replace(false)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.get()
    }

    pub fn len(&self) -> usize {
        self.queue.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.borrow().is_empty()
    }

    /// Enqueues one packet, correcting its timestamp unless `atc` keeps the
    /// absolute chain.
    pub fn enqueue(&self, packet: &MediaPacket, atc: bool, algorithm: JitterAlgorithm) {
        let mut packet = packet.clone();
        if !atc {
            packet.timestamp = self.jitter.borrow_mut().correct(packet.timestamp, algorithm);
        }
        {
            let mut q = self.queue.borrow_mut();
            q.push_back(packet);
            self.shrink(&mut q);
        }
        if !self.paused.get() {
            self.wakeup.signal();
        }
    }

    /// Drops oldest packets while the queue spans more than the cap.
    fn shrink(&self, q: &mut VecDeque<MediaPacket>) {
        let cap = self.queue_size_ms.get();
        if cap <= 0 {
            return;
        }
        while q.len() > 1 {
            let span = q.back().unwrap().timestamp - q.front().unwrap().timestamp;
            if span <= cap {
                break;
            }
            q.pop_front();
            self.dropped.set(self.dropped.get() + 1);
        }
    }

    /// Pops up to `max` packets for one merged write.
    pub fn dump_packets(&self, max: usize) -> Vec<MediaPacket> {
        if self.paused.get() {
            return Vec::new();
        }
        let mut q = self.queue.borrow_mut();
        let n = q.len().min(max);
        q.drain(..n).collect()
    }

    /// Blocks until signaled or `timeout`; returns whether a signal came.
    pub async fn wait(&self, timeout: Duration) -> bool {
        if !self.is_empty() && !self.paused.get() {
            return true;
        }
        self.wakeup.wait_timeout(timeout).await
    }

    /// Wakes the consumer without data, e.g. on shutdown.
    pub fn wakeup(&self) {
        self.wakeup.signal();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn pkt(ts: i64) -> MediaPacket {
        MediaPacket::audio(ts, Bytes::from_static(&[0xAF, 0x01, 0]))
    }

    #[test]
    fn test_enqueue_dump() {
        let c = Consumer::new(5000);
        for ts in [0, 40, 80] {
            c.enqueue(&pkt(ts), false, JitterAlgorithm::Off);
        }
        let got = c.dump_packets(10);
        assert_eq!(got.len(), 3);
        assert_eq!(got[0].timestamp, 0);
        assert!(c.is_empty());
    }

    #[test]
    fn test_dump_respects_batch_size() {
        let c = Consumer::new(5000);
        for ts in 0..10 {
            c.enqueue(&pkt(ts * 40), false, JitterAlgorithm::Off);
        }
        assert_eq!(c.dump_packets(4).len(), 4);
        assert_eq!(c.len(), 6);
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let c = Consumer::new(1000);
        for ts in 0..100 {
            c.enqueue(&pkt(ts * 100), false, JitterAlgorithm::Off);
        }
        let got = c.dump_packets(1000);
        // span capped at ~1000ms
        let span = got.last().unwrap().timestamp - got.first().unwrap().timestamp;
        assert!(span <= 1000);
        assert!(c.dropped() > 0);
    }

    #[test]
    fn test_jitter_applied_unless_atc() {
        let c = Consumer::new(5000);
        c.enqueue(&pkt(5000), false, JitterAlgorithm::Zero);
        c.enqueue(&pkt(5040), false, JitterAlgorithm::Zero);
        let got = c.dump_packets(10);
        assert_eq!(got[0].timestamp, 0);
        assert_eq!(got[1].timestamp, 40);

        let c = Consumer::new(5000);
        c.enqueue(&pkt(5000), true, JitterAlgorithm::Zero);
        assert_eq!(c.dump_packets(10)[0].timestamp, 5000);
    }

    #[test]
    fn test_paused_holds_packets() {
        let c = Consumer::new(5000);
        c.set_paused(true);
        c.enqueue(&pkt(0), false, JitterAlgorithm::Off);
        assert!(c.dump_packets(10).is_empty());
        c.set_paused(false);
        assert_eq!(c.dump_packets(10).len(), 1);
    }

    #[tokio::test]
    async fn test_wait_wakes_on_enqueue() {
        let c = std::rc::Rc::new(Consumer::new(5000));
        tokio::task::LocalSet::new()
            .run_until(async {
                let producer = c.clone();
                tokio::task::spawn_local(async move {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    producer.enqueue(&pkt(0), false, JitterAlgorithm::Off);
                });
                assert!(c.wait(Duration::from_secs(1)).await);
                assert_eq!(c.dump_packets(10).len(), 1);
            })
            .await;
    }

    #[tokio::test]
    async fn test_wait_times_out_when_idle() {
        let c = Consumer::new(5000);
        assert!(!c.wait(Duration::from_millis(10)).await);
    }
}
