//! Condition signaling between producer and consumer coroutines.

use std::rc::Rc;
use std::time::Duration;
use tokio::sync::Notify;

/// One-permit condition variable.
///
/// The producer calls `signal()` after enqueueing work; the consumer blocks
/// in `wait*` and drains its queue on wakeup. A signal issued while nobody
/// waits is stored, so the enqueue-then-signal ordering can never lose a
/// wakeup.
#[derive(Clone, Default)]
pub struct CondWaiter {
    notify: Rc<Notify>,
}

impl CondWaiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal(&self) {
        self.notify.notify_one();
    }

    pub async fn wait(&self) {
        self.notify.notified().await;
    }

    /// Waits up to `timeout`; returns `true` when signaled, `false` on
    /// timeout.
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.notify.notified())
            .await
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::task::LocalSet;

    #[tokio::test]
    async fn test_signal_before_wait_is_stored() {
        let cond = CondWaiter::new();
        cond.signal();
        assert!(cond.wait_timeout(Duration::from_millis(5)).await);
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let cond = CondWaiter::new();
        assert!(!cond.wait_timeout(Duration::from_millis(5)).await);
    }

    #[tokio::test]
    async fn test_producer_wakes_consumer() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let cond = CondWaiter::new();
                let producer = cond.clone();
                tokio::task::spawn_local(async move {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    producer.signal();
                });
                assert!(cond.wait_timeout(Duration::from_secs(1)).await);
            })
            .await;
    }
}
