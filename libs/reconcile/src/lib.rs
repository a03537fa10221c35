//! Reconciliation loop primitives.
//!
//! Two small building blocks shared by the agent and the controller:
//!
//! - [`Backoff`]: bounded exponential backoff with proportional jitter,
//!   used for RPC retries and for spacing requeues of failing work items.
//! - [`WorkQueue`]: a keyed queue feeding reconcile dispatchers. Keys are
//!   deduplicated while queued, failures are tracked per key, and a requeue
//!   is delayed by the backoff policy before the key becomes visible again.
//!
//! # Invariants
//!
//! - A key is delivered to at most one worker at a time per enqueue.
//! - Requeue delays grow monotonically (modulo jitter) until `steps` and
//!   then stay at the final delay.
//! - `forget` resets a key's failure history; the next failure starts over
//!   at the initial delay.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::mpsc;

/// Bounded exponential backoff with proportional jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    /// First delay.
    pub initial: Duration,

    /// Multiplier applied after each step.
    pub factor: f64,

    /// Random jitter as a fraction of the current delay (0.4 adds up to
    /// 40%).
    pub jitter: f64,

    /// Number of growth steps; further attempts reuse the final delay.
    pub steps: u32,
}

impl Backoff {
    /// Policy used by the inventory reporter: 500ms, x1.5, jitter 0.4, 10
    /// steps.
    pub fn reporter() -> Self {
        Self {
            initial: Duration::from_millis(500),
            factor: 1.5,
            jitter: 0.4,
            steps: 10,
        }
    }

    /// Policy used for requeueing failed reconciles.
    pub fn requeue() -> Self {
        Self {
            initial: Duration::from_millis(250),
            factor: 2.0,
            jitter: 0.1,
            steps: 8,
        }
    }

    /// The jittered delay for a zero-based attempt number.
    pub fn delay(&self, attempt: u32) -> Duration {
        let capped = attempt.min(self.steps.saturating_sub(1));
        let base = self.initial.as_secs_f64() * self.factor.powi(capped as i32);
        let jittered = base * (1.0 + self.jitter * rand::random::<f64>());
        Duration::from_secs_f64(jittered)
    }
}

/// A keyed work queue with per-key failure tracking.
///
/// Designed to be shared behind an [`Arc`]: producers call [`add`], workers
/// loop on [`next`], and report outcomes via [`requeue`] / [`forget`].
///
/// [`add`]: WorkQueue::add
/// [`next`]: WorkQueue::next
/// [`requeue`]: WorkQueue::requeue
/// [`forget`]: WorkQueue::forget
pub struct WorkQueue {
    tx: mpsc::UnboundedSender<String>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
    queued: Mutex<HashSet<String>>,
    failures: Mutex<HashMap<String, u32>>,
    backoff: Backoff,
}

impl WorkQueue {
    pub fn new(backoff: Backoff) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            queued: Mutex::new(HashSet::new()),
            failures: Mutex::new(HashMap::new()),
            backoff,
        })
    }

    /// Enqueue a key. A key already waiting in the queue is not duplicated;
    /// a key currently being processed may be enqueued again.
    pub fn add(&self, key: &str) {
        let fresh = self.queued.lock().expect("queue poisoned").insert(key.to_string());
        if fresh {
            // Receiver lives as long as the queue; a send can only fail
            // during teardown.
            let _ = self.tx.send(key.to_string());
        }
    }

    /// Wait for the next key. Returns `None` once the queue is unreachable
    /// (all senders dropped), which only happens at shutdown.
    pub async fn next(&self) -> Option<String> {
        let key = self.rx.lock().await.recv().await?;
        self.queued.lock().expect("queue poisoned").remove(&key);
        Some(key)
    }

    /// Pop a key without waiting. Used to drain the queue at shutdown;
    /// returns `None` when the queue is empty or another worker holds the
    /// receiver.
    pub fn try_next(&self) -> Option<String> {
        let mut rx = self.rx.try_lock().ok()?;
        let key = rx.try_recv().ok()?;
        self.queued.lock().expect("queue poisoned").remove(&key);
        Some(key)
    }

    /// Record a failure for the key and re-add it after the backoff delay.
    pub fn requeue(self: &Arc<Self>, key: &str) {
        let attempt = {
            let mut failures = self.failures.lock().expect("queue poisoned");
            let entry = failures.entry(key.to_string()).or_insert(0);
            let attempt = *entry;
            *entry += 1;
            attempt
        };

        let delay = self.backoff.delay(attempt);
        let queue = Arc::clone(self);
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(&key);
        });
    }

    /// Clear a key's failure history after a successful reconcile.
    pub fn forget(&self, key: &str) {
        self.failures.lock().expect("queue poisoned").remove(key);
    }

    /// Number of recorded failures for a key.
    pub fn failure_count(&self, key: &str) -> u32 {
        self.failures
            .lock()
            .expect("queue poisoned")
            .get(key)
            .copied()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_growth_and_cap() {
        let backoff = Backoff {
            initial: Duration::from_millis(100),
            factor: 2.0,
            jitter: 0.0,
            steps: 3,
        };

        assert_eq!(backoff.delay(0), Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(200));
        assert_eq!(backoff.delay(2), Duration::from_millis(400));
        // Past the last step the delay stops growing.
        assert_eq!(backoff.delay(3), Duration::from_millis(400));
        assert_eq!(backoff.delay(10), Duration::from_millis(400));
    }

    #[test]
    fn test_backoff_jitter_bounds() {
        let backoff = Backoff {
            initial: Duration::from_millis(500),
            factor: 1.5,
            jitter: 0.4,
            steps: 10,
        };

        for attempt in 0..10 {
            let base = 500.0 * 1.5f64.powi(attempt as i32);
            let delay = backoff.delay(attempt).as_secs_f64() * 1000.0;
            assert!(delay >= base - 0.001);
            assert!(delay <= base * 1.4 + 1.0);
        }
    }

    #[tokio::test]
    async fn test_queue_dedupes_pending_keys() {
        let queue = WorkQueue::new(Backoff::requeue());

        queue.add("default/example");
        queue.add("default/example");
        queue.add("default/other");

        assert_eq!(queue.next().await.unwrap(), "default/example");
        assert_eq!(queue.next().await.unwrap(), "default/other");

        // Once popped, the key may be enqueued again.
        queue.add("default/example");
        assert_eq!(queue.next().await.unwrap(), "default/example");
    }

    #[tokio::test]
    async fn test_queue_requeue_and_forget() {
        let queue = WorkQueue::new(Backoff {
            initial: Duration::from_millis(5),
            factor: 1.0,
            jitter: 0.0,
            steps: 1,
        });

        queue.requeue("default/example");
        assert_eq!(queue.failure_count("default/example"), 1);

        // The key comes back after the delay elapses.
        let key = tokio::time::timeout(Duration::from_secs(1), queue.next())
            .await
            .expect("requeued key never arrived")
            .unwrap();
        assert_eq!(key, "default/example");

        queue.forget("default/example");
        assert_eq!(queue.failure_count("default/example"), 0);
    }
}
