//! AI-queue admission bound: a token-bounded FIFO gate distinct from the
//! unconstrained dispatch of non-AI steps. Grounded directly on
//! `src/scheduler/core.rs`'s `Mutex<SchedulerInner> + Notify` structure,
//! narrowed from a priority `BinaryHeap` to a plain FIFO `VecDeque` since
//! spec.md §4.7 only requires FIFO fairness among AI-tagged steps, not
//! priority.

use std::collections::VecDeque;

use tokio::sync::{Mutex, Notify};
use tracing::debug;

struct Inner {
    in_flight: usize,
    waiters: VecDeque<u64>,
    next_ticket: u64,
}

/// Bounds concurrent AI-tagged steps to `max_ai_tasks`, admitting waiters in
/// FIFO order. A held `Permit` releases its slot on drop so every exit path
/// (normal, error, cancellation) is guaranteed to free the token.
pub struct AiQueue {
    max: usize,
    inner: Mutex<Inner>,
    notify: Notify,
}

impl AiQueue {
    pub fn new(max_ai_tasks: usize) -> Self {
        Self {
            max: max_ai_tasks.max(1),
            inner: Mutex::new(Inner {
                in_flight: 0,
                waiters: VecDeque::new(),
                next_ticket: 0,
            }),
            notify: Notify::new(),
        }
    }

    /// Block until an admission token is available, honoring FIFO order
    /// among concurrent callers.
    pub async fn acquire(&self) -> Permit<'_> {
        let ticket = {
            let mut inner = self.inner.lock().await;
            let ticket = inner.next_ticket;
            inner.next_ticket += 1;
            inner.waiters.push_back(ticket);
            ticket
        };

        loop {
            {
                let mut inner = self.inner.lock().await;
                if inner.in_flight < self.max && inner.waiters.front() == Some(&ticket) {
                    inner.waiters.pop_front();
                    inner.in_flight += 1;
                    debug!(ticket, in_flight = inner.in_flight, max = self.max, "AiQueue::acquire: admitted");
                    return Permit { queue: self };
                }
            }
            self.notify.notified().await;
        }
    }

    async fn release(&self) {
        let mut inner = self.inner.lock().await;
        inner.in_flight = inner.in_flight.saturating_sub(1);
        drop(inner);
        self.notify.notify_waiters();
    }
}

/// RAII admission token; releases its slot when dropped.
pub struct Permit<'a> {
    queue: &'a AiQueue,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        let queue = self.queue;
        // `release` is async (it needs the mutex); spawn it rather than
        // block a sync `Drop`. This mirrors the teacher's `complete()` being
        // called from an async context on every exit path rather than from
        // `Drop` directly, except here the token lives across an `.await`
        // boundary the caller doesn't control, so a detached task is the
        // only option on drop.
        tokio::spawn(async move { queue.release().await });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn bounds_concurrent_admissions() {
        let queue = Arc::new(AiQueue::new(2));
        let concurrent = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let queue = queue.clone();
            let concurrent = concurrent.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let _permit = queue.acquire().await;
                let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                concurrent.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn admits_immediately_when_under_the_cap() {
        let queue = AiQueue::new(2);
        let start = std::time::Instant::now();
        let _permit = queue.acquire().await;
        assert!(start.elapsed() < std::time::Duration::from_millis(50));
    }
}
