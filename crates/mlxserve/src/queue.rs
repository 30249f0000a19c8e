// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! FIFO admission queue with bounded concurrency.
//!
//! `execute` runs futures in submission order, never exceeding the
//! configured concurrency. One execution's failure never blocks the
//! next dispatch, cancelled pendings never run, and an optional
//! per-request timeout completes the caller's future with `Timeout`
//! whether the request is still pending or already active.

use crate::config::QueueConfig;
use crate::error::{Error, Result};
use crate::metrics_constants::{METRIC_QUEUE_PENDING, METRIC_QUEUE_TIMEOUTS_TOTAL};
use parking_lot::Mutex;
use prometheus::{Counter, Gauge};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tracing::debug;

static PENDING: LazyLock<Gauge> = LazyLock::new(|| {
    crate::metrics_utils::gauge(METRIC_QUEUE_PENDING, "Requests pending in the admission queue")
});
static TIMEOUTS: LazyLock<Counter> = LazyLock::new(|| {
    crate::metrics_utils::counter(
        METRIC_QUEUE_TIMEOUTS_TOTAL,
        "Requests timed out while queued or active",
    )
});

struct PendingJob {
    id: u64,
    go: oneshot::Sender<()>,
}

struct QueueInner {
    pending: VecDeque<PendingJob>,
    active: usize,
    next_id: u64,
    draining: bool,
}

/// The admission queue.
pub struct RequestQueue {
    max_concurrent: Option<usize>,
    default_timeout: Option<Duration>,
    inner: Mutex<QueueInner>,
    idle: Notify,
}

impl RequestQueue {
    /// Build from config. Zero or negative `max_concurrent` means
    /// unbounded.
    #[must_use]
    pub fn new(config: &QueueConfig) -> Arc<Self> {
        let max_concurrent = usize::try_from(config.max_concurrent).ok().filter(|n| *n > 0);
        let default_timeout = (config.request_timeout_ms > 0)
            .then(|| Duration::from_millis(config.request_timeout_ms));
        Arc::new(Self {
            max_concurrent,
            default_timeout,
            inner: Mutex::new(QueueInner {
                pending: VecDeque::new(),
                active: 0,
                next_id: 0,
                draining: false,
            }),
            idle: Notify::new(),
        })
    }

    /// Pending request count.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Active request count.
    #[must_use]
    pub fn active(&self) -> usize {
        self.inner.lock().active
    }

    /// Run `fut` under the queue's concurrency bound with the default
    /// timeout.
    ///
    /// # Errors
    ///
    /// `Timeout` when the budget elapses pending or active; `Cancelled`
    /// when [`RequestQueue::clear_pending`] removed it before it ran;
    /// otherwise the future's own error.
    pub async fn execute<T, Fut>(self: &Arc<Self>, fut: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        self.execute_with_timeout(fut, self.default_timeout).await
    }

    /// As [`RequestQueue::execute`] with an explicit timeout override.
    ///
    /// # Errors
    ///
    /// As [`RequestQueue::execute`].
    pub async fn execute_with_timeout<T, Fut>(
        self: &Arc<Self>,
        fut: Fut,
        timeout: Option<Duration>,
    ) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        let started = tokio::time::Instant::now();

        // Admission: run immediately when under the cap with nothing
        // queued ahead, otherwise park in FIFO order.
        let wait = {
            let mut inner = self.inner.lock();
            if inner.draining {
                return Err(Error::Shutdown("queue is draining".to_string()));
            }
            let under_cap = self
                .max_concurrent
                .map_or(true, |cap| inner.active < cap);
            if under_cap && inner.pending.is_empty() {
                inner.active += 1;
                None
            } else {
                let id = inner.next_id;
                inner.next_id += 1;
                let (go_tx, go_rx) = oneshot::channel();
                inner.pending.push_back(PendingJob { id, go: go_tx });
                PENDING.set(inner.pending.len() as f64);
                Some((id, go_rx))
            }
        };

        if let Some((id, mut go_rx)) = wait {
            let admitted = match timeout {
                Some(limit) => match tokio::time::timeout(limit, &mut go_rx).await {
                    Ok(result) => result,
                    Err(_) => {
                        self.remove_pending(id);
                        // The dispatcher may have admitted us in the
                        // instant before removal; give the slot back so
                        // it is not leaked.
                        if go_rx.try_recv().is_ok() {
                            self.release_slot();
                        }
                        TIMEOUTS.inc();
                        return Err(Error::Timeout {
                            method: "queue_admission".to_string(),
                            request_id: id,
                            elapsed_ms: limit.as_millis() as u64,
                        });
                    }
                },
                None => (&mut go_rx).await,
            };
            if admitted.is_err() {
                // clear_pending dropped the sender.
                return Err(Error::Cancelled("cleared from the queue".to_string()));
            }
            // The dispatcher already counted us active.
        }

        // Execution guard: release the slot and dispatch the next job on
        // every exit path.
        struct SlotGuard {
            queue: Arc<RequestQueue>,
        }
        impl Drop for SlotGuard {
            fn drop(&mut self) {
                self.queue.release_slot();
            }
        }
        let _guard = SlotGuard {
            queue: Arc::clone(self),
        };

        match timeout {
            Some(limit) => {
                let remaining = limit.saturating_sub(started.elapsed());
                match tokio::time::timeout(remaining, fut).await {
                    Ok(result) => result,
                    Err(_) => {
                        TIMEOUTS.inc();
                        Err(Error::Timeout {
                            method: "queue_execution".to_string(),
                            request_id: 0,
                            elapsed_ms: limit.as_millis() as u64,
                        })
                    }
                }
            }
            None => fut.await,
        }
    }

    /// Cancel pending requests; active requests continue.
    pub fn clear_pending(&self) {
        let cleared = {
            let mut inner = self.inner.lock();
            let jobs = std::mem::take(&mut inner.pending);
            PENDING.set(0.0);
            jobs
        };
        let count = cleared.len();
        drop(cleared); // Dropping the senders rejects the parked callers.
        if count > 0 {
            debug!(count, "Cleared pending queue entries");
        }
        self.idle.notify_waiters();
    }

    /// Await completion of all active and pending requests. New
    /// submissions are rejected while draining.
    pub async fn drain(&self) {
        self.inner.lock().draining = true;
        loop {
            {
                let inner = self.inner.lock();
                if inner.active == 0 && inner.pending.is_empty() {
                    return;
                }
            }
            self.idle.notified().await;
        }
    }

    /// Reopen after a drain (tests and restart paths).
    pub fn reopen(&self) {
        self.inner.lock().draining = false;
    }

    fn remove_pending(&self, id: u64) {
        let mut inner = self.inner.lock();
        inner.pending.retain(|job| job.id != id);
        PENDING.set(inner.pending.len() as f64);
    }

    fn release_slot(&self) {
        let mut inner = self.inner.lock();
        inner.active = inner.active.saturating_sub(1);
        // FIFO dispatch of the next parked job; a receiver that timed
        // out or was dropped just forfeits the slot to the one after.
        while self
            .max_concurrent
            .map_or(true, |cap| inner.active < cap)
        {
            let Some(job) = inner.pending.pop_front() else {
                break;
            };
            if job.go.send(()).is_ok() {
                inner.active += 1;
            }
        }
        PENDING.set(inner.pending.len() as f64);
        if inner.active == 0 && inner.pending.is_empty() {
            self.idle.notify_waiters();
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn queue(max_concurrent: i64) -> Arc<RequestQueue> {
        RequestQueue::new(&QueueConfig {
            max_concurrent,
            request_timeout_ms: 0,
        })
    }

    #[tokio::test]
    async fn test_runs_immediately_under_cap() {
        let queue = queue(4);
        let value = queue.execute(async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
        assert_eq!(queue.active(), 0);
    }

    #[tokio::test]
    async fn test_concurrency_never_exceeds_cap() {
        let queue = queue(2);
        let peak = Arc::new(AtomicUsize::new(0));
        let current = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let queue = Arc::clone(&queue);
            let peak = Arc::clone(&peak);
            let current = Arc::clone(&current);
            handles.push(tokio::spawn(async move {
                queue
                    .execute(async move {
                        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        current.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2, "peak {}", peak.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = queue(1);
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..5 {
            let queue = Arc::clone(&queue);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                queue
                    .execute(async move {
                        order.lock().push(i);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        Ok(())
                    })
                    .await
            }));
            // Stagger submissions so enqueue order is deterministic.
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_error_does_not_block_next() {
        let queue = queue(1);
        let err = queue
            .execute(async { Err::<(), _>(Error::Generation("boom".to_string())) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Generation(_)));

        let value = queue.execute(async { Ok(1) }).await.unwrap();
        assert_eq!(value, 1);
    }

    #[tokio::test]
    async fn test_unbounded_when_zero() {
        let queue = queue(0);
        let mut handles = Vec::new();
        for _ in 0..32 {
            let queue = Arc::clone(&queue);
            handles.push(tokio::spawn(async move {
                queue
                    .execute(async {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Ok(())
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn test_pending_timeout() {
        let queue = queue(1);
        let blocker = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                queue
                    .execute(async {
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        Ok(())
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let err = queue
            .execute_with_timeout(async { Ok(()) }, Some(Duration::from_millis(30)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        assert_eq!(queue.pending(), 0, "timed out pending must be removed");
        blocker.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_active_timeout() {
        let queue = queue(1);
        let err = queue
            .execute_with_timeout(
                async {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok(())
                },
                Some(Duration::from_millis(30)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        // Slot released despite the timeout.
        queue.execute(async { Ok(()) }).await.unwrap();
    }

    #[tokio::test]
    async fn test_clear_pending_cancels_only_pending() {
        let queue = queue(1);
        let active_done = Arc::new(AtomicUsize::new(0));

        let active = {
            let queue = Arc::clone(&queue);
            let active_done = Arc::clone(&active_done);
            tokio::spawn(async move {
                queue
                    .execute(async move {
                        tokio::time::sleep(Duration::from_millis(80)).await;
                        active_done.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let parked = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.execute(async { Ok(()) }).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(queue.pending(), 1);

        queue.clear_pending();
        let err = parked.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Cancelled(_)));

        active.await.unwrap().unwrap();
        assert_eq!(active_done.load(Ordering::SeqCst), 1, "active ran to completion");
    }

    #[tokio::test]
    async fn test_drain_waits_for_everything() {
        let queue = queue(2);
        let done = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let queue = Arc::clone(&queue);
            let done = Arc::clone(&done);
            handles.push(tokio::spawn(async move {
                queue
                    .execute(async move {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        done.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
            }));
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
        queue.drain().await;
        assert_eq!(done.load(Ordering::SeqCst), 4);

        let err = queue.execute(async { Ok(()) }).await.unwrap_err();
        assert!(matches!(err, Error::Shutdown(_)));
    }
}
