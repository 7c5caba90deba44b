//! Admission control for calls against a rate-limited external service.
//!
//! A [`RateLimiter`] bounds two things at once:
//! - how many scheduled tasks run simultaneously (`max_concurrent`), and
//! - how close together two task starts may be (`min_interval`), even when
//!   slots are free.
//!
//! Tasks are admitted in submission order and never rejected. A task's
//! outcome (including an error) is handed back unchanged and its slot is
//! released as soon as it finishes.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{Mutex, Semaphore, SemaphorePermit};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use kwengine_shared::LimiterConfig;

/// Shared, cloneable limiter. Clones share the same slots and interval gate.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Inner>,
}

struct Inner {
    config: LimiterConfig,
    /// Concurrency slots. Tokio's semaphore hands out permits FIFO.
    slots: Semaphore,
    /// Start time of the most recently admitted task. Holding this lock is
    /// the admission critical section.
    last_start: Mutex<Option<Instant>>,
    in_flight: AtomicUsize,
    waiting: AtomicUsize,
}

impl RateLimiter {
    pub fn new(config: LimiterConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                slots: Semaphore::new(config.max_concurrent),
                last_start: Mutex::new(None),
                in_flight: AtomicUsize::new(0),
                waiting: AtomicUsize::new(0),
            }),
        }
    }

    pub fn config(&self) -> LimiterConfig {
        self.inner.config
    }

    /// Tasks currently running.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Tasks submitted but not yet admitted.
    pub fn waiting(&self) -> usize {
        self.inner.waiting.load(Ordering::SeqCst)
    }

    /// Run `task` once both a slot is free and the interval since the last
    /// start has elapsed.
    pub async fn schedule<F, Fut, T>(&self, task: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let permit = self.admit().await;
        self.run(permit, task).await
    }

    /// Like [`schedule`](Self::schedule), but gives up with `None` if `cancel`
    /// fires before the task is admitted. Once admitted the task always runs
    /// to completion.
    pub async fn schedule_until<F, Fut, T>(&self, cancel: &CancellationToken, task: F) -> Option<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if cancel.is_cancelled() {
            return None;
        }

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                trace!("admission abandoned after cancellation");
                return None;
            }
            permit = self.admit() => permit,
        };

        Some(self.run(permit, task).await)
    }

    async fn admit(&self) -> SemaphorePermit<'_> {
        let _waiting = CounterGuard::enter(&self.inner.waiting);

        let permit = self
            .inner
            .slots
            .acquire()
            .await
            .expect("limiter semaphore is never closed");

        let mut last_start = self.inner.last_start.lock().await;
        if let Some(prev) = *last_start {
            let earliest = prev + self.inner.config.min_interval;
            if earliest > Instant::now() {
                debug!(
                    wait_ms = (earliest - Instant::now()).as_millis() as u64,
                    "rate limiting: spacing next call"
                );
                tokio::time::sleep_until(earliest).await;
            }
        }
        *last_start = Some(Instant::now());

        permit
    }

    async fn run<F, Fut, T>(&self, permit: SemaphorePermit<'_>, task: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _running = CounterGuard::enter(&self.inner.in_flight);
        trace!(in_flight = self.in_flight(), "task admitted");
        let output = task().await;
        drop(permit);
        output
    }
}

/// Increments a gauge on creation and decrements it on drop, so the gauges
/// stay correct when a future is dropped mid-wait.
struct CounterGuard<'a>(&'a AtomicUsize);

impl<'a> CounterGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for CounterGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn limiter(max_concurrent: usize, min_interval_ms: u64) -> RateLimiter {
        RateLimiter::new(LimiterConfig::new(
            max_concurrent,
            Duration::from_millis(min_interval_ms),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn bounds_concurrency_and_spacing() {
        let limiter = limiter(10, 1000);
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let starts = Arc::new(std::sync::Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for _ in 0..100 {
            let limiter = limiter.clone();
            let current = current.clone();
            let peak = peak.clone();
            let starts = starts.clone();
            handles.push(tokio::spawn(async move {
                limiter
                    .schedule(move || async move {
                        let now_running = current.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now_running, Ordering::SeqCst);
                        starts.lock().unwrap().push(Instant::now());
                        tokio::time::sleep(Duration::from_secs(15)).await;
                        current.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 10);

        let mut starts = starts.lock().unwrap().clone();
        assert_eq!(starts.len(), 100);
        starts.sort();
        for pair in starts.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(1000));
        }
        assert_eq!(limiter.in_flight(), 0);
        assert_eq!(limiter.waiting(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn spacing_applies_below_the_cap() {
        let limiter = limiter(10, 1000);
        let origin = Instant::now();

        let starts = futures::future::join_all(
            (0..3).map(|_| limiter.schedule(move || async move { Instant::now() - origin })),
        )
        .await;

        assert_eq!(starts[0], Duration::ZERO);
        for pair in starts.windows(2) {
            let gap = pair[1] - pair[0];
            assert!(gap >= Duration::from_millis(1000));
            assert!(gap < Duration::from_millis(1010));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn admits_in_submission_order() {
        let limiter = limiter(1, 0);
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        futures::future::join_all((0..5).map(|i| {
            let order = order.clone();
            limiter.schedule(move || async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                order.lock().unwrap().push(i);
            })
        }))
        .await;

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_task_releases_its_slot() {
        let limiter = limiter(1, 0);

        let first: Result<(), String> = limiter.schedule(|| async { Err("boom".into()) }).await;
        assert_eq!(first.unwrap_err(), "boom");

        let second: Result<u32, String> = limiter.schedule(|| async { Ok(7) }).await;
        assert_eq!(second.unwrap(), 7);
        assert_eq!(limiter.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_before_admission_returns_none() {
        let limiter = limiter(1, 0);
        let cancel = CancellationToken::new();

        let blocker = {
            let limiter = limiter.clone();
            tokio::spawn(async move {
                limiter
                    .schedule(|| tokio::time::sleep(Duration::from_secs(5)))
                    .await
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(limiter.in_flight(), 1);

        let waiter = {
            let limiter = limiter.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { limiter.schedule_until(&cancel, || async { 1 }).await })
        };
        tokio::task::yield_now().await;
        assert_eq!(limiter.waiting(), 1);

        cancel.cancel();
        assert_eq!(waiter.await.unwrap(), None);
        assert_eq!(limiter.waiting(), 0);

        // The in-flight task still completes normally.
        blocker.await.unwrap();
        assert_eq!(limiter.in_flight(), 0);
    }

    #[tokio::test]
    async fn pre_cancelled_token_never_runs_task() {
        let limiter = limiter(2, 0);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let ran = limiter.schedule_until(&cancel, || async { true }).await;
        assert!(ran.is_none());
    }
}
