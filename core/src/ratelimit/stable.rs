//! Stable token-bucket limiter

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{Bucket, RateLimiter};

/// Distributes permits at a fixed rate: the bucket is reset to
/// `max_threshold` every `period`, and empty-bucket acquirers park until
/// the next refill.
pub struct StableRateLimiter {
    max_threshold: u64,
    period: Duration,
    bucket: Arc<Bucket>,
    stopped: Arc<AtomicBool>,
    timer: Mutex<Option<CancellationToken>>,
}

impl StableRateLimiter {
    /// Limiter refilled once per second
    pub fn new(max_threshold: u64) -> Self {
        Self::with_period(max_threshold, Duration::from_secs(1))
    }

    /// Limiter with an explicit refill period
    pub fn with_period(max_threshold: u64, period: Duration) -> Self {
        Self {
            max_threshold,
            period,
            bucket: Arc::new(Bucket::new(max_threshold as i64)),
            stopped: Arc::new(AtomicBool::new(true)),
            timer: Mutex::new(None),
        }
    }

    /// Permits left in the current period
    pub fn current_threshold(&self) -> i64 {
        self.bucket.current()
    }
}

#[async_trait]
impl RateLimiter for StableRateLimiter {
    async fn acquire(&self) -> bool {
        if self.is_stopped() {
            return false;
        }
        self.bucket.acquire().await
    }

    fn start(&self) {
        let mut slot = self.timer.lock().expect("timer lock");
        if let Some(previous) = slot.take() {
            previous.cancel();
        }
        let cancel = CancellationToken::new();
        *slot = Some(cancel.clone());
        self.stopped.store(false, Ordering::SeqCst);

        let bucket = Arc::clone(&self.bucket);
        let threshold = self.max_threshold as i64;
        let period = self.period;
        tracing::debug!(max_threshold = self.max_threshold, period_ms = period.as_millis() as u64, "stable rate limiter started");
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    // first tick fires immediately, filling the bucket on start
                    _ = interval.tick() => bucket.refill(threshold),
                }
            }
        });
    }

    fn stop(&self) {
        if let Some(timer) = self.timer.lock().expect("timer lock").take() {
            timer.cancel();
        }
        self.stopped.store(true, Ordering::SeqCst);
        // parked acquirers must not sit out a refill that will never come
        self.bucket.release_waiters();
        tracing::debug!("stable rate limiter stopped");
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}
