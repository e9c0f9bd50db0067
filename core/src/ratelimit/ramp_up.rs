//! Ramp-up token-bucket limiter

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{Bucket, RateLimiter};

/// Distributes permits at a rate that grows in steps.
///
/// Two schedules cooperate: every `ramp_up_period` the target threshold
/// grows by `ramp_up_step` (saturating at `max_threshold`), and every
/// `refill_period` the bucket is reset to the current target and parked
/// acquirers are released. The bucket starts empty, so the first
/// acquirers always take the slow path.
pub struct RampUpRateLimiter {
    max_threshold: u64,
    ramp_up_step: u64,
    ramp_up_period: Duration,
    refill_period: Duration,
    bucket: Arc<Bucket>,
    next_threshold: Arc<AtomicI64>,
    stopped: Arc<AtomicBool>,
    timers: Mutex<Option<CancellationToken>>,
}

impl RampUpRateLimiter {
    /// Create a ramp-up limiter; call [`start`] to begin the schedules.
    ///
    /// [`start`]: RateLimiter::start
    pub fn new(
        max_threshold: u64,
        ramp_up_step: u64,
        ramp_up_period: Duration,
        refill_period: Duration,
    ) -> Self {
        Self {
            max_threshold,
            ramp_up_step,
            ramp_up_period,
            refill_period,
            bucket: Arc::new(Bucket::new(0)),
            next_threshold: Arc::new(AtomicI64::new(0)),
            stopped: Arc::new(AtomicBool::new(true)),
            timers: Mutex::new(None),
        }
    }

    /// The threshold the next refill will grant
    pub fn next_threshold(&self) -> i64 {
        self.next_threshold.load(Ordering::SeqCst)
    }

    /// Permits left in the current refill window
    pub fn current_threshold(&self) -> i64 {
        self.bucket.current()
    }
}

#[async_trait]
impl RateLimiter for RampUpRateLimiter {
    async fn acquire(&self) -> bool {
        if self.is_stopped() {
            return false;
        }
        self.bucket.acquire().await
    }

    fn start(&self) {
        let mut slot = self.timers.lock().expect("timer lock");
        if let Some(previous) = slot.take() {
            previous.cancel();
        }
        let cancel = CancellationToken::new();
        *slot = Some(cancel.clone());
        self.stopped.store(false, Ordering::SeqCst);
        self.next_threshold.store(0, Ordering::SeqCst);
        self.bucket.refill(0);

        tracing::debug!(
            max_threshold = self.max_threshold,
            ramp_up_step = self.ramp_up_step,
            ramp_up_period_ms = self.ramp_up_period.as_millis() as u64,
            refill_period_ms = self.refill_period.as_millis() as u64,
            "ramp-up rate limiter started"
        );

        let growth_cancel = cancel.clone();
        let next_threshold = Arc::clone(&self.next_threshold);
        let step = self.ramp_up_step as i64;
        let max = self.max_threshold as i64;
        let ramp_up_period = self.ramp_up_period;
        tokio::spawn(async move {
            // first growth lands one full period after start
            let start = tokio::time::Instant::now() + ramp_up_period;
            let mut interval = tokio::time::interval_at(start, ramp_up_period);
            loop {
                tokio::select! {
                    _ = growth_cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let current = next_threshold.load(Ordering::SeqCst);
                        let grown = current.saturating_add(step).min(max);
                        next_threshold.store(grown, Ordering::SeqCst);
                    }
                }
            }
        });

        let bucket = Arc::clone(&self.bucket);
        let next_threshold = Arc::clone(&self.next_threshold);
        let refill_period = self.refill_period;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(refill_period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => bucket.refill(next_threshold.load(Ordering::SeqCst)),
                }
            }
        });
    }

    fn stop(&self) {
        if let Some(timers) = self.timers.lock().expect("timer lock").take() {
            timers.cancel();
        }
        self.stopped.store(true, Ordering::SeqCst);
        self.bucket.release_waiters();
        tracing::debug!("ramp-up rate limiter stopped");
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}
