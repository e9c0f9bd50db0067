//! Aggregate throughput shaping
//!
//! Token-bucket limiters shared by every user worker. The fast path of
//! [`RateLimiter::acquire`] is a single atomic decrement; only callers
//! that find the bucket empty park, and a scheduled refill wakes all of
//! them at once. Throughput is shaped worker-wide; there is no per-user
//! pacing or fairness.

mod ramp_up;
mod stable;

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::config::RateLimitConfig;

pub use ramp_up::RampUpRateLimiter;
pub use stable::StableRateLimiter;

/// A token-bucket throttle over request starts
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Take one permit, parking until the next refill when none are free.
    ///
    /// Returns `false` when a free permit was available immediately and
    /// `true` when the caller had to wait. A stopped limiter admits
    /// immediately.
    async fn acquire(&self) -> bool;

    /// Start (or restart) the refill schedule
    fn start(&self);

    /// Stop the refill schedule and release parked callers
    fn stop(&self);

    /// Whether the limiter is currently stopped
    fn is_stopped(&self) -> bool;
}

/// Build the configured limiter, if any
pub fn from_config(config: &RateLimitConfig) -> Option<Arc<dyn RateLimiter>> {
    match config {
        RateLimitConfig::None => None,
        RateLimitConfig::Stable {
            max_threshold,
            period,
        } => Some(Arc::new(StableRateLimiter::with_period(
            *max_threshold,
            *period,
        ))),
        RateLimitConfig::RampUp {
            max_threshold,
            ramp_up_step,
            ramp_up_period,
            refill_period,
        } => Some(Arc::new(RampUpRateLimiter::new(
            *max_threshold,
            *ramp_up_step,
            *ramp_up_period,
            *refill_period,
        ))),
    }
}

/// Permit counter with a refill broadcast
///
/// `acquire` decrements; negative means the bucket is drained and the
/// caller parks on the watch channel until a refill (or a shutdown wake)
/// is broadcast.
pub(crate) struct Bucket {
    threshold: AtomicI64,
    refill: watch::Sender<u64>,
}

impl Bucket {
    pub(crate) fn new(initial: i64) -> Self {
        let (refill, _) = watch::channel(0);
        Self {
            threshold: AtomicI64::new(initial),
            refill,
        }
    }

    /// Reset the permit count and wake every parked caller
    pub(crate) fn refill(&self, threshold: i64) {
        self.threshold.store(threshold, Ordering::SeqCst);
        self.refill.send_modify(|generation| *generation += 1);
    }

    /// Wake parked callers without granting permits
    pub(crate) fn release_waiters(&self) {
        self.refill.send_modify(|generation| *generation += 1);
    }

    pub(crate) fn current(&self) -> i64 {
        self.threshold.load(Ordering::SeqCst)
    }

    pub(crate) async fn acquire(&self) -> bool {
        let permit = self.threshold.fetch_sub(1, Ordering::SeqCst) - 1;
        if permit >= 0 {
            return false;
        }
        let mut parked = self.refill.subscribe();
        let _ = parked.changed().await;
        true
    }
}
