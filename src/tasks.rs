//! Demo tasks simulating a small storefront workload
//!
//! Stand-ins for real user behavior (HTTP calls, DB queries, ...): each
//! task sleeps for a plausible latency and reports its own timing, the
//! way production task implementations are expected to.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;

use loadswarm_core::{StatsRecorder, Task};

/// Browsing: frequent, fast, occasionally flaky
pub struct BrowseTask {
    recorder: StatsRecorder,
}

impl BrowseTask {
    pub fn new(recorder: StatsRecorder) -> Self {
        Self { recorder }
    }
}

#[async_trait]
impl Task for BrowseTask {
    fn name(&self) -> &str {
        "browse"
    }

    fn weight(&self) -> u64 {
        3
    }

    async fn execute(&self) -> anyhow::Result<()> {
        let start = Instant::now();
        let latency = rand::rng().random_range(5..60);
        tokio::time::sleep(Duration::from_millis(latency)).await;
        let elapsed = start.elapsed().as_millis() as u64;

        if rand::rng().random_ratio(1, 50) {
            self.recorder
                .report_failure("GET", "/products", elapsed, "upstream timed out");
        } else {
            self.recorder.report_success("GET", "/products", elapsed, 2048);
        }
        Ok(())
    }
}

/// Checkout: rarer, slower, heavier response
pub struct CheckoutTask {
    recorder: StatsRecorder,
}

impl CheckoutTask {
    pub fn new(recorder: StatsRecorder) -> Self {
        Self { recorder }
    }
}

#[async_trait]
impl Task for CheckoutTask {
    fn name(&self) -> &str {
        "checkout"
    }

    async fn execute(&self) -> anyhow::Result<()> {
        let start = Instant::now();
        let latency = rand::rng().random_range(40..200);
        tokio::time::sleep(Duration::from_millis(latency)).await;
        let elapsed = start.elapsed().as_millis() as u64;

        self.recorder
            .report_success("POST", "/checkout", elapsed, 512);
        Ok(())
    }
}
