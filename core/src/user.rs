//! Simulated-user execution loop

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::ratelimit::RateLimiter;
use crate::stats::StatsRecorder;
use crate::task::{Task, WeightedSelector};

/// An unhandled error escaping user task code, relayed to the master
#[derive(Debug, Clone)]
pub struct TaskFailure {
    /// Name of the task that failed
    pub task: String,
    /// Top-level error message
    pub message: String,
    /// Full error chain
    pub detail: String,
}

/// One simulated user: repeatedly picks a weighted task and runs it
///
/// The loop is `acquire -> pick -> execute -> repeat`. Tasks report their
/// own timings; only errors escaping `execute` are recorded here, as
/// failures with the elapsed wall time under the `unknown` method tag.
/// Cancellation is cooperative and checked between iterations, never
/// inside user code.
pub struct UserWorker {
    id: u64,
    selector: Arc<WeightedSelector>,
    limiter: Option<Arc<dyn RateLimiter>>,
    recorder: StatsRecorder,
    failures_tx: mpsc::UnboundedSender<TaskFailure>,
}

impl UserWorker {
    /// Create a user over the shared services
    pub fn new(
        id: u64,
        selector: Arc<WeightedSelector>,
        limiter: Option<Arc<dyn RateLimiter>>,
        recorder: StatsRecorder,
        failures_tx: mpsc::UnboundedSender<TaskFailure>,
    ) -> Self {
        Self {
            id,
            selector,
            limiter,
            recorder,
            failures_tx,
        }
    }

    /// Run until `cancel` fires
    pub async fn run(self, cancel: CancellationToken) {
        tracing::debug!(user_id = self.id, "user started");

        loop {
            if cancel.is_cancelled() {
                break;
            }

            if let Some(limiter) = &self.limiter {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = limiter.acquire() => {}
                }
            }

            let task = Arc::clone(self.selector.pick());
            let start = Instant::now();
            if let Err(error) = task.execute().await {
                let elapsed = start.elapsed().as_millis() as u64;
                self.recorder
                    .report_failure("unknown", task.name(), elapsed, error.to_string());
                let _ = self.failures_tx.send(TaskFailure {
                    task: task.name().to_string(),
                    message: error.to_string(),
                    detail: format!("{error:?}"),
                });
                tracing::debug!(
                    user_id = self.id,
                    task = task.name(),
                    error = %error,
                    "task failed"
                );
            }
        }

        tracing::debug!(user_id = self.id, "user stopped");
    }
}
