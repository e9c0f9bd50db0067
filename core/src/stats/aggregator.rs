//! Aggregation worker that turns request outcomes into report snapshots
//!
//! Producers (user workers, any number of them) push outcome events onto
//! unbounded queues through a cheap cloneable [`StatsRecorder`]; a single
//! aggregation task drains the queues and owns every [`StatsEntry`], so no
//! counter is ever touched from two tasks. A timer enqueues a report tick
//! every report interval; each tick snapshots the entry table onto a
//! bounded queue the runner relays to the master.
//!
//! The drain loop polls its queues in a fixed priority order (clear, tick,
//! failures, successes), so a flood of successes can never starve a clear
//! request or delay a report tick.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::entry::{fingerprint, StatsEntry, StatsError};

/// Capacity of the outbound snapshot queue
const SNAPSHOT_QUEUE_DEPTH: usize = 16;

struct Success {
    method: String,
    name: String,
    response_time: u64,
    content_length: u64,
}

struct Failure {
    method: String,
    name: String,
    response_time: u64,
    error: String,
}

/// Producer-side handle into the stats pipeline
///
/// All operations are non-blocking and never fail from the caller's
/// perspective; once the aggregation task is gone the events are silently
/// dropped.
#[derive(Clone)]
pub struct StatsRecorder {
    success_tx: mpsc::UnboundedSender<Success>,
    failure_tx: mpsc::UnboundedSender<Failure>,
    clear_tx: mpsc::UnboundedSender<()>,
    tick_tx: mpsc::UnboundedSender<()>,
}

impl StatsRecorder {
    /// Record a successful request
    pub fn report_success(&self, method: &str, name: &str, response_time: u64, content_length: u64) {
        let _ = self.success_tx.send(Success {
            method: method.to_string(),
            name: name.to_string(),
            response_time,
            content_length,
        });
    }

    /// Record a failed request
    ///
    /// The failure also counts as a request: its response time flows into
    /// the histogram and per-second maps, with a content length of zero.
    pub fn report_failure(
        &self,
        method: &str,
        name: &str,
        response_time: u64,
        error: impl Into<String>,
    ) {
        let _ = self.failure_tx.send(Failure {
            method: method.to_string(),
            name: name.to_string(),
            response_time,
            error: error.into(),
        });
    }

    /// Request a full reset at the next aggregation step
    pub fn clear(&self) {
        let _ = self.clear_tx.send(());
    }

    /// Force a report snapshot outside the timer cadence
    pub fn flush(&self) {
        let _ = self.tick_tx.send(());
    }
}

/// One report interval's worth of aggregated stats
#[derive(Debug, Clone)]
pub struct ReportSnapshot {
    /// Entries with at least one request or failure
    pub stats: Vec<StatsEntry>,
    /// The worker-wide aggregate
    pub stats_total: StatsEntry,
    /// Distinct errors since the previous snapshot
    pub errors: HashMap<String, StatsError>,
}

impl ReportSnapshot {
    /// The `data` payload of an outbound `stats` message
    pub fn into_payload(self) -> Map<String, Value> {
        let mut payload = Map::new();
        payload.insert(
            "stats".into(),
            Value::Array(self.stats.iter().map(StatsEntry::report).collect()),
        );
        payload.insert("stats_total".into(), self.stats_total.report());
        payload.insert(
            "errors".into(),
            Value::Object(
                self.errors
                    .iter()
                    .map(|(key, error)| (key.clone(), error.report()))
                    .collect(),
            ),
        );
        payload
    }
}

/// Single-consumer aggregation worker
pub struct StatsAggregator {
    entries: HashMap<(String, String), StatsEntry>,
    total: StatsEntry,
    errors: HashMap<String, StatsError>,
    success_rx: mpsc::UnboundedReceiver<Success>,
    failure_rx: mpsc::UnboundedReceiver<Failure>,
    clear_rx: mpsc::UnboundedReceiver<()>,
    tick_rx: mpsc::UnboundedReceiver<()>,
    snapshot_tx: mpsc::Sender<ReportSnapshot>,
}

impl StatsAggregator {
    /// Start the stats pipeline: the aggregation task plus its report
    /// timer. Returns the producer handle and the snapshot stream.
    pub fn spawn(
        report_interval: Duration,
        shutdown: CancellationToken,
    ) -> (StatsRecorder, mpsc::Receiver<ReportSnapshot>) {
        let (success_tx, success_rx) = mpsc::unbounded_channel();
        let (failure_tx, failure_rx) = mpsc::unbounded_channel();
        let (clear_tx, clear_rx) = mpsc::unbounded_channel();
        let (tick_tx, tick_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = mpsc::channel(SNAPSHOT_QUEUE_DEPTH);

        let recorder = StatsRecorder {
            success_tx,
            failure_tx,
            clear_tx,
            tick_tx: tick_tx.clone(),
        };

        let timer_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(report_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = timer_shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        if tick_tx.send(()).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let aggregator = Self {
            entries: HashMap::new(),
            total: StatsEntry::total(),
            errors: HashMap::new(),
            success_rx,
            failure_rx,
            clear_rx,
            tick_rx,
            snapshot_tx,
        };
        tokio::spawn(aggregator.run(shutdown));

        (recorder, snapshot_rx)
    }

    async fn run(mut self, shutdown: CancellationToken) {
        tracing::debug!("stats aggregation started");
        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,

                Some(()) = self.clear_rx.recv() => self.clear_all(),

                Some(()) = self.tick_rx.recv() => self.report().await,

                Some(failure) = self.failure_rx.recv() => {
                    self.log_request(&failure.method, &failure.name, failure.response_time, 0);
                    self.log_error(&failure.method, &failure.name, &failure.error);
                }

                Some(success) = self.success_rx.recv() => {
                    self.log_request(
                        &success.method,
                        &success.name,
                        success.response_time,
                        success.content_length,
                    );
                }
            }
        }
        tracing::debug!("stats aggregation stopped");
    }

    fn entry(&mut self, method: &str, name: &str) -> &mut StatsEntry {
        self.entries
            .entry((name.to_string(), method.to_string()))
            .or_insert_with(|| StatsEntry::new(name, method))
    }

    fn log_request(&mut self, method: &str, name: &str, response_time: u64, content_length: u64) {
        self.total.log(response_time, content_length);
        self.entry(method, name).log(response_time, content_length);
    }

    fn log_error(&mut self, method: &str, name: &str, error: &str) {
        self.total.log_error();
        self.entry(method, name).log_error();

        let key = fingerprint(method, name, error);
        self.errors
            .entry(key)
            .or_insert_with(|| StatsError::new(name, method, error))
            .occurred();
    }

    fn clear_all(&mut self) {
        self.entries.clear();
        self.errors.clear();
        self.total = StatsEntry::total();
        tracing::debug!("stats cleared");
    }

    async fn report(&mut self) {
        let snapshot = ReportSnapshot {
            stats: self
                .entries
                .values()
                .filter(|entry| !entry.is_empty())
                .cloned()
                .collect(),
            stats_total: self.total.clone(),
            errors: std::mem::take(&mut self.errors),
        };
        // bounded queue: a stalled relay backpressures reporting rather
        // than growing without limit
        if self.snapshot_tx.send(snapshot).await.is_err() {
            tracing::debug!("snapshot consumer gone, stopping reports");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline() -> (
        StatsRecorder,
        mpsc::Receiver<ReportSnapshot>,
        CancellationToken,
    ) {
        // timer parked far out so tests drive ticks via flush()
        let shutdown = CancellationToken::new();
        let (recorder, snapshots) = StatsAggregator::spawn(Duration::from_secs(3600), shutdown.clone());
        (recorder, snapshots, shutdown)
    }

    /// Flush until the total reaches `expected` requests, or give up.
    async fn snapshot_at(
        recorder: &StatsRecorder,
        snapshots: &mut mpsc::Receiver<ReportSnapshot>,
        expected: u64,
    ) -> ReportSnapshot {
        for _ in 0..200 {
            recorder.flush();
            let snapshot = snapshots.recv().await.expect("aggregator alive");
            if snapshot.stats_total.num_requests >= expected {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("aggregation never reached {expected} requests");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_aggregation_under_concurrent_load() {
        let (recorder, mut snapshots, shutdown) = pipeline();

        let mut producers = Vec::new();
        for i in 0..100u64 {
            let recorder = recorder.clone();
            producers.push(tokio::spawn(async move {
                for _ in 0..1000 {
                    recorder.report_success("GET", "/x", 10 + i % 50, 100);
                }
            }));
        }
        for producer in producers {
            producer.await.unwrap();
        }

        let snapshot = snapshot_at(&recorder, &mut snapshots, 100_000).await;
        assert_eq!(snapshot.stats_total.num_requests, 100_000);
        assert_eq!(snapshot.stats_total.total_content_length, 10_000_000);
        // response times 10..=59 are all below 100, so buckets are exact
        assert_eq!(snapshot.stats_total.response_times.len(), 50);
        assert_eq!(snapshot.stats.len(), 1);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_failure_counts_as_request() {
        let (recorder, mut snapshots, shutdown) = pipeline();

        recorder.report_failure("GET", "/x", 20, "connection refused");
        let snapshot = snapshot_at(&recorder, &mut snapshots, 1).await;

        assert_eq!(snapshot.stats_total.num_requests, 1);
        assert_eq!(snapshot.stats_total.num_failures, 1);
        assert_eq!(snapshot.stats_total.min_response_time, Some(20));
        assert_eq!(snapshot.stats_total.total_content_length, 0);

        assert_eq!(snapshot.errors.len(), 1);
        let error = snapshot.errors.values().next().unwrap();
        assert_eq!(error.occurrences, 1);
        assert_eq!(error.error, "connection refused");
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_totals_equal_entry_sums() {
        let (recorder, mut snapshots, shutdown) = pipeline();

        recorder.report_success("GET", "/a", 10, 100);
        recorder.report_success("GET", "/a", 30, 50);
        recorder.report_success("POST", "/b", 200, 2000);
        recorder.report_failure("GET", "/c", 15, "boom");

        let snapshot = snapshot_at(&recorder, &mut snapshots, 4).await;

        let sum = |field: fn(&StatsEntry) -> u64| snapshot.stats.iter().map(field).sum::<u64>();
        assert_eq!(sum(|e| e.num_requests), snapshot.stats_total.num_requests);
        assert_eq!(sum(|e| e.num_failures), snapshot.stats_total.num_failures);
        assert_eq!(
            sum(|e| e.total_response_time),
            snapshot.stats_total.total_response_time
        );
        assert_eq!(
            sum(|e| e.total_content_length),
            snapshot.stats_total.total_content_length
        );
        assert_eq!(snapshot.stats.len(), 3);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_clear_returns_to_zero_state() {
        let (recorder, mut snapshots, shutdown) = pipeline();

        recorder.report_success("GET", "/x", 10, 100);
        recorder.report_failure("GET", "/x", 10, "boom");
        let _ = snapshot_at(&recorder, &mut snapshots, 2).await;

        recorder.clear();
        recorder.flush();
        let snapshot = snapshots.recv().await.unwrap();

        assert!(snapshot.stats.is_empty());
        assert!(snapshot.errors.is_empty());
        assert!(snapshot.stats_total.is_empty());
        assert_eq!(snapshot.stats_total.response_times.len(), 0);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_errors_drain_per_report_but_histograms_persist() {
        let (recorder, mut snapshots, shutdown) = pipeline();

        recorder.report_failure("GET", "/x", 40, "boom");
        let first = snapshot_at(&recorder, &mut snapshots, 1).await;
        assert_eq!(first.errors.len(), 1);

        recorder.flush();
        let second = snapshots.recv().await.unwrap();
        assert!(second.errors.is_empty());
        assert_eq!(second.stats_total.num_failures, 1);
        assert_eq!(second.stats[0].response_times.len(), 1);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_timer_produces_snapshots() {
        let shutdown = CancellationToken::new();
        let (recorder, mut snapshots) =
            StatsAggregator::spawn(Duration::from_millis(50), shutdown.clone());

        recorder.report_success("GET", "/x", 10, 1);
        let snapshot = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let snapshot = snapshots.recv().await.unwrap();
                if snapshot.stats_total.num_requests > 0 {
                    return snapshot;
                }
            }
        })
        .await
        .expect("timer never fired");

        assert_eq!(snapshot.stats_total.num_requests, 1);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_snapshot_payload_shape() {
        let (recorder, mut snapshots, shutdown) = pipeline();

        recorder.report_success("GET", "/x", 10, 1);
        recorder.report_failure("GET", "/x", 5, "boom");
        let snapshot = snapshot_at(&recorder, &mut snapshots, 2).await;

        let payload = snapshot.into_payload();
        assert!(payload["stats"].is_array());
        assert_eq!(payload["stats_total"]["name"], "Total");
        assert_eq!(payload["stats_total"]["num_requests"], 2);
        assert_eq!(payload["errors"].as_object().unwrap().len(), 1);
        shutdown.cancel();
    }
}
