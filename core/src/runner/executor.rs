//! The core controller: state machine, population control, control loops

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::state::RunnerState;
use crate::config::{ConfigError, WorkerConfig};
use crate::error::{Error, Result};
use crate::message::{self, Message};
use crate::ratelimit::{self, RateLimiter};
use crate::stats::{ReportSnapshot, StatsAggregator, StatsRecorder};
use crate::task::{Task, WeightedSelector};
use crate::transport::{Recv, TcpTransport, Transport};
use crate::user::{TaskFailure, UserWorker};

/// Consecutive heartbeat send failures tolerated before the master is
/// considered unreachable
const HEARTBEAT_FAILURE_LIMIT: u32 = 3;

/// Pacing deadline used while no reconcile is in progress
const IDLE_PACING: Duration = Duration::from_secs(3600);

enum Event {
    Inbound(Message),
    ReceiverFailed,
    TransportClosed,
    HeartbeatLost,
    MasterSilent,
}

#[derive(Debug, Clone, Copy)]
struct Reconcile {
    target: u64,
    rate: f64,
    next_batch_at: tokio::time::Instant,
}

/// Worker-side controller driven by the master
///
/// Owns the transport, the stats pipeline, the rate limiter, and the user
/// population. Register tasks, then call [`run`], which connects to the
/// master and serves the control protocol until a `quit` arrives or the
/// shutdown token fires.
///
/// Construction must happen inside a tokio runtime: the stats pipeline is
/// spawned immediately so that tasks can capture a [`StatsRecorder`]
/// before the runner starts.
///
/// [`run`]: Runner::run
pub struct Runner {
    config: WorkerConfig,
    node_id: String,
    tasks: Vec<Arc<dyn Task>>,
    transport: Option<Arc<dyn Transport>>,
    limiter: Option<Arc<dyn RateLimiter>>,
    recorder: StatsRecorder,
    snapshot_rx: Option<mpsc::Receiver<ReportSnapshot>>,
    state_tx: watch::Sender<RunnerState>,
    shutdown: CancellationToken,
    user_count: Arc<AtomicU64>,
}

impl Runner {
    /// Create a runner for the given configuration
    pub fn new(config: WorkerConfig) -> Result<Self> {
        config.validate()?;
        let shutdown = CancellationToken::new();
        let (recorder, snapshot_rx) =
            StatsAggregator::spawn(config.report_interval, shutdown.clone());
        let limiter = ratelimit::from_config(&config.rate_limit);
        let (state_tx, _) = watch::channel(RunnerState::Ready);

        Ok(Self {
            node_id: message::node_id(),
            config,
            tasks: Vec::new(),
            transport: None,
            limiter,
            recorder,
            snapshot_rx: Some(snapshot_rx),
            state_tx,
            shutdown,
            user_count: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Use an already-connected transport instead of dialing the master
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Register a task for weighted selection
    pub fn register(&mut self, task: Arc<dyn Task>) -> &mut Self {
        self.tasks.push(task);
        self
    }

    /// Producer handle into the stats pipeline
    pub fn recorder(&self) -> StatsRecorder {
        self.recorder.clone()
    }

    /// Current lifecycle state
    pub fn state(&self) -> RunnerState {
        *self.state_tx.borrow()
    }

    /// Observe state transitions
    pub fn watch_state(&self) -> watch::Receiver<RunnerState> {
        self.state_tx.subscribe()
    }

    /// Token that tears the whole worker down when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Number of currently spawned users
    pub fn user_count(&self) -> u64 {
        self.user_count.load(Ordering::SeqCst)
    }

    /// Connect to the master and serve the control protocol
    ///
    /// Returns after a `quit` message, a fatal transport failure, or
    /// cancellation of the shutdown token.
    pub async fn run(self) -> Result<()> {
        let shutdown = self.shutdown.clone();
        let result = self.serve().await;
        // tear down whatever outlived the dispatch loop, stats included
        shutdown.cancel();
        result
    }

    async fn serve(mut self) -> Result<()> {
        let selector = Arc::new(
            WeightedSelector::new(std::mem::take(&mut self.tasks))
                .ok_or(Error::Config(ConfigError::NoTasks))?,
        );
        let transport: Arc<dyn Transport> = match self.transport.take() {
            Some(transport) => transport,
            None => Arc::new(
                TcpTransport::connect(
                    &self.config.master_host,
                    self.config.master_port,
                    self.config.recv_timeout,
                )
                .await?,
            ),
        };

        info!(node_id = %self.node_id, "worker starting");
        transport.send(&Message::client_ready(&self.node_id)).await?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (failures_tx, failures_rx) = mpsc::unbounded_channel();
        let last_activity = Arc::new(Mutex::new(std::time::Instant::now()));

        // control pool: receiver, stats relay, heartbeater, liveness watcher
        tokio::spawn(receiver_loop(
            Arc::clone(&transport),
            event_tx.clone(),
            Arc::clone(&last_activity),
            self.shutdown.clone(),
        ));
        tokio::spawn(relay_loop(
            Arc::clone(&transport),
            self.snapshot_rx.take().expect("snapshot stream taken once"),
            Arc::clone(&self.user_count),
            self.node_id.clone(),
            self.shutdown.clone(),
        ));
        tokio::spawn(heartbeat_loop(
            Arc::clone(&transport),
            self.node_id.clone(),
            self.state_tx.subscribe(),
            Arc::clone(&self.user_count),
            self.config.heartbeat_interval,
            event_tx.clone(),
            self.shutdown.clone(),
        ));
        tokio::spawn(liveness_loop(
            Arc::clone(&last_activity),
            self.config.master_missing_timeout,
            event_tx,
            self.shutdown.clone(),
        ));

        let mut dispatch = Dispatch {
            node_id: self.node_id.clone(),
            transport: Arc::clone(&transport),
            selector,
            limiter: self.limiter.clone(),
            recorder: self.recorder.clone(),
            state_tx: self.state_tx.clone(),
            shutdown: self.shutdown.clone(),
            user_count: Arc::clone(&self.user_count),
            population: Vec::new(),
            next_user_id: 0,
            reconcile: None,
            failures_tx,
            failures_rx,
            event_rx,
        };
        dispatch.run().await;

        transport.close().await?;
        info!(node_id = %self.node_id, "worker stopped");
        Ok(())
    }
}

/// Main loop state: exclusively owns the user population, so every
/// mutation of it is serialized through one task.
struct Dispatch {
    node_id: String,
    transport: Arc<dyn Transport>,
    selector: Arc<WeightedSelector>,
    limiter: Option<Arc<dyn RateLimiter>>,
    recorder: StatsRecorder,
    state_tx: watch::Sender<RunnerState>,
    shutdown: CancellationToken,
    user_count: Arc<AtomicU64>,
    population: Vec<CancellationToken>,
    next_user_id: u64,
    reconcile: Option<Reconcile>,
    failures_tx: mpsc::UnboundedSender<TaskFailure>,
    failures_rx: mpsc::UnboundedReceiver<TaskFailure>,
    event_rx: mpsc::UnboundedReceiver<Event>,
}

impl Dispatch {
    async fn run(&mut self) {
        loop {
            let pacing = self
                .reconcile
                .map(|r| r.next_batch_at)
                .unwrap_or_else(|| tokio::time::Instant::now() + IDLE_PACING);

            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => {
                    self.quit(false).await;
                    break;
                }

                maybe_event = self.event_rx.recv() => match maybe_event {
                    Some(event) => {
                        if self.handle_event(event).await {
                            break;
                        }
                    }
                    None => break,
                },

                Some(failure) = self.failures_rx.recv() => {
                    self.relay_exception(failure).await;
                }

                _ = tokio::time::sleep_until(pacing) => self.spawn_step().await,
            }
        }
    }

    /// Returns `true` when the dispatch loop should exit
    async fn handle_event(&mut self, event: Event) -> bool {
        match event {
            Event::Inbound(message) => self.dispatch_message(message).await,
            Event::ReceiverFailed | Event::HeartbeatLost | Event::MasterSilent => {
                self.enter_missing().await;
                false
            }
            Event::TransportClosed => {
                warn!("transport closed by peer");
                self.quit(false).await;
                true
            }
        }
    }

    async fn dispatch_message(&mut self, message: Message) -> bool {
        match message.kind.as_str() {
            message::SPAWN => {
                self.handle_spawn(&message).await;
                false
            }
            message::STOP => {
                self.handle_stop().await;
                false
            }
            message::QUIT => {
                info!("quit received");
                self.quit(true).await;
                true
            }
            message::ACK => {
                self.handle_ack();
                false
            }
            message::RECONNECT => {
                self.register().await;
                false
            }
            // presence already recorded by the receiver
            message::HEARTBEAT => false,
            other => {
                debug!(kind = other, "ignoring unknown message type");
                false
            }
        }
    }

    async fn handle_spawn(&mut self, message: &Message) {
        let Some((target, rate)) = message.spawn_target() else {
            warn!("spawn without a target population");
            return;
        };
        info!(target, rate, "reconciling user population");
        self.set_state(RunnerState::Spawning);
        if let Some(limiter) = &self.limiter {
            limiter.start();
        }

        let current = self.population.len() as u64;
        if target < current {
            // LIFO teardown, no pacing on the way down
            for cancel in self.population.drain(target as usize..) {
                cancel.cancel();
            }
            self.sync_user_count();
        }
        if target <= current {
            self.finish_reconcile(target).await;
        } else {
            self.reconcile = Some(Reconcile {
                target,
                rate: rate.max(1.0),
                next_batch_at: tokio::time::Instant::now(),
            });
        }
    }

    async fn spawn_step(&mut self) {
        let Some(reconcile) = self.reconcile else {
            return;
        };
        let remaining = reconcile.target.saturating_sub(self.population.len() as u64);
        let batch = (reconcile.rate.ceil() as u64).max(1).min(remaining);
        for _ in 0..batch {
            self.spawn_user();
        }
        debug!(
            spawned = batch,
            current = self.population.len(),
            target = reconcile.target,
            "spawn step"
        );

        if self.population.len() as u64 >= reconcile.target {
            self.finish_reconcile(reconcile.target).await;
        } else {
            self.reconcile = Some(Reconcile {
                next_batch_at: tokio::time::Instant::now() + Duration::from_secs(1),
                ..reconcile
            });
        }
    }

    async fn finish_reconcile(&mut self, target: u64) {
        self.reconcile = None;
        self.send(Message::spawning_complete(&self.node_id, target))
            .await;
        self.set_state(RunnerState::Running);
        info!(user_count = target, "spawning complete");
    }

    async fn handle_stop(&mut self) {
        if *self.state_tx.borrow() == RunnerState::Stopped {
            debug!("already stopped");
            return;
        }
        info!("stopping all users");
        self.reconcile = None;
        self.stop_users();
        if let Some(limiter) = &self.limiter {
            limiter.stop();
        }
        self.send(Message::client_stopped(&self.node_id)).await;
        self.set_state(RunnerState::Stopped);
    }

    async fn quit(&mut self, notify_master: bool) {
        self.reconcile = None;
        self.stop_users();
        if let Some(limiter) = &self.limiter {
            limiter.stop();
        }
        if notify_master {
            self.send(Message::client_stopped(&self.node_id)).await;
        }
        self.set_state(RunnerState::Quitting);
        self.shutdown.cancel();
    }

    async fn enter_missing(&mut self) {
        warn!("master unreachable, entering missing state");
        self.set_state(RunnerState::Missing);
        self.register().await;
    }

    fn handle_ack(&mut self) {
        if *self.state_tx.borrow() == RunnerState::Missing {
            info!("master acknowledged reconnect");
            self.set_state(RunnerState::Ready);
        }
    }

    async fn register(&mut self) {
        self.send(Message::client_ready(&self.node_id)).await;
    }

    async fn relay_exception(&self, failure: TaskFailure) {
        let traceback = format!("task {}: {}", failure.task, failure.detail);
        self.send(Message::exception(&self.node_id, &failure.message, &traceback))
            .await;
    }

    fn spawn_user(&mut self) {
        let cancel = self.shutdown.child_token();
        let worker = UserWorker::new(
            self.next_user_id,
            Arc::clone(&self.selector),
            self.limiter.clone(),
            self.recorder.clone(),
            self.failures_tx.clone(),
        );
        self.next_user_id += 1;
        tokio::spawn(worker.run(cancel.clone()));
        self.population.push(cancel);
        self.sync_user_count();
    }

    fn stop_users(&mut self) {
        for cancel in self.population.drain(..) {
            cancel.cancel();
        }
        self.sync_user_count();
    }

    fn sync_user_count(&self) {
        self.user_count
            .store(self.population.len() as u64, Ordering::SeqCst);
    }

    fn set_state(&self, state: RunnerState) {
        let previous = *self.state_tx.borrow();
        if previous != state {
            info!(from = %previous, to = %state, "state transition");
        }
        self.state_tx.send_replace(state);
    }

    /// Control-plane send: log and carry on, the next cycle supersedes
    async fn send(&self, message: Message) {
        if let Err(error) = self.transport.send(&message).await {
            warn!(kind = %message.kind, error = %error, "send failed");
        }
    }
}

async fn receiver_loop(
    transport: Arc<dyn Transport>,
    event_tx: mpsc::UnboundedSender<Event>,
    last_activity: Arc<Mutex<std::time::Instant>>,
    shutdown: CancellationToken,
) {
    loop {
        if shutdown.is_cancelled() {
            break;
        }
        match transport.recv().await {
            Ok(Recv::Message(message)) => {
                *last_activity.lock().expect("activity lock") = std::time::Instant::now();
                if event_tx.send(Event::Inbound(message)).is_err() {
                    break;
                }
            }
            Ok(Recv::TimedOut) => {}
            Err(error) if error.is_recoverable() => {
                warn!(error = %error, "dropping undecodable message");
            }
            Err(Error::TransportClosed) => {
                let _ = event_tx.send(Event::TransportClosed);
                break;
            }
            Err(error) => {
                warn!(error = %error, "receive failed");
                let _ = event_tx.send(Event::ReceiverFailed);
                break;
            }
        }
    }
    debug!("receiver loop exited");
}

async fn relay_loop(
    transport: Arc<dyn Transport>,
    mut snapshot_rx: mpsc::Receiver<ReportSnapshot>,
    user_count: Arc<AtomicU64>,
    node_id: String,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            maybe_snapshot = snapshot_rx.recv() => match maybe_snapshot {
                None => break,
                Some(snapshot) => {
                    let message = Message::stats(
                        &node_id,
                        snapshot.into_payload(),
                        user_count.load(Ordering::SeqCst),
                    );
                    if let Err(error) = transport.send(&message).await {
                        // counters are cumulative, the next snapshot supersedes
                        warn!(error = %error, "stats snapshot dropped");
                    }
                }
            }
        }
    }
    debug!("stats relay exited");
}

async fn heartbeat_loop(
    transport: Arc<dyn Transport>,
    node_id: String,
    state_rx: watch::Receiver<RunnerState>,
    user_count: Arc<AtomicU64>,
    interval: Duration,
    event_tx: mpsc::UnboundedSender<Event>,
    shutdown: CancellationToken,
) {
    let mut system = sysinfo::System::new();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut consecutive_failures = 0u32;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                system.refresh_cpu_usage();
                let cpu = f64::from(system.global_cpu_usage());
                let state = *state_rx.borrow();
                let message = Message::heartbeat(
                    &node_id,
                    state.as_str(),
                    cpu,
                    user_count.load(Ordering::SeqCst),
                );
                match transport.send(&message).await {
                    Ok(()) => consecutive_failures = 0,
                    Err(error) => {
                        consecutive_failures += 1;
                        warn!(error = %error, consecutive_failures, "heartbeat send failed");
                        if consecutive_failures >= HEARTBEAT_FAILURE_LIMIT {
                            let _ = event_tx.send(Event::HeartbeatLost);
                            consecutive_failures = 0;
                        }
                    }
                }
            }
        }
    }
    debug!("heartbeater exited");
}

async fn liveness_loop(
    last_activity: Arc<Mutex<std::time::Instant>>,
    timeout: Duration,
    event_tx: mpsc::UnboundedSender<Event>,
    shutdown: CancellationToken,
) {
    let check = (timeout / 4).clamp(Duration::from_millis(50), Duration::from_secs(1));
    let mut ticker = tokio::time::interval(check);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let silent = last_activity.lock().expect("activity lock").elapsed();
                if silent >= timeout {
                    if event_tx.send(Event::MasterSilent).is_err() {
                        break;
                    }
                    // restart the window so silence fires once per period
                    *last_activity.lock().expect("activity lock") = std::time::Instant::now();
                }
            }
        }
    }
    debug!("liveness watcher exited");
}
