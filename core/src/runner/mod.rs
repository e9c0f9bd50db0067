//! Worker-side controller
//!
//! The Runner is the heart of the worker runtime: it owns the master
//! transport and the user population, applies the master's lifecycle
//! commands (`spawn`, `stop`, `quit`, `reconnect`), relays stats
//! snapshots and heartbeats, and watches the master's own liveness.
//!
//! Four long-lived control loops run alongside the dispatch loop:
//!
//! 1. **Receiver**: bounded-timeout reads from the transport
//! 2. **Stats relay**: forwards each [`ReportSnapshot`] as a `stats`
//!    message with the live user count piggybacked
//! 3. **Heartbeater**: `heartbeat{state, current_cpu_usage, count}`
//!    every heartbeat interval
//! 4. **Liveness watcher**: flags the master as missing after prolonged
//!    silence
//!
//! All four live on the shared tokio runtime; the transport's bounded
//! receive keeps any of them from pinning the socket.
//!
//! [`ReportSnapshot`]: crate::stats::ReportSnapshot

mod executor;
mod state;

pub use executor::Runner;
pub use state::RunnerState;
