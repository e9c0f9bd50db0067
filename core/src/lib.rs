//! Worker runtime for the loadswarm distributed load generator
//!
//! A central master coordinates many workers; each worker process embeds
//! this crate, registers its [`Task`] implementations, and hands control
//! to the [`Runner`]. The master then drives the worker through the
//! control protocol: spawning and rescaling simulated users, receiving
//! periodic stats snapshots and heartbeats, and eventually stopping or
//! quitting the worker.
//!
//! The crate provides:
//!
//! - the [`Runner`] state machine and spawn controller
//! - the [`stats`] aggregation pipeline fed by any number of users
//! - aggregate [`ratelimit`] shaping (stable and ramp-up token buckets)
//! - weighted [`task`] selection
//! - the serialized master [`transport`] with bounded receives
//!
//! ```ignore
//! use loadswarm_core::{Runner, WorkerConfig};
//!
//! let mut runner = Runner::new(WorkerConfig::new("master.local", 5557))?;
//! let recorder = runner.recorder();
//! runner.register(Arc::new(MyTask::new(recorder)));
//! runner.run().await?;
//! ```
//!
//! [`Task`]: task::Task

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod message;
pub mod ratelimit;
pub mod runner;
pub mod stats;
pub mod task;
pub mod transport;
pub mod user;

pub use config::{RateLimitConfig, WorkerConfig};
pub use error::{Error, Result};
pub use message::Message;
pub use runner::{Runner, RunnerState};
pub use stats::StatsRecorder;
pub use task::Task;
