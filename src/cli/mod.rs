//! CLI argument parsing

use std::time::Duration;

use clap::Parser;

use loadswarm_core::{RateLimitConfig, WorkerConfig};

/// Worker process for distributed load generation
#[derive(Parser)]
#[command(name = "loadswarm")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Master hostname or address
    #[arg(long, default_value = "127.0.0.1")]
    pub master_host: String,

    /// Master port
    #[arg(long, default_value_t = 5557)]
    pub master_port: u16,

    /// Cap aggregate throughput at this many requests per second
    #[arg(long)]
    pub max_rps: Option<u64>,

    /// Ramp throughput up by this many requests per second each second,
    /// until --max-rps is reached (requires --max-rps)
    #[arg(long, requires = "max_rps")]
    pub ramp_up_step: Option<u64>,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    /// Default log level for the subscriber
    pub fn log_level(&self) -> tracing::Level {
        if self.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }

    /// Build the worker configuration from the parsed arguments
    pub fn worker_config(&self) -> WorkerConfig {
        let config = WorkerConfig::new(self.master_host.clone(), self.master_port);
        match (self.max_rps, self.ramp_up_step) {
            (Some(max_rps), Some(step)) => config.with_rate_limit(RateLimitConfig::RampUp {
                max_threshold: max_rps,
                ramp_up_step: step,
                ramp_up_period: Duration::from_secs(1),
                refill_period: Duration::from_secs(1),
            }),
            (Some(max_rps), None) => config.with_max_rps(max_rps),
            _ => config,
        }
    }
}
