//! Worker configuration types

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How long a blocking `recv` on the master socket may run before it
/// releases the socket lock and reports a timeout.
pub const RECV_TIMEOUT: Duration = Duration::from_millis(300);

/// Cadence of outbound heartbeats to the master.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(1000);

/// Cadence of stats report snapshots.
pub const REPORT_INTERVAL: Duration = Duration::from_millis(3000);

/// How long the master may stay silent before the worker considers it
/// missing and tries to reconnect.
pub const MASTER_MISSING_TIMEOUT: Duration = Duration::from_millis(60_000);

/// Worker configuration
///
/// Defines how a worker connects to its master and how aggregate request
/// throughput is shaped. The target user population is never configured
/// here; the master drives it at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Master hostname or address
    pub master_host: String,

    /// Master port
    pub master_port: u16,

    /// Aggregate throughput shaping across all simulated users
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Bounded blocking window for socket receives
    #[serde(default = "default_recv_timeout", with = "duration_millis")]
    pub recv_timeout: Duration,

    /// Outbound heartbeat cadence
    #[serde(default = "default_heartbeat_interval", with = "duration_millis")]
    pub heartbeat_interval: Duration,

    /// Stats snapshot cadence
    #[serde(default = "default_report_interval", with = "duration_millis")]
    pub report_interval: Duration,

    /// Master silence tolerated before entering the missing state
    #[serde(default = "default_master_missing", with = "duration_millis")]
    pub master_missing_timeout: Duration,
}

/// Aggregate rate limiting configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum RateLimitConfig {
    /// No throughput shaping
    #[default]
    None,

    /// Token bucket refilled to `max_threshold` every `period`
    Stable {
        /// Bucket capacity, permits per refill
        max_threshold: u64,
        /// Refill period
        #[serde(with = "duration_millis")]
        period: Duration,
    },

    /// Token bucket whose capacity grows by `ramp_up_step` every
    /// `ramp_up_period` until it reaches `max_threshold`
    RampUp {
        /// Final bucket capacity
        max_threshold: u64,
        /// Capacity growth per ramp-up period
        ramp_up_step: u64,
        /// Cadence of capacity growth
        #[serde(with = "duration_millis")]
        ramp_up_period: Duration,
        /// Cadence of bucket refills
        #[serde(with = "duration_millis")]
        refill_period: Duration,
    },
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            master_host: "127.0.0.1".to_string(),
            master_port: 5557,
            rate_limit: RateLimitConfig::None,
            recv_timeout: RECV_TIMEOUT,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            report_interval: REPORT_INTERVAL,
            master_missing_timeout: MASTER_MISSING_TIMEOUT,
        }
    }
}

impl WorkerConfig {
    /// Create a new config for the given master endpoint
    pub fn new(master_host: impl Into<String>, master_port: u16) -> Self {
        Self {
            master_host: master_host.into(),
            master_port,
            ..Default::default()
        }
    }

    /// Cap aggregate throughput at `rps` requests per second
    ///
    /// Shorthand for a stable limiter with a one-second refill period.
    pub fn with_max_rps(mut self, rps: u64) -> Self {
        self.rate_limit = RateLimitConfig::Stable {
            max_threshold: rps,
            period: Duration::from_secs(1),
        };
        self
    }

    /// Set the rate limiting configuration
    pub fn with_rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    /// Set the master silence tolerance
    pub fn with_master_missing_timeout(mut self, timeout: Duration) -> Self {
        self.master_missing_timeout = timeout;
        self
    }

    /// Validate the configuration
    ///
    /// Invalid options are fatal: the worker refuses to start.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.master_host.is_empty() {
            return Err(ConfigError::InvalidMaster(
                "master host must not be empty".into(),
            ));
        }
        if self.master_port == 0 {
            return Err(ConfigError::InvalidMaster("master port must not be 0".into()));
        }
        if self.recv_timeout.is_zero()
            || self.heartbeat_interval.is_zero()
            || self.report_interval.is_zero()
            || self.master_missing_timeout.is_zero()
        {
            return Err(ConfigError::InvalidTiming(
                "timing intervals must be positive".into(),
            ));
        }
        self.rate_limit.validate()
    }
}

impl RateLimitConfig {
    /// Validate the rate limiting options
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            RateLimitConfig::None => Ok(()),
            RateLimitConfig::Stable {
                max_threshold,
                period,
            } => {
                if *max_threshold == 0 {
                    return Err(ConfigError::InvalidRateLimit(
                        "max_threshold must be at least 1".into(),
                    ));
                }
                if period.is_zero() {
                    return Err(ConfigError::InvalidRateLimit(
                        "period must be positive".into(),
                    ));
                }
                Ok(())
            }
            RateLimitConfig::RampUp {
                max_threshold,
                ramp_up_step,
                ramp_up_period,
                refill_period,
            } => {
                if *max_threshold == 0 || *ramp_up_step == 0 {
                    return Err(ConfigError::InvalidRateLimit(
                        "max_threshold and ramp_up_step must be at least 1".into(),
                    ));
                }
                if ramp_up_period.is_zero() || refill_period.is_zero() {
                    return Err(ConfigError::InvalidRateLimit(
                        "ramp-up and refill periods must be positive".into(),
                    ));
                }
                Ok(())
            }
        }
    }
}

/// Configuration validation errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Invalid master endpoint
    #[error("invalid master endpoint: {0}")]
    InvalidMaster(String),

    /// Invalid rate limiting options
    #[error("invalid rate limit: {0}")]
    InvalidRateLimit(String),

    /// Invalid protocol timing options
    #[error("invalid timing: {0}")]
    InvalidTiming(String),

    /// The runner was started without any registered tasks
    #[error("no tasks registered")]
    NoTasks,
}

fn default_recv_timeout() -> Duration {
    RECV_TIMEOUT
}

fn default_heartbeat_interval() -> Duration {
    HEARTBEAT_INTERVAL
}

fn default_report_interval() -> Duration {
    REPORT_INTERVAL
}

fn default_master_missing() -> Duration {
    MASTER_MISSING_TIMEOUT
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
