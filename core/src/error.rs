//! Error types for loadswarm-core

use thiserror::Error;

/// Core error type
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid configuration, fatal at startup
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// A single send/recv failure that is expected to recover
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// The transport was closed, either by us or by the peer
    #[error("transport closed")]
    TransportClosed,

    /// An inbound frame that could not be decoded into a message
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl Error {
    /// Whether the receive loop may keep running after this error.
    ///
    /// Decode failures drop a single message; everything else tears the
    /// connection down.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::Protocol(_))
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
