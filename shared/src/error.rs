//! Error types shared by both roles

use thiserror::Error;

/// Transport-level broker failures. Always recoverable by reconnecting.
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),

    #[error("Broker connection closed")]
    Closed,

    #[error("Not connected to broker")]
    NotConnected,

    #[error("Broker error: {0}")]
    Other(String),
}

/// Conditions the connection lifecycle cannot recover from.
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("Broker reconnect gave up after {attempts} attempts: {source}")]
    ReconnectExhausted {
        attempts: u32,
        #[source]
        source: BrokerError,
    },
}

/// Errors raised while loading or checking configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
