//! Tello Relay Shared Primitives
//!
//! This crate provides the pieces shared by the command producer and the
//! command executor: configuration, the plain-text command protocol, the
//! validation policy, and the broker connection lifecycle.

pub mod broker;
pub mod codec;
pub mod config;
pub mod error;
pub mod queue;
pub mod slot;
pub mod state_machine;
pub mod validation;

pub use broker::{
    AmqpConnector, BrokerConnector, BrokerSession, ConnectionManager, LinkEvent, Role,
    SessionEvent,
};
pub use codec::{CommandLine, Reply};
pub use config::{AppConfig, BrokerConfig, DroneConfig, FlightConfig};
pub use error::{BrokerError, ConfigError, LinkError};
pub use queue::PendingQueue;
pub use slot::ResponseSlot;
pub use state_machine::{Backoff, ConnectionState};
pub use validation::{validate, ValidationError};

/// Broker queue names
pub mod queues {
    /// Commands travelling from the producer to the executor
    pub const COMMANDS: &str = "tello_commands";

    /// Vehicle replies travelling from the executor back to the producer
    pub const RESPONSES: &str = "tello_responses";
}

/// Well-known vehicle commands and replies
pub mod protocol {
    /// SDK handshake; must succeed before anything else is accepted
    pub const HANDSHAKE: &str = "command";
    pub const TAKEOFF: &str = "takeoff";
    pub const LAND: &str = "land";
    pub const BATTERY_QUERY: &str = "battery?";
    pub const HEIGHT_QUERY: &str = "height?";

    pub const REPLY_OK: &str = "ok";
    pub const REPLY_ERROR: &str = "error";
    pub const REPLY_OUT_OF_RANGE: &str = "out of range";
    pub const REPLY_INVALID_COMMAND: &str = "invalid command";
}

/// Install the `tracing` subscriber used by both binaries.
///
/// `RUST_LOG` wins over `level`; `level` wins over the `info` default.
pub fn init_logging(level: Option<&str>) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let default = level.unwrap_or("info");
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let _ = tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .try_init();
}
