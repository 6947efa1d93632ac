//! Command execution for the vehicle side
//!
//! This module handles:
//! - Receiving commands from the broker
//! - Forwarding each one to the vehicle and waiting for its reply
//! - Publishing the reply back, queuing it while the broker is down

mod executor;

pub use executor::CommandRelay;
