//! Broker connection management
//!
//! This module handles:
//! - The broker seam (`BrokerConnector` / `BrokerSession`) and its AMQP implementation
//! - The connection lifecycle: connect, detect failure, reconnect with backoff
//! - Queue topology and consumption for each role

mod amqp;
mod manager;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
mod traits;

pub use amqp::{AmqpConnector, AmqpSession};
pub use manager::{ConnectionManager, LinkEvent, Role};
pub use traits::{BrokerConnector, BrokerSession, SessionEvent};
