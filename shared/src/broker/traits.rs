//! Broker trait abstraction for pluggable message brokers

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::config::BrokerConfig;
use crate::error::BrokerError;

/// Something that happened on an open session
#[derive(Debug)]
pub enum SessionEvent {
    /// A message arrived on a consumed queue
    Delivery { queue: String, payload: Bytes },
    /// The connection or a consumer failed
    Failed(BrokerError),
}

/// One open connection plus its channel
#[async_trait]
pub trait BrokerSession: Send {
    /// Declare a durable queue. Idempotent.
    async fn declare_queue(&mut self, queue: &str) -> Result<(), BrokerError>;

    /// Start consuming `queue` without manual acknowledgment
    async fn consume(&mut self, queue: &str) -> Result<(), BrokerError>;

    /// Publish a persistent message to `queue` through the default exchange
    async fn publish(&mut self, queue: &str, payload: &[u8]) -> Result<(), BrokerError>;

    /// Wait at most `budget` for the next event
    async fn next_event(&mut self, budget: Duration) -> Option<SessionEvent>;

    /// Close the connection
    async fn close(&mut self) -> Result<(), BrokerError>;
}

/// Factory for broker sessions
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    /// The session type this connector produces
    type Session: BrokerSession;

    /// Open a fresh connection and channel
    async fn connect(&self, endpoint: &BrokerConfig) -> Result<Self::Session, BrokerError>;

    /// Human-readable name for this broker
    fn name(&self) -> &'static str;
}
