//! Connection manager with automatic reconnection
//!
//! Owns the single logical broker connection. The owner drives it by calling
//! [`ConnectionManager::pump`]: each pump waits a bounded time for one broker
//! event, and a failure is handled inline by tearing the session down and
//! reconnecting with capped exponential backoff. Running out of reconnect
//! attempts is the only fatal outcome.

use std::time::Duration;

use bytes::Bytes;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, warn};

use super::traits::{BrokerConnector, BrokerSession, SessionEvent};
use crate::config::{BrokerConfig, FlightConfig};
use crate::error::{BrokerError, LinkError};
use crate::queue::PendingQueue;
use crate::queues;
use crate::state_machine::{Backoff, ConnectionState, LinkSignal};

/// Which side of the relay this process is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Publishes commands, consumes vehicle replies
    Producer,
    /// Consumes commands, publishes vehicle replies
    Executor,
}

impl Role {
    /// Queue this role consumes from
    pub fn inbound_queue(&self) -> &'static str {
        match self {
            Role::Producer => queues::RESPONSES,
            Role::Executor => queues::COMMANDS,
        }
    }

    /// Queue this role publishes to
    pub fn outbound_queue(&self) -> &'static str {
        match self {
            Role::Producer => queues::COMMANDS,
            Role::Executor => queues::RESPONSES,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Producer => write!(f, "producer"),
            Role::Executor => write!(f, "executor"),
        }
    }
}

/// Events surfaced to the owner of the connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// The link (re)entered Connected; queued payloads should be drained
    Ready,
    /// A message arrived on the role's inbound queue
    Message { queue: String, payload: Bytes },
}

/// Manages the broker connection, its topology and reconnection
pub struct ConnectionManager<C: BrokerConnector> {
    connector: C,
    endpoint: BrokerConfig,
    role: Role,
    state: ConnectionState,
    backoff: Backoff,
    session: Option<C::Session>,
    /// Failure seen outside a pump (e.g. on publish), handled by the next pump
    deferred_failure: Option<BrokerError>,
    shutdown_requested: bool,
}

impl<C: BrokerConnector> ConnectionManager<C> {
    /// Create a manager. Nothing is opened until `connect` or `pump`.
    pub fn new(connector: C, endpoint: BrokerConfig, flight: &FlightConfig, role: Role) -> Self {
        Self {
            connector,
            endpoint,
            role,
            state: ConnectionState::Disconnected,
            backoff: Backoff::new(flight.max_reconnect_attempts, flight.max_backoff()),
            session: None,
            deferred_failure: None,
            shutdown_requested: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Reconnects attempted since the last successful connect
    pub fn reconnect_attempts(&self) -> u32 {
        self.backoff.attempt()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown_requested
    }

    /// Connect if not already connected.
    ///
    /// A failed first attempt goes through the same backoff path as a dropped
    /// connection, so this only returns an error once the ceiling is reached.
    pub async fn connect(&mut self) -> Result<(), LinkError> {
        if self.is_connected() || self.shutdown_requested {
            return Ok(());
        }

        match self.open().await {
            Ok(()) => Ok(()),
            Err(err) => self.recover(err).await,
        }
    }

    /// Ensure the durable queues exist and start consuming the inbound one
    pub async fn declare_topology(&mut self) -> Result<(), BrokerError> {
        let inbound = self.role.inbound_queue();
        let session = self.session.as_mut().ok_or(BrokerError::NotConnected)?;

        for queue in [queues::COMMANDS, queues::RESPONSES] {
            session.declare_queue(queue).await?;
            debug!("Declared durable queue {}", queue);
        }

        session.consume(inbound).await?;
        info!("Consuming {} as {}", inbound, self.role);
        Ok(())
    }

    /// Publish one persistent message.
    ///
    /// On failure the link is marked down and the next pump reconnects; the
    /// caller keeps the payload. The original error is held for that
    /// reconnect and the caller gets a summary of it.
    pub async fn publish(&mut self, queue: &str, payload: &[u8]) -> Result<(), BrokerError> {
        if !self.is_connected() {
            return Err(BrokerError::NotConnected);
        }
        let session = self.session.as_mut().ok_or(BrokerError::NotConnected)?;

        match session.publish(queue, payload).await {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!("Publish to {} failed: {}", queue, err);
                let summary = BrokerError::Other(err.to_string());
                self.state = self.state.on(LinkSignal::Failed);
                // Kept typed so an exhausted reconnect reports the real cause
                self.deferred_failure = Some(err);
                Err(summary)
            }
        }
    }

    /// Publish queued payloads front to back, stopping at the first failure.
    /// Returns how many were published.
    pub async fn flush(&mut self, pending: &mut PendingQueue, queue: &str) -> usize {
        let mut published = 0;

        while let Some(front) = pending.front() {
            let payload = front.to_string();
            if self.publish(queue, payload.as_bytes()).await.is_err() {
                warn!(
                    "Drain stopped at {:?}; {} message(s) still queued",
                    payload,
                    pending.len()
                );
                break;
            }
            pending.pop_front();
            published += 1;
            debug!("Drained queued message {:?}", payload);
        }

        if published > 0 {
            info!("Drained {} queued message(s) to {}", published, queue);
        }
        published
    }

    /// Advance the link by one bounded step.
    ///
    /// Waits at most `budget` for a broker event. A failure (observed now or
    /// deferred from a publish) is recovered inline and reported as `Ready`
    /// once the link is back.
    pub async fn pump(&mut self, budget: Duration) -> Result<Option<LinkEvent>, LinkError> {
        if self.shutdown_requested {
            sleep(budget).await;
            return Ok(None);
        }

        if let Some(err) = self.deferred_failure.take() {
            self.recover(err).await?;
            return Ok(Some(LinkEvent::Ready));
        }

        if !self.is_connected() {
            self.connect().await?;
            return Ok(Some(LinkEvent::Ready));
        }

        let event = match self.session.as_mut() {
            Some(session) => session.next_event(budget).await,
            None => Some(SessionEvent::Failed(BrokerError::NotConnected)),
        };

        match event {
            Some(SessionEvent::Delivery { queue, payload }) => {
                Ok(Some(LinkEvent::Message { queue, payload }))
            }
            Some(SessionEvent::Failed(err)) => {
                self.recover(err).await?;
                Ok(Some(LinkEvent::Ready))
            }
            None => Ok(None),
        }
    }

    /// Pump until the link is up or `limit` elapses. Returns whether it is up.
    ///
    /// An in-progress reconnect is abandoned at the deadline; the backoff
    /// counter carries over to the next attempt.
    pub async fn wait_for_connection(&mut self, limit: Duration) -> Result<bool, LinkError> {
        let deadline = Instant::now() + limit;
        while !self.is_connected() && !self.shutdown_requested {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match timeout(remaining, self.pump(remaining)).await {
                Ok(result) => {
                    result?;
                }
                Err(_) => break,
            }
        }
        Ok(self.is_connected())
    }

    /// Stop reconnecting and close the connection. Idempotent.
    pub async fn shutdown(&mut self) {
        if self.shutdown_requested {
            return;
        }
        self.shutdown_requested = true;
        self.state = self.state.on(LinkSignal::Shutdown);

        if let Some(mut session) = self.session.take() {
            if let Err(e) = session.close().await {
                warn!("Error closing broker connection: {}", e);
            }
        }

        // Let in-flight broker I/O settle
        tokio::task::yield_now().await;
        info!("Broker link shut down");
    }

    /// Single connect attempt: fresh session, topology, then Connected
    async fn open(&mut self) -> Result<(), BrokerError> {
        self.state = self.state.on(LinkSignal::ConnectRequested);
        info!(
            "Connecting to {} broker at {}",
            self.connector.name(),
            self.endpoint.endpoint()
        );

        match self.establish().await {
            Ok(()) => {
                self.state = self.state.on(LinkSignal::Ready);
                self.backoff.reset();
                info!("Connected to broker as {}", self.role);
                Ok(())
            }
            Err(err) => {
                self.teardown().await;
                Err(err)
            }
        }
    }

    async fn establish(&mut self) -> Result<(), BrokerError> {
        self.session = Some(self.connector.connect(&self.endpoint).await?);
        self.declare_topology().await
    }

    /// Failure handling: tear down, then reconnect with backoff until the
    /// ceiling is hit.
    async fn recover(&mut self, mut last_error: BrokerError) -> Result<(), LinkError> {
        loop {
            if self.shutdown_requested {
                warn!("Broker error after shutdown ignored: {}", last_error);
                return Ok(());
            }

            warn!("Broker link failed: {}", last_error);
            self.teardown().await;

            let Some(delay) = self.backoff.next_delay() else {
                error!(
                    "Giving up on broker after {} reconnect attempts",
                    self.backoff.attempt()
                );
                return Err(LinkError::ReconnectExhausted {
                    attempts: self.backoff.attempt(),
                    source: last_error,
                });
            };

            info!(
                "Reconnecting in {:?} (attempt {})",
                delay,
                self.backoff.attempt()
            );
            sleep(delay).await;

            match self.open().await {
                Ok(()) => return Ok(()),
                Err(err) => last_error = err,
            }
        }
    }

    /// Drop the session; a reconnect always builds a new one
    async fn teardown(&mut self) {
        self.state = self.state.on(LinkSignal::Failed);
        self.deferred_failure = None;
        if let Some(mut session) = self.session.take() {
            if let Err(e) = session.close().await {
                debug!("Error closing failed session: {}", e);
            }
        }
    }
}
