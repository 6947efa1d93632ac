//! Command dispatcher - publishes commands and waits for their responses
//!
//! One command is in flight at a time. Commands issued while the broker link
//! is down are queued and drained in order once it is back; the response wait
//! keeps pumping the link so reconnects and deliveries are serviced while the
//! caller waits.

use std::sync::Arc;
use std::time::Duration;

use tello_shared::broker::{BrokerConnector, ConnectionManager, LinkEvent, Role};
use tello_shared::{
    protocol, queues, validate, BrokerConfig, ConnectionState, FlightConfig, LinkError,
    PendingQueue, ResponseSlot, ValidationError,
};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::outcome::{classify, Outcome, SequenceResult, Verdict};

/// What `publish` did with a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishStatus {
    /// Handed to the broker
    Published,
    /// Held in the pending queue until the link is back
    Queued,
    /// Refused by the validation policy; nothing was sent
    Rejected(ValidationError),
}

/// Bookkeeping for one `execute` call
#[derive(Debug)]
struct CommandRecord {
    command: String,
    retries_left: u32,
    attempts: u32,
    started_at: Instant,
}

impl CommandRecord {
    fn new(command: &str, max_retries: u32) -> Self {
        Self {
            command: command.to_string(),
            retries_left: max_retries.max(1),
            attempts: 0,
            started_at: Instant::now(),
        }
    }
}

/// Result of a single publish-and-wait round
enum Attempt {
    Rejected(ValidationError),
    Response(Option<String>),
}

/// Drives commands through the broker on behalf of the producer
pub struct CommandDispatcher<C: BrokerConnector> {
    link: ConnectionManager<C>,
    config: Arc<FlightConfig>,
    pending: PendingQueue,
    slot: ResponseSlot,
}

impl<C: BrokerConnector> CommandDispatcher<C> {
    pub fn new(connector: C, broker: BrokerConfig, config: Arc<FlightConfig>) -> Self {
        let link = ConnectionManager::new(connector, broker, &config, Role::Producer);
        Self {
            link,
            config,
            pending: PendingQueue::new(),
            slot: ResponseSlot::new(),
        }
    }

    pub fn config(&self) -> Arc<FlightConfig> {
        Arc::clone(&self.config)
    }

    pub fn state(&self) -> ConnectionState {
        self.link.state()
    }

    /// Commands waiting for the link
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Pump until the link is up or `limit` elapses
    pub async fn wait_for_connection(&mut self, limit: Duration) -> Result<bool, LinkError> {
        let connected = self.link.wait_for_connection(limit).await?;
        if connected {
            self.drain_pending().await;
        } else {
            warn!("Broker link not up after {:?}", limit);
        }
        Ok(connected)
    }

    /// Validate and publish a command without waiting for its response
    pub async fn publish(&mut self, command: &str) -> PublishStatus {
        if let Err(err) = validate(command, &self.config) {
            warn!("Rejected {:?}: {}", command, err);
            return PublishStatus::Rejected(err);
        }

        if !self.link.is_connected() {
            self.pending.push(command);
            info!(
                "Link {}; queued {:?} ({} pending)",
                self.link.state(),
                command,
                self.pending.len()
            );
            return PublishStatus::Queued;
        }

        // Older commands go first
        if !self.pending.is_empty() {
            self.pending.push(command);
            self.drain_pending().await;
            return if self.pending.is_empty() {
                PublishStatus::Published
            } else {
                PublishStatus::Queued
            };
        }

        match self.link.publish(queues::COMMANDS, command.as_bytes()).await {
            Ok(()) => {
                debug!("Published {:?}", command);
                PublishStatus::Published
            }
            Err(err) => {
                warn!("Queueing {:?} after publish failure: {}", command, err);
                self.pending.push(command);
                PublishStatus::Queued
            }
        }
    }

    /// Publish queued commands in order, stopping at the first failure
    pub async fn drain_pending(&mut self) -> usize {
        if self.pending.is_empty() || !self.link.is_connected() {
            return 0;
        }
        self.link.flush(&mut self.pending, queues::COMMANDS).await
    }

    /// Service the link for at most `budget`
    pub async fn pump(&mut self, budget: Duration) -> Result<(), LinkError> {
        match self.link.pump(budget).await? {
            Some(LinkEvent::Ready) => {
                self.drain_pending().await;
            }
            Some(LinkEvent::Message { queue, payload }) if queue == queues::RESPONSES => {
                let response = String::from_utf8_lossy(&payload).trim().to_string();
                debug!("Response {:?}", response);
                self.slot.set(response);
            }
            Some(LinkEvent::Message { queue, .. }) => {
                debug!("Ignoring message on {}", queue);
            }
            None => {}
        }
        Ok(())
    }

    /// Keep the link serviced for `duration`
    pub async fn idle(&mut self, duration: Duration) -> Result<(), LinkError> {
        let deadline = Instant::now() + duration;
        let poll = self.config.poll_interval();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(());
            }
            self.pump(remaining.min(poll)).await?;
        }
    }

    /// Run `command` to a terminal outcome.
    ///
    /// `max_retries` is the total number of attempts (at least one). Rejected
    /// and exhausted commands are followed by an emergency land.
    pub async fn execute(
        &mut self,
        command: &str,
        timeout: Duration,
        max_retries: u32,
    ) -> Result<Outcome, LinkError> {
        let mut record = CommandRecord::new(command, max_retries);
        info!("Executing {:?}", record.command);

        loop {
            record.attempts += 1;

            // A retry only republishes once the earlier copy has left the
            // queue; otherwise it keeps waiting on that copy
            let resend = record.attempts == 1 || self.pending.is_empty();
            if !resend {
                info!(
                    "{:?} still queued, waiting again instead of resending",
                    record.command
                );
            }

            let response = match self.attempt(command, timeout, resend).await? {
                Attempt::Rejected(_) => {
                    error!("{:?} failed validation, aborting", record.command);
                    self.emergency_land().await?;
                    return Ok(Outcome::Unrecoverable {
                        response: protocol::REPLY_INVALID_COMMAND.to_string(),
                    });
                }
                Attempt::Response(response) => response,
            };

            match (classify(command, response.as_deref()), response) {
                (Verdict::Success, Some(response)) => {
                    info!(
                        "{:?} -> {:?} after {} attempt(s) in {:?}",
                        record.command,
                        response,
                        record.attempts,
                        record.started_at.elapsed()
                    );
                    return Ok(Outcome::Succeeded { response });
                }
                (Verdict::Unrecoverable, Some(response)) => {
                    error!("{:?} rejected by vehicle: {:?}", record.command, response);
                    self.emergency_land().await?;
                    return Ok(Outcome::Unrecoverable { response });
                }
                (_, last_response) => {
                    record.retries_left -= 1;
                    match &last_response {
                        Some(response) => {
                            warn!("{:?} got unexpected {:?}", record.command, response)
                        }
                        None => warn!("{:?} timed out after {:?}", record.command, timeout),
                    }

                    if record.retries_left == 0 {
                        error!(
                            "{:?} failed after {} attempt(s)",
                            record.command, record.attempts
                        );
                        self.emergency_land().await?;
                        return Ok(Outcome::Exhausted {
                            attempts: record.attempts,
                            last_response,
                        });
                    }

                    info!(
                        "Retrying {:?} ({} attempt(s) left)",
                        record.command, record.retries_left
                    );
                    self.idle(self.config.command_delay()).await?;
                }
            }
        }
    }

    /// Execute `commands` in order, pausing between them, until one fails
    pub async fn run_sequence<S: AsRef<str>>(
        &mut self,
        commands: &[S],
    ) -> Result<SequenceResult, LinkError> {
        for (index, command) in commands.iter().enumerate() {
            let command = command.as_ref();
            if index > 0 {
                self.idle(self.config.command_delay()).await?;
            }

            let timeout = if command.trim() == protocol::TAKEOFF {
                self.config.takeoff_timeout()
            } else {
                self.config.command_timeout()
            };

            let outcome = self
                .execute(command, timeout, self.config.max_command_retries)
                .await?;
            if !outcome.is_success() {
                warn!(
                    "Sequence aborted at {:?}; {} command(s) skipped",
                    command,
                    commands.len() - index - 1
                );
                return Ok(SequenceResult::Aborted {
                    command: command.to_string(),
                    outcome,
                });
            }
        }

        info!("Sequence of {} command(s) completed", commands.len());
        Ok(SequenceResult::Completed {
            executed: commands.len(),
        })
    }

    /// Single land attempt whose result is only logged.
    ///
    /// Unsent commands are dropped first so the land is not queued behind
    /// them.
    pub async fn emergency_land(&mut self) -> Result<(), LinkError> {
        warn!("Issuing emergency land");
        if !self.pending.is_empty() {
            for stale in self.pending.iter() {
                debug!("Dropping unsent {:?}", stale);
            }
            let dropped = self.pending.clear();
            warn!("Dropped {} unsent command(s) ahead of land", dropped);
        }

        match self
            .attempt(protocol::LAND, self.config.command_timeout(), true)
            .await?
        {
            Attempt::Response(Some(response)) => info!("Emergency land -> {:?}", response),
            Attempt::Response(None) => warn!("Emergency land got no response"),
            Attempt::Rejected(err) => warn!("Emergency land rejected: {}", err),
        }
        Ok(())
    }

    pub async fn shutdown(&mut self) {
        if !self.pending.is_empty() {
            warn!("Shutting down with {} unsent command(s)", self.pending.len());
        }
        self.link.shutdown().await;
    }

    /// Publish (when `resend`) and wait up to `timeout` for the correlated
    /// response
    async fn attempt(
        &mut self,
        command: &str,
        timeout: Duration,
        resend: bool,
    ) -> Result<Attempt, LinkError> {
        self.slot.clear();

        if resend {
            if let PublishStatus::Rejected(err) = self.publish(command).await {
                return Ok(Attempt::Rejected(err));
            }
        }

        let deadline = Instant::now() + timeout;
        let poll = self.config.poll_interval();
        while !self.slot.is_received() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            self.pump(remaining.min(poll)).await?;
        }

        Ok(Attempt::Response(self.slot.take()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tello_shared::broker::testing::{MockBroker, MockEvent};

    const LINK_UP: Duration = Duration::from_secs(5);

    fn dispatcher(broker: &MockBroker) -> CommandDispatcher<MockBroker> {
        CommandDispatcher::new(
            broker.clone(),
            BrokerConfig::default(),
            Arc::new(FlightConfig::default()),
        )
    }

    fn reply_ok(broker: &MockBroker) {
        broker.auto_reply(|_| Some("ok".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_preserves_order_across_outage() {
        let broker = MockBroker::new();
        let mut dispatcher = dispatcher(&broker);

        for cmd in ["takeoff", "forward 50", "cw 90"] {
            assert_eq!(dispatcher.publish(cmd).await, PublishStatus::Queued);
        }
        assert_eq!(dispatcher.pending_count(), 3);
        assert!(broker.published(queues::COMMANDS).is_empty());

        assert!(dispatcher.wait_for_connection(LINK_UP).await.unwrap());
        assert_eq!(dispatcher.pending_count(), 0);
        assert_eq!(
            broker.published(queues::COMMANDS),
            vec!["takeoff", "forward 50", "cw 90"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_publish_is_queued_and_drained() {
        let broker = MockBroker::new();
        let mut dispatcher = dispatcher(&broker);
        assert!(dispatcher.wait_for_connection(LINK_UP).await.unwrap());

        broker.fail_publishes(1);
        assert_eq!(dispatcher.publish("forward 50").await, PublishStatus::Queued);
        assert_eq!(dispatcher.publish("cw 90").await, PublishStatus::Queued);
        assert_eq!(dispatcher.state(), ConnectionState::Disconnected);

        dispatcher.pump(Duration::from_millis(100)).await.unwrap();

        assert_eq!(dispatcher.state(), ConnectionState::Connected);
        assert_eq!(broker.published(queues::COMMANDS), vec!["forward 50", "cw 90"]);
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_rejects_out_of_bounds() {
        let broker = MockBroker::new();
        let mut dispatcher = dispatcher(&broker);
        assert!(dispatcher.wait_for_connection(LINK_UP).await.unwrap());

        let status = dispatcher.publish("forward 501").await;
        assert!(matches!(status, PublishStatus::Rejected(_)));
        assert!(broker.published(queues::COMMANDS).is_empty());
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_success() {
        let broker = MockBroker::new();
        reply_ok(&broker);
        let mut dispatcher = dispatcher(&broker);
        assert!(dispatcher.wait_for_connection(LINK_UP).await.unwrap());

        let outcome = dispatcher
            .execute("forward 50", Duration::from_secs(7), 3)
            .await
            .unwrap();

        assert_eq!(
            outcome,
            Outcome::Succeeded {
                response: "ok".into()
            }
        );
        assert_eq!(broker.published(queues::COMMANDS), vec!["forward 50"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_land_error_counts_as_success() {
        let broker = MockBroker::new();
        broker.auto_reply(|_| Some("error".to_string()));
        let mut dispatcher = dispatcher(&broker);
        assert!(dispatcher.wait_for_connection(LINK_UP).await.unwrap());

        let outcome = dispatcher
            .execute("land", Duration::from_secs(7), 3)
            .await
            .unwrap();

        assert!(outcome.is_success());
        assert_eq!(broker.published(queues::COMMANDS), vec!["land"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_range_lands_without_retry() {
        let broker = MockBroker::new();
        broker.auto_reply(|cmd| {
            Some(if cmd == "land" { "ok" } else { "out of range" }.to_string())
        });
        let mut dispatcher = dispatcher(&broker);
        assert!(dispatcher.wait_for_connection(LINK_UP).await.unwrap());

        let outcome = dispatcher
            .execute("forward 50", Duration::from_secs(7), 3)
            .await
            .unwrap();

        assert_eq!(
            outcome,
            Outcome::Unrecoverable {
                response: "out of range".into()
            }
        );
        assert_eq!(broker.published(queues::COMMANDS), vec!["forward 50", "land"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted_then_land() {
        let broker = MockBroker::new();
        broker.auto_reply(|cmd| (cmd == "land").then(|| "ok".to_string()));
        let mut dispatcher = dispatcher(&broker);
        assert!(dispatcher.wait_for_connection(LINK_UP).await.unwrap());

        let started = Instant::now();
        let outcome = dispatcher
            .execute("forward 50", Duration::from_secs(7), 3)
            .await
            .unwrap();

        assert_eq!(
            outcome,
            Outcome::Exhausted {
                attempts: 3,
                last_response: None
            }
        );
        assert_eq!(
            broker.published(queues::COMMANDS),
            vec!["forward 50", "forward 50", "forward 50", "land"]
        );
        // Three 7 s waits with a 2 s pause between attempts
        assert!(started.elapsed() >= Duration::from_secs(23));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsent_retries_are_not_duplicated() {
        let broker = MockBroker::new();
        reply_ok(&broker);
        let mut dispatcher = dispatcher(&broker);
        assert!(dispatcher.wait_for_connection(LINK_UP).await.unwrap());

        // Every publish fails while the command is being retried
        broker.fail_publishes(u32::MAX);
        let outcome = dispatcher
            .execute("forward 50", Duration::from_secs(7), 3)
            .await
            .unwrap();
        assert!(matches!(outcome, Outcome::Exhausted { attempts: 3, .. }));
        // Only the land is left waiting
        assert_eq!(dispatcher.pending_count(), 1);

        broker.fail_publishes(0);
        dispatcher.idle(Duration::from_secs(5)).await.unwrap();

        assert_eq!(dispatcher.pending_count(), 0);
        assert_eq!(broker.published(queues::COMMANDS), vec!["land"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_emergency_land_jumps_the_queue() {
        let broker = MockBroker::new();
        reply_ok(&broker);
        let mut dispatcher = dispatcher(&broker);

        for cmd in ["forward 50", "cw 90"] {
            dispatcher.publish(cmd).await;
        }
        assert_eq!(dispatcher.pending_count(), 2);

        dispatcher.emergency_land().await.unwrap();

        assert_eq!(broker.published(queues::COMMANDS), vec!["land"]);
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_then_success() {
        let broker = MockBroker::new();
        let mut calls = 0;
        broker.auto_reply(move |_| {
            calls += 1;
            (calls > 1).then(|| "ok".to_string())
        });
        let mut dispatcher = dispatcher(&broker);
        assert!(dispatcher.wait_for_connection(LINK_UP).await.unwrap());

        let outcome = dispatcher
            .execute("cw 90", Duration::from_secs(7), 3)
            .await
            .unwrap();

        assert!(outcome.is_success());
        assert_eq!(broker.published(queues::COMMANDS), vec!["cw 90", "cw 90"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unexpected_reply_is_retried() {
        let broker = MockBroker::new();
        let mut calls = 0;
        broker.auto_reply(move |_| {
            calls += 1;
            Some(if calls == 1 { "error" } else { "ok" }.to_string())
        });
        let mut dispatcher = dispatcher(&broker);
        assert!(dispatcher.wait_for_connection(LINK_UP).await.unwrap());

        let outcome = dispatcher
            .execute("takeoff", Duration::from_secs(20), 3)
            .await
            .unwrap();

        assert!(outcome.is_success());
        assert_eq!(broker.published(queues::COMMANDS), vec!["takeoff", "takeoff"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_command_never_reaches_broker() {
        let broker = MockBroker::new();
        reply_ok(&broker);
        let mut dispatcher = dispatcher(&broker);
        assert!(dispatcher.wait_for_connection(LINK_UP).await.unwrap());

        let outcome = dispatcher
            .execute("forward 19", Duration::from_secs(7), 3)
            .await
            .unwrap();

        assert_eq!(
            outcome,
            Outcome::Unrecoverable {
                response: "invalid command".into()
            }
        );
        assert_eq!(broker.published(queues::COMMANDS), vec!["land"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_value_is_success() {
        let broker = MockBroker::new();
        broker.auto_reply(|_| Some("87\r\n".to_string()));
        let mut dispatcher = dispatcher(&broker);
        assert!(dispatcher.wait_for_connection(LINK_UP).await.unwrap());

        let outcome = dispatcher
            .execute("battery?", Duration::from_secs(7), 3)
            .await
            .unwrap();

        assert_eq!(outcome.response(), Some("87"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_command_in_flight() {
        let broker = MockBroker::new();
        reply_ok(&broker);
        broker.reply_delay(Duration::from_secs(3));
        let mut dispatcher = dispatcher(&broker);
        assert!(dispatcher.wait_for_connection(LINK_UP).await.unwrap());

        let result = dispatcher
            .run_sequence(&["takeoff", "forward 50", "cw 90", "land"])
            .await
            .unwrap();
        assert_eq!(result, SequenceResult::Completed { executed: 4 });

        // Every publish is answered before the next one goes out
        let log = broker.log();
        assert_eq!(log.len(), 8);
        for pair in log.chunks(2) {
            assert!(matches!(pair[0], MockEvent::Published { .. }));
            assert!(matches!(pair[1], MockEvent::Delivered { .. }));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequence_stops_at_first_failure() {
        let broker = MockBroker::new();
        broker.auto_reply(|cmd| {
            Some(if cmd == "cw 90" { "out of range" } else { "ok" }.to_string())
        });
        let mut dispatcher = dispatcher(&broker);
        assert!(dispatcher.wait_for_connection(LINK_UP).await.unwrap());

        let result = dispatcher
            .run_sequence(&["forward 50", "cw 90", "forward 50", "land"])
            .await
            .unwrap();

        assert!(matches!(
            result,
            SequenceResult::Aborted { ref command, .. } if command == "cw 90"
        ));
        assert_eq!(
            broker.published(queues::COMMANDS),
            vec!["forward 50", "cw 90", "land"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_rides_out_reconnect() {
        let broker = MockBroker::new();
        reply_ok(&broker);
        let mut dispatcher = dispatcher(&broker);
        assert!(dispatcher.wait_for_connection(LINK_UP).await.unwrap());

        // Publish fails, the command is queued and goes out after reconnect
        broker.fail_publishes(1);
        let outcome = dispatcher
            .execute("up 30", Duration::from_secs(7), 3)
            .await
            .unwrap();

        assert!(outcome.is_success());
        assert_eq!(broker.published(queues::COMMANDS), vec!["up 30"]);
        assert_eq!(broker.connect_attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_connection_drains() {
        let broker = MockBroker::new();
        broker.fail_connects(1);
        let mut dispatcher = dispatcher(&broker);

        dispatcher.publish("takeoff").await;
        assert!(dispatcher.wait_for_connection(LINK_UP).await.unwrap());
        assert_eq!(broker.published(queues::COMMANDS), vec!["takeoff"]);
    }
}
