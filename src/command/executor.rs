//! Command relay - forwards broker commands to the vehicle

use std::time::Duration;

use tello_shared::broker::{BrokerConnector, ConnectionManager, LinkEvent};
use tello_shared::{queues, LinkError, PendingQueue};
use tracing::{debug, info, warn};

use crate::transport::Vehicle;

/// Relays commands from `tello_commands` to the vehicle and replies to
/// `tello_responses`
pub struct CommandRelay<C: BrokerConnector, V: Vehicle> {
    link: ConnectionManager<C>,
    vehicle: V,
    /// Replies that could not be published yet
    outbox: PendingQueue,
    poll_interval: Duration,
}

impl<C: BrokerConnector, V: Vehicle> CommandRelay<C, V> {
    pub fn new(link: ConnectionManager<C>, vehicle: V, poll_interval: Duration) -> Self {
        Self {
            link,
            vehicle,
            outbox: PendingQueue::new(),
            poll_interval,
        }
    }

    /// Replies waiting for the broker
    pub fn queued_replies(&self) -> usize {
        self.outbox.len()
    }

    /// Relay until shut down or the broker link is lost for good
    pub async fn run(&mut self) -> Result<(), LinkError> {
        self.link.connect().await?;
        info!("Relay started, waiting for commands");

        while !self.link.is_shutdown() {
            self.step().await?;
        }
        Ok(())
    }

    /// Service the link once; a delivered command is relayed to completion
    pub async fn step(&mut self) -> Result<(), LinkError> {
        match self.link.pump(self.poll_interval).await? {
            Some(LinkEvent::Ready) => {
                self.link.flush(&mut self.outbox, queues::RESPONSES).await;
            }
            Some(LinkEvent::Message { queue, payload }) if queue == queues::COMMANDS => {
                let command = String::from_utf8_lossy(&payload).trim().to_string();
                self.handle_command(&command).await;
            }
            Some(LinkEvent::Message { queue, .. }) => {
                debug!("Ignoring message on {}", queue);
            }
            None => {}
        }
        Ok(())
    }

    async fn handle_command(&mut self, command: &str) {
        if command.is_empty() {
            warn!("Ignoring empty command");
            return;
        }

        info!("Received command {:?}", command);
        match self.vehicle.send_command(command).await {
            Some(response) => {
                info!("{:?} -> {:?}", command, response);
                self.publish_response(&response).await;
            }
            // The producer times out and retries
            None => warn!("Vehicle did not answer {:?}", command),
        }
    }

    async fn publish_response(&mut self, response: &str) {
        if !self.link.is_connected() || !self.outbox.is_empty() {
            self.outbox.push(response);
            debug!("Reply {:?} queued ({} waiting)", response, self.outbox.len());
            if self.link.is_connected() {
                self.link.flush(&mut self.outbox, queues::RESPONSES).await;
            }
            return;
        }

        if let Err(e) = self.link.publish(queues::RESPONSES, response.as_bytes()).await {
            warn!("Queueing reply {:?}: {}", response, e);
            self.outbox.push(response);
        }
    }

    pub async fn shutdown(&mut self) {
        if !self.outbox.is_empty() {
            warn!("Dropping {} unpublished reply(s)", self.outbox.len());
        }
        self.link.shutdown().await;
    }
}
