//! AMQP 0-9-1 broker session backed by `lapin`

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, SelectAll};
use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{BasicConsumeOptions, BasicPublishOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::debug;

use super::traits::{BrokerConnector, BrokerSession, SessionEvent};
use crate::config::BrokerConfig;
use crate::error::BrokerError;

/// Persistent delivery mode
const DELIVERY_MODE_PERSISTENT: u8 = 2;

type TaggedDeliveries = BoxStream<'static, (String, Result<Delivery, lapin::Error>)>;

/// Connects to an AMQP broker such as RabbitMQ
#[derive(Debug, Clone, Copy, Default)]
pub struct AmqpConnector;

#[async_trait]
impl BrokerConnector for AmqpConnector {
    type Session = AmqpSession;

    async fn connect(&self, endpoint: &BrokerConfig) -> Result<AmqpSession, BrokerError> {
        let connection = Connection::connect(&endpoint.uri(), ConnectionProperties::default()).await?;

        // The connection error callback runs on lapin's own I/O driver; forward
        // it so the lifecycle manager sees it on its next pump.
        let (error_tx, error_rx) = mpsc::unbounded_channel();
        connection.on_error(move |err| {
            let _ = error_tx.send(err);
        });

        let channel = connection.create_channel().await?;
        debug!("AMQP channel {} open on {}", channel.id(), endpoint.endpoint());

        Ok(AmqpSession {
            connection,
            channel,
            deliveries: SelectAll::new(),
            errors: error_rx,
        })
    }

    fn name(&self) -> &'static str {
        "AMQP"
    }
}

/// An open AMQP connection with a single channel
pub struct AmqpSession {
    connection: Connection,
    channel: Channel,
    deliveries: SelectAll<TaggedDeliveries>,
    errors: mpsc::UnboundedReceiver<lapin::Error>,
}

#[async_trait]
impl BrokerSession for AmqpSession {
    async fn declare_queue(&mut self, queue: &str) -> Result<(), BrokerError> {
        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn consume(&mut self, queue: &str) -> Result<(), BrokerError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                &format!("{queue}-consumer"),
                BasicConsumeOptions {
                    no_ack: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        let name = queue.to_string();
        self.deliveries
            .push(consumer.map(move |item| (name.clone(), item)).boxed());
        Ok(())
    }

    async fn publish(&mut self, queue: &str, payload: &[u8]) -> Result<(), BrokerError> {
        self.channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default().with_delivery_mode(DELIVERY_MODE_PERSISTENT),
            )
            .await?
            .await?;
        Ok(())
    }

    async fn next_event(&mut self, budget: Duration) -> Option<SessionEvent> {
        let deliveries = &mut self.deliveries;
        let errors = &mut self.errors;

        let wait = async {
            tokio::select! {
                Some(err) = errors.recv() => Some(SessionEvent::Failed(err.into())),
                item = deliveries.next(), if !deliveries.is_empty() => match item {
                    Some((queue, Ok(delivery))) => Some(SessionEvent::Delivery {
                        queue,
                        payload: Bytes::from(delivery.data),
                    }),
                    Some((_, Err(err))) => Some(SessionEvent::Failed(err.into())),
                    // Every consumer stream ended: the channel is gone
                    None => Some(SessionEvent::Failed(BrokerError::Closed)),
                },
                else => {
                    tokio::time::sleep(budget).await;
                    None
                }
            }
        };

        timeout(budget, wait).await.ok().flatten()
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        if self.connection.status().connected() {
            self.connection.close(200, "shutdown").await?;
        }
        Ok(())
    }
}
