//! In-memory broker for tests
//!
//! Scriptable stand-in for an AMQP server: connect and publish failures,
//! injected connection errors, queued deliveries and an auto-responder that
//! answers published commands after an optional delay. Every publish and
//! delivery is recorded in order.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::{sleep, Instant};

use super::traits::{BrokerConnector, BrokerSession, SessionEvent};
use crate::config::BrokerConfig;
use crate::error::BrokerError;
use crate::queues;

type Responder = Box<dyn FnMut(&str) -> Option<String> + Send>;

/// Ordered record of broker traffic
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockEvent {
    Published { queue: String, payload: String },
    Delivered { queue: String, payload: String },
}

struct Inbound {
    queue: String,
    payload: String,
    ready_at: Instant,
}

#[derive(Default)]
struct MockState {
    connect_attempts: u32,
    failing_connects: u32,
    failing_publishes: u32,
    publish_fail_countdown: Option<u32>,
    injected_failure: Option<String>,
    declared: Vec<String>,
    consumed: Vec<String>,
    inbound: VecDeque<Inbound>,
    log: Vec<MockEvent>,
    responder: Option<Responder>,
    reply_delay: Duration,
    closed_sessions: u32,
}

/// Shared handle to the in-memory broker; clones see the same state
#[derive(Clone, Default)]
pub struct MockBroker {
    state: Arc<Mutex<MockState>>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fail the next `count` connection attempts
    pub fn fail_connects(&self, count: u32) {
        self.lock().failing_connects = count;
    }

    /// Fail the next `count` publishes
    pub fn fail_publishes(&self, count: u32) {
        self.lock().failing_publishes = count;
    }

    /// Let `successes` publishes through, then fail one
    pub fn fail_publish_at(&self, successes: u32) {
        self.lock().publish_fail_countdown = Some(successes);
    }

    /// Make the next `next_event` on an open session report a failure
    pub fn inject_failure(&self, reason: &str) {
        self.lock().injected_failure = Some(reason.to_string());
    }

    /// Queue a message for consumers of `queue`
    pub fn deliver(&self, queue: &str, payload: &str) {
        self.lock().inbound.push_back(Inbound {
            queue: queue.to_string(),
            payload: payload.to_string(),
            ready_at: Instant::now(),
        });
    }

    /// Answer every command published to `tello_commands` with the reply
    /// returned by `responder` (no reply for `None`)
    pub fn auto_reply(&self, responder: impl FnMut(&str) -> Option<String> + Send + 'static) {
        self.lock().responder = Some(Box::new(responder));
    }

    /// Delay between a command publish and its auto-reply
    pub fn reply_delay(&self, delay: Duration) {
        self.lock().reply_delay = delay;
    }

    pub fn connect_attempts(&self) -> u32 {
        self.lock().connect_attempts
    }

    pub fn declared(&self) -> Vec<String> {
        self.lock().declared.clone()
    }

    pub fn consumed(&self) -> Vec<String> {
        self.lock().consumed.clone()
    }

    pub fn closed_sessions(&self) -> u32 {
        self.lock().closed_sessions
    }

    /// Payloads successfully published to `queue`, in order
    pub fn published(&self, queue: &str) -> Vec<String> {
        self.lock()
            .log
            .iter()
            .filter_map(|event| match event {
                MockEvent::Published { queue: q, payload } if q == queue => Some(payload.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn log(&self) -> Vec<MockEvent> {
        self.lock().log.clone()
    }
}

#[async_trait]
impl BrokerConnector for MockBroker {
    type Session = MockSession;

    async fn connect(&self, _endpoint: &BrokerConfig) -> Result<MockSession, BrokerError> {
        let mut state = self.lock();
        state.connect_attempts += 1;
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(BrokerError::Other("connection refused".into()));
        }
        Ok(MockSession {
            broker: self.clone(),
            consuming: Vec::new(),
            closed: false,
        })
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

/// Session on the in-memory broker
pub struct MockSession {
    broker: MockBroker,
    consuming: Vec<String>,
    closed: bool,
}

impl MockSession {
    /// Take the first ready delivery for this session, or report when the
    /// next one becomes ready
    fn poll_inbound(&self) -> Result<Option<SessionEvent>, Option<Instant>> {
        let mut state = self.broker.lock();

        if let Some(reason) = state.injected_failure.take() {
            return Ok(Some(SessionEvent::Failed(BrokerError::Other(reason))));
        }

        let now = Instant::now();
        let position = state
            .inbound
            .iter()
            .position(|m| self.consuming.contains(&m.queue) && m.ready_at <= now);

        if let Some(message) = position.and_then(|index| state.inbound.remove(index)) {
            state.log.push(MockEvent::Delivered {
                queue: message.queue.clone(),
                payload: message.payload.clone(),
            });
            return Ok(Some(SessionEvent::Delivery {
                queue: message.queue,
                payload: Bytes::from(message.payload),
            }));
        }

        Err(state
            .inbound
            .iter()
            .filter(|m| self.consuming.contains(&m.queue))
            .map(|m| m.ready_at)
            .min())
    }
}

#[async_trait]
impl BrokerSession for MockSession {
    async fn declare_queue(&mut self, queue: &str) -> Result<(), BrokerError> {
        self.broker.lock().declared.push(queue.to_string());
        Ok(())
    }

    async fn consume(&mut self, queue: &str) -> Result<(), BrokerError> {
        self.broker.lock().consumed.push(queue.to_string());
        self.consuming.push(queue.to_string());
        Ok(())
    }

    async fn publish(&mut self, queue: &str, payload: &[u8]) -> Result<(), BrokerError> {
        let mut state = self.broker.lock();

        if self.closed {
            return Err(BrokerError::Closed);
        }
        if state.failing_publishes > 0 {
            state.failing_publishes -= 1;
            return Err(BrokerError::Other("publish failed".into()));
        }
        match state.publish_fail_countdown {
            Some(0) => {
                state.publish_fail_countdown = None;
                return Err(BrokerError::Other("publish failed".into()));
            }
            Some(n) => state.publish_fail_countdown = Some(n - 1),
            None => {}
        }

        let text = String::from_utf8_lossy(payload).into_owned();
        state.log.push(MockEvent::Published {
            queue: queue.to_string(),
            payload: text.clone(),
        });

        if queue == queues::COMMANDS {
            let delay = state.reply_delay;
            if let Some(reply) = state.responder.as_mut().and_then(|respond| respond(&text)) {
                state.inbound.push_back(Inbound {
                    queue: queues::RESPONSES.to_string(),
                    payload: reply,
                    ready_at: Instant::now() + delay,
                });
            }
        }
        Ok(())
    }

    async fn next_event(&mut self, budget: Duration) -> Option<SessionEvent> {
        let deadline = Instant::now() + budget;
        loop {
            let wake_at = match self.poll_inbound() {
                Ok(event) if event.is_some() => return event,
                Ok(_) => deadline,
                Err(next_ready) => next_ready.map_or(deadline, |at| at.min(deadline)),
            };

            if wake_at >= deadline {
                sleep(deadline.saturating_duration_since(Instant::now())).await;
                return None;
            }
            sleep(wake_at.saturating_duration_since(Instant::now())).await;
        }
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        if !self.closed {
            self.closed = true;
            self.broker.lock().closed_sessions += 1;
        }
        Ok(())
    }
}
