//! Broker Link State Machine
//!
//! Defines the connection states, the signals that move between them, and the
//! reconnect backoff schedule.

use std::time::Duration;

/// Connection state owned by the lifecycle manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}

/// Broker-side events and explicit requests that drive the state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkSignal {
    /// A connection attempt is starting
    ConnectRequested,
    /// Connection and topology are up
    Ready,
    /// Connect, publish or consume failed
    Failed,
    /// Shutdown was requested
    Shutdown,
}

impl ConnectionState {
    /// Next state for a signal. Unexpected pairs leave the state unchanged.
    pub fn on(self, signal: LinkSignal) -> ConnectionState {
        use ConnectionState::*;
        use LinkSignal::*;

        match (self, signal) {
            (Disconnected, ConnectRequested) => Connecting,
            (Connecting, Ready) => Connected,
            (_, Failed) | (_, Shutdown) => Disconnected,
            (state, _) => state,
        }
    }
}

/// Reconnect attempt counter with a capped exponential delay.
///
/// The delay for attempt `n` is `min(max_delay, 2^n seconds)`; the counter is
/// reset on every successful connect.
#[derive(Debug, Clone)]
pub struct Backoff {
    attempt: u32,
    max_attempts: u32,
    max_delay: Duration,
}

impl Backoff {
    pub fn new(max_attempts: u32, max_delay: Duration) -> Self {
        Self {
            attempt: 0,
            max_attempts,
            max_delay,
        }
    }

    /// Failure-driven reconnects made since the last successful connect
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Delay for a given attempt number
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let secs = 2u64.checked_pow(attempt).unwrap_or(u64::MAX);
        Duration::from_secs(secs).min(self.max_delay)
    }

    /// Delay before the next reconnect, advancing the counter.
    /// Returns `None` once the ceiling has been reached.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }
        let delay = self.delay_for(self.attempt);
        self.attempt += 1;
        Some(delay)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_normal_connect_flow() {
        let state = ConnectionState::Disconnected.on(LinkSignal::ConnectRequested);
        assert_eq!(state, ConnectionState::Connecting);

        let state = state.on(LinkSignal::Ready);
        assert_eq!(state, ConnectionState::Connected);

        let state = state.on(LinkSignal::Failed);
        assert_eq!(state, ConnectionState::Disconnected);
    }

    #[test]
    fn test_failure_while_connecting() {
        let state = ConnectionState::Connecting.on(LinkSignal::Failed);
        assert_eq!(state, ConnectionState::Disconnected);
    }

    #[test]
    fn test_invalid_transitions_are_ignored() {
        // Ready without a pending connect does not promote the state
        assert_eq!(
            ConnectionState::Disconnected.on(LinkSignal::Ready),
            ConnectionState::Disconnected
        );
        assert_eq!(
            ConnectionState::Connected.on(LinkSignal::ConnectRequested),
            ConnectionState::Connected
        );
    }

    #[test]
    fn test_shutdown_from_any_state() {
        for state in [
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
            ConnectionState::Connected,
        ] {
            assert_eq!(state.on(LinkSignal::Shutdown), ConnectionState::Disconnected);
        }
    }

    #[test]
    fn test_backoff_monotonic_and_capped() {
        let mut backoff = Backoff::new(10, Duration::from_secs(16));
        let delays: Vec<u64> = std::iter::from_fn(|| backoff.next_delay())
            .map(|d| d.as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 16, 16, 16, 16, 16]);
        assert!(backoff.is_exhausted());
    }

    #[test]
    fn test_backoff_ceiling() {
        let mut backoff = Backoff::new(2, Duration::from_secs(16));
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(1)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(2)));
        assert_eq!(backoff.next_delay(), None);
        assert_eq!(backoff.attempt(), 2);
    }

    #[test]
    fn test_backoff_reset() {
        let mut backoff = Backoff::new(5, Duration::from_secs(16));
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_backoff_large_attempt_saturates() {
        let backoff = Backoff::new(100, Duration::from_secs(16));
        assert_eq!(backoff.delay_for(80), Duration::from_secs(16));
    }
}
