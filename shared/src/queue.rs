//! Messages waiting for the broker
//!
//! Filled while the link is down or a publish fails; drained front to back on
//! the next Connected transition, stopping at the first failure.

use std::collections::VecDeque;

/// FIFO of raw payloads awaiting publication
#[derive(Debug, Default)]
pub struct PendingQueue {
    entries: VecDeque<String>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, payload: impl Into<String>) {
        self.entries.push_back(payload.into());
    }

    pub fn front(&self) -> Option<&str> {
        self.entries.front().map(String::as_str)
    }

    pub fn pop_front(&mut self) -> Option<String> {
        self.entries.pop_front()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(String::as_str)
    }

    /// Drop everything still queued, returning how many entries were dropped
    pub fn clear(&mut self) -> usize {
        let dropped = self.entries.len();
        self.entries.clear();
        dropped
    }
}
