//! Single-value holder for the most recent correlated response

/// Last-write-wins response holder.
///
/// Correlation is implicit: only one command is in flight per connection, so
/// whatever arrives after a `clear` belongs to the command published after it.
#[derive(Debug, Default)]
pub struct ResponseSlot {
    response: Option<String>,
}

impl ResponseSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.response = None;
    }

    pub fn set(&mut self, response: impl Into<String>) {
        self.response = Some(response.into());
    }

    pub fn is_received(&self) -> bool {
        self.response.is_some()
    }

    /// Take the response, leaving the slot cleared
    pub fn take(&mut self) -> Option<String> {
        self.response.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_write_wins() {
        let mut slot = ResponseSlot::new();
        assert!(!slot.is_received());

        slot.set("error");
        slot.set("ok");
        assert!(slot.is_received());
        assert_eq!(slot.take().as_deref(), Some("ok"));
        assert!(!slot.is_received());
    }

    #[test]
    fn test_clear() {
        let mut slot = ResponseSlot::new();
        slot.set("87");
        slot.clear();
        assert_eq!(slot.take(), None);
    }
}
