//! Response classification

use tello_shared::codec::{self, Reply};

/// How a single response (or the lack of one) is treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Success,
    /// The vehicle rejected the command; do not retry
    Unrecoverable,
    /// No response or an unexpected one; retry if attempts remain
    Retryable,
}

/// Classify the response to `command`
pub fn classify(command: &str, response: Option<&str>) -> Verdict {
    let Some(response) = response else {
        return Verdict::Retryable;
    };

    match Reply::parse(response) {
        Reply::Ok => Verdict::Success,
        // Landing while already on the ground
        Reply::Error if codec::is_land(command) => Verdict::Success,
        reply if reply.is_unrecoverable() => Verdict::Unrecoverable,
        Reply::Value(_) if codec::is_query(command) => Verdict::Success,
        _ => Verdict::Retryable,
    }
}

/// Terminal result of one executed command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Succeeded { response: String },
    /// Rejected by the vehicle or by validation; an emergency land was issued
    Unrecoverable { response: String },
    /// Every attempt failed; an emergency land was issued
    Exhausted {
        attempts: u32,
        last_response: Option<String>,
    },
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Succeeded { .. })
    }

    /// The last response seen, if any
    pub fn response(&self) -> Option<&str> {
        match self {
            Outcome::Succeeded { response } | Outcome::Unrecoverable { response } => {
                Some(response)
            }
            Outcome::Exhausted { last_response, .. } => last_response.as_deref(),
        }
    }
}

/// Result of running a command list
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SequenceResult {
    Completed { executed: usize },
    /// Stopped at `command`; later commands were not sent
    Aborted { command: String, outcome: Outcome },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ok_is_success() {
        assert_eq!(classify("forward 50", Some("ok")), Verdict::Success);
        assert_eq!(classify("takeoff", Some("ok\r\n")), Verdict::Success);
    }

    #[test]
    fn test_land_error_is_success() {
        assert_eq!(classify("land", Some("error")), Verdict::Success);
        assert_eq!(classify("takeoff", Some("error")), Verdict::Retryable);
    }

    #[test]
    fn test_vehicle_rejections_are_unrecoverable() {
        assert_eq!(classify("forward 50", Some("out of range")), Verdict::Unrecoverable);
        assert_eq!(classify("flip x", Some("invalid command")), Verdict::Unrecoverable);
        assert_eq!(classify("land", Some("out of range")), Verdict::Unrecoverable);
    }

    #[test]
    fn test_missing_or_unexpected_is_retryable() {
        assert_eq!(classify("cw 90", None), Verdict::Retryable);
        assert_eq!(classify("cw 90", Some("error Not joystick")), Verdict::Retryable);
        assert_eq!(classify("cw 90", Some("42")), Verdict::Retryable);
    }

    #[test]
    fn test_query_values_are_success() {
        assert_eq!(classify("battery?", Some("87")), Verdict::Success);
        assert_eq!(classify("height?", Some("10dm")), Verdict::Success);
        assert_eq!(classify("battery?", Some("error")), Verdict::Retryable);
    }

    #[test]
    fn test_outcome_accessors() {
        let outcome = Outcome::Exhausted {
            attempts: 3,
            last_response: None,
        };
        assert!(!outcome.is_success());
        assert_eq!(outcome.response(), None);

        let outcome = Outcome::Succeeded {
            response: "ok".into(),
        };
        assert!(outcome.is_success());
        assert_eq!(outcome.response(), Some("ok"));
    }
}
