//! Plain-text command protocol
//!
//! Commands and replies travel as raw ASCII strings, both over the broker and
//! over the vehicle datagram link:
//! ```text
//! command:  <verb> [<arg> ...]      e.g. "forward 50", "cw 90", "battery?"
//! reply:    ok | error | out of range | invalid command | <integer>[unit]
//! ```

use thiserror::Error;

use crate::protocol;

/// Errors that can occur while reading a numeric reply
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CodecError {
    #[error("Empty reply")]
    Empty,

    #[error("Reply is not a number: {0:?}")]
    NotNumeric(String),
}

/// A command split into its verb and arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine<'a> {
    pub verb: &'a str,
    pub args: Vec<&'a str>,
}

impl<'a> CommandLine<'a> {
    /// Split a raw command on whitespace. Returns `None` for a blank command.
    pub fn parse(raw: &'a str) -> Option<Self> {
        let mut parts = raw.split_whitespace();
        let verb = parts.next()?;
        Some(Self {
            verb,
            args: parts.collect(),
        })
    }

    /// Queries end in `?` and answer with a value instead of `ok`
    pub fn is_query(&self) -> bool {
        self.verb.ends_with('?')
    }
}

/// `true` for read-only queries such as `battery?`
pub fn is_query(raw: &str) -> bool {
    CommandLine::parse(raw).is_some_and(|line| line.is_query())
}

/// `true` for the land command
pub fn is_land(raw: &str) -> bool {
    raw.trim() == protocol::LAND
}

/// A reply from the vehicle, as far as the relay cares about it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ok,
    Error,
    OutOfRange,
    InvalidCommand,
    /// Numeric answer to a query
    Value(i64),
    Other(String),
}

impl Reply {
    pub fn parse(raw: &str) -> Self {
        let text = raw.trim();
        match text {
            protocol::REPLY_OK => Reply::Ok,
            protocol::REPLY_ERROR => Reply::Error,
            protocol::REPLY_OUT_OF_RANGE => Reply::OutOfRange,
            protocol::REPLY_INVALID_COMMAND => Reply::InvalidCommand,
            _ => match parse_reading(text) {
                Ok(value) => Reply::Value(value),
                Err(_) => Reply::Other(text.to_string()),
            },
        }
    }

    /// Replies that mean the vehicle rejected the command outright
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, Reply::OutOfRange | Reply::InvalidCommand)
    }
}

/// Read an integer from a query reply.
///
/// Surrounding whitespace and a trailing unit suffix are ignored, so `"87"`,
/// `" 87\r\n"` and `"10dm"` all parse.
pub fn parse_reading(raw: &str) -> Result<i64, CodecError> {
    let text = raw.trim();
    if text.is_empty() {
        return Err(CodecError::Empty);
    }

    let digits = text.trim_end_matches(|c: char| c.is_ascii_alphabetic() || c == '%');
    digits
        .trim()
        .parse::<i64>()
        .map_err(|_| CodecError::NotNumeric(text.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_command_line() {
        let line = CommandLine::parse("  forward   50 ").unwrap();
        assert_eq!(line.verb, "forward");
        assert_eq!(line.args, vec!["50"]);

        let line = CommandLine::parse("takeoff").unwrap();
        assert!(line.args.is_empty());

        assert!(CommandLine::parse("   ").is_none());
    }

    #[test]
    fn test_query_detection() {
        assert!(is_query("battery?"));
        assert!(is_query("height?"));
        assert!(!is_query("land"));
        assert!(!is_query(""));
        assert!(is_land(" land "));
        assert!(!is_land("land now"));
    }

    #[test]
    fn test_reply_parsing() {
        assert_eq!(Reply::parse("ok"), Reply::Ok);
        assert_eq!(Reply::parse("ok\r\n"), Reply::Ok);
        assert_eq!(Reply::parse("error"), Reply::Error);
        assert_eq!(Reply::parse("out of range"), Reply::OutOfRange);
        assert_eq!(Reply::parse("invalid command"), Reply::InvalidCommand);
        assert_eq!(Reply::parse("87"), Reply::Value(87));
        assert_eq!(
            Reply::parse("error Motor stop"),
            Reply::Other("error Motor stop".into())
        );
        assert!(Reply::parse("out of range").is_unrecoverable());
        assert!(!Reply::parse("error").is_unrecoverable());
    }

    #[test]
    fn test_parse_reading() {
        assert_eq!(parse_reading("15"), Ok(15));
        assert_eq!(parse_reading(" 87\r\n"), Ok(87));
        assert_eq!(parse_reading("10dm"), Ok(10));
        assert_eq!(parse_reading("-3"), Ok(-3));
        assert_eq!(parse_reading(""), Err(CodecError::Empty));
        assert!(matches!(parse_reading("ok"), Err(CodecError::NotNumeric(_))));
        assert!(matches!(parse_reading("dm"), Err(CodecError::NotNumeric(_))));
    }
}
