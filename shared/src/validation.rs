//! Command validation policy
//!
//! Rejects malformed commands before they reach the network. The policy only
//! knows the movement and rotation verbs; anything else with arguments is
//! passed through unchecked.

use thiserror::Error;

use crate::codec::CommandLine;
use crate::config::FlightConfig;

const MOVEMENT_VERBS: &[&str] = &["forward", "back", "left", "right", "up", "down"];
const ROTATION_VERBS: &[&str] = &["cw", "ccw"];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Empty command")]
    Empty,

    #[error("{verb}: parameter {param:?} is not an integer")]
    NotAnInteger { verb: String, param: String },

    #[error("{verb}: {value} outside [{min}, {max}]")]
    OutOfBounds {
        verb: String,
        value: i64,
        min: i64,
        max: i64,
    },

    #[error("{verb}: expected exactly one parameter, got {count}")]
    WrongArity { verb: String, count: usize },
}

/// Check a raw command against the configured bounds
pub fn validate(raw: &str, config: &FlightConfig) -> Result<(), ValidationError> {
    let line = CommandLine::parse(raw).ok_or(ValidationError::Empty)?;

    let bounds = if MOVEMENT_VERBS.contains(&line.verb) {
        Some((config.min_distance, config.max_distance))
    } else if ROTATION_VERBS.contains(&line.verb) {
        Some((config.min_angle, config.max_angle))
    } else {
        None
    };

    match line.args.as_slice() {
        [] => Ok(()),
        [param] => {
            let value = param
                .parse::<i64>()
                .map_err(|_| ValidationError::NotAnInteger {
                    verb: line.verb.to_string(),
                    param: param.to_string(),
                })?;

            match bounds {
                Some((min, max)) if value < min || value > max => {
                    Err(ValidationError::OutOfBounds {
                        verb: line.verb.to_string(),
                        value,
                        min,
                        max,
                    })
                }
                _ => Ok(()),
            }
        }
        args if bounds.is_some() => Err(ValidationError::WrongArity {
            verb: line.verb.to_string(),
            count: args.len(),
        }),
        // Multi-argument verbs (go, curve, rc, ...) are the vehicle's business
        _ => Ok(()),
    }
}
