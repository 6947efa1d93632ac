//! Command dispatch and retry for the producer
//!
//! This module handles:
//! - Validating and publishing commands, queuing them while the broker is down
//! - Waiting for the correlated vehicle response with a timeout
//! - Classifying the response and retrying, aborting or landing

mod dispatcher;
mod outcome;

pub use dispatcher::CommandDispatcher;
pub use outcome::{Outcome, SequenceResult};
