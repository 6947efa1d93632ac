//! Safety Module
//!
//! Pre-flight readiness gating: battery, takeoff and altitude checks that run
//! before the main command sequence and land the vehicle on any abort.

mod preflight;

pub use preflight::{run as preflight, PreflightReport};
