//! Scripted flight patterns

use tello_shared::{protocol, FlightConfig};

/// Four sides of a square, turning after each, then land
pub fn square(config: &FlightConfig) -> Vec<String> {
    let mut commands = Vec::with_capacity(9);
    for _ in 0..4 {
        commands.push(format!("forward {}", config.square_side));
        commands.push(format!("cw {}", config.turn_angle));
    }
    commands.push(protocol::LAND.to_string());
    commands
}
