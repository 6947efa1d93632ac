pub mod traits;
pub mod udp;

pub use traits::Vehicle;
pub use udp::DroneClient;
