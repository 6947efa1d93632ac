//! UDP transport to the vehicle

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::net::{lookup_host, UdpSocket};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::transport::traits::Vehicle;
use tello_shared::DroneConfig;

/// Largest reply the vehicle sends
const MAX_DATAGRAM: usize = 1518;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to bind UDP port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("Failed to resolve vehicle address {address}: {source}")]
    Resolve {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("Vehicle address {0} resolved to nothing")]
    NoAddress(String),
}

/// Datagram client for the vehicle's text command protocol
pub struct DroneClient {
    socket: UdpSocket,
    target: SocketAddr,
    reply_port: u16,
    polls: u32,
    poll: Duration,
}

impl DroneClient {
    /// Bind the local reply port and resolve the vehicle address.
    /// The socket receives from the moment it is bound.
    pub async fn bind(config: &DroneConfig) -> Result<Self, TransportError> {
        let address = format!("{}:{}", config.address, config.command_port);
        let target = lookup_host(&address)
            .await
            .map_err(|source| TransportError::Resolve {
                address: address.clone(),
                source,
            })?
            .next()
            .ok_or_else(|| TransportError::NoAddress(address.clone()))?;

        let socket = UdpSocket::bind(("0.0.0.0", config.local_port))
            .await
            .map_err(|source| TransportError::Bind {
                port: config.local_port,
                source,
            })?;

        info!(
            "Vehicle link on {} -> {}",
            socket.local_addr().map_or_else(|_| "?".into(), |a| a.to_string()),
            target
        );

        Ok(Self {
            socket,
            target,
            reply_port: config.reply_port,
            polls: config.response_polls.max(1),
            poll: config.response_poll(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Drop datagrams left over from earlier, timed-out commands
    fn discard_stale(&self) {
        let mut buf = [0u8; MAX_DATAGRAM];
        while let Ok((len, from)) = self.socket.try_recv_from(&mut buf) {
            debug!(
                "Discarding stale datagram from {}: {:?}",
                from,
                String::from_utf8_lossy(&buf[..len])
            );
        }
    }
}

#[async_trait]
impl Vehicle for DroneClient {
    async fn send_command(&mut self, command: &str) -> Option<String> {
        self.discard_stale();

        if let Err(e) = self.socket.send_to(command.as_bytes(), self.target).await {
            warn!("Failed to send {:?}: {}", command, e);
            return None;
        }
        debug!("Sent {:?} to {}", command, self.target);

        // Stray traffic does not shorten the wait for the real reply
        let limit = self.poll * self.polls;
        let deadline = Instant::now() + limit;
        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            match timeout_at(deadline, self.socket.recv_from(&mut buf)).await {
                Ok(Ok((len, from))) if from.port() == self.reply_port => {
                    let reply = String::from_utf8_lossy(&buf[..len]).trim().to_string();
                    debug!("{:?} -> {:?}", command, reply);
                    return Some(reply);
                }
                Ok(Ok((_, from))) => debug!("Ignoring datagram from {}", from),
                Ok(Err(e)) => warn!("UDP receive error: {}", e),
                Err(_) => break,
            }
        }

        warn!("No response to {:?} within {:?}", command, limit);
        None
    }
}
