//! Vehicle link abstraction

use async_trait::async_trait;
use tello_shared::protocol;

/// A request/response link to the vehicle with one request outstanding
#[async_trait]
pub trait Vehicle: Send {
    /// Send one command and wait a bounded time for its reply
    async fn send_command(&mut self, command: &str) -> Option<String>;

    /// SDK handshake; must be answered before other commands are accepted
    async fn connect(&mut self) -> Option<String> {
        self.send_command(protocol::HANDSHAKE).await
    }
}
