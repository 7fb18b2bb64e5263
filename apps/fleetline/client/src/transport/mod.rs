use anyhow::Result;
use async_trait::async_trait;

pub mod mock;
pub mod websocket;

/// One established link to the messaging transport. A `Transport` is a
/// single connection: once `recv` returns `None` the link is finished and a
/// fresh one must be obtained from the connector. Reconnection policy lives
/// in the [`crate::connection::ConnectionManager`], not here.
#[async_trait]
pub trait Transport: Send {
    /// Send one wire frame to the remote peer.
    async fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Receive the next wire frame, or `None` once the link has closed.
    async fn recv(&mut self) -> Option<Vec<u8>>;

    fn is_connected(&self) -> bool;
}

/// Factory producing fresh transport links, one per connection attempt.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Transport>>;
}
