#![forbid(unsafe_code)]

// Transport module - the event channel the simulated clients talk through

pub mod ws;

#[cfg(test)]
pub(crate) mod memory;

use crate::error::TransportError;
use crate::protocol::{InboundEvent, OutboundEvent};
use async_trait::async_trait;

pub use ws::WsConnector;

/// Opens connections to a matchmaking endpoint.
///
/// Timeouts are the caller's concern: implementations may take as long as the
/// underlying handshake takes.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, url: &str) -> Result<Box<dyn Connection>, TransportError>;
}

/// One open, bidirectional event channel.
#[async_trait]
pub trait Connection: Send {
    async fn emit(&mut self, event: OutboundEvent) -> Result<(), TransportError>;

    /// Next inbound event in arrival order, or `None` once the channel is
    /// closed. Must be cancel-safe.
    async fn recv(&mut self) -> Option<InboundEvent>;

    async fn close(&mut self);
}
