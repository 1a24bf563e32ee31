//! Transport module for the session's bidirectional connection
//!
//! A transport carries opaque binary messages in both directions and
//! delivers inbound messages in order. The session trusts that ordering;
//! there are no sequence numbers on the wire.

mod websocket;

use async_trait::async_trait;

use crate::error::Result;

pub use websocket::{WebSocketConnector, WebSocketTransport};

/// A message read from the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Binary audio fragment
    Binary(Vec<u8>),
    /// Anything the protocol does not define, described for diagnostics
    Unexpected(String),
}

/// An open bidirectional binary-message connection
#[async_trait]
pub trait Transport: Send {
    /// Send one binary message; fails with `TransportClosed` once closed
    async fn send(&mut self, payload: Vec<u8>) -> Result<()>;

    /// Next inbound message, `None` once the connection has closed.
    /// Must be cancel safe: dropping the future loses no message.
    async fn recv(&mut self) -> Option<Inbound>;

    /// Whether sends can currently succeed
    fn is_open(&self) -> bool;

    /// Close the connection. Closing twice is a no-op.
    async fn close(&mut self);
}

/// Establishes transports to an endpoint
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &str) -> Result<Box<dyn Transport>>;
}
