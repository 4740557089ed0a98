//! The duplex message channel the session runs over.
//!
//! A transport carries whole JSON messages; framing belongs to whatever sits
//! underneath. [`ws`] adapts a WebSocket connection, and
//! [`testutil`](crate::testutil) provides an in-process pair for tests.

pub mod ws;

use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use crate::config::Endpoint;

pub use ws::WsConnector;

/// Transport-level failures. Mapped into [`ObsError`](crate::ObsError) by
/// the session.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Nobody is listening at the endpoint.
    #[error("connection refused: {0}")]
    Refused(String),
    /// The channel is closed (end of stream, or closed locally).
    #[error("connection closed: {0}")]
    Closed(String),
    /// Any other I/O failure.
    #[error("transport I/O error: {0}")]
    Io(String),
}

/// One open duplex channel.
///
/// `receive` is only ever called by one thread at a time (the link's reader,
/// or a callback on that same thread). `send` may be called concurrently.
pub trait Transport: Send + Sync {
    /// Queue one message for the peer.
    fn send(&self, message: Value) -> Result<(), TransportError>;

    /// Block until the next message. Returns [`TransportError::Closed`] at
    /// end of stream.
    fn receive(&self) -> Result<Value, TransportError>;

    /// Close the channel. A blocked `receive` returns, later `send`s fail.
    /// Idempotent.
    fn close(&self);
}

/// Opens transports. Called once per connection attempt.
pub trait Connector: Send + Sync {
    /// Open a channel to `endpoint`.
    fn open(&self, endpoint: &Endpoint) -> Result<Arc<dyn Transport>, TransportError>;
}
