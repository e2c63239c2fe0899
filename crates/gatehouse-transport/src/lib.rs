//! Transport abstraction layer for Gatehouse.
//!
//! Provides the [`Transport`] and [`Connection`] traits the socket session
//! manager is written against, plus two implementations:
//!
//! - [`WebSocketTransport`] / [`WebSocketConnection`]: real sockets via
//!   `tokio-tungstenite` (feature `websocket`, on by default)
//! - [`MemoryConnection`] / [`MemoryPeer`]: an in-process channel pair,
//!   used by tests that drive time with `tokio::time::pause`

#![allow(async_fn_in_trait)]

mod error;
mod memory;
#[cfg(feature = "websocket")]
mod websocket;

pub use error::TransportError;
pub use memory::{MemoryConnection, MemoryFrame, MemoryPeer};
#[cfg(feature = "websocket")]
pub use websocket::{DEFAULT_UPGRADE_TIMEOUT, WebSocketConnection, WebSocketTransport};

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

/// Source of connection identifiers. Monotonic, so an identifier is never
/// handed out twice within a process.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque identifier for a live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Creates a new `ConnectionId` from a raw `u64`.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Allocates the next process-unique identifier.
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the underlying `u64` value.
    pub fn into_inner(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Accepts new incoming connections.
pub trait Transport: Send + Sync + 'static {
    /// The connection type produced by this transport.
    type Connection: Connection;
    /// The error type for transport operations.
    type Error: std::error::Error + Send + Sync;

    /// Waits for and accepts the next upgraded connection.
    async fn accept(&mut self) -> Result<Self::Connection, Self::Error>;

    /// Returns the address the transport is listening on.
    fn local_addr(&self) -> std::io::Result<std::net::SocketAddr>;

    /// Gracefully shuts down the transport, stopping new connections.
    async fn shutdown(&self) -> Result<(), Self::Error>;
}

/// A single bidirectional connection carrying whole frames.
///
/// Methods return `Send` futures so connection tasks generic over `C`
/// can be handed to `tokio::spawn`.
pub trait Connection: Send + Sync + 'static {
    /// Sends one frame to the remote peer.
    fn send(&self, data: &[u8]) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Receives the next frame from the remote peer.
    ///
    /// Returns `Ok(None)` when the connection is cleanly closed. Must be
    /// cancel-safe: dropping the future loses no frame.
    fn recv(&self) -> impl Future<Output = Result<Option<Vec<u8>>, TransportError>> + Send;

    /// Starts the close handshake with an application close code.
    fn close(
        &self,
        code: u16,
        reason: &str,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Returns the unique identifier for this connection.
    fn id(&self) -> ConnectionId;

    /// The session token the client supplied with the upgrade request,
    /// if any (`?token=` query parameter or `Authorization: Bearer`).
    fn presented_token(&self) -> Option<&str> {
        None
    }
}
