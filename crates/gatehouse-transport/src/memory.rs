//! In-process connection pair backed by unbounded channels.
//!
//! No sockets, no I/O. Time-driven behavior (idle timeouts, revocation
//! polling) can be tested under `tokio::time::pause` without wall-clock
//! waits.

use tokio::sync::{Mutex, mpsc};

use crate::{Connection, ConnectionId, TransportError};

/// A frame as observed by the [`MemoryPeer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryFrame {
    /// A data frame sent by the server side.
    Data(Vec<u8>),
    /// The server side closed the connection.
    Close { code: u16, reason: String },
}

/// The server half of an in-memory connection.
pub struct MemoryConnection {
    id: ConnectionId,
    inbound: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    outbound: mpsc::UnboundedSender<MemoryFrame>,
    token: Option<String>,
}

/// The client half of an in-memory connection.
pub struct MemoryPeer {
    tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    rx: mpsc::UnboundedReceiver<MemoryFrame>,
}

impl MemoryConnection {
    /// Creates a connected pair. `token` plays the role of a token carried
    /// on the upgrade request.
    pub fn pair(token: Option<String>) -> (MemoryConnection, MemoryPeer) {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let conn = MemoryConnection {
            id: ConnectionId::next(),
            inbound: Mutex::new(in_rx),
            outbound: out_tx,
            token,
        };
        let peer = MemoryPeer {
            tx: Some(in_tx),
            rx: out_rx,
        };
        (conn, peer)
    }
}

impl Connection for MemoryConnection {
    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        self.outbound
            .send(MemoryFrame::Data(data.to_vec()))
            .map_err(|_| TransportError::ConnectionClosed("peer dropped".into()))
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>, TransportError> {
        Ok(self.inbound.lock().await.recv().await)
    }

    async fn close(&self, code: u16, reason: &str) -> Result<(), TransportError> {
        self.outbound
            .send(MemoryFrame::Close {
                code,
                reason: reason.to_string(),
            })
            .map_err(|_| TransportError::ConnectionClosed("peer dropped".into()))
    }

    fn id(&self) -> ConnectionId {
        self.id
    }

    fn presented_token(&self) -> Option<&str> {
        self.token.as_deref()
    }
}

impl MemoryPeer {
    /// Sends a frame to the server side.
    pub fn send(&self, data: impl Into<Vec<u8>>) -> Result<(), TransportError> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| TransportError::ConnectionClosed("peer hung up".into()))?;
        tx.send(data.into())
            .map_err(|_| TransportError::ConnectionClosed("server dropped".into()))
    }

    /// Waits for the next frame from the server side. `None` once the
    /// server half is dropped.
    pub async fn recv(&mut self) -> Option<MemoryFrame> {
        self.rx.recv().await
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<MemoryFrame> {
        self.rx.try_recv().ok()
    }

    /// Closes the client side. The server's next `recv` returns `Ok(None)`.
    pub fn hang_up(&mut self) {
        self.tx = None;
    }
}
