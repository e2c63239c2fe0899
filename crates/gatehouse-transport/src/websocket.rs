//! WebSocket transport implementation using `tokio-tungstenite`.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

use crate::{Connection, ConnectionId, Transport, TransportError};

type WsStream = WebSocketStream<TcpStream>;
type Upgraded = Result<WebSocketConnection, TransportError>;

/// How long a client gets to complete the HTTP upgrade when no other
/// limit is configured.
pub const DEFAULT_UPGRADE_TIMEOUT: Duration = Duration::from_secs(5);

/// Upgraded connections waiting for `accept`.
const UPGRADED_BACKLOG: usize = 128;

/// A WebSocket-based [`Transport`] that listens for incoming upgrades.
///
/// A background task accepts TCP connections and runs each upgrade
/// handshake on its own task under a timeout, so a client that stalls
/// mid-handshake never holds up anyone else. [`accept`](Transport::accept)
/// hands out connections in the order their upgrades complete.
pub struct WebSocketTransport {
    local_addr: SocketAddr,
    upgraded: mpsc::Receiver<Upgraded>,
    acceptor: JoinHandle<()>,
}

impl WebSocketTransport {
    /// Binds a new WebSocket transport to the given address.
    pub async fn bind(addr: &str) -> Result<Self, TransportError> {
        Self::bind_with_timeout(addr, DEFAULT_UPGRADE_TIMEOUT).await
    }

    /// Binds with an explicit limit on how long an upgrade may take.
    pub async fn bind_with_timeout(
        addr: &str,
        upgrade_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(TransportError::AcceptFailed)?;
        let local_addr = listener.local_addr().map_err(TransportError::AcceptFailed)?;
        tracing::info!(%local_addr, "WebSocket transport listening");

        let (tx, upgraded) = mpsc::channel(UPGRADED_BACKLOG);
        let acceptor = tokio::spawn(accept_loop(listener, tx, upgrade_timeout));
        Ok(Self {
            local_addr,
            upgraded,
            acceptor,
        })
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.acceptor.abort();
    }
}

impl Transport for WebSocketTransport {
    type Connection = WebSocketConnection;
    type Error = TransportError;

    async fn accept(&mut self) -> Result<Self::Connection, Self::Error> {
        self.upgraded.recv().await.unwrap_or(Err(TransportError::Shutdown))
    }

    fn local_addr(&self) -> std::io::Result<SocketAddr> {
        Ok(self.local_addr)
    }

    async fn shutdown(&self) -> Result<(), Self::Error> {
        self.acceptor.abort();
        Ok(())
    }
}

/// Accepts TCP connections and spawns one upgrade task per connection.
async fn accept_loop(listener: TcpListener, tx: mpsc::Sender<Upgraded>, upgrade_timeout: Duration) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                if tx.send(Err(TransportError::AcceptFailed(e))).await.is_err() {
                    break;
                }
                continue;
            }
        };

        let tx = tx.clone();
        tokio::spawn(async move {
            let upgraded = match tokio::time::timeout(upgrade_timeout, upgrade(stream, addr)).await {
                Ok(upgraded) => upgraded,
                Err(_) => Err(TransportError::Handshake(format!(
                    "{addr}: no upgrade within {upgrade_timeout:?}"
                ))),
            };
            // The receiver is gone once the transport shuts down.
            let _ = tx.send(upgraded).await;
        });
    }
}

/// Runs the HTTP upgrade on one TCP stream.
async fn upgrade(stream: TcpStream, addr: SocketAddr) -> Upgraded {
    // The upgrade request is only visible inside the handshake
    // callback, so the token is captured there.
    let mut presented_token = None;
    let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        presented_token = token_from_request(req);
        Ok(resp)
    };

    let ws = tokio_tungstenite::accept_hdr_async(stream, callback)
        .await
        .map_err(|e| TransportError::Handshake(format!("{addr}: {e}")))?;

    let id = ConnectionId::next();
    tracing::debug!(
        %id,
        %addr,
        token_in_upgrade = presented_token.is_some(),
        "accepted WebSocket connection"
    );

    let (sink, stream) = ws.split();
    Ok(WebSocketConnection {
        id,
        sink: Mutex::new(sink),
        stream: Mutex::new(stream),
        presented_token,
    })
}

/// Extracts a session token from `?token=…` or `Authorization: Bearer …`.
/// The query parameter wins when both are present.
fn token_from_request(req: &Request) -> Option<String> {
    let from_query = req.uri().query().and_then(|query| {
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(key, _)| key == "token")
            .map(|(_, value)| value.into_owned())
    });

    from_query
        .or_else(|| {
            req.headers()
                .get("authorization")
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.strip_prefix("Bearer "))
                .map(|token| token.trim().to_string())
        })
        .filter(|token| !token.is_empty())
}

/// A single WebSocket connection.
///
/// Read and write halves are locked independently, so a task parked in
/// `recv` never blocks a `send`.
pub struct WebSocketConnection {
    id: ConnectionId,
    sink: Mutex<SplitSink<WsStream, Message>>,
    stream: Mutex<SplitStream<WsStream>>,
    presented_token: Option<String>,
}

impl Connection for WebSocketConnection {
    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        let msg = Message::Binary(data.to_vec().into());
        self.sink.lock().await.send(msg).await.map_err(|e| {
            TransportError::SendFailed(std::io::Error::new(std::io::ErrorKind::BrokenPipe, e))
        })
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>, TransportError> {
        let mut stream = self.stream.lock().await;
        loop {
            match stream.next().await {
                Some(Ok(Message::Binary(data))) => return Ok(Some(data.into())),
                Some(Ok(Message::Text(text))) => return Ok(Some(text.as_bytes().to_vec())),
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => continue, // ping/pong/raw frame
                Some(Err(e)) => {
                    return Err(TransportError::ReceiveFailed(std::io::Error::new(
                        std::io::ErrorKind::ConnectionReset,
                        e,
                    )));
                }
            }
        }
    }

    async fn close(&self, code: u16, reason: &str) -> Result<(), TransportError> {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_owned().into(),
        };
        self.sink
            .lock()
            .await
            .send(Message::Close(Some(frame)))
            .await
            .map_err(|e| {
                TransportError::SendFailed(std::io::Error::new(std::io::ErrorKind::BrokenPipe, e))
            })
    }

    fn id(&self) -> ConnectionId {
        self.id
    }

    fn presented_token(&self) -> Option<&str> {
        self.presented_token.as_deref()
    }
}
