//! The application hook: what a connection does with inbound messages.
//!
//! The session manager owns authentication, heartbeats, rooms, and
//! teardown. Everything else a client sends arrives as an `App` payload
//! and is handed to your [`MessageHandler`] together with a
//! [`ConnectionContext`] describing who sent it.

use std::future::Future;
use std::sync::Arc;

use gatehouse_gateway::{GatewayError, SessionHandle};
use gatehouse_protocol::{Identity, ProtocolError, TokenId};
use gatehouse_transport::ConnectionId;
use tokio::sync::mpsc;

use crate::{CloseReason, ConnectionHub, Outbound};

/// Handles application messages on open connections.
///
/// One instance is shared by every connection task, so it must be
/// `Send + Sync + 'static`. `on_open` and `on_close` default to no-ops.
///
/// # Example
///
/// ```rust
/// use gatehouse::prelude::*;
///
/// /// Sends every message straight back.
/// struct Echo;
///
/// impl MessageHandler for Echo {
///     async fn on_message(
///         &self,
///         ctx: &ConnectionContext,
///         data: Vec<u8>,
///     ) -> Result<(), HandlerError> {
///         ctx.send(data)
///     }
/// }
/// ```
pub trait MessageHandler: Send + Sync + 'static {
    /// Called once, right after the client received its `AuthAck`.
    fn on_open(&self, ctx: &ConnectionContext) -> impl Future<Output = ()> + Send {
        let _ = ctx;
        async {}
    }

    /// Called for every application payload, one at a time per connection.
    ///
    /// An `Err` is reported to the client as a `SystemMessage::Error`
    /// with [`HandlerError::code`]; the connection stays open.
    fn on_message(
        &self,
        ctx: &ConnectionContext,
        data: Vec<u8>,
    ) -> impl Future<Output = Result<(), HandlerError>> + Send;

    /// Called once while the connection is closing, after it has left the
    /// hub and its session's cancellation token has fired.
    fn on_close(
        &self,
        ctx: &ConnectionContext,
        reason: &CloseReason,
    ) -> impl Future<Output = ()> + Send {
        let _ = (ctx, reason);
        async {}
    }
}

/// A handler failure, reported to the client without closing.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// The handler refused the message itself.
    #[error("{message}")]
    Rejected { code: u16, message: String },

    /// A downstream call made on the client's behalf failed.
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    /// The payload couldn't be decoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The connection's outbound queue is full or already closed.
    #[error("outbound queue unavailable")]
    OutboundUnavailable,
}

impl HandlerError {
    /// Convenience constructor for [`HandlerError::Rejected`].
    pub fn rejected(code: u16, message: impl Into<String>) -> Self {
        Self::Rejected {
            code,
            message: message.into(),
        }
    }

    /// HTTP-style code sent in the `Error` message.
    pub fn code(&self) -> u16 {
        match self {
            Self::Rejected { code, .. } => *code,
            Self::Gateway(GatewayError::Unauthorized { .. }) => 401,
            Self::Gateway(GatewayError::InvalidRequest(_)) => 500,
            Self::Gateway(_) | Self::OutboundUnavailable => 503,
            Self::Protocol(_) => 400,
        }
    }
}

/// Everything a handler knows about the connection it is serving.
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    connection_id: ConnectionId,
    identity: Identity,
    token_id: TokenId,
    expires_at: i64,
    outbox: mpsc::Sender<Outbound>,
    hub: Arc<ConnectionHub>,
    session: SessionHandle,
}

impl ConnectionContext {
    pub(crate) fn new(
        connection_id: ConnectionId,
        expires_at: i64,
        outbox: mpsc::Sender<Outbound>,
        hub: Arc<ConnectionHub>,
        session: SessionHandle,
    ) -> Self {
        Self {
            connection_id,
            identity: session.identity().clone(),
            token_id: session.token_id().clone(),
            expires_at,
            outbox,
            hub,
            session,
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn token_id(&self) -> &TokenId {
        &self.token_id
    }

    /// Unix seconds at which the connection's token expires.
    pub fn expires_at(&self) -> i64 {
        self.expires_at
    }

    /// The handle to pass to [`OutboundGateway::call`](gatehouse_gateway::OutboundGateway::call).
    /// Its cancellation token fires when this connection closes.
    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    pub fn hub(&self) -> &Arc<ConnectionHub> {
        &self.hub
    }

    /// Queues application bytes for this connection. Never waits: a full
    /// queue is an error.
    pub fn send(&self, data: Vec<u8>) -> Result<(), HandlerError> {
        self.outbox
            .try_send(Outbound::App(data))
            .map_err(|_| HandlerError::OutboundUnavailable)
    }

    /// Queues `data` for everyone else in `room`.
    pub fn broadcast(&self, room: &str, data: &[u8]) -> usize {
        self.hub.broadcast_room(room, data, Some(self.connection_id))
    }

    pub fn join_room(&self, room: &str) -> bool {
        self.hub.join_room(self.connection_id, room)
    }

    pub fn leave_room(&self, room: &str) -> bool {
        self.hub.leave_room(self.connection_id, room)
    }
}
