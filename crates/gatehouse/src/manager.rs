//! The socket session manager: one task per connection, from the first
//! frame to the close frame.
//!
//! The flow for a connection is:
//!   1. Connecting: take the token from the upgrade request, or wait for
//!      an `Authenticate` message
//!   2. Authenticating: validate, require an access token, bind it in the
//!      registry, admit it into the hub under the per-identity limit
//!   3. Open: send `AuthAck`, then loop over close signals, the idle
//!      timer, the revocation poll, the outbound queue, and inbound frames
//!   4. Closing: leave the hub, unbind, flush or drop the queue, cancel
//!      the session, send the close frame
//!
//! Every socket write happens on the connection's own task, so frames
//! never interleave. Other tasks reach a connection through the
//! [`ConnectionHub`] queues.

use std::sync::Arc;

use chrono::Utc;
use gatehouse_auth::{Claims, TokenKind};
use gatehouse_gateway::SessionHandle;
use gatehouse_protocol::{Codec, Envelope, ErrorKind, PROTOCOL_VERSION, Payload, SystemMessage};
use gatehouse_session::{Authenticator, BindOutcome, RegistryEvent, SessionRegistry};
use gatehouse_transport::{Connection, ConnectionId};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::hub::HubEntry;
use crate::{
    CloseReason, ConnectionContext, ConnectionHub, ConnectionState, GatehouseError,
    MessageHandler, Outbound, OutboundPolicy, SocketConfig,
};

/// State shared by every connection task.
struct Shared<A, H, C> {
    auth: A,
    registry: Arc<SessionRegistry>,
    handler: H,
    codec: C,
    hub: Arc<ConnectionHub>,
    config: SocketConfig,
    shutdown: CancellationToken,
}

/// Owns the lifecycle of every live socket.
///
/// Cheap to clone: clones share one hub, one registry, one handler.
///
/// # Type parameters
///
/// - `A`: checks presented tokens ([`Authenticator`])
/// - `H`: handles application messages ([`MessageHandler`])
/// - `C`: turns envelopes into frames ([`Codec`])
pub struct SocketSessionManager<A, H, C> {
    shared: Arc<Shared<A, H, C>>,
}

impl<A, H, C> Clone for SocketSessionManager<A, H, C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Why authentication or admission failed. `detail` is for the log only.
struct Rejection {
    kind: ErrorKind,
    detail: String,
}

impl Rejection {
    fn new(kind: ErrorKind, detail: impl ToString) -> Self {
        Self {
            kind,
            detail: detail.to_string(),
        }
    }
}

/// A connection that made it through admission.
struct Admitted {
    claims: Claims,
    outbox: mpsc::Sender<Outbound>,
    queued: mpsc::Receiver<Outbound>,
    close_signal: mpsc::Receiver<CloseReason>,
}

impl<A, H, C> SocketSessionManager<A, H, C>
where
    A: Authenticator,
    H: MessageHandler,
    C: Codec,
{
    pub fn new(
        auth: A,
        registry: Arc<SessionRegistry>,
        handler: H,
        codec: C,
        config: SocketConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                auth,
                registry,
                handler,
                codec,
                hub: Arc::new(ConnectionHub::new()),
                config: config.validated(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn hub(&self) -> &Arc<ConnectionHub> {
        &self.shared.hub
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.shared.registry
    }

    pub fn config(&self) -> &SocketConfig {
        &self.shared.config
    }

    /// Closes every connection with [`CloseReason::ServerShutdown`] and
    /// stops the revocation watcher. In-flight gateway calls are cancelled.
    pub fn shutdown(&self) {
        tracing::info!(open = self.shared.hub.len(), "socket session manager shutting down");
        self.shared.shutdown.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }

    /// Completes once [`shutdown`](Self::shutdown) has been called.
    pub async fn wait_for_shutdown(&self) {
        self.shared.shutdown.cancelled().await;
    }

    /// Spawns the task that force-closes a connection as soon as the
    /// registry announces its token's revocation.
    ///
    /// The subscription is taken before this returns, so revocations
    /// published afterwards are never missed. If the watcher falls behind
    /// and loses events, the per-connection revocation poll still catches
    /// them.
    pub fn spawn_revocation_watcher(&self) -> JoinHandle<()> {
        let mut events = self.shared.registry.subscribe();
        let hub = Arc::clone(&self.shared.hub);
        let shutdown = self.shared.shutdown.clone();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = events.recv() => event,
                };
                match event {
                    Ok(RegistryEvent::Revoked {
                        token_id,
                        identity,
                        connection: Some(connection_id),
                    }) => {
                        if hub.close(connection_id, CloseReason::Revoked) {
                            tracing::info!(
                                %connection_id,
                                %identity,
                                %token_id,
                                "closing connection of revoked session"
                            );
                        }
                    }
                    Ok(RegistryEvent::Revoked {
                        connection: None, ..
                    }) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "revocation events lagged, relying on polling");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            tracing::debug!("revocation watcher stopped");
        })
    }

    /// Spawns a task that runs `conn` through its whole lifecycle.
    pub fn accept<Conn: Connection>(&self, conn: Conn) -> JoinHandle<CloseReason> {
        let manager = self.clone();
        tokio::spawn(async move { manager.run_connection(conn).await })
    }

    /// Runs one connection to completion on the current task and returns
    /// why it closed.
    pub async fn run_connection<Conn: Connection>(&self, conn: Conn) -> CloseReason {
        let shared = &*self.shared;
        let connection_id = conn.id();
        let mut state = ConnectionState::Connecting;
        let mut writer = Writer::new(&conn, &shared.codec);
        tracing::debug!(%connection_id, "connection accepted");

        // --- Connecting ---
        let token = match conn.presented_token() {
            Some(token) => token.to_string(),
            None => match self.await_authenticate(&conn).await {
                Ok(token) => token,
                Err(reason) => {
                    advance(&mut state, ConnectionState::Closing, connection_id);
                    return finish_unauthenticated(&mut writer, &mut state, connection_id, reason)
                        .await;
                }
            },
        };

        // --- Authenticating ---
        advance(&mut state, ConnectionState::Authenticating, connection_id);
        let admitted = match self.admit(connection_id, &token).await {
            Ok(admitted) => admitted,
            Err(rejection) => {
                tracing::warn!(
                    %connection_id,
                    kind = %rejection.kind,
                    error = %rejection.detail,
                    "authentication rejected"
                );
                advance(&mut state, ConnectionState::Closing, connection_id);
                let reason = CloseReason::Rejected(rejection.kind);
                return finish_unauthenticated(&mut writer, &mut state, connection_id, reason)
                    .await;
            }
        };

        // --- Open ---
        let Admitted {
            claims,
            outbox,
            mut queued,
            mut close_signal,
        } = admitted;
        let cancel = shared.shutdown.child_token();
        let session = SessionHandle::new(
            claims.sub.clone(),
            claims.jti.clone(),
            token,
            cancel.clone(),
        );
        let ctx = ConnectionContext::new(
            connection_id,
            claims.exp,
            outbox,
            Arc::clone(&shared.hub),
            session,
        );

        advance(&mut state, ConnectionState::Open, connection_id);
        tracing::info!(
            %connection_id,
            identity = %claims.sub,
            token_id = %claims.jti,
            "connection opened"
        );

        let ack = SystemMessage::AuthAck {
            identity: claims.sub.clone(),
            connection_id: connection_id.into_inner(),
            expires_at: claims.exp,
            version: PROTOCOL_VERSION,
        };
        let reason = match writer.system(ack).await {
            Ok(()) => {
                shared.handler.on_open(&ctx).await;
                self.serve(&conn, &mut writer, &ctx, &mut queued, &mut close_signal)
                    .await
            }
            Err(e) => CloseReason::TransportFailed(e.to_string()),
        };

        // --- Closing ---
        advance(&mut state, ConnectionState::Closing, connection_id);
        shared.hub.remove(connection_id);
        if let Err(e) = shared
            .registry
            .unbind_connection(&claims.jti, connection_id)
        {
            tracing::warn!(%connection_id, error = %e, "unbind failed");
        }

        let writable = peer_can_read(&reason);
        queued.close();
        match shared.config.outbound_policy {
            OutboundPolicy::Flush if writable => {
                while let Ok(message) = queued.try_recv() {
                    if writer.outbound(message).await.is_err() {
                        break;
                    }
                }
            }
            _ => {
                let dropped = std::iter::from_fn(|| queued.try_recv().ok()).count();
                if dropped > 0 {
                    tracing::debug!(%connection_id, dropped, "queued messages dropped on close");
                }
            }
        }
        if writable {
            let closing = SystemMessage::Closing {
                code: reason.code(),
                reason: reason.to_string(),
            };
            if let Err(e) = writer.system(closing).await {
                tracing::debug!(%connection_id, error = %e, "could not send Closing");
            }
        }

        cancel.cancel();
        shared.handler.on_close(&ctx, &reason).await;
        send_close_frame(&conn, &reason).await;

        advance(&mut state, ConnectionState::Closed, connection_id);
        tracing::info!(
            %connection_id,
            identity = %claims.sub,
            code = reason.code(),
            kind = ?reason.kind(),
            reason = %reason,
            "connection closed"
        );
        reason
    }

    /// Waits for the first frame, which must be `Authenticate`.
    async fn await_authenticate<Conn: Connection>(
        &self,
        conn: &Conn,
    ) -> Result<String, CloseReason> {
        let shared = &*self.shared;
        let frame = tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => return Err(CloseReason::ServerShutdown),
            frame = tokio::time::timeout(shared.config.handshake_timeout, conn.recv()) => frame,
        };

        let data = match frame {
            Err(_) => return Err(CloseReason::HandshakeTimeout),
            Ok(Ok(None)) => return Err(CloseReason::ClientClosed),
            Ok(Err(e)) => return Err(CloseReason::TransportFailed(e.to_string())),
            Ok(Ok(Some(data))) => data,
        };

        match shared.codec.decode::<Envelope>(&data) {
            Ok(Envelope {
                payload: Payload::System(SystemMessage::Authenticate { token }),
                ..
            }) => Ok(token),
            Ok(_) => {
                tracing::debug!(connection_id = %conn.id(), "first message was not Authenticate");
                Err(CloseReason::Rejected(ErrorKind::TokenMalformed))
            }
            Err(e) => {
                tracing::debug!(connection_id = %conn.id(), error = %e, "undecodable first frame");
                Err(CloseReason::Rejected(ErrorKind::TokenMalformed))
            }
        }
    }

    /// Validates the token, binds it, and takes a slot in the hub.
    async fn admit(&self, connection_id: ConnectionId, token: &str) -> Result<Admitted, Rejection> {
        let shared = &*self.shared;

        let claims = shared
            .auth
            .authenticate(token)
            .await
            .map_err(|e| Rejection::new(e.kind(), &e))?;
        claims
            .require_kind(TokenKind::Access)
            .map_err(|e| Rejection::new(e.kind(), &e))?;

        let outcome = shared
            .registry
            .bind_connection(&claims.jti, connection_id)
            .map_err(|e| Rejection::new(e.kind(), &e))?;
        if let BindOutcome::Evicted(previous) = outcome {
            shared.hub.evict(previous, CloseReason::Evicted);
        }

        let (outbox, queued) = mpsc::channel(shared.config.outbound_queue_capacity);
        let (close_tx, close_signal) = mpsc::channel(1);
        let entry = HubEntry::new(claims.sub.clone(), claims.jti.clone(), outbox.clone(), close_tx);

        if let Err(held) = shared.hub.admit(
            connection_id,
            entry,
            shared.config.max_connections_per_identity,
        ) {
            if let Err(e) = shared
                .registry
                .unbind_connection(&claims.jti, connection_id)
            {
                tracing::warn!(%connection_id, error = %e, "unbind after refused admission failed");
            }
            return Err(Rejection::new(
                ErrorKind::ConnectionLimitExceeded,
                format!("{} already holds {held} connection(s)", claims.sub),
            ));
        }

        Ok(Admitted {
            claims,
            outbox,
            queued,
            close_signal,
        })
    }

    /// The `Open` loop. Returns once something decides the connection
    /// must close.
    async fn serve<Conn: Connection>(
        &self,
        conn: &Conn,
        writer: &mut Writer<'_, Conn, C>,
        ctx: &ConnectionContext,
        queued: &mut mpsc::Receiver<Outbound>,
        close_signal: &mut mpsc::Receiver<CloseReason>,
    ) -> CloseReason {
        let shared = &*self.shared;
        let idle_timeout = shared.config.idle_timeout;
        let mut last_activity = Instant::now();

        // The first tick completes immediately, which catches a revocation
        // that landed between bind and admission.
        let mut poll = tokio::time::interval(shared.config.revocation_check_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                Some(reason) = close_signal.recv() => return reason,
                _ = shared.shutdown.cancelled() => return CloseReason::ServerShutdown,
                _ = tokio::time::sleep_until(last_activity + idle_timeout) => {
                    return CloseReason::Idle;
                }
                _ = poll.tick() => {
                    if let Some(reason) = self.check_session(ctx) {
                        return reason;
                    }
                }
                Some(message) = queued.recv() => {
                    if let Err(e) = writer.outbound(message).await {
                        return CloseReason::TransportFailed(e.to_string());
                    }
                }
                frame = conn.recv() => match frame {
                    Ok(Some(data)) => {
                        last_activity = Instant::now();
                        match self.dispatch(writer, ctx, close_signal, data).await {
                            Ok(None) => {}
                            Ok(Some(reason)) => return reason,
                            Err(e) => return CloseReason::TransportFailed(e.to_string()),
                        }
                    }
                    Ok(None) => return CloseReason::ClientClosed,
                    Err(e) => return CloseReason::TransportFailed(e.to_string()),
                },
            }
        }
    }

    /// The revocation poll. Expiry is checked first so an expired token
    /// closes as `Expired`, not `Revoked`.
    fn check_session(&self, ctx: &ConnectionContext) -> Option<CloseReason> {
        let shared = &*self.shared;
        if Utc::now().timestamp() >= ctx.expires_at() {
            return Some(CloseReason::Expired);
        }
        match shared.registry.is_revoked(ctx.token_id()) {
            Ok(false) => None,
            Ok(true) => Some(CloseReason::Revoked),
            Err(e) => {
                tracing::warn!(
                    connection_id = %ctx.connection_id(),
                    kind = %e.kind(),
                    error = %e,
                    "revocation check failed"
                );
                shared
                    .config
                    .close_on_store_unavailable
                    .then_some(CloseReason::StoreUnavailable)
            }
        }
    }

    /// Handles one inbound frame on an open connection.
    async fn dispatch<Conn: Connection>(
        &self,
        writer: &mut Writer<'_, Conn, C>,
        ctx: &ConnectionContext,
        close_signal: &mut mpsc::Receiver<CloseReason>,
        data: Vec<u8>,
    ) -> Result<Option<CloseReason>, GatehouseError> {
        let shared = &*self.shared;
        let connection_id = ctx.connection_id();

        let envelope: Envelope = match shared.codec.decode(&data) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::debug!(%connection_id, error = %e, "failed to decode envelope");
                writer.error(400, "malformed envelope").await?;
                return Ok(None);
            }
        };

        let message = match envelope.payload {
            Payload::App(bytes) => return self.run_handler(writer, ctx, close_signal, bytes).await,
            Payload::System(message) => message,
        };

        match message {
            SystemMessage::Heartbeat { client_time } => {
                let server_time = writer.elapsed_ms();
                writer
                    .system(SystemMessage::HeartbeatAck {
                        client_time,
                        server_time,
                    })
                    .await?;
            }
            SystemMessage::JoinRoom { room } => {
                if ctx.join_room(&room) {
                    tracing::debug!(%connection_id, %room, "joined room");
                    writer.system(SystemMessage::RoomJoined { room }).await?;
                } else {
                    writer.error(409, "connection is closing").await?;
                }
            }
            SystemMessage::LeaveRoom { room } => {
                if !ctx.leave_room(&room) {
                    writer.error(404, &format!("not a member of {room}")).await?;
                }
            }
            SystemMessage::Disconnect { reason } => {
                return Ok(Some(CloseReason::ClientRequested(reason)));
            }
            SystemMessage::Authenticate { .. } => {
                writer.error(409, "already authenticated").await?;
            }
            other => {
                tracing::debug!(%connection_id, message = ?other, "unexpected system message");
                writer.error(400, "unexpected system message").await?;
            }
        }
        Ok(None)
    }

    /// Runs the message handler. A close signal arriving meanwhile cancels
    /// the session (aborting gateway calls) and is honoured once the
    /// handler returns.
    async fn run_handler<Conn: Connection>(
        &self,
        writer: &mut Writer<'_, Conn, C>,
        ctx: &ConnectionContext,
        close_signal: &mut mpsc::Receiver<CloseReason>,
        data: Vec<u8>,
    ) -> Result<Option<CloseReason>, GatehouseError> {
        let handled = self.shared.handler.on_message(ctx, data);
        tokio::pin!(handled);

        let mut pending = None;
        let result = loop {
            tokio::select! {
                biased;
                result = &mut handled => break result,
                Some(reason) = close_signal.recv(), if pending.is_none() => {
                    ctx.session().cancellation().cancel();
                    pending = Some(reason);
                }
            }
        };

        if pending.is_some() {
            return Ok(pending);
        }
        if let Err(e) = result {
            tracing::debug!(
                connection_id = %ctx.connection_id(),
                code = e.code(),
                error = %e,
                "message handler failed"
            );
            writer.error(e.code(), &e.to_string()).await?;
        }
        Ok(None)
    }
}

/// Writes envelopes with this connection's sequence numbers.
struct Writer<'a, Conn, C> {
    conn: &'a Conn,
    codec: &'a C,
    seq: u64,
    started: Instant,
}

impl<'a, Conn: Connection, C: Codec> Writer<'a, Conn, C> {
    fn new(conn: &'a Conn, codec: &'a C) -> Self {
        Self {
            conn,
            codec,
            seq: 0,
            started: Instant::now(),
        }
    }

    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn next_seq(&mut self) -> u64 {
        let current = self.seq;
        self.seq += 1;
        current
    }

    async fn system(&mut self, message: SystemMessage) -> Result<(), GatehouseError> {
        let envelope = Envelope::system(self.next_seq(), self.elapsed_ms(), message);
        self.write(&envelope).await
    }

    async fn outbound(&mut self, message: Outbound) -> Result<(), GatehouseError> {
        let envelope = match message {
            Outbound::App(data) => Envelope::app(self.next_seq(), self.elapsed_ms(), data),
            Outbound::System(message) => {
                Envelope::system(self.next_seq(), self.elapsed_ms(), message)
            }
        };
        self.write(&envelope).await
    }

    async fn error(&mut self, code: u16, message: &str) -> Result<(), GatehouseError> {
        self.system(SystemMessage::Error {
            code,
            message: message.to_string(),
        })
        .await
    }

    async fn write(&mut self, envelope: &Envelope) -> Result<(), GatehouseError> {
        let bytes = self.codec.encode(envelope)?;
        self.conn.send(&bytes).await?;
        Ok(())
    }
}

/// Closes a connection that never reached `Open`.
async fn finish_unauthenticated<Conn: Connection, C: Codec>(
    writer: &mut Writer<'_, Conn, C>,
    state: &mut ConnectionState,
    connection_id: ConnectionId,
    reason: CloseReason,
) -> CloseReason {
    if peer_can_read(&reason) {
        let notice = match &reason {
            CloseReason::Rejected(kind) => SystemMessage::Rejected {
                kind: *kind,
                message: rejection_message(*kind).to_string(),
            },
            other => SystemMessage::Closing {
                code: other.code(),
                reason: other.to_string(),
            },
        };
        if let Err(e) = writer.system(notice).await {
            tracing::debug!(%connection_id, error = %e, "could not send rejection");
        }
    }
    send_close_frame(writer.conn, &reason).await;
    advance(state, ConnectionState::Closed, connection_id);
    tracing::debug!(%connection_id, code = reason.code(), reason = %reason, "connection closed before open");
    reason
}

async fn send_close_frame<Conn: Connection>(conn: &Conn, reason: &CloseReason) {
    if !peer_can_read(reason) {
        return;
    }
    if let Err(e) = conn.close(reason.code(), &reason.to_string()).await {
        tracing::debug!(connection_id = %conn.id(), error = %e, "close frame not sent");
    }
}

/// `false` when the peer is already gone and writing would only fail.
fn peer_can_read(reason: &CloseReason) -> bool {
    !matches!(
        reason,
        CloseReason::ClientClosed | CloseReason::TransportFailed(_)
    )
}

fn advance(state: &mut ConnectionState, next: ConnectionState, connection_id: ConnectionId) {
    if !state.can_transition_to(next) {
        tracing::warn!(%connection_id, from = %state, to = %next, "unexpected state transition");
    }
    tracing::debug!(%connection_id, from = %state, to = %next, "connection state changed");
    *state = next;
}

/// What a rejected client is told. Never includes internal detail.
fn rejection_message(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::TokenExpired => "token expired, refresh and reconnect",
        ErrorKind::TokenRevoked => "token revoked",
        ErrorKind::TokenMalformed => "malformed or missing token",
        ErrorKind::TokenSignatureMismatch => "token signature mismatch",
        ErrorKind::WrongTokenKind => "an access token is required",
        ErrorKind::ConnectionBindConflict => "token already in use by another connection",
        ErrorKind::ConnectionLimitExceeded => "too many open connections",
        ErrorKind::InternalStoreUnavailable => "session store unavailable, try again",
        _ => "authentication failed",
    }
}
