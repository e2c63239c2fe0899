//! Connection lifecycle tests over in-memory connections.
//!
//! Time-dependent behavior (idle timeout, revocation polling, handshake
//! timeout) runs under a paused tokio clock, so a 30 second timeout takes
//! no wall-clock time.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use gatehouse::prelude::*;
use gatehouse_auth::SessionToken;
use gatehouse_session::{BindOutcome, MemoryStore, SessionRecord, SessionStore};
use gatehouse_transport::MemoryFrame;
use tokio::task::JoinHandle;
use tokio::time::Instant;

const SIGNING_SECRET: &[u8] = b"lifecycle-tests-signing-secret!!";

// =========================================================================
// Handlers
// =========================================================================

/// Echoes every message back; "fail" is refused with 422.
struct Echo;

impl MessageHandler for Echo {
    async fn on_message(&self, ctx: &ConnectionContext, data: Vec<u8>) -> Result<(), HandlerError> {
        if data == b"fail" {
            return Err(HandlerError::rejected(422, "refused"));
        }
        ctx.send(data)
    }
}

/// Relays every message to everyone else in "lobby".
struct Relay;

impl MessageHandler for Relay {
    async fn on_message(&self, ctx: &ConnectionContext, data: Vec<u8>) -> Result<(), HandlerError> {
        ctx.broadcast("lobby", &data);
        Ok(())
    }
}

// =========================================================================
// A store that can be switched off
// =========================================================================

#[derive(Default)]
struct FlakyStore {
    inner: MemoryStore,
    down: AtomicBool,
}

impl FlakyStore {
    fn check(&self) -> Result<(), SessionError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(SessionError::StoreUnavailable("connection refused".into()));
        }
        Ok(())
    }
}

impl SessionStore for FlakyStore {
    fn insert(&self, record: SessionRecord) -> Result<(), SessionError> {
        self.check()?;
        self.inner.insert(record)
    }
    fn get(&self, token_id: &TokenId) -> Result<Option<SessionRecord>, SessionError> {
        self.check()?;
        self.inner.get(token_id)
    }
    fn revoke(&self, token_id: &TokenId) -> Result<Option<SessionRecord>, SessionError> {
        self.check()?;
        self.inner.revoke(token_id)
    }
    fn bind(
        &self,
        token_id: &TokenId,
        connection: ConnectionId,
        policy: BindPolicy,
        now: i64,
    ) -> Result<BindOutcome, SessionError> {
        self.check()?;
        self.inner.bind(token_id, connection, policy, now)
    }
    fn unbind(&self, token_id: &TokenId, connection: ConnectionId) -> Result<bool, SessionError> {
        self.check()?;
        self.inner.unbind(token_id, connection)
    }
    fn remove_if_expired(
        &self,
        token_id: &TokenId,
        now: i64,
    ) -> Result<Option<SessionRecord>, SessionError> {
        self.check()?;
        self.inner.remove_if_expired(token_id, now)
    }
    fn remove_expired(&self, now: i64) -> Result<Vec<SessionRecord>, SessionError> {
        self.check()?;
        self.inner.remove_expired(now)
    }
    fn tokens_of(&self, identity: &Identity) -> Result<Vec<TokenId>, SessionError> {
        self.check()?;
        self.inner.tokens_of(identity)
    }
    fn count(&self) -> Result<usize, SessionError> {
        self.check()?;
        self.inner.count()
    }
}

// =========================================================================
// Fixture
// =========================================================================

struct Fixture<H: MessageHandler> {
    issuer: Arc<TokenIssuer>,
    registry: Arc<SessionRegistry>,
    manager: SocketSessionManager<TokenAuthenticator, H, JsonCodec>,
}

fn fixture<H: MessageHandler>(handler: H, socket: SocketConfig) -> Fixture<H> {
    fixture_with(handler, socket, RegistryConfig::default(), Arc::new(MemoryStore::new()))
}

fn fixture_with<H: MessageHandler>(
    handler: H,
    socket: SocketConfig,
    registry: RegistryConfig,
    store: Arc<dyn SessionStore>,
) -> Fixture<H> {
    let issuer = Arc::new(TokenIssuer::new(SIGNING_SECRET, TokenConfig::default()).unwrap());
    let registry = Arc::new(SessionRegistry::with_store(store, registry));
    let auth = TokenAuthenticator::new(Arc::clone(&issuer), Arc::clone(&registry));
    let manager = SocketSessionManager::new(auth, Arc::clone(&registry), handler, JsonCodec, socket);
    Fixture {
        issuer,
        registry,
        manager,
    }
}

impl<H: MessageHandler> Fixture<H> {
    /// Issues and registers an access token.
    fn token(&self, who: &str) -> SessionToken {
        let token = self
            .issuer
            .issue(&Identity::from(who), Duration::from_secs(3600))
            .unwrap();
        self.registry.register(token.claims()).unwrap();
        token
    }

    fn connect(&self, token: &SessionToken) -> (JoinHandle<CloseReason>, MemoryPeer) {
        let (conn, peer) = MemoryConnection::pair(Some(token.as_str().to_string()));
        (self.manager.accept(conn), peer)
    }

    /// Connects and waits for the `AuthAck`.
    async fn open(&self, token: &SessionToken) -> (JoinHandle<CloseReason>, MemoryPeer) {
        let (task, mut peer) = self.connect(token);
        let ack = next_system(&mut peer).await;
        assert!(
            matches!(ack, SystemMessage::AuthAck { .. }),
            "expected AuthAck, got {ack:?}"
        );
        (task, peer)
    }
}

fn send_system(peer: &MemoryPeer, message: SystemMessage) {
    let bytes = serde_json::to_vec(&Envelope::system(0, 0, message)).unwrap();
    peer.send(bytes).unwrap();
}

fn send_app(peer: &MemoryPeer, data: &[u8]) {
    let bytes = serde_json::to_vec(&Envelope::app(0, 0, data.to_vec())).unwrap();
    peer.send(bytes).unwrap();
}

async fn next_envelope(peer: &mut MemoryPeer) -> Envelope {
    match peer.recv().await {
        Some(MemoryFrame::Data(bytes)) => serde_json::from_slice(&bytes).unwrap(),
        other => panic!("expected a data frame, got {other:?}"),
    }
}

async fn next_system(peer: &mut MemoryPeer) -> SystemMessage {
    match next_envelope(peer).await.payload {
        Payload::System(message) => message,
        Payload::App(data) => panic!("expected a system message, got app data {data:?}"),
    }
}

async fn next_app(peer: &mut MemoryPeer) -> Vec<u8> {
    match next_envelope(peer).await.payload {
        Payload::App(data) => data,
        Payload::System(message) => panic!("expected app data, got {message:?}"),
    }
}

/// Skips data frames until the close frame; returns its code.
async fn close_code(peer: &mut MemoryPeer) -> u16 {
    loop {
        match peer.recv().await {
            Some(MemoryFrame::Close { code, .. }) => return code,
            Some(MemoryFrame::Data(_)) => continue,
            None => panic!("server dropped the connection without a close frame"),
        }
    }
}

// =========================================================================
// Authentication
// =========================================================================

#[tokio::test]
async fn test_upgrade_token_opens_connection() {
    let fx = fixture(Echo, SocketConfig::default());
    let token = fx.token("alice");
    let (_task, mut peer) = fx.connect(&token);

    match next_system(&mut peer).await {
        SystemMessage::AuthAck {
            identity,
            expires_at,
            ..
        } => {
            assert_eq!(identity, Identity::from("alice"));
            assert_eq!(expires_at, token.claims().exp);
        }
        other => panic!("expected AuthAck, got {other:?}"),
    }
    assert_eq!(fx.manager.hub().len(), 1);
}

#[tokio::test]
async fn test_authenticate_message_opens_connection() {
    let fx = fixture(Echo, SocketConfig::default());
    let token = fx.token("alice");
    let (conn, mut peer) = MemoryConnection::pair(None);
    let _task = fx.manager.accept(conn);

    send_system(
        &peer,
        SystemMessage::Authenticate {
            token: token.as_str().to_string(),
        },
    );

    assert!(matches!(
        next_system(&mut peer).await,
        SystemMessage::AuthAck { .. }
    ));
}

#[tokio::test]
async fn test_revoked_token_is_rejected_before_open() {
    let fx = fixture(Echo, SocketConfig::default());
    let token = fx.token("alice");
    fx.registry.revoke(&token.claims().jti).unwrap();

    let (task, mut peer) = fx.connect(&token);

    match next_system(&mut peer).await {
        SystemMessage::Rejected { kind, .. } => assert_eq!(kind, ErrorKind::TokenRevoked),
        other => panic!("expected Rejected, got {other:?}"),
    }
    assert_eq!(close_code(&mut peer).await, gatehouse::CLOSE_UNAUTHORIZED);
    assert_eq!(
        task.await.unwrap(),
        CloseReason::Rejected(ErrorKind::TokenRevoked)
    );
    assert!(fx.manager.hub().is_empty());
}

#[tokio::test]
async fn test_refresh_token_is_rejected_as_wrong_kind() {
    let fx = fixture(Echo, SocketConfig::default());
    let refresh = fx
        .issuer
        .issue_refresh(&Identity::from("alice"), Duration::from_secs(3600))
        .unwrap();
    fx.registry.register(refresh.claims()).unwrap();

    let (_task, mut peer) = fx.connect(&refresh);

    match next_system(&mut peer).await {
        SystemMessage::Rejected { kind, .. } => assert_eq!(kind, ErrorKind::WrongTokenKind),
        other => panic!("expected Rejected, got {other:?}"),
    }
}

#[tokio::test]
async fn test_garbage_token_is_rejected_as_malformed() {
    let fx = fixture(Echo, SocketConfig::default());
    let (conn, mut peer) = MemoryConnection::pair(Some("not-a-token".into()));
    let _task = fx.manager.accept(conn);

    match next_system(&mut peer).await {
        SystemMessage::Rejected { kind, message } => {
            assert_eq!(kind, ErrorKind::TokenMalformed);
            assert!(!message.contains("not-a-token"));
        }
        other => panic!("expected Rejected, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_handshake_timeout_closes_unauthenticated() {
    let fx = fixture(Echo, SocketConfig::default());
    let (conn, mut peer) = MemoryConnection::pair(None);
    let start = Instant::now();
    let task = fx.manager.accept(conn);

    assert_eq!(close_code(&mut peer).await, gatehouse::CLOSE_UNAUTHORIZED);
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(5) && elapsed < Duration::from_secs(6));
    assert_eq!(task.await.unwrap(), CloseReason::HandshakeTimeout);
}

// =========================================================================
// Binding and limits
// =========================================================================

#[tokio::test]
async fn test_second_bind_under_reject_policy_is_conflict() {
    let fx = fixture_with(
        Echo,
        SocketConfig::default(),
        RegistryConfig {
            bind_policy: BindPolicy::Reject,
            ..RegistryConfig::default()
        },
        Arc::new(MemoryStore::new()),
    );
    let token = fx.token("alice");
    let (_first, _first_peer) = fx.open(&token).await;

    let (_second, mut second_peer) = fx.connect(&token);
    match next_system(&mut second_peer).await {
        SystemMessage::Rejected { kind, .. } => {
            assert_eq!(kind, ErrorKind::ConnectionBindConflict);
        }
        other => panic!("expected Rejected, got {other:?}"),
    }
    assert_eq!(close_code(&mut second_peer).await, gatehouse::CLOSE_FORBIDDEN);
    assert_eq!(fx.manager.hub().len(), 1);
}

#[tokio::test]
async fn test_second_bind_under_evict_policy_closes_first() {
    let fx = fixture(Echo, SocketConfig::default());
    let token = fx.token("alice");
    let (first, mut first_peer) = fx.open(&token).await;

    let (_second, _second_peer) = fx.open(&token).await;

    assert_eq!(close_code(&mut first_peer).await, gatehouse::CLOSE_EVICTED);
    assert_eq!(first.await.unwrap(), CloseReason::Evicted);

    let record = fx.registry.get(&token.claims().jti).unwrap().unwrap();
    assert!(record.connection.is_some(), "the new connection keeps the binding");
    assert_eq!(fx.manager.hub().len(), 1);
}

#[tokio::test]
async fn test_connection_limit_per_identity() {
    let fx = fixture(
        Echo,
        SocketConfig {
            max_connections_per_identity: 1,
            ..SocketConfig::default()
        },
    );
    let (_first, _first_peer) = fx.open(&fx.token("alice")).await;

    let (_second, mut second_peer) = fx.connect(&fx.token("alice"));
    match next_system(&mut second_peer).await {
        SystemMessage::Rejected { kind, .. } => {
            assert_eq!(kind, ErrorKind::ConnectionLimitExceeded);
        }
        other => panic!("expected Rejected, got {other:?}"),
    }

    // Someone else is unaffected.
    let (_bob, _bob_peer) = fx.open(&fx.token("bob")).await;
}

#[tokio::test]
async fn test_client_disconnect_unbinds_session() {
    let fx = fixture(Echo, SocketConfig::default());
    let token = fx.token("alice");
    let (task, mut peer) = fx.open(&token).await;

    send_system(
        &peer,
        SystemMessage::Disconnect {
            reason: "bye".into(),
        },
    );

    assert_eq!(close_code(&mut peer).await, 1000);
    assert_eq!(
        task.await.unwrap(),
        CloseReason::ClientRequested("bye".into())
    );
    let record = fx.registry.get(&token.claims().jti).unwrap().unwrap();
    assert_eq!(record.connection, None);
    assert!(!record.revoked, "closing a socket doesn't log the session out");
    assert!(fx.manager.hub().is_empty());
}

#[tokio::test]
async fn test_peer_hang_up_closes_cleanly() {
    let fx = fixture(Echo, SocketConfig::default());
    let (task, mut peer) = fx.open(&fx.token("alice")).await;

    peer.hang_up();

    assert_eq!(task.await.unwrap(), CloseReason::ClientClosed);
    assert!(fx.manager.hub().is_empty());
}

// =========================================================================
// Timeouts and revocation
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_idle_connection_closes_after_timeout() {
    let fx = fixture(
        Echo,
        SocketConfig {
            idle_timeout: Duration::from_secs(30),
            ..SocketConfig::default()
        },
    );
    let (task, mut peer) = fx.open(&fx.token("alice")).await;
    let start = Instant::now();

    assert_eq!(close_code(&mut peer).await, gatehouse::CLOSE_IDLE);
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(30), "closed early: {elapsed:?}");
    assert!(elapsed <= Duration::from_secs(31), "closed late: {elapsed:?}");
    assert_eq!(task.await.unwrap(), CloseReason::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_counts_as_activity() {
    let fx = fixture(
        Echo,
        SocketConfig {
            idle_timeout: Duration::from_secs(30),
            ..SocketConfig::default()
        },
    );
    let (_task, mut peer) = fx.open(&fx.token("alice")).await;

    tokio::time::sleep(Duration::from_secs(20)).await;
    send_system(&peer, SystemMessage::Heartbeat { client_time: 7 });
    assert!(matches!(
        next_system(&mut peer).await,
        SystemMessage::HeartbeatAck { client_time: 7, .. }
    ));

    // 40s after open, 20s after the heartbeat: still open.
    tokio::time::sleep(Duration::from_secs(20)).await;
    send_system(&peer, SystemMessage::Heartbeat { client_time: 8 });
    assert!(matches!(
        next_system(&mut peer).await,
        SystemMessage::HeartbeatAck { client_time: 8, .. }
    ));
}

#[tokio::test(start_paused = true)]
async fn test_revocation_poll_closes_within_interval() {
    let fx = fixture(
        Echo,
        SocketConfig {
            revocation_check_interval: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(600),
            ..SocketConfig::default()
        },
    );
    let token = fx.token("alice");
    let (task, mut peer) = fx.open(&token).await;

    // No watcher running: only the poll can notice.
    let start = Instant::now();
    assert!(fx.registry.revoke(&token.claims().jti).unwrap());

    assert_eq!(close_code(&mut peer).await, gatehouse::CLOSE_REVOKED);
    assert!(start.elapsed() <= Duration::from_secs(5));
    assert_eq!(task.await.unwrap(), CloseReason::Revoked);
}

#[tokio::test(start_paused = true)]
async fn test_revocation_watcher_closes_immediately() {
    let fx = fixture(
        Echo,
        SocketConfig {
            revocation_check_interval: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(600),
            ..SocketConfig::default()
        },
    );
    let _watcher = fx.manager.spawn_revocation_watcher();
    let token = fx.token("alice");
    let (_task, mut peer) = fx.open(&token).await;

    let start = Instant::now();
    fx.registry.revoke(&token.claims().jti).unwrap();

    assert_eq!(close_code(&mut peer).await, gatehouse::CLOSE_REVOKED);
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn test_store_outage_keeps_open_connection_by_default() {
    let store = Arc::new(FlakyStore::default());
    let fx = fixture_with(
        Echo,
        SocketConfig {
            revocation_check_interval: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(600),
            ..SocketConfig::default()
        },
        RegistryConfig::default(),
        store.clone(),
    );
    let (_task, mut peer) = fx.open(&fx.token("alice")).await;

    store.down.store(true, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(20)).await;

    send_app(&peer, b"still here?");
    assert_eq!(next_app(&mut peer).await, b"still here?");
}

#[tokio::test(start_paused = true)]
async fn test_store_outage_closes_when_configured() {
    let store = Arc::new(FlakyStore::default());
    let fx = fixture_with(
        Echo,
        SocketConfig {
            revocation_check_interval: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(600),
            close_on_store_unavailable: true,
            ..SocketConfig::default()
        },
        RegistryConfig::default(),
        store.clone(),
    );
    let (task, mut peer) = fx.open(&fx.token("alice")).await;

    store.down.store(true, Ordering::SeqCst);

    assert_eq!(close_code(&mut peer).await, 1011);
    assert_eq!(task.await.unwrap(), CloseReason::StoreUnavailable);
}

#[tokio::test]
async fn test_store_outage_fails_new_authentication_closed() {
    let store = Arc::new(FlakyStore::default());
    let fx = fixture_with(
        Echo,
        SocketConfig::default(),
        RegistryConfig::default(),
        store.clone(),
    );
    let token = fx.token("alice");
    store.down.store(true, Ordering::SeqCst);

    let (_task, mut peer) = fx.connect(&token);
    match next_system(&mut peer).await {
        SystemMessage::Rejected { kind, .. } => {
            assert_eq!(kind, ErrorKind::InternalStoreUnavailable);
        }
        other => panic!("expected Rejected, got {other:?}"),
    }
}

#[tokio::test]
async fn test_shutdown_closes_every_connection() {
    let fx = fixture(Echo, SocketConfig::default());
    let (first, mut first_peer) = fx.open(&fx.token("alice")).await;
    let (second, mut second_peer) = fx.open(&fx.token("bob")).await;

    fx.manager.shutdown();

    assert_eq!(close_code(&mut first_peer).await, 1001);
    assert_eq!(close_code(&mut second_peer).await, 1001);
    assert_eq!(first.await.unwrap(), CloseReason::ServerShutdown);
    assert_eq!(second.await.unwrap(), CloseReason::ServerShutdown);
}

// =========================================================================
// Messages and rooms
// =========================================================================

#[tokio::test]
async fn test_app_message_reaches_handler() {
    let fx = fixture(Echo, SocketConfig::default());
    let (_task, mut peer) = fx.open(&fx.token("alice")).await;

    send_app(&peer, b"hello");
    assert_eq!(next_app(&mut peer).await, b"hello");
}

#[tokio::test]
async fn test_handler_error_is_reported_without_closing() {
    let fx = fixture(Echo, SocketConfig::default());
    let (_task, mut peer) = fx.open(&fx.token("alice")).await;

    send_app(&peer, b"fail");
    match next_system(&mut peer).await {
        SystemMessage::Error { code, .. } => assert_eq!(code, 422),
        other => panic!("expected Error, got {other:?}"),
    }

    send_app(&peer, b"again");
    assert_eq!(next_app(&mut peer).await, b"again");
}

#[tokio::test]
async fn test_malformed_frame_is_reported_without_closing() {
    let fx = fixture(Echo, SocketConfig::default());
    let (_task, mut peer) = fx.open(&fx.token("alice")).await;

    peer.send(b"{ not json".to_vec()).unwrap();
    match next_system(&mut peer).await {
        SystemMessage::Error { code, .. } => assert_eq!(code, 400),
        other => panic!("expected Error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_second_authenticate_is_conflict() {
    let fx = fixture(Echo, SocketConfig::default());
    let token = fx.token("alice");
    let (_task, mut peer) = fx.open(&token).await;

    send_system(
        &peer,
        SystemMessage::Authenticate {
            token: token.as_str().to_string(),
        },
    );
    match next_system(&mut peer).await {
        SystemMessage::Error { code, .. } => assert_eq!(code, 409),
        other => panic!("expected Error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_room_broadcast_reaches_other_members_only() {
    let fx = fixture(Relay, SocketConfig::default());
    let (_alice, mut alice) = fx.open(&fx.token("alice")).await;
    let (_bob, mut bob) = fx.open(&fx.token("bob")).await;
    let (_carol, mut carol) = fx.open(&fx.token("carol")).await;

    for peer in [&mut alice, &mut bob] {
        send_system(
            peer,
            SystemMessage::JoinRoom {
                room: "lobby".into(),
            },
        );
        assert_eq!(
            next_system(peer).await,
            SystemMessage::RoomJoined {
                room: "lobby".into()
            }
        );
    }

    send_app(&alice, b"hi all");
    assert_eq!(next_app(&mut bob).await, b"hi all");

    // Neither the sender nor a non-member receives it.
    send_system(&alice, SystemMessage::Heartbeat { client_time: 1 });
    assert!(matches!(
        next_system(&mut alice).await,
        SystemMessage::HeartbeatAck { .. }
    ));
    assert!(carol.try_recv().is_none());
}

#[tokio::test]
async fn test_closed_connection_leaves_its_rooms() {
    let fx = fixture(Relay, SocketConfig::default());
    let (task, mut alice) = fx.open(&fx.token("alice")).await;
    send_system(
        &alice,
        SystemMessage::JoinRoom {
            room: "lobby".into(),
        },
    );
    next_system(&mut alice).await;
    assert_eq!(fx.manager.hub().room_members("lobby").len(), 1);

    alice.hang_up();
    task.await.unwrap();

    assert!(fx.manager.hub().room_members("lobby").is_empty());
}

#[tokio::test]
async fn test_hub_send_to_identity_is_written_by_connection_task() {
    let fx = fixture(Echo, SocketConfig::default());
    let (_task, mut peer) = fx.open(&fx.token("alice")).await;

    let delivered = fx
        .manager
        .hub()
        .send_to_identity(&Identity::from("alice"), b"notice");

    assert_eq!(delivered, 1);
    assert_eq!(next_app(&mut peer).await, b"notice");
}
