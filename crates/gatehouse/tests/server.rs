//! End-to-end tests over real WebSocket connections.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use gatehouse::prelude::*;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;

const SIGNING_SECRET: &[u8] = b"server-tests-signing-secret-32by";

// =========================================================================
// Handler
// =========================================================================

/// Echoes every message back to the sender.
struct Echo;

impl MessageHandler for Echo {
    async fn on_message(&self, ctx: &ConnectionContext, data: Vec<u8>) -> Result<(), HandlerError> {
        ctx.send(data)
    }
}

// =========================================================================
// Helpers
// =========================================================================

type ClientWs = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

struct Running {
    addr: String,
    service: AuthService,
    manager: SocketSessionManager<TokenAuthenticator, Echo, JsonCodec>,
    server: tokio::task::JoinHandle<Result<(), GatehouseError>>,
}

/// Starts a server on a random port with one credential: alice / "correct horse".
async fn start_server() -> Running {
    let hasher = SecretHasher::new(&HashingConfig {
        memory_kib: 256,
        iterations: 1,
        parallelism: 1,
    })
    .expect("hasher");
    let store = InMemoryCredentialStore::new();
    store.insert(
        CredentialRecord::create(
            &hasher,
            Identity::from("alice"),
            HashAlgorithm::Argon2id,
            "correct horse",
        )
        .expect("credential"),
    );
    let verifier = CredentialVerifier::new(Arc::new(store), &hasher).expect("verifier");
    let issuer = Arc::new(TokenIssuer::new(SIGNING_SECRET, TokenConfig::default()).expect("issuer"));
    let registry = Arc::new(SessionRegistry::new(RegistryConfig::default()));
    let service = AuthService::new(Arc::new(verifier), issuer, Arc::clone(&registry));

    let server = GatehouseServerBuilder::new()
        .bind("127.0.0.1:0")
        .build(service.authenticator(), registry, Echo)
        .await
        .expect("server should build");

    let addr = server
        .local_addr()
        .expect("should have local addr")
        .to_string();
    let manager = server.manager().clone();

    let server = tokio::spawn(server.run());

    // Give the accept loop a moment to start.
    tokio::time::sleep(Duration::from_millis(10)).await;
    Running {
        addr,
        service,
        manager,
        server,
    }
}

async fn login(running: &Running) -> TokenPair {
    running
        .service
        .login(&Identity::from("alice"), "correct horse")
        .await
        .expect("login")
}

async fn connect(url: String) -> ClientWs {
    let (ws, _) = tokio_tungstenite::connect_async(url)
        .await
        .expect("should connect");
    ws
}

fn encode(payload: Payload) -> Message {
    let envelope = Envelope {
        seq: 0,
        timestamp: 0,
        payload,
    };
    Message::Binary(serde_json::to_vec(&envelope).expect("encode").into())
}

async fn next_payload(ws: &mut ClientWs) -> Payload {
    loop {
        let msg = ws.next().await.expect("stream ended").expect("recv");
        match msg {
            Message::Binary(_) | Message::Text(_) => {
                let env: Envelope = serde_json::from_slice(&msg.into_data()).expect("decode");
                return env.payload;
            }
            Message::Close(frame) => panic!("unexpected close: {frame:?}"),
            _ => continue,
        }
    }
}

/// Reads until the close frame and returns its code.
async fn close_code(ws: &mut ClientWs) -> u16 {
    while let Some(msg) = ws.next().await {
        if let Ok(Message::Close(frame)) = msg {
            return frame.map(|f| u16::from(f.code)).unwrap_or(1005);
        }
    }
    panic!("stream ended without a close frame");
}

// =========================================================================
// Tests
// =========================================================================

#[tokio::test]
async fn test_query_token_handshake_acks() {
    let running = start_server().await;
    let pair = login(&running).await;

    let mut ws = connect(format!("ws://{}/?token={}", running.addr, pair.access.as_str())).await;

    match next_payload(&mut ws).await {
        Payload::System(SystemMessage::AuthAck {
            identity, version, ..
        }) => {
            assert_eq!(identity, Identity::from("alice"));
            assert_eq!(version, PROTOCOL_VERSION);
        }
        other => panic!("expected AuthAck, got {other:?}"),
    }
}

#[tokio::test]
async fn test_bearer_header_handshake_acks() {
    let running = start_server().await;
    let pair = login(&running).await;

    let mut request = format!("ws://{}/", running.addr)
        .into_client_request()
        .expect("request");
    request.headers_mut().insert(
        "Authorization",
        HeaderValue::from_str(&format!("Bearer {}", pair.access.as_str())).expect("header"),
    );
    let (mut ws, _) = tokio_tungstenite::connect_async(request)
        .await
        .expect("should connect");

    assert!(matches!(
        next_payload(&mut ws).await,
        Payload::System(SystemMessage::AuthAck { .. })
    ));
}

#[tokio::test]
async fn test_authenticate_message_handshake_then_echo() {
    let running = start_server().await;
    let pair = login(&running).await;
    let mut ws = connect(format!("ws://{}/", running.addr)).await;

    ws.send(encode(Payload::System(SystemMessage::Authenticate {
        token: pair.access.as_str().to_string(),
    })))
    .await
    .expect("send");
    assert!(matches!(
        next_payload(&mut ws).await,
        Payload::System(SystemMessage::AuthAck { .. })
    ));

    ws.send(encode(Payload::App(b"ping".to_vec())))
        .await
        .expect("send");
    assert_eq!(next_payload(&mut ws).await, Payload::App(b"ping".to_vec()));
}

#[tokio::test]
async fn test_revoked_token_is_rejected() {
    let running = start_server().await;
    let pair = login(&running).await;
    assert!(running.service.logout(pair.access.as_str()).expect("logout"));

    let mut ws = connect(format!("ws://{}/?token={}", running.addr, pair.access.as_str())).await;

    match next_payload(&mut ws).await {
        Payload::System(SystemMessage::Rejected { kind, .. }) => {
            assert_eq!(kind, ErrorKind::TokenRevoked);
        }
        other => panic!("expected Rejected, got {other:?}"),
    }
    assert_eq!(close_code(&mut ws).await, gatehouse::CLOSE_UNAUTHORIZED);
}

#[tokio::test]
async fn test_logout_closes_live_socket() {
    let running = start_server().await;
    let pair = login(&running).await;
    let mut ws = connect(format!("ws://{}/?token={}", running.addr, pair.access.as_str())).await;
    next_payload(&mut ws).await;

    running.service.logout(pair.access.as_str()).expect("logout");

    let code = tokio::time::timeout(Duration::from_secs(2), close_code(&mut ws))
        .await
        .expect("closed promptly");
    assert_eq!(code, gatehouse::CLOSE_REVOKED);
}

#[tokio::test]
async fn test_refreshed_pair_opens_new_socket() {
    let running = start_server().await;
    let pair = login(&running).await;
    let fresh = running
        .service
        .refresh(pair.refresh.as_str())
        .expect("refresh");

    let mut ws = connect(format!("ws://{}/?token={}", running.addr, fresh.access.as_str())).await;
    assert!(matches!(
        next_payload(&mut ws).await,
        Payload::System(SystemMessage::AuthAck { .. })
    ));
}

#[tokio::test]
async fn test_shutdown_stops_server_and_closes_sockets() {
    let running = start_server().await;
    let pair = login(&running).await;
    let mut ws = connect(format!("ws://{}/?token={}", running.addr, pair.access.as_str())).await;
    next_payload(&mut ws).await;

    running.manager.shutdown();

    assert_eq!(close_code(&mut ws).await, 1001);
    let result = tokio::time::timeout(Duration::from_secs(2), running.server)
        .await
        .expect("server stopped")
        .expect("server task");
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_stalled_upgrade_does_not_block_other_clients() {
    let running = start_server().await;
    let pair = login(&running).await;

    // Opens TCP but never sends the upgrade request.
    let _stalled = tokio::net::TcpStream::connect(&running.addr)
        .await
        .expect("tcp connect");
    tokio::time::sleep(Duration::from_millis(50)).await;

    let url = format!("ws://{}/?token={}", running.addr, pair.access.as_str());
    let mut ws = tokio::time::timeout(Duration::from_secs(3), connect(url))
        .await
        .expect("upgrade completes while another client stalls");
    assert!(matches!(
        next_payload(&mut ws).await,
        Payload::System(SystemMessage::AuthAck { .. })
    ));
}
