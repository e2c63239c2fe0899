//! A small chat relay on top of Gatehouse.
//!
//! Clients join rooms with the `JoinRoom` system message and then send
//! JSON commands as app payloads:
//!
//! ```json
//! { "type": "say", "room": "lobby", "text": "hi" }
//! { "type": "whisper", "to": "bob", "text": "psst" }
//! { "type": "profile" }
//! ```
//!
//! `profile` fetches `GATEHOUSE_DOWNSTREAM_URL` + `profile` with the
//! caller's session token, so a downstream service sees the same identity.

use std::sync::Arc;

use gatehouse::prelude::*;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Command {
    Say { room: String, text: String },
    Whisper { to: String, text: String },
    Profile,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Event {
    Said { room: String, from: String, text: String },
    Whispered { from: String, text: String },
    Profile { status: u16, body: String },
}

fn encode(event: &Event) -> Result<Vec<u8>, HandlerError> {
    serde_json::to_vec(event).map_err(|e| HandlerError::rejected(500, e.to_string()))
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

struct ChatRelay {
    gateway: Option<OutboundGateway>,
}

impl MessageHandler for ChatRelay {
    async fn on_open(&self, ctx: &ConnectionContext) {
        tracing::info!(identity = %ctx.identity(), connection = %ctx.connection_id(), "joined relay");
    }

    async fn on_message(&self, ctx: &ConnectionContext, data: Vec<u8>) -> Result<(), HandlerError> {
        let command: Command = serde_json::from_slice(&data)
            .map_err(|e| HandlerError::rejected(400, format!("bad command: {e}")))?;

        match command {
            Command::Say { room, text } => {
                if !ctx.hub().room_members(&room).contains(&ctx.connection_id()) {
                    return Err(HandlerError::rejected(403, format!("not in room {room}")));
                }
                let event = Event::Said {
                    room: room.clone(),
                    from: ctx.identity().to_string(),
                    text,
                };
                ctx.broadcast(&room, &encode(&event)?);
                Ok(())
            }
            Command::Whisper { to, text } => {
                let event = Event::Whispered {
                    from: ctx.identity().to_string(),
                    text,
                };
                let delivered = ctx
                    .hub()
                    .send_to_identity(&Identity::from(to.as_str()), &encode(&event)?);
                if delivered == 0 {
                    return Err(HandlerError::rejected(404, format!("{to} is not connected")));
                }
                Ok(())
            }
            Command::Profile => {
                let Some(gateway) = &self.gateway else {
                    return Err(HandlerError::rejected(501, "no downstream configured"));
                };
                let response = gateway
                    .call(ctx.session(), DownstreamRequest::get("profile"))
                    .await?;
                ctx.send(encode(&Event::Profile {
                    status: response.status,
                    body: response.text(),
                })?)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let config = GatehouseConfig::from_env()?;
    tracing::info!(?config, "starting chat relay");

    // One demo account. Real deployments load credentials from storage.
    let demo_secret = std::env::var("CHAT_RELAY_DEMO_SECRET")
        .unwrap_or_else(|_| "relay-demo-secret".to_string());
    let hasher = SecretHasher::new(&HashingConfig::default())?;
    let credentials = InMemoryCredentialStore::new();
    credentials.insert(CredentialRecord::create(
        &hasher,
        Identity::from("demo"),
        HashAlgorithm::Argon2id,
        &demo_secret,
    )?);
    let verifier = CredentialVerifier::new(Arc::new(credentials), &hasher)?;

    let issuer = Arc::new(TokenIssuer::new(
        config.signing_secret.as_bytes(),
        config.token.clone(),
    )?);
    let registry = Arc::new(SessionRegistry::new(config.registry.clone()));
    let service = AuthService::new(Arc::new(verifier), issuer, Arc::clone(&registry));

    let pair = service.login(&Identity::from("demo"), &demo_secret).await?;
    tracing::info!(
        url = %format!("ws://{}/?token={}", config.bind_addr, pair.access.as_str()),
        "demo session ready"
    );

    let gateway = if config.gateway.base_url.is_some() {
        Some(OutboundGateway::new(config.gateway.clone())?)
    } else {
        None
    };

    let stop_sweeper = CancellationToken::new();
    let sweeper = registry.spawn_sweeper(stop_sweeper.clone());

    let server = GatehouseServerBuilder::new()
        .bind(&config.bind_addr)
        .socket_config(config.socket.clone())
        .build(service.authenticator(), registry, ChatRelay { gateway })
        .await?;

    let manager = server.manager().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("ctrl-c received, shutting down");
            manager.shutdown();
        }
    });

    server.run().await?;
    stop_sweeper.cancel();
    sweeper.await?;
    Ok(())
}
