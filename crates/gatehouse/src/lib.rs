//! # Gatehouse
//!
//! Token authentication and live socket sessions.
//!
//! Gatehouse verifies credentials, issues signed session tokens, tracks
//! which tokens are still valid, and keeps authenticated WebSocket
//! connections alive until their token is revoked, expires, or goes idle.
//! Your code implements a single [`MessageHandler`] for application
//! messages.
//!
//! ## Layers
//!
//! ```text
//! gatehouse (this crate)  ← socket session manager, hub, server, AuthService
//! gatehouse-gateway       ← authenticated downstream HTTP calls
//! gatehouse-session       ← session registry, revocation, Authenticator
//! gatehouse-auth          ← credential hashing, token signing/validation
//! gatehouse-protocol      ← envelopes, identities, error kinds, codecs
//! gatehouse-transport     ← WebSocket and in-memory connections
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use gatehouse::prelude::*;
//!
//! struct Echo;
//!
//! impl MessageHandler for Echo {
//!     async fn on_message(&self, ctx: &ConnectionContext, data: Vec<u8>) -> Result<(), HandlerError> {
//!         ctx.send(data)
//!     }
//! }
//!
//! async fn serve(service: AuthService, registry: Arc<SessionRegistry>) -> Result<(), GatehouseError> {
//!     let config = GatehouseConfig::from_env()?;
//!     let server = GatehouseServerBuilder::new()
//!         .bind(&config.bind_addr)
//!         .socket_config(config.socket)
//!         .build(service.authenticator(), registry, Echo)
//!         .await?;
//!     server.run().await
//! }
//! ```

#![allow(async_fn_in_trait)]

mod config;
mod error;
mod handler;
mod hub;
mod manager;
mod server;
mod service;
mod state;

pub use config::{GatehouseConfig, OutboundPolicy, SocketConfig};
pub use error::GatehouseError;
pub use handler::{ConnectionContext, HandlerError, MessageHandler};
pub use hub::{ConnectionHub, Outbound};
pub use manager::SocketSessionManager;
pub use server::{GatehouseServer, GatehouseServerBuilder};
pub use service::AuthService;
pub use state::{
    CLOSE_EVICTED, CLOSE_FORBIDDEN, CLOSE_IDLE, CLOSE_REVOKED, CLOSE_UNAUTHORIZED, CloseReason,
    ConnectionState,
};

use tracing_subscriber::EnvFilter;

/// Installs a `tracing` subscriber that honours `RUST_LOG`, defaulting to
/// `info`. Safe to call more than once; only the first call installs.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Everything needed to run a server, in one import.
pub mod prelude {
    pub use crate::{
        AuthService, CloseReason, ConnectionContext, ConnectionHub, ConnectionState,
        GatehouseConfig, GatehouseError, GatehouseServer, GatehouseServerBuilder, HandlerError,
        MessageHandler, OutboundPolicy, SocketConfig, SocketSessionManager, init_tracing,
    };
    pub use gatehouse_auth::{
        AuthError, Claims, CredentialRecord, CredentialStore, CredentialVerifier, HashAlgorithm,
        HashingConfig, InMemoryCredentialStore, SecretHasher, TokenConfig, TokenIssuer,
        TokenKind, TokenPair,
    };
    pub use gatehouse_gateway::{
        DownstreamRequest, DownstreamResponse, GatewayConfig, GatewayError, OutboundGateway,
        SessionHandle,
    };
    pub use gatehouse_protocol::{
        Codec, Envelope, ErrorKind, Identity, JsonCodec, PROTOCOL_VERSION, Payload, SystemMessage,
        TokenId,
    };
    pub use gatehouse_session::{
        Authenticator, BindPolicy, RegistryConfig, SessionError, SessionRegistry,
        TokenAuthenticator,
    };
    pub use gatehouse_transport::{Connection, ConnectionId, MemoryConnection, MemoryPeer};
}
