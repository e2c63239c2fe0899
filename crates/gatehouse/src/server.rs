//! `GatehouseServer` builder and accept loop.
//!
//! The entry point for serving WebSocket sessions. It ties the layers
//! together: transport → protocol → session registry → socket manager.

use std::sync::Arc;

use gatehouse_protocol::JsonCodec;
use gatehouse_session::{Authenticator, SessionRegistry};
use gatehouse_transport::{Transport, TransportError, WebSocketTransport};
use tokio::task::JoinHandle;

use crate::{GatehouseError, MessageHandler, SocketConfig, SocketSessionManager};

/// Builder for configuring and starting a Gatehouse server.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
///
/// use gatehouse::prelude::*;
///
/// struct Echo;
///
/// impl MessageHandler for Echo {
///     async fn on_message(&self, ctx: &ConnectionContext, data: Vec<u8>) -> Result<(), HandlerError> {
///         ctx.send(data)
///     }
/// }
///
/// async fn serve(service: AuthService, registry: Arc<SessionRegistry>) -> Result<(), GatehouseError> {
///     let server = GatehouseServerBuilder::new()
///         .bind("0.0.0.0:8080")
///         .build(service.authenticator(), registry, Echo)
///         .await?;
///     server.run().await
/// }
/// ```
pub struct GatehouseServerBuilder {
    bind_addr: String,
    socket_config: SocketConfig,
}

impl GatehouseServerBuilder {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            socket_config: SocketConfig::default(),
        }
    }

    /// Sets the address to bind the server to. Port 0 picks a free port.
    pub fn bind(mut self, addr: &str) -> Self {
        self.bind_addr = addr.to_string();
        self
    }

    pub fn socket_config(mut self, config: SocketConfig) -> Self {
        self.socket_config = config;
        self
    }

    /// Binds the listener and starts the revocation watcher.
    ///
    /// Uses `JsonCodec` and `WebSocketTransport`. Upgrades that take
    /// longer than the socket config's `handshake_timeout` are dropped.
    pub async fn build<A, H>(
        self,
        auth: A,
        registry: Arc<SessionRegistry>,
        handler: H,
    ) -> Result<GatehouseServer<A, H>, GatehouseError>
    where
        A: Authenticator,
        H: MessageHandler,
    {
        let socket_config = self.socket_config.validated();
        let transport =
            WebSocketTransport::bind_with_timeout(&self.bind_addr, socket_config.handshake_timeout)
                .await?;
        let manager = SocketSessionManager::new(auth, registry, handler, JsonCodec, socket_config);
        let watcher = manager.spawn_revocation_watcher();

        Ok(GatehouseServer {
            transport,
            manager,
            watcher,
        })
    }
}

impl Default for GatehouseServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A bound Gatehouse server, created by [`GatehouseServerBuilder::build`].
///
/// Call [`run()`](Self::run) to start accepting connections.
pub struct GatehouseServer<A, H> {
    transport: WebSocketTransport,
    manager: SocketSessionManager<A, H, JsonCodec>,
    watcher: JoinHandle<()>,
}

impl<A, H> GatehouseServer<A, H>
where
    A: Authenticator,
    H: MessageHandler,
{
    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.transport.local_addr()
    }

    /// The manager owning every live connection. Clone it to reach the
    /// hub or to trigger [`shutdown`](SocketSessionManager::shutdown)
    /// from another task.
    pub fn manager(&self) -> &SocketSessionManager<A, H, JsonCodec> {
        &self.manager
    }

    /// Accepts upgrades and spawns a task per connection until the
    /// manager is shut down.
    pub async fn run(mut self) -> Result<(), GatehouseError> {
        tracing::info!(addr = ?self.transport.local_addr().ok(), "Gatehouse server running");

        loop {
            let accepted = tokio::select! {
                _ = self.manager.wait_for_shutdown() => break,
                accepted = self.transport.accept() => accepted,
            };

            match accepted {
                Ok(conn) => {
                    self.manager.accept(conn);
                }
                Err(TransportError::Handshake(e)) => {
                    tracing::debug!(error = %e, "upgrade handshake failed");
                }
                Err(TransportError::Shutdown) => {
                    tracing::warn!("transport stopped accepting, shutting down");
                    self.manager.shutdown();
                    break;
                }
                Err(e) => {
                    tracing::error!(error = %e, "accept failed");
                }
            }
        }

        self.transport.shutdown().await?;
        if let Err(e) = self.watcher.await {
            tracing::warn!(error = %e, "revocation watcher ended abnormally");
        }
        tracing::info!("Gatehouse server stopped");
        Ok(())
    }
}
