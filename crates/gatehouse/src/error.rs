//! Unified error type for Gatehouse.

use gatehouse_auth::AuthError;
use gatehouse_gateway::GatewayError;
use gatehouse_protocol::{ErrorKind, ProtocolError};
use gatehouse_session::SessionError;
use gatehouse_transport::TransportError;

/// Top-level error that wraps all crate-specific errors.
///
/// When using the `gatehouse` meta-crate you deal with this single error
/// type instead of importing errors from each sub-crate. The `#[from]`
/// attribute on each variant generates the `From` impls that `?` uses.
#[derive(Debug, thiserror::Error)]
pub enum GatehouseError {
    /// A transport-level error (accept, send, recv).
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A protocol-level error (encode, decode, invalid message).
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A credential or token error.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// A session registry error.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// A downstream call error.
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    /// Missing or invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// A blocking task panicked or was cancelled.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatehouseError {
    /// The [`ErrorKind`] behind this error, if it is an auth or session
    /// failure. Transport and protocol faults have none.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Auth(e) => Some(e.kind()),
            Self::Session(e) => Some(e.kind()),
            Self::Gateway(e) => Some(e.kind()),
            Self::Transport(_)
            | Self::Protocol(_)
            | Self::Config(_)
            | Self::Internal(_) => None,
        }
    }
}
