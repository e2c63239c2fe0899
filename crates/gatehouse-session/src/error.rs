//! Error types for the session layer.

use gatehouse_auth::AuthError;
use gatehouse_protocol::{ErrorKind, TokenId};
use gatehouse_transport::ConnectionId;

/// Errors from the session registry and its backing store.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Token validation failed before the registry was consulted, or the
    /// registry reported the token revoked.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// `register` was called twice with the same token id.
    #[error("token {0} is already registered")]
    DuplicateToken(TokenId),

    /// The record's expiry is not after its issue time.
    #[error("session expiry must be after its issue time")]
    InvalidExpiry,

    /// No record for this token id. Treated as revoked.
    #[error("token {0} is not registered")]
    UnknownToken(TokenId),

    #[error("token {0} is revoked")]
    Revoked(TokenId),

    #[error("token {0} is expired")]
    Expired(TokenId),

    /// Another connection already holds the token and the bind policy is
    /// `Reject`.
    #[error("token {token_id} is already bound to {connection}")]
    BindConflict {
        token_id: TokenId,
        connection: ConnectionId,
    },

    /// The backing store could not be reached.
    #[error("session store unavailable: {0}")]
    StoreUnavailable(String),
}

impl SessionError {
    /// Reduces the error to its stable [`ErrorKind`].
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Auth(e) => e.kind(),
            Self::DuplicateToken(_) | Self::InvalidExpiry => ErrorKind::Internal,
            Self::UnknownToken(_) | Self::Revoked(_) => ErrorKind::TokenRevoked,
            Self::Expired(_) => ErrorKind::TokenExpired,
            Self::BindConflict { .. } => ErrorKind::ConnectionBindConflict,
            Self::StoreUnavailable(_) => ErrorKind::InternalStoreUnavailable,
        }
    }
}
