use gatehouse_protocol::ErrorKind;

use crate::TokenKind;

/// Errors from credential checks, token minting, and token validation.
///
/// Messages never include the secret, the stored hash, or the raw token.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("invalid credentials")]
    InvalidCredentials,

    /// Not three base64url segments, or the header/payload is not JSON.
    #[error("malformed token: {0}")]
    TokenMalformed(String),

    #[error("token expired")]
    TokenExpired,

    /// Bad signature, unknown `kid`, or an algorithm other than HS256.
    #[error("token signature mismatch")]
    TokenSignatureMismatch,

    #[error("token revoked")]
    TokenRevoked,

    #[error("expected {expected} token, got {found}")]
    WrongTokenKind { expected: TokenKind, found: TokenKind },

    /// The revocation list or credential store could not be consulted.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("token lifetime must be at least one second")]
    InvalidTtl,

    /// Signing secret too short, or hashing parameters rejected.
    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("hashing failed: {0}")]
    Hashing(String),

    #[error("signing failed: {0}")]
    Signing(String),
}

impl AuthError {
    /// Reduces the error to its stable [`ErrorKind`].
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidCredentials => ErrorKind::InvalidCredentials,
            Self::TokenMalformed(_) => ErrorKind::TokenMalformed,
            Self::TokenExpired => ErrorKind::TokenExpired,
            Self::TokenSignatureMismatch => ErrorKind::TokenSignatureMismatch,
            Self::TokenRevoked => ErrorKind::TokenRevoked,
            Self::WrongTokenKind { .. } => ErrorKind::WrongTokenKind,
            Self::StoreUnavailable(_) => ErrorKind::InternalStoreUnavailable,
            Self::InvalidTtl | Self::InvalidKey(_) | Self::Hashing(_) | Self::Signing(_) => {
                ErrorKind::Internal
            }
        }
    }
}
