//! Credential verification and signed session tokens for Gatehouse.
//!
//! Two independent pieces live here:
//!
//! 1. **Credential Verifier** ([`CredentialVerifier`]): checks an
//!    identity/secret pair against a stored salted hash, in constant time,
//!    failing closed when the identity is unknown.
//! 2. **Token Issuer/Validator** ([`TokenIssuer`]): mints HS256 tokens
//!    and validates them: structure, expiry, signature, then revocation.
//!
//! # Revocation
//!
//! This crate does not know which tokens are revoked. The session
//! registry does, and it plugs in through the [`RevocationList`] trait:
//!
//! ```text
//! TokenIssuer::validate(token, &registry)
//!     ├─ structure / expiry / signature   (this crate)
//!     └─ registry.is_revoked(jti)         (gatehouse-session)
//! ```

mod config;
mod credential;
mod error;
mod keys;
mod token;

pub use config::{HashingConfig, TokenConfig};
pub use credential::{
    CredentialRecord, CredentialStore, CredentialVerifier, FailedAttemptHook, FailureReason,
    HashAlgorithm, InMemoryCredentialStore, SecretHasher, hash_secret,
};
pub use error::AuthError;
pub use keys::{KeyRing, MIN_SECRET_LEN, SigningKey};
pub use token::{Claims, SessionToken, TokenIssuer, TokenKind, TokenPair};

use gatehouse_protocol::TokenId;

/// Answers "has this token been revoked?" for [`TokenIssuer::validate`].
///
/// Implementations must fail closed: if the answer can't be determined,
/// return [`AuthError::StoreUnavailable`] rather than `Ok(false)`.
pub trait RevocationList: Send + Sync {
    fn is_revoked(&self, token_id: &TokenId) -> Result<bool, AuthError>;
}

impl<T: RevocationList + ?Sized> RevocationList for std::sync::Arc<T> {
    fn is_revoked(&self, token_id: &TokenId) -> Result<bool, AuthError> {
        (**self).is_revoked(token_id)
    }
}
