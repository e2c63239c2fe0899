//! The failure taxonomy shared by every Gatehouse layer.
//!
//! Each crate keeps its own error enum with rich context, but all of
//! them can be reduced to one [`ErrorKind`]. The kind is what gets
//! logged, counted, and sent to a rejected socket client, so it must stay
//! stable and must never carry secrets.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A stable classification of an authentication or session failure.
///
/// Serialized in `snake_case`, e.g. `"token_expired"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The identity/secret pair did not match a credential record.
    InvalidCredentials,
    /// The token is not a well-formed signed token.
    TokenMalformed,
    /// The token's expiry has passed. The client may refresh.
    TokenExpired,
    /// The token was revoked (logout, rotation) or is unknown to the registry.
    TokenRevoked,
    /// The token's signature does not match any known signing key.
    TokenSignatureMismatch,
    /// The token is valid but of the wrong kind (refresh used as access, …).
    WrongTokenKind,
    /// Another live connection is already bound to the token.
    ConnectionBindConflict,
    /// The identity already holds its maximum number of live connections.
    ConnectionLimitExceeded,
    /// A downstream service rejected the session's token.
    DownstreamUnauthorized,
    /// A downstream service could not be reached in time.
    DownstreamUnavailable,
    /// The session store backing the registry is unreachable.
    InternalStoreUnavailable,
    /// A server-side failure unrelated to the client's credentials
    /// (hashing or signing failed, invalid configuration).
    Internal,
}

impl ErrorKind {
    /// Returns `true` if the client should re-authenticate from scratch
    /// rather than refresh its token.
    ///
    /// Only `TokenExpired` is refreshable; everything else about a token
    /// means the credential itself can't be trusted.
    pub fn requires_reauthentication(&self) -> bool {
        matches!(
            self,
            Self::InvalidCredentials
                | Self::TokenMalformed
                | Self::TokenRevoked
                | Self::TokenSignatureMismatch
                | Self::WrongTokenKind
                | Self::DownstreamUnauthorized
        )
    }

    /// The short machine name, identical to the serialized form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidCredentials => "invalid_credentials",
            Self::TokenMalformed => "token_malformed",
            Self::TokenExpired => "token_expired",
            Self::TokenRevoked => "token_revoked",
            Self::TokenSignatureMismatch => "token_signature_mismatch",
            Self::WrongTokenKind => "wrong_token_kind",
            Self::ConnectionBindConflict => "connection_bind_conflict",
            Self::ConnectionLimitExceeded => "connection_limit_exceeded",
            Self::DownstreamUnauthorized => "downstream_unauthorized",
            Self::DownstreamUnavailable => "downstream_unavailable",
            Self::InternalStoreUnavailable => "internal_store_unavailable",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_serializes_as_snake_case() {
        let json = serde_json::to_string(&ErrorKind::TokenSignatureMismatch).unwrap();
        assert_eq!(json, "\"token_signature_mismatch\"");
    }

    #[test]
    fn test_error_kind_display_matches_serialized_form() {
        for kind in [
            ErrorKind::InvalidCredentials,
            ErrorKind::TokenExpired,
            ErrorKind::ConnectionLimitExceeded,
            ErrorKind::InternalStoreUnavailable,
        ] {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{kind}\""));
        }
    }

    #[test]
    fn test_requires_reauthentication_expired_is_refreshable() {
        assert!(!ErrorKind::TokenExpired.requires_reauthentication());
        assert!(ErrorKind::TokenRevoked.requires_reauthentication());
        assert!(ErrorKind::TokenSignatureMismatch.requires_reauthentication());
        assert!(!ErrorKind::DownstreamUnavailable.requires_reauthentication());
    }
}
