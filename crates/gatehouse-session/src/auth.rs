//! The authentication hook the socket session manager calls.
//!
//! The manager doesn't know how tokens are checked. It calls
//! [`Authenticator::authenticate`] with whatever the client presented and
//! gets back the token's [`Claims`] or an error carrying an
//! [`ErrorKind`](gatehouse_protocol::ErrorKind).
//!
//! [`TokenAuthenticator`] is the production implementation: signature
//! and expiry checks by the [`TokenIssuer`], revocation by the
//! [`SessionRegistry`].

use std::future::Future;
use std::sync::Arc;

use gatehouse_auth::{Claims, TokenIssuer};

use crate::{SessionError, SessionRegistry};

/// Validates a presented token and returns its claims.
///
/// # Trait bounds
///
/// - `Send + Sync` → shared by every connection task.
/// - `'static` → lives as long as the server.
///
/// # Example
///
/// ```rust
/// use gatehouse_auth::{AuthError, Claims, TokenKind};
/// use gatehouse_protocol::{Identity, TokenId};
/// use gatehouse_session::{Authenticator, SessionError};
///
/// /// Accepts the literal token "letmein". Tests only.
/// struct FixedToken;
///
/// impl Authenticator for FixedToken {
///     async fn authenticate(&self, token: &str) -> Result<Claims, SessionError> {
///         if token != "letmein" {
///             return Err(AuthError::TokenMalformed("unexpected token".into()).into());
///         }
///         Ok(Claims {
///             sub: Identity::from("tester"),
///             jti: TokenId::new("fixed"),
///             iat: 0,
///             exp: i64::MAX,
///             typ: TokenKind::Access,
///         })
///     }
/// }
/// ```
pub trait Authenticator: Send + Sync + 'static {
    /// Validates `token`.
    ///
    /// # Returns
    /// - `Ok(Claims)`: the token is well-formed, signed, unexpired, and
    ///   not revoked
    /// - `Err(SessionError)`: anything else; `kind()` says which
    fn authenticate(
        &self,
        token: &str,
    ) -> impl Future<Output = Result<Claims, SessionError>> + Send;
}

/// Checks tokens with a [`TokenIssuer`] and revocation with a
/// [`SessionRegistry`].
#[derive(Clone)]
pub struct TokenAuthenticator {
    issuer: Arc<TokenIssuer>,
    registry: Arc<SessionRegistry>,
}

impl TokenAuthenticator {
    pub fn new(issuer: Arc<TokenIssuer>, registry: Arc<SessionRegistry>) -> Self {
        Self { issuer, registry }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn issuer(&self) -> &Arc<TokenIssuer> {
        &self.issuer
    }
}

impl Authenticator for TokenAuthenticator {
    async fn authenticate(&self, token: &str) -> Result<Claims, SessionError> {
        Ok(self.issuer.validate(token, self.registry.as_ref())?)
    }
}
