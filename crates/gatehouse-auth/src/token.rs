//! Minting and validating signed session tokens.
//!
//! Tokens are HS256 JWTs carrying `{sub, jti, iat, exp, typ}` and a `kid`
//! header naming the signing key. Validation runs in a fixed order so
//! each failure maps to exactly one [`ErrorKind`](gatehouse_protocol::ErrorKind):
//!
//! 1. structure → `TokenMalformed`
//! 2. expiry → `TokenExpired` (checked before the signature, so an
//!    expired token is reported as expired even if it was tampered with)
//! 3. signature → `TokenSignatureMismatch`
//! 4. revocation → `TokenRevoked`

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use gatehouse_protocol::{Identity, TokenId};
use jsonwebtoken::{Algorithm, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{AuthError, KeyRing, RevocationList, TokenConfig};

/// What a token may be used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    /// Opens sockets and authorizes downstream calls.
    Access,
    /// Only exchanged for a new token pair.
    Refresh,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Access => f.write_str("access"),
            Self::Refresh => f.write_str("refresh"),
        }
    }
}

/// The signed payload of a session token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Identity,
    pub jti: TokenId,
    /// Issued-at, Unix seconds.
    pub iat: i64,
    /// Expiry, Unix seconds.
    pub exp: i64,
    pub typ: TokenKind,
}

impl Claims {
    pub fn identity(&self) -> &Identity {
        &self.sub
    }

    pub fn token_id(&self) -> &TokenId {
        &self.jti
    }

    pub fn is_expired_at(&self, now: i64) -> bool {
        self.exp <= now
    }

    /// Fails with `WrongTokenKind` unless the token is of `expected` kind.
    pub fn require_kind(&self, expected: TokenKind) -> Result<(), AuthError> {
        if self.typ == expected {
            Ok(())
        } else {
            Err(AuthError::WrongTokenKind {
                expected,
                found: self.typ,
            })
        }
    }
}

/// An issued token: the encoded string handed to the client plus the
/// claims it carries.
#[derive(Clone)]
pub struct SessionToken {
    encoded: String,
    claims: Claims,
}

impl SessionToken {
    /// The compact `header.payload.signature` form.
    pub fn as_str(&self) -> &str {
        &self.encoded
    }

    pub fn claims(&self) -> &Claims {
        &self.claims
    }

    pub fn into_parts(self) -> (String, Claims) {
        (self.encoded, self.claims)
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionToken")
            .field("encoded", &"<redacted>")
            .field("claims", &self.claims)
            .finish()
    }
}

/// An access token and the refresh token issued alongside it.
#[derive(Debug, Clone)]
pub struct TokenPair {
    pub access: SessionToken,
    pub refresh: SessionToken,
}

/// Mints and validates session tokens.
///
/// Holds the [`KeyRing`] behind a copy-on-write lock: validation clones
/// the current `Arc` and never blocks on rotation.
pub struct TokenIssuer {
    keys: RwLock<Arc<KeyRing>>,
    config: TokenConfig,
}

impl TokenIssuer {
    /// Creates an issuer signing with `secret` (at least 32 bytes).
    pub fn new(secret: &[u8], config: TokenConfig) -> Result<Self, AuthError> {
        let config = config.validated();
        let ring = KeyRing::new(secret, config.key_grace())?;
        Ok(Self {
            keys: RwLock::new(Arc::new(ring)),
            config,
        })
    }

    pub fn config(&self) -> &TokenConfig {
        &self.config
    }

    /// A snapshot of the current key ring.
    pub fn keys(&self) -> Arc<KeyRing> {
        self.keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Makes `secret` the active signing key. Tokens signed with the
    /// previous key keep validating for the grace window, or until they
    /// expire if they outlive it.
    pub fn rotate(&self, secret: &[u8]) -> Result<(), AuthError> {
        self.rotate_at(secret, Utc::now().timestamp())
    }

    /// [`rotate`](Self::rotate) with an explicit clock.
    pub fn rotate_at(&self, secret: &[u8], now: i64) -> Result<(), AuthError> {
        let mut guard = self.keys.write().unwrap_or_else(PoisonError::into_inner);
        let next = guard.rotated(secret, now)?;
        tracing::info!(
            kid = next.active().kid(),
            verifying_keys = next.len(),
            "signing key rotated"
        );
        *guard = Arc::new(next);
        Ok(())
    }

    /// Issues an access token for `identity` valid for `ttl`.
    pub fn issue(&self, identity: &Identity, ttl: Duration) -> Result<SessionToken, AuthError> {
        self.issue_kind(identity, TokenKind::Access, ttl)
    }

    /// Issues a refresh token for `identity` valid for `ttl`.
    pub fn issue_refresh(
        &self,
        identity: &Identity,
        ttl: Duration,
    ) -> Result<SessionToken, AuthError> {
        self.issue_kind(identity, TokenKind::Refresh, ttl)
    }

    /// Issues an access/refresh pair with the configured lifetimes.
    pub fn issue_pair(&self, identity: &Identity) -> Result<TokenPair, AuthError> {
        Ok(TokenPair {
            access: self.issue(identity, self.config.access_ttl)?,
            refresh: self.issue_refresh(identity, self.config.refresh_ttl)?,
        })
    }

    /// Issues a token of any kind, stamped with the current time.
    pub fn issue_kind(
        &self,
        identity: &Identity,
        kind: TokenKind,
        ttl: Duration,
    ) -> Result<SessionToken, AuthError> {
        self.issue_at(identity, kind, ttl, Utc::now().timestamp())
    }

    /// Issues a token as if the current time were `now` (Unix seconds).
    pub fn issue_at(
        &self,
        identity: &Identity,
        kind: TokenKind,
        ttl: Duration,
        now: i64,
    ) -> Result<SessionToken, AuthError> {
        let ttl_secs = i64::try_from(ttl.as_secs()).map_err(|_| AuthError::InvalidTtl)?;
        if ttl_secs < 1 {
            return Err(AuthError::InvalidTtl);
        }

        let claims = Claims {
            sub: identity.clone(),
            jti: TokenId::new(Uuid::new_v4().to_string()),
            iat: now,
            exp: now.saturating_add(ttl_secs),
            typ: kind,
        };

        let keys = self.keys();
        let key = keys.active();
        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some(key.kid().to_string());

        // Recorded before the token exists so a concurrent rotation can
        // never retire the key ahead of this expiry.
        key.record_signed(claims.exp);
        let encoded = jsonwebtoken::encode(&header, &claims, key.encoding())
            .map_err(|e| AuthError::Signing(e.to_string()))?;

        tracing::debug!(%identity, token_id = %claims.jti, %kind, exp = claims.exp, "token issued");
        Ok(SessionToken { encoded, claims })
    }

    /// Validates `token` at the current time. See the module docs for the
    /// order of checks.
    pub fn validate(
        &self,
        token: &str,
        revocations: &dyn RevocationList,
    ) -> Result<Claims, AuthError> {
        self.validate_at(token, revocations, Utc::now().timestamp())
    }

    /// Validates `token` as if the current time were `now` (Unix seconds).
    pub fn validate_at(
        &self,
        token: &str,
        revocations: &dyn RevocationList,
        now: i64,
    ) -> Result<Claims, AuthError> {
        let claims = self.verify_signed_at(token, now)?;

        if revocations.is_revoked(&claims.jti)? {
            return Err(AuthError::TokenRevoked);
        }
        Ok(claims)
    }

    /// Runs the structure, expiry and signature checks but not the
    /// revocation check.
    pub fn verify_signed_at(&self, token: &str, now: i64) -> Result<Claims, AuthError> {
        let (header, claims) = parse_unverified(token)?;

        if claims.is_expired_at(now) {
            return Err(AuthError::TokenExpired);
        }

        if header.alg != Algorithm::HS256 {
            return Err(AuthError::TokenSignatureMismatch);
        }
        let kid = header.kid.ok_or(AuthError::TokenSignatureMismatch)?;
        let keys = self.keys();
        let key = keys
            .find(&kid, now)
            .ok_or(AuthError::TokenSignatureMismatch)?;

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.leeway = 0;
        validation.required_spec_claims.clear();

        jsonwebtoken::decode::<Claims>(token, key.decoding(), &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::InvalidSignature => {
                    AuthError::TokenSignatureMismatch
                }
                _ => AuthError::TokenMalformed(e.to_string()),
            })
    }
}

impl fmt::Debug for TokenIssuer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenIssuer")
            .field("keys", &self.keys())
            .field("config", &self.config)
            .finish()
    }
}

/// Splits and decodes a token without checking its signature.
fn parse_unverified(token: &str) -> Result<(Header, Claims), AuthError> {
    let mut segments = token.split('.');
    let (Some(_), Some(payload), Some(signature), None) = (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    ) else {
        return Err(AuthError::TokenMalformed(
            "expected three dot-separated segments".into(),
        ));
    };
    if signature.is_empty() {
        return Err(AuthError::TokenMalformed("empty signature segment".into()));
    }

    let header =
        jsonwebtoken::decode_header(token).map_err(|e| AuthError::TokenMalformed(e.to_string()))?;

    let payload = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|e| AuthError::TokenMalformed(format!("payload: {e}")))?;
    let claims: Claims = serde_json::from_slice(&payload)
        .map_err(|e| AuthError::TokenMalformed(format!("claims: {e}")))?;

    Ok((header, claims))
}
