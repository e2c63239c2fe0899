//! Login, logout, and refresh: the non-socket side of a session.

use std::sync::Arc;

use chrono::Utc;
use gatehouse_auth::{AuthError, Claims, CredentialVerifier, TokenIssuer, TokenKind, TokenPair};
use gatehouse_protocol::Identity;
use gatehouse_session::{SessionRegistry, TokenAuthenticator};

use crate::GatehouseError;

/// Strings the credential verifier, the token issuer, and the session
/// registry together.
///
/// ```text
/// login    = verify secret → issue access + refresh → register both
/// refresh  = validate refresh → revoke it → issue + register a new pair
/// logout   = revoke the presented token
/// ```
#[derive(Clone)]
pub struct AuthService {
    verifier: Arc<CredentialVerifier>,
    issuer: Arc<TokenIssuer>,
    registry: Arc<SessionRegistry>,
}

impl AuthService {
    pub fn new(
        verifier: Arc<CredentialVerifier>,
        issuer: Arc<TokenIssuer>,
        registry: Arc<SessionRegistry>,
    ) -> Self {
        Self {
            verifier,
            issuer,
            registry,
        }
    }

    pub fn issuer(&self) -> &Arc<TokenIssuer> {
        &self.issuer
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// The [`Authenticator`](gatehouse_session::Authenticator) a socket
    /// session manager should use for tokens issued here.
    pub fn authenticator(&self) -> TokenAuthenticator {
        TokenAuthenticator::new(Arc::clone(&self.issuer), Arc::clone(&self.registry))
    }

    /// Checks `secret` and, if it matches, issues and registers a fresh
    /// access/refresh pair.
    ///
    /// Hashing is CPU-bound, so the check runs on the blocking pool.
    ///
    /// # Errors
    /// `InvalidCredentials` for an unknown identity or a wrong secret
    /// alike, store outages as `InternalStoreUnavailable`.
    pub async fn login(&self, identity: &Identity, secret: &str) -> Result<TokenPair, GatehouseError> {
        let verifier = Arc::clone(&self.verifier);
        let who = identity.clone();
        let secret = secret.to_string();
        tokio::task::spawn_blocking(move || verifier.authenticate(&who, &secret))
            .await
            .map_err(|e| GatehouseError::Internal(format!("credential check aborted: {e}")))??;

        let pair = self.issue_registered_pair(identity)?;
        tracing::info!(%identity, token_id = %pair.access.claims().jti, "login succeeded");
        Ok(pair)
    }

    /// Revokes the presented token. Returns `false` if it was already
    /// revoked or unknown.
    ///
    /// The signature must check out, so nobody can log out a token they
    /// merely guessed the id of.
    pub fn logout(&self, token: &str) -> Result<bool, GatehouseError> {
        let claims = self.issuer.verify_signed_at(token, Utc::now().timestamp())?;
        let revoked = self.registry.revoke(&claims.jti)?;
        if revoked {
            tracing::info!(identity = %claims.sub, token_id = %claims.jti, "logout");
        }
        Ok(revoked)
    }

    /// Revokes every session of `identity`. Returns how many were revoked.
    pub fn logout_all(&self, identity: &Identity) -> Result<usize, GatehouseError> {
        Ok(self.registry.revoke_identity(identity)?)
    }

    /// Trades a refresh token for a new pair. The refresh token is
    /// single-use: it is revoked before the new pair is issued, and a
    /// second concurrent refresh with the same token fails.
    ///
    /// # Errors
    /// `WrongTokenKind` for an access token, `TokenRevoked` if the refresh
    /// token was already used, plus every validation failure.
    pub fn refresh(&self, refresh_token: &str) -> Result<TokenPair, GatehouseError> {
        let claims = self.issuer.validate(refresh_token, self.registry.as_ref())?;
        claims.require_kind(TokenKind::Refresh)?;

        if !self.registry.revoke(&claims.jti)? {
            return Err(AuthError::TokenRevoked.into());
        }

        let pair = self.issue_registered_pair(&claims.sub)?;
        tracing::info!(
            identity = %claims.sub,
            old_token_id = %claims.jti,
            token_id = %pair.access.claims().jti,
            "session refreshed"
        );
        Ok(pair)
    }

    /// Validates an access token for a plain request (no socket).
    pub fn authenticate_request(&self, access_token: &str) -> Result<Claims, GatehouseError> {
        let claims = self.issuer.validate(access_token, self.registry.as_ref())?;
        claims.require_kind(TokenKind::Access)?;
        Ok(claims)
    }

    fn issue_registered_pair(&self, identity: &Identity) -> Result<TokenPair, GatehouseError> {
        let pair = self.issuer.issue_pair(identity)?;
        self.registry.register(pair.access.claims())?;
        self.registry.register(pair.refresh.claims())?;
        Ok(pair)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use gatehouse_auth::{
        CredentialRecord, HashAlgorithm, HashingConfig, InMemoryCredentialStore, SecretHasher,
        TokenConfig,
    };
    use gatehouse_protocol::ErrorKind;
    use gatehouse_session::RegistryConfig;

    use super::*;

    const SIGNING_SECRET: &[u8] = b"service-tests-signing-secret-32b";

    fn service() -> AuthService {
        let hasher = SecretHasher::new(&HashingConfig {
            memory_kib: 256,
            iterations: 1,
            parallelism: 1,
        })
        .unwrap();
        let store = InMemoryCredentialStore::new();
        store.insert(
            CredentialRecord::create(
                &hasher,
                Identity::from("alice"),
                HashAlgorithm::Argon2id,
                "correct horse",
            )
            .unwrap(),
        );
        let verifier = CredentialVerifier::new(Arc::new(store), &hasher).unwrap();
        let issuer = TokenIssuer::new(
            SIGNING_SECRET,
            TokenConfig {
                access_ttl: Duration::from_secs(300),
                refresh_ttl: Duration::from_secs(3600),
            },
        )
        .unwrap();
        AuthService::new(
            Arc::new(verifier),
            Arc::new(issuer),
            Arc::new(SessionRegistry::new(RegistryConfig::default())),
        )
    }

    #[tokio::test]
    async fn test_login_registers_both_tokens() {
        let service = service();
        let pair = service
            .login(&Identity::from("alice"), "correct horse")
            .await
            .unwrap();

        assert_eq!(service.registry().len().unwrap(), 2);
        let claims = service
            .authenticate_request(pair.access.as_str())
            .unwrap();
        assert_eq!(claims.sub, Identity::from("alice"));
    }

    #[tokio::test]
    async fn test_login_wrong_secret_is_invalid_credentials() {
        let service = service();
        let err = service
            .login(&Identity::from("alice"), "wrong")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::InvalidCredentials));
        assert!(service.registry().is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_logout_then_authenticate_is_revoked() {
        let service = service();
        let pair = service
            .login(&Identity::from("alice"), "correct horse")
            .await
            .unwrap();

        assert!(service.logout(pair.access.as_str()).unwrap());
        assert!(!service.logout(pair.access.as_str()).unwrap());

        let err = service
            .authenticate_request(pair.access.as_str())
            .unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::TokenRevoked));
    }

    #[tokio::test]
    async fn test_refresh_is_single_use() {
        let service = service();
        let pair = service
            .login(&Identity::from("alice"), "correct horse")
            .await
            .unwrap();

        let next = service.refresh(pair.refresh.as_str()).unwrap();
        assert_ne!(next.access.claims().jti, pair.access.claims().jti);

        let err = service.refresh(pair.refresh.as_str()).unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::TokenRevoked));
    }

    #[tokio::test]
    async fn test_refresh_with_access_token_is_wrong_kind() {
        let service = service();
        let pair = service
            .login(&Identity::from("alice"), "correct horse")
            .await
            .unwrap();

        let err = service.refresh(pair.access.as_str()).unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::WrongTokenKind));
    }

    #[tokio::test]
    async fn test_authenticate_request_rejects_refresh_token() {
        let service = service();
        let pair = service
            .login(&Identity::from("alice"), "correct horse")
            .await
            .unwrap();

        let err = service
            .authenticate_request(pair.refresh.as_str())
            .unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::WrongTokenKind));
    }

    #[tokio::test]
    async fn test_logout_all_revokes_every_session() {
        let service = service();
        let alice = Identity::from("alice");
        let first = service.login(&alice, "correct horse").await.unwrap();
        let second = service.login(&alice, "correct horse").await.unwrap();

        assert_eq!(service.logout_all(&alice).unwrap(), 4);
        for token in [first.access.as_str(), second.access.as_str()] {
            assert!(service.authenticate_request(token).is_err());
        }
    }
}
