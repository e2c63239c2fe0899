//! The session registry: the single source of truth for which tokens are
//! currently valid.
//!
//! Every issued token gets a [`SessionRecord`]. The registry answers
//! "is this token revoked?", binds live connections to records, and
//! announces revocations so connection tasks can close promptly.
//!
//! # Lifecycle of a record
//!
//! ```text
//! register() ──→ [live, unbound] ──bind_connection()──→ [live, bound]
//!                     │  ↑                                   │
//!                     │  └──────unbind_connection()──────────┘
//!                     │
//!                  revoke() ──→ [revoked] ──(expiry passes)──→ swept
//! ```
//!
//! # Fail-closed
//!
//! A token id the registry has never heard of (or has already swept) is
//! reported as revoked. A store outage is reported as an error, never as
//! "not revoked".

use std::sync::Arc;

use chrono::Utc;
use gatehouse_auth::{AuthError, Claims, RevocationList};
use gatehouse_protocol::{Identity, TokenId};
use gatehouse_transport::ConnectionId;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    BindOutcome, BindPolicy, MemoryStore, RegistryConfig, SessionError, SessionRecord,
    SessionStore,
};

/// Announced on the registry's broadcast channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// A record was revoked. `connection` is the connection that was
    /// bound at the moment of revocation, if any.
    Revoked {
        token_id: TokenId,
        identity: Identity,
        connection: Option<ConnectionId>,
    },
}

/// Tracks every issued token and the connection bound to it.
///
/// Cheap to share: wrap it in an `Arc` and hand clones to the token
/// validator, the socket manager, and the sweeper.
pub struct SessionRegistry {
    store: Arc<dyn SessionStore>,
    config: RegistryConfig,
    events: broadcast::Sender<RegistryEvent>,
}

impl SessionRegistry {
    /// Creates a registry backed by an in-process [`MemoryStore`].
    pub fn new(config: RegistryConfig) -> Self {
        Self::with_store(Arc::new(MemoryStore::new()), config)
    }

    /// Creates a registry over any [`SessionStore`].
    pub fn with_store(store: Arc<dyn SessionStore>, config: RegistryConfig) -> Self {
        let config = config.validated();
        let (events, _) = broadcast::channel(config.event_capacity);
        Self {
            store,
            config,
            events,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Subscribes to revocation events.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Records a freshly issued token.
    ///
    /// # Errors
    /// - [`SessionError::InvalidExpiry`] if `exp <= iat`
    /// - [`SessionError::DuplicateToken`] if the id is already registered
    pub fn register(&self, claims: &Claims) -> Result<(), SessionError> {
        if claims.exp <= claims.iat {
            return Err(SessionError::InvalidExpiry);
        }
        self.store.insert(SessionRecord::from_claims(claims))?;
        tracing::info!(
            identity = %claims.sub,
            token_id = %claims.jti,
            kind = %claims.typ,
            "session registered"
        );
        Ok(())
    }

    /// Looks up a record. An expired record is removed on the way and
    /// reported as absent.
    pub fn get(&self, token_id: &TokenId) -> Result<Option<SessionRecord>, SessionError> {
        self.get_at(token_id, now())
    }

    /// Like [`get`](Self::get) with an explicit clock.
    pub fn get_at(
        &self,
        token_id: &TokenId,
        now: i64,
    ) -> Result<Option<SessionRecord>, SessionError> {
        match self.store.get(token_id)? {
            Some(record) if record.is_expired_at(now) => {
                self.store.remove_if_expired(token_id, now)?;
                Ok(None)
            }
            other => Ok(other),
        }
    }

    /// Revokes a token. Returns `true` if this call revoked it, `false`
    /// if it was unknown or already revoked.
    ///
    /// Any connection bound at this instant is named in the published
    /// [`RegistryEvent::Revoked`].
    pub fn revoke(&self, token_id: &TokenId) -> Result<bool, SessionError> {
        let Some(before) = self.store.revoke(token_id)? else {
            tracing::debug!(%token_id, "revoke of unknown token ignored");
            return Ok(false);
        };
        if before.revoked {
            return Ok(false);
        }

        tracing::info!(
            identity = %before.identity,
            %token_id,
            bound = before.connection.is_some(),
            "session revoked"
        );
        // No receivers is fine: nobody has a socket open.
        let _ = self.events.send(RegistryEvent::Revoked {
            token_id: token_id.clone(),
            identity: before.identity,
            connection: before.connection,
        });
        Ok(true)
    }

    /// Revokes every token belonging to `identity` ("log out
    /// everywhere"). Returns how many were newly revoked.
    pub fn revoke_identity(&self, identity: &Identity) -> Result<usize, SessionError> {
        let mut revoked = 0;
        for token_id in self.store.tokens_of(identity)? {
            if self.revoke(&token_id)? {
                revoked += 1;
            }
        }
        tracing::info!(%identity, revoked, "all sessions of identity revoked");
        Ok(revoked)
    }

    /// `true` if the token is revoked, expired, or unknown.
    pub fn is_revoked(&self, token_id: &TokenId) -> Result<bool, SessionError> {
        Ok(match self.get(token_id)? {
            Some(record) => record.revoked,
            None => true,
        })
    }

    /// Binds a live connection to the token using the configured policy.
    pub fn bind_connection(
        &self,
        token_id: &TokenId,
        connection: ConnectionId,
    ) -> Result<BindOutcome, SessionError> {
        self.bind_connection_with(token_id, connection, self.config.bind_policy)
    }

    /// Binds with an explicit [`BindPolicy`].
    ///
    /// # Errors
    /// - `UnknownToken` / `Revoked` / `Expired` if the record isn't live
    /// - `BindConflict` under [`BindPolicy::Reject`] when another
    ///   connection holds the token
    pub fn bind_connection_with(
        &self,
        token_id: &TokenId,
        connection: ConnectionId,
        policy: BindPolicy,
    ) -> Result<BindOutcome, SessionError> {
        let outcome = self.store.bind(token_id, connection, policy, now())?;
        match outcome {
            BindOutcome::Bound => {
                tracing::debug!(%token_id, %connection, "connection bound");
            }
            BindOutcome::Evicted(previous) => {
                tracing::info!(%token_id, %connection, %previous, "connection evicted by rebind");
            }
        }
        Ok(outcome)
    }

    /// Releases the binding if `connection` still holds it. Returns
    /// whether anything changed.
    pub fn unbind_connection(
        &self,
        token_id: &TokenId,
        connection: ConnectionId,
    ) -> Result<bool, SessionError> {
        let changed = self.store.unbind(token_id, connection)?;
        if changed {
            tracing::debug!(%token_id, %connection, "connection unbound");
        }
        Ok(changed)
    }

    /// Removes every record whose expiry has passed. Returns the count.
    pub fn sweep_expired(&self) -> Result<usize, SessionError> {
        self.sweep_expired_at(now())
    }

    /// Like [`sweep_expired`](Self::sweep_expired) with an explicit clock.
    pub fn sweep_expired_at(&self, now: i64) -> Result<usize, SessionError> {
        let removed = self.store.remove_expired(now)?.len();
        if removed > 0 {
            tracing::debug!(removed, "expired sessions swept");
        }
        Ok(removed)
    }

    /// Number of records currently stored.
    pub fn len(&self) -> Result<usize, SessionError> {
        self.store.count()
    }

    pub fn is_empty(&self) -> Result<bool, SessionError> {
        Ok(self.len()? == 0)
    }

    /// Spawns a task that calls [`sweep_expired`](Self::sweep_expired)
    /// every `sweep_interval` until `cancel` fires.
    pub fn spawn_sweeper(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(registry.config.sweep_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = registry.sweep_expired() {
                            tracing::warn!(error = %e, "session sweep failed");
                        }
                    }
                }
            }
            tracing::debug!("session sweeper stopped");
        })
    }
}

impl RevocationList for SessionRegistry {
    fn is_revoked(&self, token_id: &TokenId) -> Result<bool, AuthError> {
        SessionRegistry::is_revoked(self, token_id).map_err(|e| match e {
            SessionError::Auth(inner) => inner,
            other => AuthError::StoreUnavailable(other.to_string()),
        })
    }
}

fn now() -> i64 {
    Utc::now().timestamp()
}
