//! Session records and registry configuration.

use std::time::Duration;

use gatehouse_auth::{Claims, TokenKind};
use gatehouse_protocol::{Identity, TokenId};
use gatehouse_transport::ConnectionId;

// ---------------------------------------------------------------------------
// RegistryConfig
// ---------------------------------------------------------------------------

/// Configuration for the session registry.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// What to do when a second connection binds a token that already
    /// has a live connection. Default: [`BindPolicy::Evict`].
    pub bind_policy: BindPolicy,

    /// How often the background sweeper removes expired records.
    /// Default: 60 seconds.
    pub sweep_interval: Duration,

    /// Capacity of the revocation event channel. Subscribers that fall
    /// further behind than this lose events and rely on polling.
    pub event_capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            bind_policy: BindPolicy::default(),
            sweep_interval: Duration::from_secs(60),
            event_capacity: 1024,
        }
    }
}

impl RegistryConfig {
    /// Clamps values `tokio` would panic on (zero interval, zero-capacity
    /// broadcast channel).
    pub fn validated(mut self) -> Self {
        if self.sweep_interval.is_zero() {
            tracing::warn!("sweep_interval of 0 is invalid, using 1s");
            self.sweep_interval = Duration::from_secs(1);
        }
        if self.event_capacity == 0 {
            self.event_capacity = 1;
        }
        self
    }
}

// ---------------------------------------------------------------------------
// Binding
// ---------------------------------------------------------------------------

/// What happens when a token that already has a live connection is bound
/// again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BindPolicy {
    /// The new connection is refused with `ConnectionBindConflict`.
    Reject,
    /// The new connection wins; the previous one must be closed by the
    /// caller.
    #[default]
    Evict,
}

/// The result of a successful bind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindOutcome {
    /// The record had no live connection; it now has this one.
    Bound,
    /// The record was bound to another connection, which was displaced.
    Evicted(ConnectionId),
}

// ---------------------------------------------------------------------------
// SessionRecord
// ---------------------------------------------------------------------------

/// The registry's record of one issued token.
///
/// Keyed by `token_id`. Only the `revoked` flag and the bound connection
/// ever change after registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub token_id: TokenId,
    pub identity: Identity,
    pub kind: TokenKind,
    /// Unix seconds.
    pub issued_at: i64,
    /// Unix seconds.
    pub expires_at: i64,
    pub revoked: bool,
    pub connection: Option<ConnectionId>,
}

impl SessionRecord {
    /// Builds an unrevoked, unbound record from validated claims.
    pub fn from_claims(claims: &Claims) -> Self {
        Self {
            token_id: claims.jti.clone(),
            identity: claims.sub.clone(),
            kind: claims.typ,
            issued_at: claims.iat,
            expires_at: claims.exp,
            revoked: false,
            connection: None,
        }
    }

    pub fn is_expired_at(&self, now: i64) -> bool {
        self.expires_at <= now
    }

    /// Not revoked and not expired.
    pub fn is_live_at(&self, now: i64) -> bool {
        !self.revoked && !self.is_expired_at(now)
    }
}
