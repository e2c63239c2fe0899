//! Signing keys and their rotation.
//!
//! A [`KeyRing`] is immutable: it holds one active key (used to sign new
//! tokens) and any number of retired keys that still verify tokens until
//! their grace window ends. Rotation never edits a ring in place, it
//! builds the next one with [`KeyRing::rotated`]. Whoever owns the ring
//! swaps the `Arc` and readers keep whichever snapshot they already hold.
//!
//! A retired key verifies until its grace window ends or until the last
//! token it signed expires, whichever is later.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use jsonwebtoken::{DecodingKey, EncodingKey};

use crate::AuthError;

/// HS256 secrets shorter than this are refused.
pub const MIN_SECRET_LEN: usize = 32;

/// One HS256 secret and its key id (`kid` header).
#[derive(Clone)]
pub struct SigningKey {
    kid: String,
    encoding: EncodingKey,
    decoding: DecodingKey,
    /// Unix seconds at which this key stopped signing. `None` while active.
    retired_at: Option<i64>,
    /// Latest `exp` signed with this key. Shared by every ring holding a
    /// copy, so a token signed from a stale snapshot still counts.
    signed_until: Arc<AtomicI64>,
}

impl SigningKey {
    fn new(secret: &[u8]) -> Result<Self, AuthError> {
        if secret.len() < MIN_SECRET_LEN {
            return Err(AuthError::InvalidKey(format!(
                "signing secret must be at least {MIN_SECRET_LEN} bytes"
            )));
        }
        Ok(Self {
            kid: hex::encode(rand::random::<[u8; 8]>()),
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            retired_at: None,
            signed_until: Arc::new(AtomicI64::new(i64::MIN)),
        })
    }

    pub fn kid(&self) -> &str {
        &self.kid
    }

    /// Latest expiry of any token signed with this key, if any.
    pub fn signed_until(&self) -> Option<i64> {
        match self.signed_until.load(Ordering::Acquire) {
            i64::MIN => None,
            exp => Some(exp),
        }
    }

    /// Records that a token expiring at `exp` was signed with this key.
    pub(crate) fn record_signed(&self, exp: i64) {
        self.signed_until.fetch_max(exp, Ordering::AcqRel);
    }

    pub(crate) fn encoding(&self) -> &EncodingKey {
        &self.encoding
    }

    pub(crate) fn decoding(&self) -> &DecodingKey {
        &self.decoding
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("kid", &self.kid)
            .field("secret", &"<redacted>")
            .field("retired_at", &self.retired_at)
            .field("signed_until", &self.signed_until())
            .finish()
    }
}

/// The active signing key plus retired keys still inside their grace window.
#[derive(Debug, Clone)]
pub struct KeyRing {
    active: SigningKey,
    retired: Vec<SigningKey>,
    grace: Duration,
}

impl KeyRing {
    /// Creates a ring with a single active key.
    ///
    /// `grace` is how long a key keeps verifying after it is rotated out.
    /// Tokens signed with a longer lifetime extend it to their own expiry.
    pub fn new(secret: &[u8], grace: Duration) -> Result<Self, AuthError> {
        Ok(Self {
            active: SigningKey::new(secret)?,
            retired: Vec::new(),
            grace,
        })
    }

    pub fn active(&self) -> &SigningKey {
        &self.active
    }

    /// Finds the key named `kid` if it may still verify at `now`.
    pub fn find(&self, kid: &str, now: i64) -> Option<&SigningKey> {
        if self.active.kid == kid {
            return Some(&self.active);
        }
        self.retired
            .iter()
            .find(|key| key.kid == kid && self.within_grace(key, now))
    }

    /// Builds the next ring: `secret` becomes active, the current active
    /// key is retired at `now`, and retired keys past their grace window
    /// are dropped.
    pub fn rotated(&self, secret: &[u8], now: i64) -> Result<Self, AuthError> {
        let active = SigningKey::new(secret)?;

        let mut previous = self.active.clone();
        previous.retired_at = Some(now);

        let retired = std::iter::once(previous)
            .chain(self.retired.iter().cloned())
            .filter(|key| self.within_grace(key, now))
            .collect();

        Ok(Self {
            active,
            retired,
            grace: self.grace,
        })
    }

    /// Number of keys able to verify (active included). Never zero.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        1 + self.retired.len()
    }

    fn within_grace(&self, key: &SigningKey, now: i64) -> bool {
        let Some(at) = key.retired_at else {
            return true;
        };
        let grace = i64::try_from(self.grace.as_secs()).unwrap_or(i64::MAX);
        let until = at
            .saturating_add(grace)
            .max(key.signed_until().unwrap_or(i64::MIN));
        now < until
    }
}
