//! Credential verification against stored salted hashes.
//!
//! A [`CredentialRecord`] pairs an identity with a salted hash of its
//! secret. The [`CredentialVerifier`] looks records up through the
//! [`CredentialStore`] trait and compares in constant time. The same work
//! is done whether the identity exists or not, so response time does not
//! reveal which identities are registered.
//!
//! Two hash formats are understood:
//!
//! - `argon2id`: a PHC string (`$argon2id$v=19$m=…`), the default
//! - `salted-sha256`: `hex(salt)$hex(sha256(salt || secret))`, for
//!   records imported from older systems

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Argon2, Params, Version};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use gatehouse_protocol::Identity;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::{AuthError, HashingConfig};

const SHA256_SALT_LEN: usize = 16;
const ARGON2_SALT_LEN: usize = 16;

/// Identifies how a credential record's hash was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashAlgorithm {
    Argon2id,
    SaltedSha256,
}

impl HashAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Argon2id => "argon2id",
            Self::SaltedSha256 => "salted-sha256",
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HashAlgorithm {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "argon2id" => Ok(Self::Argon2id),
            "salted-sha256" => Ok(Self::SaltedSha256),
            other => Err(AuthError::Hashing(format!("unknown algorithm `{other}`"))),
        }
    }
}

/// Produces new hashes. Verification never needs one: argon2 reads its
/// cost from the stored PHC string.
#[derive(Clone)]
pub struct SecretHasher {
    argon2: Argon2<'static>,
}

impl SecretHasher {
    pub fn new(config: &HashingConfig) -> Result<Self, AuthError> {
        let params = Params::new(
            config.memory_kib,
            config.iterations,
            config.parallelism,
            None,
        )
        .map_err(|e| AuthError::InvalidKey(e.to_string()))?;
        Ok(Self {
            argon2: Argon2::new(argon2::Algorithm::Argon2id, Version::V0x13, params),
        })
    }

    /// Hashes `secret` with a fresh random salt.
    pub fn hash(&self, algorithm: HashAlgorithm, secret: &str) -> Result<String, AuthError> {
        match algorithm {
            HashAlgorithm::Argon2id => {
                let salt = SaltString::encode_b64(&rand::random::<[u8; ARGON2_SALT_LEN]>())
                    .map_err(|e| AuthError::Hashing(e.to_string()))?;
                self.argon2
                    .hash_password(secret.as_bytes(), &salt)
                    .map(|hash| hash.to_string())
                    .map_err(|e| AuthError::Hashing(e.to_string()))
            }
            HashAlgorithm::SaltedSha256 => {
                let salt: [u8; SHA256_SALT_LEN] = rand::random();
                let digest = sha256_salted(&salt, secret);
                Ok(format!("{}${}", hex::encode(salt), hex::encode(digest)))
            }
        }
    }
}

impl Default for SecretHasher {
    fn default() -> Self {
        Self {
            argon2: Argon2::default(),
        }
    }
}

/// Hashes `secret` with default argon2 cost parameters.
pub fn hash_secret(algorithm: HashAlgorithm, secret: &str) -> Result<String, AuthError> {
    SecretHasher::default().hash(algorithm, secret)
}

fn sha256_salted(salt: &[u8], secret: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(secret.as_bytes());
    hasher.finalize().to_vec()
}

/// A stored credential. Immutable; rotation replaces the whole record.
#[derive(Clone)]
pub struct CredentialRecord {
    identity: Identity,
    algorithm: HashAlgorithm,
    hash: String,
    created_at: DateTime<Utc>,
}

impl CredentialRecord {
    /// Wraps an existing hash, e.g. one loaded from a database.
    pub fn from_hash(identity: Identity, algorithm: HashAlgorithm, hash: impl Into<String>) -> Self {
        Self {
            identity,
            algorithm,
            hash: hash.into(),
            created_at: Utc::now(),
        }
    }

    /// Hashes `secret` and builds a new record.
    pub fn create(
        hasher: &SecretHasher,
        identity: Identity,
        algorithm: HashAlgorithm,
        secret: &str,
    ) -> Result<Self, AuthError> {
        let hash = hasher.hash(algorithm, secret)?;
        Ok(Self::from_hash(identity, algorithm, hash))
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Checks `secret` against the stored hash.
    ///
    /// `Err` means the stored hash could not be parsed, not that the
    /// secret was wrong.
    fn matches(&self, secret: &str) -> Result<bool, AuthError> {
        match self.algorithm {
            HashAlgorithm::Argon2id => {
                let parsed =
                    PasswordHash::new(&self.hash).map_err(|e| AuthError::Hashing(e.to_string()))?;
                Ok(Argon2::default()
                    .verify_password(secret.as_bytes(), &parsed)
                    .is_ok())
            }
            HashAlgorithm::SaltedSha256 => {
                let (salt_hex, digest_hex) = self
                    .hash
                    .split_once('$')
                    .ok_or_else(|| AuthError::Hashing("missing salt separator".into()))?;
                let salt = hex::decode(salt_hex).map_err(|e| AuthError::Hashing(e.to_string()))?;
                let expected =
                    hex::decode(digest_hex).map_err(|e| AuthError::Hashing(e.to_string()))?;
                let actual = sha256_salted(&salt, secret);
                Ok(actual.ct_eq(&expected).into())
            }
        }
    }
}

impl fmt::Debug for CredentialRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialRecord")
            .field("identity", &self.identity)
            .field("algorithm", &self.algorithm)
            .field("hash", &"<redacted>")
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// Where credential records come from.
pub trait CredentialStore: Send + Sync + 'static {
    fn get(&self, identity: &Identity) -> Result<Option<CredentialRecord>, AuthError>;
}

/// A process-local [`CredentialStore`].
#[derive(Debug, Default)]
pub struct InMemoryCredentialStore {
    records: DashMap<Identity, CredentialRecord>,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a record. Returns `false` (and changes nothing) if the
    /// identity already has one; use [`rotate`](Self::rotate) to replace.
    pub fn insert(&self, record: CredentialRecord) -> bool {
        match self.records.entry(record.identity.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(record);
                true
            }
        }
    }

    /// Replaces the record for its identity, returning the old one.
    pub fn rotate(&self, record: CredentialRecord) -> Option<CredentialRecord> {
        tracing::info!(identity = %record.identity, "credential rotated");
        self.records.insert(record.identity.clone(), record)
    }

    pub fn remove(&self, identity: &Identity) -> Option<CredentialRecord> {
        self.records.remove(identity).map(|(_, record)| record)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl CredentialStore for InMemoryCredentialStore {
    fn get(&self, identity: &Identity) -> Result<Option<CredentialRecord>, AuthError> {
        Ok(self.records.get(identity).map(|r| r.value().clone()))
    }
}

/// Why a verification failed. Handed to [`FailedAttemptHook`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    UnknownIdentity,
    WrongSecret,
    /// The stored hash could not be parsed.
    UnreadableRecord,
    StoreUnavailable,
}

/// Receives every failed verification, e.g. to drive lockout or rate
/// limiting. Called synchronously on the verifying thread.
pub trait FailedAttemptHook: Send + Sync + 'static {
    fn on_failed_attempt(&self, identity: &Identity, reason: FailureReason);
}

/// Checks presented secrets against stored credential records.
pub struct CredentialVerifier {
    store: Arc<dyn CredentialStore>,
    hook: Option<Arc<dyn FailedAttemptHook>>,
    /// Verified against when the identity is unknown.
    decoy: CredentialRecord,
}

impl CredentialVerifier {
    /// Creates a verifier. The decoy record is hashed with `hasher`, which
    /// should use the same cost as real records.
    pub fn new(store: Arc<dyn CredentialStore>, hasher: &SecretHasher) -> Result<Self, AuthError> {
        let decoy_secret = hex::encode(rand::random::<[u8; 32]>());
        let decoy = CredentialRecord::create(
            hasher,
            Identity::new(""),
            HashAlgorithm::Argon2id,
            &decoy_secret,
        )?;
        Ok(Self {
            store,
            hook: None,
            decoy,
        })
    }

    pub fn with_hook(mut self, hook: Arc<dyn FailedAttemptHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Returns `true` only if `identity` exists and `secret` matches.
    pub fn verify(&self, identity: &Identity, secret: &str) -> bool {
        self.authenticate(identity, secret).is_ok()
    }

    /// Like [`verify`](Self::verify) but reports the failure.
    ///
    /// Every credential failure is `InvalidCredentials`; a store outage
    /// is `StoreUnavailable`.
    pub fn authenticate(&self, identity: &Identity, secret: &str) -> Result<(), AuthError> {
        let record = match self.store.get(identity) {
            Ok(Some(record)) => record,
            Ok(None) => {
                let _ = self.decoy.matches(secret);
                self.failed(identity, FailureReason::UnknownIdentity);
                return Err(AuthError::InvalidCredentials);
            }
            Err(e) => {
                let _ = self.decoy.matches(secret);
                tracing::warn!(%identity, error = %e, "credential store unavailable");
                self.failed(identity, FailureReason::StoreUnavailable);
                return Err(e);
            }
        };

        match record.matches(secret) {
            Ok(true) => Ok(()),
            Ok(false) => {
                self.failed(identity, FailureReason::WrongSecret);
                Err(AuthError::InvalidCredentials)
            }
            Err(e) => {
                tracing::warn!(%identity, error = %e, "unreadable credential record");
                self.failed(identity, FailureReason::UnreadableRecord);
                Err(AuthError::InvalidCredentials)
            }
        }
    }

    fn failed(&self, identity: &Identity, reason: FailureReason) {
        tracing::debug!(%identity, ?reason, "credential verification failed");
        if let Some(hook) = &self.hook {
            hook.on_failed_attempt(identity, reason);
        }
    }
}
