//! Token lifetimes and hashing cost.

use std::time::Duration;

/// Lifetimes for issued tokens.
///
/// Call [`validated()`](Self::validated) before use; it clamps values
/// that would produce tokens nobody can use.
#[derive(Debug, Clone)]
pub struct TokenConfig {
    /// Lifetime of access tokens (socket upgrades, downstream calls).
    pub access_ttl: Duration,
    /// Lifetime of refresh tokens (only accepted by `refresh`).
    pub refresh_ttl: Duration,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            access_ttl: Duration::from_secs(30 * 60),
            refresh_ttl: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

impl TokenConfig {
    /// Returns a copy with lifetimes clamped to at least one second and the
    /// refresh lifetime no shorter than the access lifetime.
    pub fn validated(mut self) -> Self {
        let min = Duration::from_secs(1);
        if self.access_ttl < min {
            tracing::warn!(access_ttl = ?self.access_ttl, "access_ttl below 1s, clamping");
            self.access_ttl = min;
        }
        if self.refresh_ttl < self.access_ttl {
            tracing::warn!(
                refresh_ttl = ?self.refresh_ttl,
                "refresh_ttl shorter than access_ttl, raising it"
            );
            self.refresh_ttl = self.access_ttl;
        }
        self
    }

    /// How long a retired signing key keeps verifying tokens: the longest
    /// lifetime any token signed with it can have.
    pub fn key_grace(&self) -> Duration {
        self.access_ttl.max(self.refresh_ttl)
    }
}

/// Argon2id cost parameters for new credential hashes.
///
/// Existing hashes are verified with the parameters recorded in their PHC
/// string, so changing these only affects newly minted records.
#[derive(Debug, Clone)]
pub struct HashingConfig {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for HashingConfig {
    fn default() -> Self {
        Self {
            memory_kib: argon2::Params::DEFAULT_M_COST,
            iterations: argon2::Params::DEFAULT_T_COST,
            parallelism: argon2::Params::DEFAULT_P_COST,
        }
    }
}
