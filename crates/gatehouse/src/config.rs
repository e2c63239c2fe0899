//! Socket and server configuration, plus loading everything from the
//! environment.

use std::fmt;
use std::time::Duration;

use gatehouse_auth::{MIN_SECRET_LEN, TokenConfig};
use gatehouse_gateway::GatewayConfig;
use gatehouse_session::{BindPolicy, RegistryConfig};
use url::Url;

use crate::GatehouseError;

/// What happens to queued outbound messages when a connection closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutboundPolicy {
    /// Write everything already queued before the close frame.
    #[default]
    Flush,
    /// Discard the queue and close right away.
    Drop,
}

/// Per-connection settings for the socket session manager.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// How long a client without an upgrade token has to send its
    /// `Authenticate` message. Default: 5 seconds.
    pub handshake_timeout: Duration,

    /// An open connection with no inbound traffic for this long is closed.
    /// Heartbeats count as traffic. Default: 60 seconds.
    pub idle_timeout: Duration,

    /// How often each open connection re-checks its token against the
    /// registry. Backstop for missed revocation events. Default: 5 seconds.
    pub revocation_check_interval: Duration,

    /// Maximum open connections per identity. Default: 5.
    pub max_connections_per_identity: usize,

    /// Capacity of each connection's outbound queue. A full queue makes
    /// sends to that connection fail instead of waiting. Default: 256.
    pub outbound_queue_capacity: usize,

    pub outbound_policy: OutboundPolicy,

    /// Close open connections when the revocation poll can't reach the
    /// session store. Default: `false` (keep them open).
    pub close_on_store_unavailable: bool,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(60),
            revocation_check_interval: Duration::from_secs(5),
            max_connections_per_identity: 5,
            outbound_queue_capacity: 256,
            outbound_policy: OutboundPolicy::default(),
            close_on_store_unavailable: false,
        }
    }
}

impl SocketConfig {
    /// Replaces values that would make tokio panic or lock every client
    /// out (zero durations, zero capacities).
    pub fn validated(mut self) -> Self {
        if self.handshake_timeout.is_zero() {
            tracing::warn!("handshake_timeout of 0 is invalid, using 1s");
            self.handshake_timeout = Duration::from_secs(1);
        }
        if self.idle_timeout.is_zero() {
            tracing::warn!("idle_timeout of 0 is invalid, using 1s");
            self.idle_timeout = Duration::from_secs(1);
        }
        if self.revocation_check_interval.is_zero() {
            tracing::warn!("revocation_check_interval of 0 is invalid, using 1s");
            self.revocation_check_interval = Duration::from_secs(1);
        }
        if self.max_connections_per_identity == 0 {
            tracing::warn!("max_connections_per_identity of 0 would refuse everyone, using 1");
            self.max_connections_per_identity = 1;
        }
        if self.outbound_queue_capacity == 0 {
            self.outbound_queue_capacity = 1;
        }
        self
    }
}

/// Everything a Gatehouse server needs, in one place.
#[derive(Clone)]
pub struct GatehouseConfig {
    pub bind_addr: String,
    /// HS256 secret for the initial signing key.
    pub signing_secret: String,
    pub token: TokenConfig,
    pub registry: RegistryConfig,
    pub socket: SocketConfig,
    pub gateway: GatewayConfig,
}

impl fmt::Debug for GatehouseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatehouseConfig")
            .field("bind_addr", &self.bind_addr)
            .field("signing_secret", &"<redacted>")
            .field("token", &self.token)
            .field("registry", &self.registry)
            .field("socket", &self.socket)
            .field("gateway", &self.gateway)
            .finish()
    }
}

impl GatehouseConfig {
    /// Loads configuration from `GATEHOUSE_*` environment variables,
    /// reading a `.env` file first if one exists.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `GATEHOUSE_BIND_ADDR` | `127.0.0.1:8080` |
    /// | `GATEHOUSE_SIGNING_SECRET` | required, at least 32 bytes |
    /// | `GATEHOUSE_ACCESS_TTL_SECS` | `1800` |
    /// | `GATEHOUSE_REFRESH_TTL_SECS` | `604800` |
    /// | `GATEHOUSE_BIND_POLICY` | `evict` (or `reject`) |
    /// | `GATEHOUSE_IDLE_TIMEOUT_SECS` | `60` |
    /// | `GATEHOUSE_REVOCATION_CHECK_SECS` | `5` |
    /// | `GATEHOUSE_MAX_CONNECTIONS_PER_IDENTITY` | `5` |
    /// | `GATEHOUSE_DOWNSTREAM_URL` | unset |
    /// | `GATEHOUSE_DOWNSTREAM_TIMEOUT_MS` | `5000` |
    /// | `GATEHOUSE_DOWNSTREAM_MAX_ATTEMPTS` | `3` |
    ///
    /// Unparseable numbers fall back to their default.
    ///
    /// # Errors
    /// [`GatehouseError::Config`] if the signing secret is missing or too
    /// short, the bind policy is unknown, or the downstream URL is invalid.
    pub fn from_env() -> Result<Self, GatehouseError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) but reads variables through
    /// `lookup`, so tests don't have to touch the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, GatehouseError> {
        let signing_secret = lookup("GATEHOUSE_SIGNING_SECRET")
            .ok_or_else(|| GatehouseError::Config("GATEHOUSE_SIGNING_SECRET must be set".into()))?;
        if signing_secret.len() < MIN_SECRET_LEN {
            return Err(GatehouseError::Config(format!(
                "GATEHOUSE_SIGNING_SECRET must be at least {MIN_SECRET_LEN} bytes"
            )));
        }

        let secs = |key: &str, default: u64| {
            Duration::from_secs(parse_or(lookup(key), default))
        };

        let token = TokenConfig {
            access_ttl: secs("GATEHOUSE_ACCESS_TTL_SECS", 30 * 60),
            refresh_ttl: secs("GATEHOUSE_REFRESH_TTL_SECS", 7 * 24 * 60 * 60),
        };

        let bind_policy = match lookup("GATEHOUSE_BIND_POLICY").as_deref() {
            None | Some("evict") => BindPolicy::Evict,
            Some("reject") => BindPolicy::Reject,
            Some(other) => {
                return Err(GatehouseError::Config(format!(
                    "GATEHOUSE_BIND_POLICY must be `evict` or `reject`, got `{other}`"
                )));
            }
        };
        let registry = RegistryConfig {
            bind_policy,
            ..RegistryConfig::default()
        };

        let socket = SocketConfig {
            idle_timeout: secs("GATEHOUSE_IDLE_TIMEOUT_SECS", 60),
            revocation_check_interval: secs("GATEHOUSE_REVOCATION_CHECK_SECS", 5),
            max_connections_per_identity: parse_or(
                lookup("GATEHOUSE_MAX_CONNECTIONS_PER_IDENTITY"),
                5,
            ),
            ..SocketConfig::default()
        };

        let base_url = lookup("GATEHOUSE_DOWNSTREAM_URL")
            .map(|raw| {
                Url::parse(&raw).map_err(|e| {
                    GatehouseError::Config(format!("GATEHOUSE_DOWNSTREAM_URL: {e}"))
                })
            })
            .transpose()?;
        let gateway = GatewayConfig {
            base_url,
            request_timeout: Duration::from_millis(parse_or(
                lookup("GATEHOUSE_DOWNSTREAM_TIMEOUT_MS"),
                5_000,
            )),
            max_attempts: parse_or(lookup("GATEHOUSE_DOWNSTREAM_MAX_ATTEMPTS"), 3),
            ..GatewayConfig::default()
        };

        Ok(Self {
            bind_addr: lookup("GATEHOUSE_BIND_ADDR").unwrap_or_else(|| "127.0.0.1:8080".into()),
            signing_secret,
            token: token.validated(),
            registry: registry.validated(),
            socket: socket.validated(),
            gateway: gateway.validated(),
        })
    }
}

fn parse_or<T: std::str::FromStr>(raw: Option<String>, default: T) -> T {
    raw.and_then(|value| value.trim().parse().ok()).unwrap_or(default)
}
