use gatehouse_protocol::ErrorKind;

/// Errors from a downstream call.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The downstream answered 401 or 403. Never retried.
    #[error("downstream rejected the session token (HTTP {status})")]
    Unauthorized { status: u16 },

    /// Every attempt timed out, failed to connect, or got a 5xx.
    #[error("downstream unavailable after {attempts} attempt(s): {last}")]
    Unavailable { attempts: u32, last: String },

    /// The owning session ended while the call was in flight.
    #[error("call cancelled: session closed")]
    Cancelled,

    /// The request could not be built (bad URL, unserializable body).
    #[error("invalid downstream request: {0}")]
    InvalidRequest(String),
}

impl GatewayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Unauthorized { .. } => ErrorKind::DownstreamUnauthorized,
            Self::Unavailable { .. } | Self::Cancelled => ErrorKind::DownstreamUnavailable,
            Self::InvalidRequest(_) => ErrorKind::Internal,
        }
    }

    /// Number of attempts made, where known.
    pub fn attempts(&self) -> Option<u32> {
        match self {
            Self::Unavailable { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }
}
