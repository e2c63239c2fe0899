//! Connection lifecycle states and close reasons.

use std::fmt;

use gatehouse_protocol::ErrorKind;

// ---------------------------------------------------------------------------
// ConnectionState
// ---------------------------------------------------------------------------

/// The lifecycle state of one socket connection.
///
/// ```text
/// Connecting → Authenticating → Open → Closing → Closed
///      │              │                   ↑
///      └──────────────┴───────────────────┘
/// ```
///
/// - **Connecting**: the socket is up; no token yet.
/// - **Authenticating**: a token was presented and is being checked,
///   bound and admitted.
/// - **Open**: authenticated; messages flow both ways.
/// - **Closing**: unbinding, flushing or dropping queued messages, sending
///   the close frame.
/// - **Closed**: terminal. The connection id is never handed out again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Authenticating,
    Open,
    Closing,
    Closed,
}

impl ConnectionState {
    /// Returns `true` if moving to `target` is a legal transition.
    ///
    /// Every state before `Closing` may jump straight to `Closing`
    /// (handshake timeout, rejected token, idle, revoked…).
    pub fn can_transition_to(self, target: Self) -> bool {
        matches!(
            (self, target),
            (Self::Connecting, Self::Authenticating)
                | (Self::Connecting, Self::Closing)
                | (Self::Authenticating, Self::Open)
                | (Self::Authenticating, Self::Closing)
                | (Self::Open, Self::Closing)
                | (Self::Closing, Self::Closed)
        )
    }

    /// Whether application messages may flow.
    pub fn is_open(self) -> bool {
        matches!(self, Self::Open)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => write!(f, "Connecting"),
            Self::Authenticating => write!(f, "Authenticating"),
            Self::Open => write!(f, "Open"),
            Self::Closing => write!(f, "Closing"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

// ---------------------------------------------------------------------------
// CloseReason
// ---------------------------------------------------------------------------

/// Close code for a refused or failed authentication.
pub const CLOSE_UNAUTHORIZED: u16 = 4001;
/// Close code when the token is valid but the connection isn't allowed
/// (bind conflict, connection limit).
pub const CLOSE_FORBIDDEN: u16 = 4003;
pub const CLOSE_IDLE: u16 = 4008;
pub const CLOSE_EVICTED: u16 = 4009;
pub const CLOSE_REVOKED: u16 = 4010;

/// Why a connection is being closed. Decides the close frame's code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer went away without a `Disconnect`.
    ClientClosed,
    /// The peer sent `Disconnect`.
    ClientRequested(String),
    /// No `Authenticate` message arrived within the handshake timeout.
    HandshakeTimeout,
    /// Authentication or admission failed with this kind.
    Rejected(ErrorKind),
    /// No inbound traffic for the idle timeout.
    Idle,
    /// Another connection took over the token.
    Evicted,
    /// The token was revoked (or swept) while the connection was open.
    Revoked,
    /// The token's expiry passed while the connection was open.
    Expired,
    /// The session store was unreachable and the socket config says to
    /// close in that case.
    StoreUnavailable,
    /// The server is shutting down.
    ServerShutdown,
    /// Reading or writing the socket failed.
    TransportFailed(String),
}

impl CloseReason {
    /// The WebSocket close code sent with the close frame.
    pub fn code(&self) -> u16 {
        match self {
            Self::ClientClosed | Self::ClientRequested(_) => 1000,
            Self::ServerShutdown => 1001,
            Self::StoreUnavailable | Self::TransportFailed(_) => 1011,
            Self::HandshakeTimeout | Self::Expired => CLOSE_UNAUTHORIZED,
            Self::Rejected(kind) => rejection_code(*kind),
            Self::Idle => CLOSE_IDLE,
            Self::Evicted => CLOSE_EVICTED,
            Self::Revoked => CLOSE_REVOKED,
        }
    }

    /// The error kind to log for this close, if it is a failure of the
    /// session rather than an ordinary goodbye.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Rejected(kind) => Some(*kind),
            Self::Revoked => Some(ErrorKind::TokenRevoked),
            Self::Expired => Some(ErrorKind::TokenExpired),
            Self::StoreUnavailable => Some(ErrorKind::InternalStoreUnavailable),
            _ => None,
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClientClosed => write!(f, "client closed"),
            Self::ClientRequested(reason) => write!(f, "client disconnected: {reason}"),
            Self::HandshakeTimeout => write!(f, "authentication timed out"),
            Self::Rejected(kind) => write!(f, "rejected: {kind}"),
            Self::Idle => write!(f, "idle timeout"),
            Self::Evicted => write!(f, "session opened elsewhere"),
            Self::Revoked => write!(f, "session revoked"),
            Self::Expired => write!(f, "session expired"),
            Self::StoreUnavailable => write!(f, "session store unavailable"),
            Self::ServerShutdown => write!(f, "server shutting down"),
            Self::TransportFailed(e) => write!(f, "transport failed: {e}"),
        }
    }
}

fn rejection_code(kind: ErrorKind) -> u16 {
    match kind {
        ErrorKind::ConnectionBindConflict | ErrorKind::ConnectionLimitExceeded => CLOSE_FORBIDDEN,
        ErrorKind::InternalStoreUnavailable | ErrorKind::Internal => 1011,
        _ => CLOSE_UNAUTHORIZED,
    }
}
