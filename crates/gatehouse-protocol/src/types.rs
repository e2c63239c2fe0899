//! Core protocol types for the Gatehouse socket wire format.
//!
//! Everything in this module is serialized, sent over a live socket, and
//! deserialized on the other side. Identity types live here too because
//! every layer above (auth, session, socket manager) speaks in them.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ErrorKind;

// ---------------------------------------------------------------------------
// Identity types
// ---------------------------------------------------------------------------

/// An opaque reference to an authenticated principal (username, account id).
///
/// Newtype over `String` so an identity can never be confused with a
/// token identifier or a raw secret in a function signature.
/// `#[serde(transparent)]` keeps it a plain JSON string on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    /// Wraps a raw identity string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrows the underlying string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// The unique nonce of a session token (`jti` claim).
///
/// The session registry is keyed by this value, which is what makes
/// revocation independent of signature checking.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenId(String);

impl TokenId {
    /// Wraps a raw token identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrows the underlying string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// SystemMessage: session-level messages
// ---------------------------------------------------------------------------

/// Messages the session core itself produces or consumes.
///
/// Application data never appears here; it travels as [`Payload::App`]
/// and is handed to the registered message handler untouched.
///
/// `#[serde(tag = "type")]` makes the JSON internally tagged:
/// `{ "type": "Authenticate", "token": "…" }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SystemMessage {
    // -- Authentication --

    /// Client → Server: present a session token after the upgrade.
    /// Only needed when the token wasn't supplied with the upgrade request.
    Authenticate { token: String },

    /// Server → Client: the connection is `Open`.
    AuthAck {
        identity: Identity,
        connection_id: u64,
        /// Unix seconds at which the presented token expires.
        expires_at: i64,
        version: u32,
    },

    /// Server → Client: authentication failed; the socket is closing.
    /// `kind` lets the client tell "expired, refresh" from "re-login".
    Rejected { kind: ErrorKind, message: String },

    // -- Keep-alive --

    /// Client → Server: "I'm still here." Counts as activity.
    Heartbeat { client_time: u64 },

    /// Server → Client: echo of the client's timestamp plus server time.
    HeartbeatAck { client_time: u64, server_time: u64 },

    // -- Rooms --

    /// Client → Server: subscribe this connection to a named room.
    JoinRoom { room: String },

    /// Server → Client: the join succeeded.
    RoomJoined { room: String },

    /// Client → Server: unsubscribe from a room.
    LeaveRoom { room: String },

    // -- Teardown --

    /// Either direction: orderly disconnect with a human-readable reason.
    Disconnect { reason: String },

    /// Server → Client: the server is closing this connection.
    /// `code` matches the close frame that follows.
    Closing { code: u16, reason: String },

    /// Server → Client: a request on an open connection failed.
    /// HTTP-style codes (400 bad request, 404 not found, …).
    Error { code: u16, message: String },
}

// ---------------------------------------------------------------------------
// Payload / Envelope
// ---------------------------------------------------------------------------

/// The content of an envelope: a system message or opaque application bytes.
///
/// Adjacently tagged: `{ "type": "System", "data": { … } }` or
/// `{ "type": "App", "data": [1, 2, 3] }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Payload {
    /// A session-level message.
    System(SystemMessage),

    /// Application data, passed through to the message handler.
    App(Vec<u8>),
}

/// The top-level frame. Every socket message is one `Envelope`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Per-direction sequence number.
    pub seq: u64,

    /// Milliseconds since the connection was accepted.
    pub timestamp: u64,

    /// The message content.
    pub payload: Payload,
}

impl Envelope {
    /// Builds an envelope carrying a system message.
    pub fn system(seq: u64, timestamp: u64, msg: SystemMessage) -> Self {
        Self {
            seq,
            timestamp,
            payload: Payload::System(msg),
        }
    }

    /// Builds an envelope carrying application bytes.
    pub fn app(seq: u64, timestamp: u64, data: Vec<u8>) -> Self {
        Self {
            seq,
            timestamp,
            payload: Payload::App(data),
        }
    }
}

// =========================================================================
// Tests
// =========================================================================

#[cfg(test)]
mod tests {
    //! The socket client SDK parses these exact JSON shapes, so the tests
    //! pin the serde attributes rather than round-tripping every variant.

    use super::*;

    #[test]
    fn test_identity_serializes_as_plain_string() {
        let json = serde_json::to_string(&Identity::new("alice")).unwrap();
        assert_eq!(json, "\"alice\"");
    }

    #[test]
    fn test_identity_display_is_raw_value() {
        assert_eq!(Identity::from("bob").to_string(), "bob");
    }

    #[test]
    fn test_token_id_serializes_as_plain_string() {
        let json = serde_json::to_string(&TokenId::new("abc-123")).unwrap();
        assert_eq!(json, "\"abc-123\"");
    }

    #[test]
    fn test_system_message_authenticate_json_format() {
        let msg = SystemMessage::Authenticate {
            token: "a.b.c".into(),
        };
        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();

        assert_eq!(json["type"], "Authenticate");
        assert_eq!(json["token"], "a.b.c");
    }

    #[test]
    fn test_system_message_auth_ack_json_format() {
        let msg = SystemMessage::AuthAck {
            identity: Identity::new("alice"),
            connection_id: 7,
            expires_at: 1_700_000_000,
            version: 1,
        };
        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();

        assert_eq!(json["type"], "AuthAck");
        assert_eq!(json["identity"], "alice");
        assert_eq!(json["connection_id"], 7);
        assert_eq!(json["expires_at"], 1_700_000_000i64);
    }

    #[test]
    fn test_system_message_rejected_carries_kind() {
        let msg = SystemMessage::Rejected {
            kind: ErrorKind::TokenRevoked,
            message: "token revoked".into(),
        };
        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();

        assert_eq!(json["type"], "Rejected");
        assert_eq!(json["kind"], "token_revoked");
    }

    #[test]
    fn test_system_message_closing_json_format() {
        let msg = SystemMessage::Closing {
            code: 4008,
            reason: "idle timeout".into(),
        };
        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();

        assert_eq!(json["type"], "Closing");
        assert_eq!(json["code"], 4008);
    }

    #[test]
    fn test_payload_app_json_format() {
        let payload = Payload::App(vec![1, 2, 3]);
        let json: serde_json::Value = serde_json::to_value(&payload).unwrap();

        assert_eq!(json["type"], "App");
        assert_eq!(json["data"], serde_json::json!([1, 2, 3]));
    }

    #[test]
    fn test_envelope_system_constructor() {
        let env = Envelope::system(3, 50, SystemMessage::Heartbeat { client_time: 9 });
        assert_eq!(env.seq, 3);
        assert_eq!(env.timestamp, 50);
        assert!(matches!(
            env.payload,
            Payload::System(SystemMessage::Heartbeat { client_time: 9 })
        ));
    }

    #[test]
    fn test_envelope_round_trip() {
        let env = Envelope::system(
            1,
            10,
            SystemMessage::JoinRoom {
                room: "lobby".into(),
            },
        );
        let bytes = serde_json::to_vec(&env).unwrap();
        let decoded: Envelope = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(env, decoded);
    }

    #[test]
    fn test_decode_unknown_system_message_type_returns_error() {
        let unknown = r#"{"type": "Teleport", "to": "mars"}"#;
        let result: Result<SystemMessage, _> = serde_json::from_str(unknown);
        assert!(result.is_err());
    }

    #[test]
    fn test_decode_garbage_returns_error() {
        let result: Result<Envelope, _> = serde_json::from_slice(b"not json at all");
        assert!(result.is_err());
    }
}
