//! Error types for the protocol layer.

/// Errors that can occur while encoding or decoding frames.
///
/// A `ProtocolError` always means "the bytes were wrong", never "the
/// network was wrong" (that's `TransportError`) and never "the token was
/// wrong" (that's `AuthError`).
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Serialization failed.
    #[cfg(feature = "json")]
    #[error("encode failed: {0}")]
    Encode(serde_json::Error),

    /// Deserialization failed: malformed JSON, missing fields, unknown tag.
    #[cfg(feature = "json")]
    #[error("decode failed: {0}")]
    Decode(serde_json::Error),

    /// The frame decoded fine but broke a protocol rule, e.g. an
    /// application payload before authentication.
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}
