//! Wire protocol for Gatehouse.
//!
//! This crate defines what a socket client and the session core say to
//! each other, plus the identity types every other layer shares:
//!
//! - **Types** ([`Envelope`], [`SystemMessage`], [`Identity`], [`TokenId`]):
//!   the structures that travel on the wire.
//! - **Error kinds** ([`ErrorKind`]): the stable, serializable failure
//!   taxonomy used for rejections, logging, and metrics.
//! - **Codec** ([`Codec`] trait, [`JsonCodec`]): how envelopes become bytes.
//! - **Errors** ([`ProtocolError`]): what can go wrong while encoding/decoding.
//!
//! # Architecture
//!
//! ```text
//! Transport (bytes) → Protocol (Envelope) → Session manager (identity, state)
//! ```

mod codec;
mod error;
mod kind;
mod types;

pub use codec::Codec;
#[cfg(feature = "json")]
pub use codec::JsonCodec;
pub use error::ProtocolError;
pub use kind::ErrorKind;
pub use types::{Envelope, Identity, Payload, SystemMessage, TokenId};

/// The current protocol version, reported in every `AuthAck`.
pub const PROTOCOL_VERSION: u32 = 1;
