//! Session registry for Gatehouse.
//!
//! This crate tracks every issued token and the live connection bound to
//! it:
//!
//! 1. **Registry** ([`SessionRegistry`]): register, revoke, bind,
//!    unbind, sweep. Publishes [`RegistryEvent`]s on revocation.
//! 2. **Storage** ([`SessionStore`] trait, [`MemoryStore`]): the atomic
//!    record operations the registry is built from.
//! 3. **Authentication** ([`Authenticator`] trait, [`TokenAuthenticator`]):
//!    the hook the socket session manager calls during the handshake.
//!
//! # How it fits in the stack
//!
//! ```text
//! Socket Session Manager (above)  ← binds connections, listens for revocations
//!     ↕
//! Session Layer (this crate)      ← which tokens are valid, who holds them
//!     ↕
//! Auth Layer (below)              ← signatures, expiry, credential checks
//! ```

#![allow(async_fn_in_trait)]

mod auth;
mod error;
mod record;
mod registry;
mod store;

pub use auth::{Authenticator, TokenAuthenticator};
pub use error::SessionError;
pub use record::{BindOutcome, BindPolicy, RegistryConfig, SessionRecord};
pub use registry::{RegistryEvent, SessionRegistry};
pub use store::{MemoryStore, SessionStore};
