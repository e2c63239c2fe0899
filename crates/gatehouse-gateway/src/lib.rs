//! Outbound client gateway for Gatehouse.
//!
//! Lets a live session call a downstream HTTP service with its own token:
//!
//! ```text
//! connection task ──call(session, request)──→ OutboundGateway ──HTTP──→ downstream
//!                                                 │
//!                        Authorization: Bearer <session token>
//!                        per-attempt timeout, jittered exponential retry
//! ```
//!
//! 401/403 means the downstream no longer trusts the token and is never
//! retried. Timeouts, connection failures, and 5xx answers are retried
//! for idempotent requests only. The call is abandoned as soon as the
//! session's cancellation token fires.

mod config;
mod error;
mod gateway;
mod request;

pub use config::GatewayConfig;
pub use error::GatewayError;
pub use gateway::OutboundGateway;
pub use request::{DownstreamRequest, DownstreamResponse, SessionHandle};
