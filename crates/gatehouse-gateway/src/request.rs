//! Request, response, and session handle types.

use std::fmt;

use gatehouse_protocol::{Identity, TokenId};
use reqwest::Method;
use reqwest::header::HeaderMap;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

/// What the gateway needs to know about the session it calls for.
///
/// Cloned out of a live connection. `cancel` fires when the connection
/// closes, which aborts any call still in flight.
#[derive(Clone)]
pub struct SessionHandle {
    identity: Identity,
    token_id: TokenId,
    token: String,
    cancel: CancellationToken,
}

impl SessionHandle {
    pub fn new(
        identity: Identity,
        token_id: TokenId,
        token: impl Into<String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            identity,
            token_id,
            token: token.into(),
            cancel,
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn token_id(&self) -> &TokenId {
        &self.token_id
    }

    /// The encoded session token, sent as `Authorization: Bearer`.
    pub fn bearer(&self) -> &str {
        &self.token
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("identity", &self.identity)
            .field("token_id", &self.token_id)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// A downstream HTTP request.
#[derive(Debug, Clone)]
pub struct DownstreamRequest {
    pub method: Method,
    /// Absolute, or relative to [`GatewayConfig::base_url`](crate::GatewayConfig::base_url).
    pub url: String,
    pub body: Option<serde_json::Value>,
    pub headers: Vec<(String, String)>,
    /// Overrides the method-based idempotency guess.
    idempotent: Option<bool>,
}

impl DownstreamRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            body: None,
            headers: Vec::new(),
            idempotent: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn put(url: impl Into<String>) -> Self {
        Self::new(Method::PUT, url)
    }

    pub fn delete(url: impl Into<String>) -> Self {
        Self::new(Method::DELETE, url)
    }

    /// Sets a JSON body.
    pub fn json(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Marks the request safe (or unsafe) to retry regardless of method,
    /// e.g. a POST carrying an idempotency key.
    pub fn idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = Some(idempotent);
        self
    }

    /// Whether the request may be sent more than once. GET, HEAD, PUT,
    /// DELETE and OPTIONS are idempotent unless overridden.
    pub fn is_idempotent(&self) -> bool {
        self.idempotent.unwrap_or_else(|| {
            matches!(
                self.method,
                Method::GET | Method::HEAD | Method::PUT | Method::DELETE | Method::OPTIONS
            )
        })
    }
}

/// A downstream answer that was neither 401/403 nor 5xx.
#[derive(Debug, Clone)]
pub struct DownstreamResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl DownstreamResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Deserializes the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    /// The body as UTF-8, lossily.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}
