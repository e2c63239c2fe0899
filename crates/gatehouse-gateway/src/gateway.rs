//! The outbound client: bearer auth, per-attempt timeout, bounded retry.

use std::sync::atomic::{AtomicU32, Ordering};

use reqwest::{Client, StatusCode};
use tokio_retry::Retry;
use tokio_retry::strategy::{ExponentialBackoff, jitter};
use url::Url;

use crate::{DownstreamRequest, DownstreamResponse, GatewayConfig, GatewayError, SessionHandle};

/// Calls downstream services on behalf of a session.
///
/// One `OutboundGateway` is shared by every connection; `reqwest::Client`
/// pools connections internally.
#[derive(Debug, Clone)]
pub struct OutboundGateway {
    client: Client,
    config: GatewayConfig,
}

/// How a single attempt ended, from the retry loop's point of view.
type AttemptResult = Result<Result<DownstreamResponse, GatewayError>, String>;

impl OutboundGateway {
    pub fn new(config: GatewayConfig) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .build()
            .map_err(|e| GatewayError::InvalidRequest(e.to_string()))?;
        Ok(Self::with_client(client, config))
    }

    /// Uses a preconfigured client (proxies, TLS roots, …).
    pub fn with_client(client: Client, config: GatewayConfig) -> Self {
        Self {
            client,
            config: config.validated(),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Sends `request` with the session's token.
    ///
    /// Idempotent requests are retried on timeout, connection failure,
    /// or a 5xx answer, up to `max_attempts` in total, with jittered
    /// exponential backoff. Other requests get exactly one attempt.
    ///
    /// # Errors
    /// - [`GatewayError::Unauthorized`] on 401/403, without retrying
    /// - [`GatewayError::Unavailable`] when attempts run out
    /// - [`GatewayError::Cancelled`] if the session closes first
    pub async fn call(
        &self,
        session: &SessionHandle,
        request: DownstreamRequest,
    ) -> Result<DownstreamResponse, GatewayError> {
        let url = self.resolve(&request.url)?;
        let retries = if request.is_idempotent() {
            self.config.max_attempts.saturating_sub(1) as usize
        } else {
            0
        };

        // from_millis(2).factor(b / 2) yields b, 2b, 4b, …
        let base_ms = u64::try_from(self.config.base_backoff.as_millis()).unwrap_or(u64::MAX);
        let strategy = ExponentialBackoff::from_millis(2)
            .factor((base_ms / 2).max(1))
            .max_delay(self.config.max_backoff)
            .map(jitter)
            .take(retries);

        let attempts = AtomicU32::new(0);
        let retry = Retry::spawn(strategy, || async {
            let attempt = attempts.fetch_add(1, Ordering::Relaxed) + 1;
            let outcome = self.attempt(session, &request, url.clone()).await;
            if let Err(reason) = &outcome {
                tracing::debug!(
                    identity = %session.identity(),
                    %url,
                    attempt,
                    reason = %reason,
                    "downstream attempt failed"
                );
            }
            outcome
        });

        let cancel = session.cancellation();
        let finished = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
            finished = retry => finished,
        };

        match finished {
            Ok(result) => result,
            Err(last) => {
                let attempts = attempts.load(Ordering::Relaxed);
                tracing::warn!(
                    identity = %session.identity(),
                    %url,
                    attempts,
                    "downstream unavailable"
                );
                Err(GatewayError::Unavailable { attempts, last })
            }
        }
    }

    /// One attempt. `Err(reason)` means "transient, may retry";
    /// `Ok(result)` is final either way.
    async fn attempt(
        &self,
        session: &SessionHandle,
        request: &DownstreamRequest,
        url: Url,
    ) -> AttemptResult {
        let mut builder = self
            .client
            .request(request.method.clone(), url)
            .bearer_auth(session.bearer())
            .timeout(self.config.request_timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => return Err("timed out".into()),
            Err(e) if e.is_connect() || e.is_request() => return Err(e.to_string()),
            Err(e) => return Ok(Err(GatewayError::InvalidRequest(e.to_string()))),
        };

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            tracing::info!(
                identity = %session.identity(),
                status = status.as_u16(),
                "downstream rejected session token"
            );
            return Ok(Err(GatewayError::Unauthorized {
                status: status.as_u16(),
            }));
        }
        if status.is_server_error() {
            return Err(format!("HTTP {}", status.as_u16()));
        }

        let headers = response.headers().clone();
        match response.bytes().await {
            Ok(body) => Ok(Ok(DownstreamResponse {
                status: status.as_u16(),
                headers,
                body: body.to_vec(),
            })),
            Err(e) if e.is_timeout() => Err("timed out reading body".into()),
            Err(e) => Err(e.to_string()),
        }
    }

    fn resolve(&self, target: &str) -> Result<Url, GatewayError> {
        let resolved = match &self.config.base_url {
            Some(base) => base.join(target),
            None => Url::parse(target),
        };
        resolved.map_err(|e| GatewayError::InvalidRequest(format!("{target}: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_relative_path_against_base() {
        let gateway = OutboundGateway::new(GatewayConfig {
            base_url: Some(Url::parse("http://svc.internal/api/").unwrap()),
            ..GatewayConfig::default()
        })
        .unwrap();
        assert_eq!(
            gateway.resolve("users/1").unwrap().as_str(),
            "http://svc.internal/api/users/1"
        );
    }

    #[test]
    fn test_resolve_relative_path_without_base_is_invalid() {
        let gateway = OutboundGateway::new(GatewayConfig::default()).unwrap();
        assert!(matches!(
            gateway.resolve("users/1"),
            Err(GatewayError::InvalidRequest(_))
        ));
    }
}
