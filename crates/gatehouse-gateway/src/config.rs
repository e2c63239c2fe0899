//! Timeout and retry settings for downstream calls.

use std::time::Duration;

use url::Url;

/// Configuration for the [`OutboundGateway`](crate::OutboundGateway).
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Relative request URLs are joined onto this. `None` means every
    /// request must carry an absolute URL.
    pub base_url: Option<Url>,

    /// Deadline for a single attempt, connect through last body byte.
    /// Default: 5 seconds.
    pub request_timeout: Duration,

    /// Total attempts for an idempotent request, first one included.
    /// Default: 3.
    pub max_attempts: u32,

    /// Delay before the first retry. Doubles each retry, with jitter.
    /// Default: 100 ms.
    pub base_backoff: Duration,

    /// Upper bound on a single retry delay. Default: 2 seconds.
    pub max_backoff: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            request_timeout: Duration::from_secs(5),
            max_attempts: 3,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl GatewayConfig {
    /// Clamps values that would disable the gateway outright.
    pub fn validated(mut self) -> Self {
        if self.max_attempts == 0 {
            tracing::warn!("max_attempts of 0 is invalid, using 1");
            self.max_attempts = 1;
        }
        if self.request_timeout.is_zero() {
            tracing::warn!("request_timeout of 0 is invalid, using 5s");
            self.request_timeout = Duration::from_secs(5);
        }
        if self.max_backoff < self.base_backoff {
            self.max_backoff = self.base_backoff;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validated_zero_attempts_becomes_one() {
        let config = GatewayConfig {
            max_attempts: 0,
            ..GatewayConfig::default()
        }
        .validated();
        assert_eq!(config.max_attempts, 1);
    }

    #[test]
    fn test_validated_max_backoff_not_below_base() {
        let config = GatewayConfig {
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_millis(100),
            ..GatewayConfig::default()
        }
        .validated();
        assert_eq!(config.max_backoff, Duration::from_millis(500));
    }
}
