use std::time::Duration;

use thiserror::Error;

/// Stable error taxonomy for the gateway's request pipeline.
///
/// Every variant maps to one row of the distilled spec's error table: a
/// stable `code()`, a `recoverable()` hint for clients, and (via
/// `gateway-http`) an HTTP status. Variants are not retried automatically
/// here — the dispatcher decides retry policy using `code()`.
#[derive(Debug, Error, Clone)]
pub enum GatewayError {
    #[error("unauthorized: {reason}")]
    Unauthorized { reason: String },

    #[error("rate limited: retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("not found: {what}")]
    NotFound { what: String },

    #[error("no healthy instance available for template `{template}`")]
    NoHealthyInstance { template: String },

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("circuit breaker open for instance `{instance_id}`")]
    BreakerOpen { instance_id: String },

    #[error("backpressure queue full for instance `{instance_id}`")]
    QueueFull { instance_id: String },

    #[error("failed to connect to instance `{instance_id}`: {reason}")]
    ConnectError { instance_id: String, reason: String },

    #[error("malformed MCP frame: {reason}")]
    ProtocolError { reason: String },

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Stable machine-readable code, used in the HTTP error envelope and in
    /// tests that assert on the distilled spec's error table.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Unauthorized { .. } => "UNAUTHORIZED",
            GatewayError::RateLimited { .. } => "RATE_LIMITED",
            GatewayError::NotFound { .. } => "NOT_FOUND",
            GatewayError::NoHealthyInstance { .. } => "NO_HEALTHY_INSTANCE",
            GatewayError::Timeout(_) => "TIMEOUT",
            GatewayError::BreakerOpen { .. } => "BREAKER_OPEN",
            GatewayError::QueueFull { .. } => "QUEUE_FULL",
            GatewayError::ConnectError { .. } => "CONNECT_ERROR",
            GatewayError::ProtocolError { .. } => "PROTOCOL_ERROR",
            GatewayError::Internal(_) => "INTERNAL",
        }
    }

    /// Whether a client can reasonably expect a retry to succeed.
    pub fn recoverable(&self) -> bool {
        matches!(
            self,
            GatewayError::RateLimited { .. }
                | GatewayError::Timeout(_)
                | GatewayError::BreakerOpen { .. }
                | GatewayError::QueueFull { .. }
                | GatewayError::ConnectError { .. }
        )
    }

    /// Whether the dispatcher may transparently retry the triggering
    /// operation against a fresh instance pick (only for idempotent reads;
    /// the dispatcher is responsible for checking the method whitelist
    /// before consulting this).
    pub fn retryable_by_dispatcher(&self) -> bool {
        matches!(
            self,
            GatewayError::ConnectError { .. } | GatewayError::Timeout(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_the_stable_table() {
        assert_eq!(
            GatewayError::Unauthorized {
                reason: "x".into()
            }
            .code(),
            "UNAUTHORIZED"
        );
        assert_eq!(
            GatewayError::RateLimited { retry_after_ms: 1 }.code(),
            "RATE_LIMITED"
        );
        assert_eq!(GatewayError::Timeout(Duration::from_secs(1)).code(), "TIMEOUT");
    }

    #[test]
    fn recoverable_kinds_match_the_spec_table() {
        assert!(GatewayError::RateLimited { retry_after_ms: 1 }.recoverable());
        assert!(GatewayError::BreakerOpen {
            instance_id: "a".into()
        }
        .recoverable());
        assert!(!GatewayError::Unauthorized { reason: "x".into() }.recoverable());
        assert!(!GatewayError::ProtocolError { reason: "x".into() }.recoverable());
    }
}
