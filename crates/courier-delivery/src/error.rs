//! Error types for webhook delivery operations.
//!
//! Outbound failures are classified here once, so the dispatcher can branch
//! on `is_retryable()` instead of re-inspecting HTTP details. Storage and
//! lifecycle failures share the same enum for a single `Result` alias.

use std::{fmt, time::Duration};

use courier_core::CoreError;
use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Error types for webhook delivery operations.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// Network-level connectivity failure.
    #[error("network connection failed: {message}")]
    NetworkError {
        /// Error message describing the network failure
        message: String,
    },

    /// HTTP request timeout exceeded.
    #[error("request timeout after {timeout_ms}ms")]
    Timeout {
        /// Configured per-call timeout in milliseconds
        timeout_ms: u64,
    },

    /// HTTP response indicated client error (4xx).
    #[error("client error: HTTP {status_code}")]
    ClientError {
        /// HTTP status code (4xx)
        status_code: u16,
        /// Response body content, truncated
        body: String,
    },

    /// HTTP response indicated server error (5xx).
    #[error("server error: HTTP {status_code}")]
    ServerError {
        /// HTTP status code (5xx)
        status_code: u16,
        /// Response body content, truncated
        body: String,
    },

    /// Receiver asked us to slow down (HTTP 429).
    #[error("rate limited: retry after {retry_after_seconds}s")]
    RateLimited {
        /// Seconds to wait before retrying
        retry_after_seconds: u64,
    },

    /// Non-2xx status outside the 4xx and 5xx ranges.
    #[error("unexpected response: HTTP {status_code}")]
    UnexpectedStatus {
        /// HTTP status code
        status_code: u16,
    },

    /// Webhook cannot receive notifications.
    #[error("webhook {webhook_id} unavailable: {reason}")]
    WebhookUnavailable {
        /// Webhook identifier
        webhook_id: String,
        /// Why it is unavailable
        reason: String,
    },

    /// Storage operation failed.
    #[error("database error: {message}")]
    DatabaseError {
        /// Database error message
        message: String,
    },

    /// Invalid webhook or engine configuration.
    #[error("invalid configuration: {message}")]
    ConfigurationError {
        /// Configuration error message
        message: String,
    },

    /// Engine did not stop within its shutdown timeout.
    #[error("shutdown timed out after {timeout:?}")]
    ShutdownTimeout {
        /// Timeout that was exceeded
        timeout: Duration,
    },

    /// Unexpected internal error.
    #[error("internal delivery error: {message}")]
    InternalError {
        /// Internal error message
        message: String,
    },
}

impl DeliveryError {
    /// Creates a network error from a message.
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkError { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout: Duration) -> Self {
        Self::Timeout { timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX) }
    }

    /// Creates a client error from HTTP response.
    pub fn client_error(status_code: u16, body: impl Into<String>) -> Self {
        Self::ClientError { status_code, body: body.into() }
    }

    /// Creates a server error from HTTP response.
    pub fn server_error(status_code: u16, body: impl Into<String>) -> Self {
        Self::ServerError { status_code, body: body.into() }
    }

    /// Creates a rate limit error with retry guidance.
    pub fn rate_limited(retry_after_seconds: u64) -> Self {
        Self::RateLimited { retry_after_seconds }
    }

    /// Creates an unexpected status error.
    pub fn unexpected_status(status_code: u16) -> Self {
        Self::UnexpectedStatus { status_code }
    }

    /// Creates a webhook unavailable error.
    pub fn webhook_unavailable(webhook_id: impl fmt::Display, reason: impl Into<String>) -> Self {
        Self::WebhookUnavailable { webhook_id: webhook_id.to_string(), reason: reason.into() }
    }

    /// Creates a database error.
    pub fn database(message: impl Into<String>) -> Self {
        Self::DatabaseError { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::ConfigurationError { message: message.into() }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::InternalError { message: message.into() }
    }

    /// Determines if this error represents a temporary delivery failure.
    ///
    /// Network errors, timeouts, 5xx, 429 and other unexpected statuses are
    /// retried. 4xx responses and broken configuration are permanent.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NetworkError { .. }
            | Self::Timeout { .. }
            | Self::ServerError { .. }
            | Self::RateLimited { .. }
            | Self::UnexpectedStatus { .. }
            | Self::DatabaseError { .. } => true,

            Self::ClientError { .. }
            | Self::WebhookUnavailable { .. }
            | Self::ConfigurationError { .. }
            | Self::ShutdownTimeout { .. }
            | Self::InternalError { .. } => false,
        }
    }

    /// Whether the call was cut off by the per-call timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Category used as the `category` field in failure logs.
    pub fn category(&self) -> ErrorCategory {
        ErrorCategory::from(self)
    }

    /// Returns the receiver-requested minimum delay, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after_seconds } => {
                Some(Duration::from_secs(*retry_after_seconds))
            },
            _ => None,
        }
    }
}

impl From<CoreError> for DeliveryError {
    fn from(error: CoreError) -> Self {
        Self::database(error.to_string())
    }
}

/// Category of delivery error for structured logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Network connectivity issues and timeouts.
    Network,
    /// HTTP client errors (4xx).
    Client,
    /// HTTP server errors (5xx) and other unexpected statuses.
    Server,
    /// Rate limiting.
    RateLimit,
    /// Storage operations.
    Database,
    /// Webhook or engine configuration problems.
    Configuration,
    /// Internal system errors.
    Internal,
}

impl From<&DeliveryError> for ErrorCategory {
    fn from(error: &DeliveryError) -> Self {
        match error {
            DeliveryError::NetworkError { .. } | DeliveryError::Timeout { .. } => Self::Network,
            DeliveryError::ClientError { .. } => Self::Client,
            DeliveryError::ServerError { .. } | DeliveryError::UnexpectedStatus { .. } => {
                Self::Server
            },
            DeliveryError::RateLimited { .. } => Self::RateLimit,
            DeliveryError::DatabaseError { .. } => Self::Database,
            DeliveryError::WebhookUnavailable { .. } | DeliveryError::ConfigurationError { .. } => {
                Self::Configuration
            },
            DeliveryError::ShutdownTimeout { .. } | DeliveryError::InternalError { .. } => {
                Self::Internal
            },
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network => write!(f, "network"),
            Self::Client => write!(f, "client"),
            Self::Server => write!(f, "server"),
            Self::RateLimit => write!(f, "rate_limit"),
            Self::Database => write!(f, "database"),
            Self::Configuration => write!(f, "configuration"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors_identified_correctly() {
        assert!(DeliveryError::network("connection refused").is_retryable());
        assert!(DeliveryError::timeout(Duration::from_secs(5)).is_retryable());
        assert!(DeliveryError::server_error(503, "unavailable").is_retryable());
        assert!(DeliveryError::rate_limited(60).is_retryable());
        assert!(DeliveryError::unexpected_status(302).is_retryable());

        assert!(!DeliveryError::client_error(404, "not found").is_retryable());
        assert!(!DeliveryError::client_error(401, "unauthorized").is_retryable());
        assert!(!DeliveryError::configuration("invalid URL").is_retryable());
        assert!(!DeliveryError::webhook_unavailable("abc", "inactive").is_retryable());
    }

    #[test]
    fn retry_after_only_for_rate_limits() {
        assert_eq!(DeliveryError::rate_limited(120).retry_after(), Some(Duration::from_secs(120)));
        assert_eq!(DeliveryError::timeout(Duration::from_secs(1)).retry_after(), None);
    }

    #[test]
    fn timeout_reports_milliseconds() {
        let error = DeliveryError::timeout(Duration::from_millis(1500));
        assert!(error.is_timeout());
        assert_eq!(error.to_string(), "request timeout after 1500ms");
    }

    #[test]
    fn error_categories_mapped_correctly() {
        assert_eq!(ErrorCategory::from(&DeliveryError::network("x")), ErrorCategory::Network);
        assert_eq!(
            ErrorCategory::from(&DeliveryError::client_error(400, "bad request")),
            ErrorCategory::Client
        );
        assert_eq!(
            ErrorCategory::from(&DeliveryError::server_error(500, "boom")),
            ErrorCategory::Server
        );
        assert_eq!(ErrorCategory::from(&DeliveryError::rate_limited(1)), ErrorCategory::RateLimit);
        assert_eq!(ErrorCategory::RateLimit.to_string(), "rate_limit");
    }

    #[test]
    fn core_errors_become_database_errors() {
        let error = DeliveryError::from(CoreError::Database("pool timed out".to_string()));
        assert!(matches!(error, DeliveryError::DatabaseError { .. }));
    }
}
