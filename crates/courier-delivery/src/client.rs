//! HTTP executor for webhook notifications.
//!
//! Builds the outbound request from a webhook definition and a notification,
//! performs the call under the configured timeout and classifies the result
//! into an [`Outcome`]. The client never touches storage; committing the
//! outcome is the dispatcher's job.

use std::{str::FromStr, time::Duration};

use bytes::Bytes;
use courier_core::{HttpMethod, Notification, Webhook};
use reqwest::{header::HeaderMap, Method, Response, Url};
use serde::{Deserialize, Serialize};
use tracing::{debug, info_span, warn, Instrument};

use crate::error::{DeliveryError, Result};

/// Header carrying the notification ID.
pub const NOTIFICATION_ID_HEADER: &str = "X-Courier-Notification-Id";
/// Header carrying the webhook ID.
pub const WEBHOOK_ID_HEADER: &str = "X-Courier-Webhook-Id";
/// Header carrying the 1-based attempt number.
pub const ATTEMPT_HEADER: &str = "X-Courier-Attempt";

const MAX_ERROR_BODY_SIZE: usize = 1024;

/// Configuration for the webhook delivery client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Per-call timeout covering connect, send and response.
    pub timeout: Duration,
    /// User agent string for requests.
    pub user_agent: String,
    /// Maximum number of redirects to follow.
    pub max_redirects: u32,
    /// Whether to verify TLS certificates.
    pub verify_tls: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(crate::DEFAULT_TIMEOUT_SECONDS),
            user_agent: concat!("Courier-Webhook-Delivery/", env!("CARGO_PKG_VERSION")).to_string(),
            max_redirects: 3,
            verify_tls: true,
        }
    }
}

/// Classified result of a single delivery attempt.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// Receiver answered with a 2xx status.
    Success {
        /// HTTP status code
        status_code: u16,
        /// Time from send to response headers
        duration: Duration,
    },
    /// Temporary failure; the notification may be retried.
    RetryableFailure(DeliveryError),
    /// Permanent failure; the notification must not be retried.
    TerminalFailure(DeliveryError),
}

impl Outcome {
    /// Classifies a delivery error by its retryability.
    pub fn from_error(error: DeliveryError) -> Self {
        if error.is_retryable() {
            Self::RetryableFailure(error)
        } else {
            Self::TerminalFailure(error)
        }
    }

    /// Whether the attempt succeeded.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// HTTP client for webhook delivery.
///
/// Wraps a pooled `reqwest::Client`; cloning is cheap and shares the pool.
#[derive(Debug, Clone)]
pub struct DeliveryClient {
    client: reqwest::Client,
    config: ClientConfig,
}

impl DeliveryClient {
    /// Creates a new delivery client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the HTTP client cannot
    /// be configured with the provided settings.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects as usize))
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()
            .map_err(|e| {
                DeliveryError::configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self { client, config })
    }

    /// Returns the client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Delivers a notification to its webhook and classifies the result.
    ///
    /// Never fails: every transport error and non-2xx response is folded
    /// into an [`Outcome`].
    pub async fn deliver(&self, webhook: &Webhook, notification: &Notification) -> Outcome {
        let attempt = notification.attempt_count.saturating_add(1);
        let span = info_span!(
            "webhook_delivery",
            notification_id = %notification.id,
            webhook_id = %webhook.id,
            url = %webhook.url,
            attempt
        );

        async move {
            debug!("starting webhook delivery");

            let start_time = std::time::Instant::now();
            let outcome = match self.send(webhook, notification, attempt).await {
                Ok(response) => classify_response(response, start_time.elapsed()).await,
                Err(error) => Outcome::from_error(error),
            };

            match &outcome {
                Outcome::Success { status_code, duration } => {
                    debug!(
                        status = status_code,
                        duration_ms = duration.as_millis(),
                        "webhook delivered successfully"
                    );
                },
                Outcome::RetryableFailure(error) | Outcome::TerminalFailure(error) => {
                    warn!(
                        error = %error,
                        category = %error.category(),
                        retryable = outcome_is_retryable(&outcome),
                        "webhook delivery failed"
                    );
                },
            }

            outcome
        }
        .instrument(span)
        .await
    }

    async fn send(
        &self,
        webhook: &Webhook,
        notification: &Notification,
        attempt: u32,
    ) -> Result<Response> {
        let url = Url::parse(&webhook.url)
            .map_err(|e| DeliveryError::configuration(format!("invalid webhook URL: {e}")))?;
        let method = request_method(webhook.method)?;

        let mut request = self
            .client
            .request(method, url)
            .body(Bytes::from(notification.payload.clone()));

        if !webhook.headers.keys().any(|key| key.eq_ignore_ascii_case("content-type")) {
            request = request.header("content-type", "application/json");
        }

        for (key, value) in &webhook.headers {
            if !is_managed_header(key) {
                request = request.header(key, value);
            }
        }

        request = request
            .header(NOTIFICATION_ID_HEADER, notification.id.to_string())
            .header(WEBHOOK_ID_HEADER, webhook.id.to_string())
            .header(ATTEMPT_HEADER, attempt.to_string());

        request.send().await.map_err(|e| {
            if e.is_timeout() {
                DeliveryError::timeout(self.config.timeout)
            } else if e.is_builder() {
                DeliveryError::configuration(format!("invalid request: {e}"))
            } else if e.is_connect() {
                DeliveryError::network(format!("connection failed: {e}"))
            } else {
                DeliveryError::network(e.to_string())
            }
        })
    }
}

fn outcome_is_retryable(outcome: &Outcome) -> bool {
    matches!(outcome, Outcome::RetryableFailure(_))
}

fn request_method(method: HttpMethod) -> Result<Method> {
    Method::from_str(&method.to_string())
        .map_err(|e| DeliveryError::configuration(format!("invalid HTTP method: {e}")))
}

async fn classify_response(response: Response, duration: Duration) -> Outcome {
    let status_code = response.status().as_u16();

    match status_code {
        200..=299 => Outcome::Success { status_code, duration },
        429 => {
            let retry_after = extract_retry_after_seconds(response.headers()).unwrap_or(0);
            Outcome::RetryableFailure(DeliveryError::rate_limited(retry_after))
        },
        400..=499 => {
            let body = read_error_body(response).await;
            Outcome::TerminalFailure(DeliveryError::client_error(status_code, body))
        },
        500..=599 => {
            let body = read_error_body(response).await;
            Outcome::RetryableFailure(DeliveryError::server_error(status_code, body))
        },
        _ => Outcome::RetryableFailure(DeliveryError::unexpected_status(status_code)),
    }
}

/// Reads at most a short prefix of an error response body.
async fn read_error_body(response: Response) -> String {
    match response.bytes().await {
        Ok(bytes) => truncate_body(&bytes),
        Err(e) => {
            debug!(error = %e, "failed to read response body");
            format!("[failed to read response body: {e}]")
        },
    }
}

fn truncate_body(bytes: &[u8]) -> String {
    if bytes.len() <= MAX_ERROR_BODY_SIZE {
        return String::from_utf8_lossy(bytes).into_owned();
    }

    let suffix = "... (truncated)";
    let truncated = String::from_utf8_lossy(&bytes[..MAX_ERROR_BODY_SIZE - suffix.len()]);
    format!("{truncated}{suffix}")
}

/// Checks if a header is managed by the HTTP client and must not be copied
/// from the webhook definition.
fn is_managed_header(header_name: &str) -> bool {
    let lowercase = header_name.to_lowercase();
    matches!(
        lowercase.as_str(),
        "content-length"
            | "host"
            | "user-agent"
            | "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Extracts the retry-after delay from response headers.
///
/// Supports both seconds and HTTP-date formats. Returns `None` when the
/// header is missing or unparseable, and zero for dates in the past.
pub fn extract_retry_after_seconds(headers: &HeaderMap) -> Option<u64> {
    let retry_after = headers.get(reqwest::header::RETRY_AFTER)?.to_str().ok()?.trim();

    if let Ok(seconds) = retry_after.parse::<u64>() {
        return Some(seconds);
    }

    let retry_time = chrono::DateTime::parse_from_rfc2822(retry_after).ok()?;
    let remaining = retry_time.with_timezone(&chrono::Utc) - chrono::Utc::now();
    Some(remaining.to_std().map_or(0, |duration| duration.as_secs()))
}
