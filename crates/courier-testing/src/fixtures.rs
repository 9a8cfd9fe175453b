//! Test data builders for webhooks and notifications.
//!
//! Builders start from sensible defaults so tests only spell out what they
//! assert on.

use std::{collections::HashMap, time::Duration};

use chrono::{DateTime, Utc};
use courier_core::{
    HttpMethod, Notification, NotificationStatus, RetryPolicy, Webhook, WebhookId, WebhookStatus,
};
use uuid::Uuid;

/// Builder for test webhooks.
pub struct WebhookBuilder {
    name: String,
    url: String,
    method: HttpMethod,
    headers: HashMap<String, String>,
    product_ids: Vec<String>,
    status: WebhookStatus,
    retry_policy: RetryPolicy,
    created_by: Option<String>,
}

impl WebhookBuilder {
    /// Creates a builder targeting `url` with default settings.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            name: format!("webhook-{}", Uuid::new_v4().simple()),
            url: url.into(),
            method: HttpMethod::Post,
            headers: HashMap::new(),
            product_ids: Vec::new(),
            status: WebhookStatus::Active,
            retry_policy: RetryPolicy::default(),
            created_by: None,
        }
    }

    /// Sets the display name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the HTTP method.
    #[must_use]
    pub fn method(mut self, method: HttpMethod) -> Self {
        self.method = method;
        self
    }

    /// Adds a custom request header.
    #[must_use]
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Subscribes the webhook to a product.
    #[must_use]
    pub fn product(mut self, product_id: impl Into<String>) -> Self {
        self.product_ids.push(product_id.into());
        self
    }

    /// Sets the lifecycle status.
    #[must_use]
    pub fn status(mut self, status: WebhookStatus) -> Self {
        self.status = status;
        self
    }

    /// Replaces the whole retry policy.
    #[must_use]
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Sets the attempt budget.
    #[must_use]
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.retry_policy.max_attempts = max_attempts;
        self
    }

    /// Sets the first backoff delay and the delay cap.
    #[must_use]
    pub fn delays(mut self, initial: Duration, max: Duration) -> Self {
        self.retry_policy.initial_delay = initial;
        self.retry_policy.max_delay = max;
        self
    }

    /// Records who created the webhook.
    #[must_use]
    pub fn created_by(mut self, creator: impl Into<String>) -> Self {
        self.created_by = Some(creator.into());
        self
    }

    /// Builds the webhook with `created_at` as both creation and update time.
    pub fn build(self, created_at: DateTime<Utc>) -> Webhook {
        let mut webhook = Webhook::new(self.name, self.url, created_at);
        webhook.method = self.method;
        webhook.headers = self.headers;
        webhook.product_ids = self.product_ids;
        webhook.status = self.status;
        webhook.retry_policy = self.retry_policy;
        webhook.created_by = self.created_by;
        webhook
    }
}

/// Builder for notifications in arbitrary lifecycle states.
///
/// Used to seed stores with records a normal dispatch cycle would take
/// several steps to produce, such as stale leases.
pub struct NotificationBuilder {
    notification: Notification,
}

impl NotificationBuilder {
    /// Creates a pending notification for `webhook_id`.
    pub fn new(webhook_id: WebhookId, created_at: DateTime<Utc>) -> Self {
        Self { notification: Notification::new(webhook_id, r#"{"event":"test"}"#, created_at) }
    }

    /// Sets the payload.
    #[must_use]
    pub fn payload(mut self, payload: impl Into<String>) -> Self {
        self.notification.payload = payload.into();
        self
    }

    /// Sets the status.
    #[must_use]
    pub fn status(mut self, status: NotificationStatus) -> Self {
        self.notification.status = status;
        self
    }

    /// Sets the number of attempts already made.
    #[must_use]
    pub fn attempts(mut self, attempt_count: u32) -> Self {
        self.notification.attempt_count = attempt_count;
        self
    }

    /// Sets the not-before time.
    #[must_use]
    pub fn not_before(mut self, next_attempt_at: DateTime<Utc>) -> Self {
        self.notification.next_attempt_at = Some(next_attempt_at);
        self
    }

    /// Marks the record as leased until `until`, in `SENDING`.
    #[must_use]
    pub fn leased_until(mut self, until: DateTime<Utc>) -> Self {
        self.notification.status = NotificationStatus::Sending;
        self.notification.processing = true;
        self.notification.processing_until = Some(until);
        self
    }

    /// Builds the notification.
    pub fn build(self) -> Notification {
        self.notification
    }
}
