//! Core domain models and strongly-typed identifiers.
//!
//! Defines webhook registry entries, their embedded retry policy, and the
//! notification records that move through the delivery state machine. The
//! lease pair on [`Notification`] (`processing`, `processing_until`) is what
//! coordinates concurrent dispatchers without a broker.

use std::{collections::HashMap, fmt, str::FromStr, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;

type PgDb = sqlx::Postgres;
type PgRow = sqlx::postgres::PgRow;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Strongly-typed webhook identifier.
///
/// # Example
///
/// ```
/// use courier_core::models::WebhookId;
/// let webhook_id = WebhookId::new();
/// println!("dispatching to {}", webhook_id);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WebhookId(pub Uuid);

impl WebhookId {
    /// Creates a new random webhook ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WebhookId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WebhookId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for WebhookId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for WebhookId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for WebhookId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for WebhookId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Strongly-typed notification identifier.
///
/// One notification exists per (webhook, event) pair and keeps its ID for
/// its whole retry sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NotificationId(pub Uuid);

impl NotificationId {
    /// Creates a new random notification ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for NotificationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NotificationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for NotificationId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for NotificationId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for NotificationId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for NotificationId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Lifecycle status of a registered webhook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WebhookStatus {
    /// Receives new notifications.
    #[default]
    Active,
    /// Disabled by its owner. Keeps history, receives nothing new.
    Inactive,
    /// Disabled by an operator. Keeps history, receives nothing new.
    Suspended,
}

impl fmt::Display for WebhookStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Inactive => write!(f, "inactive"),
            Self::Suspended => write!(f, "suspended"),
        }
    }
}

impl FromStr for WebhookStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "active" => Ok(Self::Active),
            "inactive" => Ok(Self::Inactive),
            "suspended" => Ok(Self::Suspended),
            _ => Err(CoreError::InvalidInput(format!("invalid webhook status: {s}"))),
        }
    }
}

impl sqlx::Type<PgDb> for WebhookStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for WebhookStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(s.parse()?)
    }
}

impl sqlx::Encode<'_, PgDb> for WebhookStatus {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <String as sqlx::Encode<PgDb>>::encode_by_ref(&self.to_string(), buf)
    }
}

/// HTTP methods supported for webhook delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    /// HTTP GET method.
    Get,
    /// HTTP POST method (default).
    #[default]
    Post,
    /// HTTP PUT method.
    Put,
    /// HTTP PATCH method.
    Patch,
    /// HTTP DELETE method.
    Delete,
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Get => write!(f, "GET"),
            Self::Post => write!(f, "POST"),
            Self::Put => write!(f, "PUT"),
            Self::Patch => write!(f, "PATCH"),
            Self::Delete => write!(f, "DELETE"),
        }
    }
}

impl FromStr for HttpMethod {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "PATCH" => Ok(Self::Patch),
            "DELETE" => Ok(Self::Delete),
            _ => Err(CoreError::InvalidInput(format!("invalid http method: {s}"))),
        }
    }
}

impl sqlx::Type<PgDb> for HttpMethod {
    fn type_info() -> PgTypeInfo {
        <str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for HttpMethod {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(s.parse()?)
    }
}

impl sqlx::Encode<'_, PgDb> for HttpMethod {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <String as sqlx::Encode<PgDb>>::encode_by_ref(&self.to_string(), buf)
    }
}

/// Per-webhook retry policy.
///
/// Delays grow geometrically from `initial_delay` by `backoff_multiplier`
/// and are capped at `max_delay`. A notification is given at most
/// `max_attempts` delivery attempts in total.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of delivery attempts, including the first.
    pub max_attempts: u32,

    /// Delay before the first retry.
    pub initial_delay: Duration,

    /// Upper bound for any single retry delay.
    pub max_delay: Duration,

    /// Growth factor applied per attempt.
    pub backoff_multiplier: f64,
}

impl RetryPolicy {
    /// Default maximum attempts when a webhook leaves the policy unset.
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
    /// Default initial delay when a webhook leaves the policy unset.
    pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(1000);
    /// Default maximum delay when a webhook leaves the policy unset.
    pub const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(10_000);
    /// Default multiplier when a webhook leaves the policy unset.
    pub const DEFAULT_MULTIPLIER: f64 = 2.0;

    /// Checks the policy invariants.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidInput` if `max_attempts` is zero, the
    /// multiplier is below 1.0 or not finite, or `max_delay` is shorter than
    /// `initial_delay`.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.max_attempts == 0 {
            return Err(CoreError::InvalidInput("max_attempts must be at least 1".to_string()));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(CoreError::InvalidInput(format!(
                "backoff_multiplier must be >= 1.0, got {}",
                self.backoff_multiplier
            )));
        }
        if self.max_delay < self.initial_delay {
            return Err(CoreError::InvalidInput(
                "max_delay must not be shorter than initial_delay".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
            initial_delay: Self::DEFAULT_INITIAL_DELAY,
            max_delay: Self::DEFAULT_MAX_DELAY,
            backoff_multiplier: Self::DEFAULT_MULTIPLIER,
        }
    }
}

/// Webhook registry entry.
///
/// Registry writes belong to the administrative API; the delivery side only
/// reads these records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Webhook {
    /// Unique identifier for this webhook.
    pub id: WebhookId,

    /// Human-readable name.
    pub name: String,

    /// Target URL for delivery.
    pub url: String,

    /// HTTP method used for delivery.
    pub method: HttpMethod,

    /// Extra headers sent with every delivery.
    pub headers: HashMap<String, String>,

    /// Products whose events this webhook subscribes to.
    pub product_ids: Vec<String>,

    /// Lifecycle status. Only `Active` webhooks receive notifications.
    pub status: WebhookStatus,

    /// Retry policy, with defaults filled in for unset columns.
    pub retry_policy: RetryPolicy,

    /// When this webhook was registered.
    pub created_at: DateTime<Utc>,

    /// When configuration was last modified.
    pub updated_at: DateTime<Utc>,

    /// Who registered the webhook.
    pub created_by: Option<String>,
}

impl Webhook {
    /// Creates an active POST webhook with the default retry policy.
    pub fn new(name: impl Into<String>, url: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: WebhookId::new(),
            name: name.into(),
            url: url.into(),
            method: HttpMethod::Post,
            headers: HashMap::new(),
            product_ids: Vec::new(),
            status: WebhookStatus::Active,
            retry_policy: RetryPolicy::default(),
            created_at,
            updated_at: created_at,
            created_by: None,
        }
    }

    /// Whether this webhook may receive new notifications.
    pub fn is_active(&self) -> bool {
        self.status == WebhookStatus::Active
    }

    /// Whether this webhook subscribes to the given product.
    pub fn subscribes_to(&self, product_id: &str) -> bool {
        self.product_ids.iter().any(|p| p == product_id)
    }
}

fn millis_column(row: &PgRow, column: &str) -> Result<Option<Duration>, sqlx::Error> {
    use sqlx::Row;

    let value: Option<i64> = row.try_get(column)?;
    value
        .map(|ms| {
            u64::try_from(ms)
                .map(Duration::from_millis)
                .map_err(|_| sqlx::Error::Decode(format!("{column} cannot be negative").into()))
        })
        .transpose()
}

impl<'r> sqlx::FromRow<'r, PgRow> for Webhook {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;

        let headers: sqlx::types::Json<HashMap<String, String>> = row.try_get("headers")?;
        let max_attempts: Option<i32> = row.try_get("max_attempts")?;
        let multiplier: Option<f64> = row.try_get("backoff_multiplier")?;

        let defaults = RetryPolicy::default();
        let retry_policy = RetryPolicy {
            max_attempts: match max_attempts {
                Some(n) => u32::try_from(n).map_err(|_| {
                    sqlx::Error::Decode("max_attempts cannot be negative".into())
                })?,
                None => defaults.max_attempts,
            },
            initial_delay: millis_column(row, "initial_delay_ms")?
                .unwrap_or(defaults.initial_delay),
            max_delay: millis_column(row, "max_delay_ms")?.unwrap_or(defaults.max_delay),
            backoff_multiplier: multiplier.unwrap_or(defaults.backoff_multiplier),
        };

        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            url: row.try_get("url")?,
            method: row.try_get("method")?,
            headers: headers.0,
            product_ids: row.try_get("product_ids")?,
            status: row.try_get("status")?,
            retry_policy,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            created_by: row.try_get("created_by")?,
        })
    }
}

/// Delivery status of a notification.
///
/// ```text
/// PENDING --claim--> SENDING --2xx--> SUCCESS
///                    SENDING --retryable, attempts remain--> RETRY --claim--> SENDING
///                    SENDING --terminal or exhausted--> FAILED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationStatus {
    /// Enqueued, never attempted.
    Pending,

    /// Claimed by a dispatcher.
    ///
    /// A `SENDING` record whose lease expired is claimable again.
    Sending,

    /// Delivered. Terminal.
    Success,

    /// Permanently failed. Terminal.
    Failed,

    /// Waiting for its next attempt.
    Retry,
}

impl NotificationStatus {
    /// Terminal states never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }
}

impl fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Sending => write!(f, "sending"),
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
            Self::Retry => write!(f, "retry"),
        }
    }
}

impl FromStr for NotificationStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "sending" => Ok(Self::Sending),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "retry" => Ok(Self::Retry),
            _ => Err(CoreError::InvalidInput(format!("invalid notification status: {s}"))),
        }
    }
}

impl sqlx::Type<PgDb> for NotificationStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for NotificationStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(s.parse()?)
    }
}

impl sqlx::Encode<'_, PgDb> for NotificationStatus {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <String as sqlx::Encode<PgDb>>::encode_by_ref(&self.to_string(), buf)
    }
}

/// A notification queued for one webhook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Unique identifier.
    pub id: NotificationId,

    /// Target webhook. Not a foreign key: history outlives registration.
    pub webhook_id: WebhookId,

    /// Opaque serialized event body, sent verbatim.
    pub payload: String,

    /// Current delivery status.
    pub status: NotificationStatus,

    /// Number of delivery attempts committed so far.
    pub attempt_count: u32,

    /// Error from the most recent failed attempt.
    pub last_error: Option<String>,

    /// When the notification was enqueued.
    pub created_at: DateTime<Utc>,

    /// When the most recent attempt was committed.
    pub last_attempt_at: Option<DateTime<Utc>>,

    /// When a terminal state was reached.
    pub completed_at: Option<DateTime<Utc>>,

    /// Earliest time the next attempt may be claimed.
    pub next_attempt_at: Option<DateTime<Utc>>,

    /// Whether a dispatcher currently holds the lease.
    pub processing: bool,

    /// Lease expiry. Set whenever `processing` is true.
    pub processing_until: Option<DateTime<Utc>>,
}

impl Notification {
    /// Creates a new pending notification.
    pub fn new(webhook_id: WebhookId, payload: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: NotificationId::new(),
            webhook_id,
            payload: payload.into(),
            status: NotificationStatus::Pending,
            attempt_count: 0,
            last_error: None,
            created_at,
            last_attempt_at: None,
            completed_at: None,
            next_attempt_at: None,
            processing: false,
            processing_until: None,
        }
    }

    /// Whether the notification reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Returns the lease currently held on this record, if any.
    pub fn lease(&self) -> Option<Lease> {
        match (self.processing, self.processing_until) {
            (true, Some(expires_at)) => Some(Lease { notification_id: self.id, expires_at }),
            _ => None,
        }
    }

    /// Whether a claim at `now` may take this record.
    ///
    /// Unleased records are claimable when queued (`PENDING`, `RETRY`, or a
    /// released `SENDING`) and past their not-before time. Leased records are
    /// claimable once the lease has expired. Terminal records never are.
    pub fn is_claimable_at(&self, now: DateTime<Utc>) -> bool {
        if self.is_terminal() {
            return false;
        }

        if self.processing {
            return self.processing_until.map_or(true, |until| until <= now);
        }

        self.next_attempt_at.map_or(true, |not_before| not_before <= now)
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for Notification {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;

        let attempt_count: i32 = row.try_get("attempt_count")?;

        Ok(Self {
            id: row.try_get("id")?,
            webhook_id: row.try_get("webhook_id")?,
            payload: row.try_get("payload")?,
            status: row.try_get("status")?,
            attempt_count: u32::try_from(attempt_count)
                .map_err(|_| sqlx::Error::Decode("attempt_count cannot be negative".into()))?,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
            last_attempt_at: row.try_get("last_attempt_at")?,
            completed_at: row.try_get("completed_at")?,
            next_attempt_at: row.try_get("next_attempt_at")?,
            processing: row.try_get("processing")?,
            processing_until: row.try_get("processing_until")?,
        })
    }
}

/// Proof of a claim, presented back to the store on commit or release.
///
/// The expiry doubles as the lease token: a stale holder's expiry no longer
/// matches once another dispatcher has reclaimed the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Lease {
    /// The leased notification.
    pub notification_id: NotificationId,

    /// When the lease lapses.
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    /// Whether the lease has lapsed at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).single().expect("valid timestamp")
    }

    #[test]
    fn retry_policy_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.initial_delay, Duration::from_millis(1000));
        assert_eq!(policy.max_delay, Duration::from_millis(10_000));
        assert!((policy.backoff_multiplier - 2.0).abs() < f64::EPSILON);
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn retry_policy_rejects_broken_invariants() {
        let zero_attempts = RetryPolicy { max_attempts: 0, ..Default::default() };
        assert!(zero_attempts.validate().is_err());

        let shrinking = RetryPolicy { backoff_multiplier: 0.5, ..Default::default() };
        assert!(shrinking.validate().is_err());

        let inverted = RetryPolicy {
            initial_delay: Duration::from_secs(20),
            max_delay: Duration::from_secs(10),
            ..Default::default()
        };
        assert!(inverted.validate().is_err());
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            NotificationStatus::Pending,
            NotificationStatus::Sending,
            NotificationStatus::Success,
            NotificationStatus::Failed,
            NotificationStatus::Retry,
        ] {
            assert_eq!(status.to_string().parse::<NotificationStatus>().ok(), Some(status));
        }
        assert_eq!("SUSPENDED".parse::<WebhookStatus>().ok(), Some(WebhookStatus::Suspended));
        assert_eq!("patch".parse::<HttpMethod>().ok(), Some(HttpMethod::Patch));
        assert!("TRACE".parse::<HttpMethod>().is_err());
    }

    #[test]
    fn only_success_and_failed_are_terminal() {
        assert!(NotificationStatus::Success.is_terminal());
        assert!(NotificationStatus::Failed.is_terminal());
        assert!(!NotificationStatus::Pending.is_terminal());
        assert!(!NotificationStatus::Sending.is_terminal());
        assert!(!NotificationStatus::Retry.is_terminal());
    }

    #[test]
    fn pending_notification_is_claimable() {
        let notification = Notification::new(WebhookId::new(), "{}", t0());
        assert!(notification.is_claimable_at(t0()));
        assert!(notification.lease().is_none());
    }

    #[test]
    fn retry_waits_for_not_before() {
        let mut notification = Notification::new(WebhookId::new(), "{}", t0());
        notification.status = NotificationStatus::Retry;
        notification.next_attempt_at = Some(t0() + chrono::Duration::seconds(1));

        assert!(!notification.is_claimable_at(t0()));
        assert!(notification.is_claimable_at(t0() + chrono::Duration::seconds(1)));
    }

    #[test]
    fn live_lease_blocks_claim_until_expiry() {
        let mut notification = Notification::new(WebhookId::new(), "{}", t0());
        notification.status = NotificationStatus::Sending;
        notification.processing = true;
        notification.processing_until = Some(t0() + chrono::Duration::seconds(30));

        let lease = notification.lease().expect("leased record exposes its lease");
        assert_eq!(lease.notification_id, notification.id);
        assert!(!notification.is_claimable_at(t0() + chrono::Duration::seconds(29)));
        assert!(notification.is_claimable_at(t0() + chrono::Duration::seconds(31)));
        assert!(lease.is_expired_at(t0() + chrono::Duration::seconds(30)));
    }

    #[test]
    fn terminal_notification_is_never_claimable() {
        let mut notification = Notification::new(WebhookId::new(), "{}", t0());
        notification.status = NotificationStatus::Success;
        assert!(!notification.is_claimable_at(t0() + chrono::Duration::days(365)));
    }

    #[test]
    fn webhook_subscription_lookup() {
        let mut webhook = Webhook::new("orders", "https://example.com/hook", t0());
        webhook.product_ids = vec!["billing".to_string(), "orders".to_string()];

        assert!(webhook.is_active());
        assert!(webhook.subscribes_to("orders"));
        assert!(!webhook.subscribes_to("shipping"));
    }
}
