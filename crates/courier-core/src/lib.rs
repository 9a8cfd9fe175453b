//! Core domain models and storage for webhook notification delivery.
//!
//! Provides strongly-typed identifiers, the webhook registry and notification
//! models, the clock abstraction, and PostgreSQL repositories. The delivery
//! crate builds its dispatch loop on top of these primitives.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod models;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use models::{
    HttpMethod, Lease, Notification, NotificationId, NotificationStatus, RetryPolicy, Webhook,
    WebhookId, WebhookStatus,
};
pub use time::{Clock, RealClock, TestClock};
