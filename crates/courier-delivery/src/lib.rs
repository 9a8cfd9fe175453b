//! Lease-based webhook notification delivery.
//!
//! This crate drives queued notifications from `PENDING` to a terminal state:
//! it claims due work under a time-bounded lease, performs the outbound HTTP
//! call, and commits the classified outcome with exponential backoff for
//! retryable failures.
//!
//! # Architecture
//!
//! Each dispatch tick runs the same cycle:
//!
//! 1. **Claim** - atomically lease a bounded batch of due notifications
//! 2. **Resolve** - look up each webhook, releasing work for inactive ones
//! 3. **Deliver** - send the HTTP request with a per-call timeout
//! 4. **Commit** - record success, schedule a retry, or fail permanently
//!
//! Delivery is at-least-once: a dispatcher that dies mid-delivery leaves its
//! lease to expire, after which another dispatcher reclaims the notification.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use courier_core::{storage::Storage, RealClock};
//! use courier_delivery::{DeliveryConfig, DeliveryEngine, DeliveryError};
//!
//! # async fn example(storage: Arc<Storage>) -> std::result::Result<(), DeliveryError> {
//! let mut engine =
//!     DeliveryEngine::postgres(storage, DeliveryConfig::default(), Arc::new(RealClock::new()))?;
//!
//! engine.start().await?;
//! // ...
//! engine.shutdown().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod backoff;
pub mod client;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod publisher;
pub mod storage;

pub use client::{ClientConfig, DeliveryClient, Outcome};
pub use dispatcher::{Dispatcher, Disposition, TickSummary};
pub use engine::{DeliveryConfig, DeliveryEngine, EngineStats};
pub use error::{DeliveryError, ErrorCategory, Result};
pub use publisher::EventPublisher;
pub use storage::{memory::MemoryStore, NotificationStore, PostgresStore, WebhookRegistry};

/// Default number of concurrent deliveries per tick.
pub const DEFAULT_WORKER_POOL_SIZE: usize = 4;

/// Default number of notifications claimed per tick.
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Default pause between ticks in milliseconds.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

/// Default lease duration in seconds.
pub const DEFAULT_LEASE_SECONDS: u64 = 60;

/// Default HTTP request timeout in seconds.
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 30;
