//! Test infrastructure for deterministic delivery testing.
//!
//! Provides an in-memory test environment with HTTP mocking and a
//! controllable clock, fixture builders, invariant checks, a scenario DSL,
//! and schema-isolated PostgreSQL databases for repository tests.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use courier_core::{Clock, Notification, NotificationId, Webhook, WebhookId};
use courier_delivery::{
    ClientConfig, DeliveryClient, DeliveryConfig, Dispatcher, EngineStats, EventPublisher,
    MemoryStore, NotificationStore, TickSummary,
};
use tokio::sync::RwLock;
use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

pub mod database;
pub mod fixtures;
pub mod invariants;
pub mod scenario;

pub use courier_core::TestClock;
pub use database::TestDatabase;
pub use fixtures::{NotificationBuilder, WebhookBuilder};
pub use invariants::Invariants;
pub use scenario::{FailureKind, ScenarioBuilder};

/// Path every test webhook points at on the mock server.
pub const WEBHOOK_PATH: &str = "/webhook";

/// Builder for configuring a [`TestEnv`].
pub struct TestEnvBuilder {
    batch_size: usize,
    worker_pool_size: usize,
    lease_duration: Duration,
    delivery_timeout: Duration,
    commit_retry_attempts: u32,
}

impl Default for TestEnvBuilder {
    fn default() -> Self {
        Self {
            batch_size: 10,
            worker_pool_size: 4,
            lease_duration: Duration::from_secs(30),
            delivery_timeout: Duration::from_millis(500),
            commit_retry_attempts: 3,
        }
    }
}

impl TestEnvBuilder {
    /// Creates a new builder with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum notifications claimed per tick (default: 10).
    #[must_use]
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Sets the concurrent deliveries per tick (default: 4).
    #[must_use]
    pub fn worker_pool_size(mut self, size: usize) -> Self {
        self.worker_pool_size = size;
        self
    }

    /// Sets the lease duration (default: 30s).
    #[must_use]
    pub fn lease_duration(mut self, duration: Duration) -> Self {
        self.lease_duration = duration;
        self
    }

    /// Sets the per-call delivery timeout (default: 500ms).
    #[must_use]
    pub fn delivery_timeout(mut self, timeout: Duration) -> Self {
        self.delivery_timeout = timeout;
        self
    }

    /// Sets the attempts per commit (default: 3).
    #[must_use]
    pub fn commit_retry_attempts(mut self, attempts: u32) -> Self {
        self.commit_retry_attempts = attempts;
        self
    }

    /// Builds the environment and starts its mock server.
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid or the HTTP client
    /// cannot be built.
    pub async fn build(self) -> Result<TestEnv> {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("error")),
            )
            .with_test_writer()
            .try_init();

        let config = DeliveryConfig {
            batch_size: self.batch_size,
            worker_pool_size: self.worker_pool_size,
            lease_duration: self.lease_duration,
            tick_timeout: self.lease_duration,
            commit_retry_attempts: self.commit_retry_attempts,
            commit_retry_delay: Duration::from_millis(1),
            poll_interval: Duration::from_millis(10),
            client_config: ClientConfig {
                timeout: self.delivery_timeout,
                ..ClientConfig::default()
            },
            ..DeliveryConfig::default()
        };
        config.validate().context("invalid test delivery config")?;

        let env = TestEnv {
            http_mock: MockServer::start().await,
            clock: TestClock::new(),
            store: MemoryStore::new(),
            stats: Arc::new(RwLock::new(EngineStats::default())),
            config,
        };
        Ok(env)
    }
}

/// In-memory delivery environment.
///
/// All dispatchers created from one environment share its store, clock and
/// mock server, which is how tests model several dispatcher instances
/// competing for the same queue.
pub struct TestEnv {
    /// HTTP mock server standing in for webhook receivers.
    pub http_mock: MockServer,
    /// Deterministic clock shared by every dispatcher of this environment.
    pub clock: TestClock,
    /// Registry and notification store.
    pub store: MemoryStore,
    stats: Arc<RwLock<EngineStats>>,
    config: DeliveryConfig,
}

impl TestEnv {
    /// Creates an environment with default settings.
    ///
    /// # Errors
    ///
    /// Returns error if the environment cannot be built.
    pub async fn new() -> Result<Self> {
        TestEnvBuilder::new().build().await
    }

    /// Returns a builder for customised environments.
    pub fn builder() -> TestEnvBuilder {
        TestEnvBuilder::new()
    }

    /// Delivery configuration used by this environment's dispatchers.
    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    /// Current test time, truncated like stored timestamps.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now_utc()
    }

    /// Moves the test clock forward.
    pub fn advance_time(&self, duration: Duration) {
        self.clock.advance(duration);
    }

    /// URL of the mock receiver.
    pub fn webhook_url(&self) -> String {
        format!("{}{WEBHOOK_PATH}", self.http_mock.uri())
    }

    /// Webhook builder pointed at the mock receiver.
    pub fn webhook(&self) -> WebhookBuilder {
        WebhookBuilder::new(self.webhook_url())
    }

    /// Builds and registers a webhook.
    pub async fn create_webhook(&self, builder: WebhookBuilder) -> Webhook {
        let webhook = builder.build(self.now());
        self.store.add_webhook(webhook.clone()).await;
        webhook
    }

    /// Enqueues a notification at the current test time.
    ///
    /// # Errors
    ///
    /// Returns error if the store rejects the insert.
    pub async fn enqueue(&self, webhook_id: WebhookId, payload: &str) -> Result<Notification> {
        Ok(self.store.enqueue(webhook_id, payload, self.now()).await?)
    }

    /// Reads a notification back from the store.
    ///
    /// # Errors
    ///
    /// Returns error if the notification does not exist.
    pub async fn notification(&self, id: NotificationId) -> Result<Notification> {
        self.store.notification(id).await.with_context(|| format!("notification {id} not found"))
    }

    /// Creates a dispatcher over this environment's store and clock.
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built.
    pub fn dispatcher(&self) -> Result<Dispatcher> {
        let client = Arc::new(DeliveryClient::new(self.config.client_config.clone())?);
        Ok(Dispatcher::new(
            Arc::new(self.store.clone()),
            Arc::new(self.store.clone()),
            client,
            self.config.clone(),
            self.stats.clone(),
            Arc::new(self.clock.clone()) as Arc<dyn Clock>,
        ))
    }

    /// Creates an event publisher over this environment's store.
    pub fn publisher(&self) -> EventPublisher {
        EventPublisher::new(
            Arc::new(self.store.clone()),
            Arc::new(self.store.clone()),
            Arc::new(self.clock.clone()),
        )
    }

    /// Runs one dispatch tick.
    ///
    /// # Errors
    ///
    /// Returns error if the claim fails.
    pub async fn run_delivery_cycle(&self) -> Result<TickSummary> {
        Ok(self.dispatcher()?.tick().await?)
    }

    /// Statistics accumulated by this environment's dispatchers.
    pub async fn stats(&self) -> EngineStats {
        self.stats.read().await.clone()
    }

    /// Replaces all receiver behaviour with `response`.
    ///
    /// Also clears the received request log.
    pub async fn respond_with(&self, response: ResponseTemplate) {
        self.http_mock.reset().await;
        Mock::given(matchers::path(WEBHOOK_PATH)).respond_with(response).mount(&self.http_mock).await;
    }

    /// Makes the receiver answer with a plain status code.
    pub async fn respond_with_status(&self, status: u16) {
        self.respond_with(ResponseTemplate::new(status)).await;
    }

    /// Number of requests the receiver has seen since the last
    /// [`respond_with`](Self::respond_with).
    pub async fn received_requests(&self) -> usize {
        self.http_mock.received_requests().await.map_or(0, |requests| requests.len())
    }
}
