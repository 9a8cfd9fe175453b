//! Delivery engine lifecycle.
//!
//! The engine owns one [`Dispatcher`] running on a background task, its
//! shared statistics and the cancellation token used for graceful shutdown.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────┐   ┌──────────────┐   ┌─────────────┐
//! │ DeliveryEngine │──▶│  Dispatcher  │──▶│ HTTP Client │
//! └────────────────┘   └──────────────┘   └─────────────┘
//!                             │                   │
//!                             ▼                   ▼
//!                      ┌──────────────┐   ┌─────────────┐
//!                      │ Notification │   │  Webhook    │
//!                      │ Store        │   │  Receivers  │
//!                      └──────────────┘   └─────────────┘
//! ```

use std::{sync::Arc, time::Duration};

use courier_core::{storage::Storage, Clock};
use serde::{Deserialize, Serialize};
use tokio::{sync::RwLock, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    client::{ClientConfig, DeliveryClient},
    dispatcher::{Dispatcher, TickSummary},
    error::{DeliveryError, Result},
    storage::{NotificationStore, PostgresStore, WebhookRegistry},
};

/// Configuration for the delivery engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Pause between dispatch ticks.
    pub poll_interval: Duration,

    /// Maximum notifications claimed per tick.
    pub batch_size: usize,

    /// Maximum concurrent deliveries within a tick.
    pub worker_pool_size: usize,

    /// How long a claim stays exclusive.
    pub lease_duration: Duration,

    /// Upper bound on a single tick; unfinished work is left to lease expiry.
    pub tick_timeout: Duration,

    /// Attempts per commit before the outcome is abandoned.
    pub commit_retry_attempts: u32,

    /// Base pause between commit attempts, multiplied by the attempt number.
    pub commit_retry_delay: Duration,

    /// Random spread applied to backoff delays, between 0.0 and 1.0.
    pub retry_jitter: f64,

    /// HTTP client configuration.
    pub client_config: ClientConfig,

    /// Maximum time to wait for the dispatcher to stop.
    pub shutdown_timeout: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(crate::DEFAULT_POLL_INTERVAL_MS),
            batch_size: crate::DEFAULT_BATCH_SIZE,
            worker_pool_size: crate::DEFAULT_WORKER_POOL_SIZE,
            lease_duration: Duration::from_secs(crate::DEFAULT_LEASE_SECONDS),
            tick_timeout: Duration::from_secs(crate::DEFAULT_LEASE_SECONDS),
            commit_retry_attempts: 3,
            commit_retry_delay: Duration::from_millis(100),
            retry_jitter: 0.0,
            client_config: ClientConfig::default(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl DeliveryConfig {
    /// Checks the configuration for values the dispatcher cannot run with.
    ///
    /// The lease must cover at least two delivery timeouts so a slow call
    /// finishes and commits before its notification becomes reclaimable.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` describing the first
    /// invalid setting.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(DeliveryError::configuration("batch_size must be greater than 0"));
        }
        if self.worker_pool_size == 0 {
            return Err(DeliveryError::configuration("worker_pool_size must be greater than 0"));
        }
        if self.poll_interval.is_zero() {
            return Err(DeliveryError::configuration("poll_interval must be greater than 0"));
        }
        if self.client_config.timeout.is_zero() {
            return Err(DeliveryError::configuration("delivery timeout must be greater than 0"));
        }
        if self.lease_duration < self.client_config.timeout * 2 {
            return Err(DeliveryError::configuration(format!(
                "lease_duration ({:?}) must be at least twice the delivery timeout ({:?})",
                self.lease_duration, self.client_config.timeout
            )));
        }
        if self.tick_timeout < self.client_config.timeout {
            return Err(DeliveryError::configuration(
                "tick_timeout must not be shorter than the delivery timeout",
            ));
        }
        if self.commit_retry_attempts == 0 {
            return Err(DeliveryError::configuration("commit_retry_attempts must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.retry_jitter) {
            return Err(DeliveryError::configuration("retry_jitter must be between 0.0 and 1.0"));
        }
        Ok(())
    }
}

/// Statistics for delivery engine monitoring.
#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    /// Whether the background dispatcher is running.
    pub running: bool,
    /// Dispatch ticks completed.
    pub ticks: u64,
    /// Notifications claimed.
    pub claimed: u64,
    /// Committed as `SUCCESS`.
    pub succeeded: u64,
    /// Committed as `RETRY`.
    pub retried: u64,
    /// Committed as `FAILED`.
    pub failed: u64,
    /// Released without an attempt.
    pub released: u64,
    /// Commits rejected because the lease had been reclaimed.
    pub lease_conflicts: u64,
    /// Commits abandoned after storage errors.
    pub commit_errors: u64,
    /// Deliveries currently waiting on a receiver.
    pub in_flight: u64,
}

/// Runs the dispatch loop in the background and stops it on request.
pub struct DeliveryEngine {
    dispatcher: Dispatcher,
    config: DeliveryConfig,
    stats: Arc<RwLock<EngineStats>>,
    cancellation_token: CancellationToken,
    handle: Option<JoinHandle<Result<()>>>,
}

impl DeliveryEngine {
    /// Creates an engine over explicit registry and store implementations.
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid or the HTTP client
    /// cannot be built.
    pub fn new(
        registry: Arc<dyn WebhookRegistry>,
        store: Arc<dyn NotificationStore>,
        config: DeliveryConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let client = Arc::new(DeliveryClient::new(config.client_config.clone())?);
        let stats = Arc::new(RwLock::new(EngineStats::default()));
        let dispatcher =
            Dispatcher::new(registry, store, client, config.clone(), stats.clone(), clock);

        Ok(Self {
            dispatcher,
            config,
            stats,
            cancellation_token: CancellationToken::new(),
            handle: None,
        })
    }

    /// Creates an engine backed by PostgreSQL.
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid or the HTTP client
    /// cannot be built.
    pub fn postgres(
        storage: Arc<Storage>,
        config: DeliveryConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let store = Arc::new(PostgresStore::new(storage));
        Self::new(store.clone(), store, config, clock)
    }

    /// Spawns the dispatch loop.
    ///
    /// Returns immediately. Use `shutdown()` to stop gracefully, or drop the
    /// engine to cancel the loop.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the engine is already
    /// running or was shut down.
    pub async fn start(&mut self) -> Result<()> {
        if self.handle.is_some() {
            return Err(DeliveryError::configuration("delivery engine already started"));
        }
        if self.cancellation_token.is_cancelled() {
            return Err(DeliveryError::configuration("delivery engine was shut down"));
        }

        info!(
            batch_size = self.config.batch_size,
            worker_pool_size = self.config.worker_pool_size,
            lease_seconds = self.config.lease_duration.as_secs(),
            "starting webhook delivery engine"
        );

        let dispatcher = self.dispatcher.clone();
        let token = self.cancellation_token.clone();
        let stats = self.stats.clone();
        stats.write().await.running = true;

        self.handle = Some(tokio::spawn(async move {
            let result = dispatcher.run(token).await;
            if let Err(ref error) = result {
                error!(error = %error, "dispatcher terminated with error");
            }
            stats.write().await.running = false;
            result
        }));

        info!("delivery engine started successfully");
        Ok(())
    }

    /// Gracefully shuts down the engine.
    ///
    /// Stops claiming new work and waits up to `shutdown_timeout` for the
    /// current tick's deliveries to commit. If the timeout is exceeded the
    /// loop is aborted and unfinished leases are left to expire.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ShutdownTimeout` if the dispatcher did not
    /// stop in time, or `DeliveryError::InternalError` if it panicked.
    pub async fn shutdown(mut self) -> Result<()> {
        info!("shutting down delivery engine");
        self.cancellation_token.cancel();

        let Some(mut handle) = self.handle.take() else {
            info!("delivery engine was not started, shutdown completed immediately");
            return Ok(());
        };

        let timeout = self.config.shutdown_timeout;
        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(result)) => {
                info!("delivery engine shutdown completed");
                result
            },
            Ok(Err(join_error)) => {
                error!(error = %join_error, "dispatcher task panicked during shutdown");
                Err(DeliveryError::internal(format!("dispatcher task failed: {join_error}")))
            },
            Err(_elapsed) => {
                handle.abort();
                self.stats.write().await.running = false;
                warn!(
                    timeout_seconds = timeout.as_secs(),
                    "dispatcher shutdown timed out, aborting in-flight deliveries"
                );
                Err(DeliveryError::ShutdownTimeout { timeout })
            },
        }
    }

    /// Runs a single dispatch tick on the caller's task.
    ///
    /// Intended for tests and controlled batch processing; does not require
    /// `start()`.
    ///
    /// # Errors
    ///
    /// Returns error if claiming fails.
    pub async fn run_tick(&self) -> Result<TickSummary> {
        self.dispatcher.tick().await
    }

    /// Returns current engine statistics.
    pub async fn stats(&self) -> EngineStats {
        let mut stats = self.stats.read().await.clone();
        stats.in_flight = self.dispatcher.in_flight();
        stats
    }

    /// Whether the background dispatcher has been started and not stopped.
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    /// Returns the engine configuration.
    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }
}

impl Drop for DeliveryEngine {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.cancellation_token.cancel();
        }
    }
}
