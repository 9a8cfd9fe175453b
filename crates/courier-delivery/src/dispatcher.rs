//! Dispatch loop: claim due notifications, deliver them, commit outcomes.
//!
//! Each tick claims one bounded batch under a fresh lease and fans it out to
//! at most `worker_pool_size` concurrent deliveries. Every outcome is
//! committed with the lease it was claimed under, so a dispatcher whose lease
//! was reclaimed by another instance cannot overwrite the newer state.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use courier_core::{Clock, CoreError, Lease, Notification};
use tokio::{
    sync::{RwLock, Semaphore},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{
    backoff::{RetryContext, RetryDecision},
    client::{DeliveryClient, Outcome},
    engine::{DeliveryConfig, EngineStats},
    error::{DeliveryError, ErrorCategory, Result},
    storage::{NotificationStore, WebhookRegistry},
};

/// What happened to one claimed notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Delivered and committed as `SUCCESS`.
    Succeeded,
    /// Failed and rescheduled as `RETRY`.
    Retried,
    /// Committed as `FAILED`.
    Failed,
    /// Lease released without an attempt.
    Released,
    /// Another dispatcher reclaimed the notification before we committed.
    LeaseLost,
    /// Commit kept failing; the lease will expire and the record be reclaimed.
    CommitFailed,
}

/// Per-tick counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    /// Notifications claimed by this tick.
    pub claimed: usize,
    /// Committed as `SUCCESS`.
    pub succeeded: usize,
    /// Committed as `RETRY`.
    pub retried: usize,
    /// Committed as `FAILED`.
    pub failed: usize,
    /// Released without an attempt.
    pub released: usize,
    /// Commits rejected because the lease was gone.
    pub lease_lost: usize,
    /// Commits abandoned after repeated storage errors.
    pub commit_failed: usize,
    /// Delivery tasks that panicked.
    pub panicked: usize,
}

impl TickSummary {
    fn record(&mut self, disposition: Disposition) {
        match disposition {
            Disposition::Succeeded => self.succeeded += 1,
            Disposition::Retried => self.retried += 1,
            Disposition::Failed => self.failed += 1,
            Disposition::Released => self.released += 1,
            Disposition::LeaseLost => self.lease_lost += 1,
            Disposition::CommitFailed => self.commit_failed += 1,
        }
    }
}

/// State transition to write for a finished attempt.
#[derive(Debug, Clone)]
enum Commit {
    Success,
    Retry { next_attempt_at: chrono::DateTime<chrono::Utc>, error: String },
    Failed { error: String },
}

/// Counts one delivery as in flight until dropped, including when the
/// delivery task is aborted by a tick timeout.
struct InFlightGuard(Arc<AtomicU64>);

impl InFlightGuard {
    fn enter(counter: &Arc<AtomicU64>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Drives notifications from claim to committed outcome.
///
/// Cloning is cheap; clones share storage, client, stats and the
/// concurrency limit.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<dyn WebhookRegistry>,
    store: Arc<dyn NotificationStore>,
    client: Arc<DeliveryClient>,
    config: Arc<DeliveryConfig>,
    stats: Arc<RwLock<EngineStats>>,
    clock: Arc<dyn Clock>,
    permits: Arc<Semaphore>,
    in_flight: Arc<AtomicU64>,
}

impl Dispatcher {
    /// Creates a dispatcher over the given registry and store.
    pub fn new(
        registry: Arc<dyn WebhookRegistry>,
        store: Arc<dyn NotificationStore>,
        client: Arc<DeliveryClient>,
        config: DeliveryConfig,
        stats: Arc<RwLock<EngineStats>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.worker_pool_size.max(1)));
        Self {
            registry,
            store,
            client,
            config: Arc::new(config),
            stats,
            clock,
            permits,
            in_flight: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Deliveries currently waiting on a receiver, across all clones.
    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Runs ticks until `cancellation_token` fires.
    ///
    /// Cancellation is observed between ticks, so deliveries of the current
    /// tick finish and commit before the loop exits. Tick errors are logged
    /// and the loop keeps polling.
    ///
    /// # Errors
    ///
    /// Currently never returns an error; the signature leaves room for setup
    /// failures.
    pub async fn run(&self, cancellation_token: CancellationToken) -> Result<()> {
        info!(
            batch_size = self.config.batch_size,
            worker_pool_size = self.config.worker_pool_size,
            poll_interval_ms = self.config.poll_interval.as_millis(),
            "dispatcher starting"
        );

        let mut tick_number: u64 = 0;
        loop {
            if cancellation_token.is_cancelled() {
                break;
            }

            tick_number += 1;
            let span = info_span!("dispatch_tick", tick = tick_number);
            match tokio::time::timeout(self.config.tick_timeout, self.tick().instrument(span))
                .await
            {
                Ok(Ok(summary)) => {
                    if summary.claimed > 0 {
                        debug!(
                            tick = tick_number,
                            claimed = summary.claimed,
                            succeeded = summary.succeeded,
                            retried = summary.retried,
                            failed = summary.failed,
                            released = summary.released,
                            "dispatch tick completed"
                        );
                    }
                },
                Ok(Err(error)) => {
                    error!(
                        tick = tick_number,
                        error = %error,
                        category = %error.category(),
                        "dispatch tick failed"
                    );
                },
                Err(_elapsed) => {
                    warn!(
                        tick = tick_number,
                        timeout_ms = self.config.tick_timeout.as_millis(),
                        "dispatch tick timed out, unfinished leases will expire"
                    );
                },
            }

            tokio::select! {
                () = self.clock.sleep(self.config.poll_interval) => {},
                () = cancellation_token.cancelled() => break,
            }
        }

        info!(ticks = tick_number, "dispatcher stopped");
        Ok(())
    }

    /// Runs one claim, deliver and commit cycle.
    ///
    /// Returns once every claimed notification has been committed, released
    /// or abandoned to lease expiry.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::DatabaseError` if the claim itself fails.
    /// Failures of individual notifications are reported in the summary.
    pub async fn tick(&self) -> Result<TickSummary> {
        let now = self.clock.now_utc();
        let claimed = self
            .store
            .claim_due(self.config.batch_size, self.config.lease_duration, now)
            .await
            .map_err(|e| DeliveryError::database(format!("failed to claim notifications: {e}")))?;

        let mut summary = TickSummary { claimed: claimed.len(), ..TickSummary::default() };
        {
            let mut stats = self.stats.write().await;
            stats.ticks += 1;
            stats.claimed += claimed.len() as u64;
        }

        if claimed.is_empty() {
            return Ok(summary);
        }

        debug!(count = claimed.len(), "claimed due notifications");

        let mut tasks = JoinSet::new();
        for notification in claimed {
            let permit = self
                .permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| DeliveryError::internal("delivery permits closed"))?;
            let dispatcher = self.clone();
            tasks.spawn(async move {
                let _permit = permit;
                dispatcher.process(notification).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(disposition) => summary.record(disposition),
                Err(join_error) => {
                    error!(error = %join_error, "delivery task panicked, lease left to expire");
                    summary.panicked += 1;
                },
            }
        }

        Ok(summary)
    }

    async fn process(&self, notification: Notification) -> Disposition {
        let Some(lease) = notification.lease() else {
            warn!(notification_id = %notification.id, "claimed notification carries no lease");
            return Disposition::LeaseLost;
        };

        let webhook = match self.registry.get(notification.webhook_id).await {
            Ok(webhook) if webhook.is_active() => webhook,
            Ok(webhook) => {
                debug!(
                    notification_id = %notification.id,
                    webhook_id = %webhook.id,
                    status = %webhook.status,
                    "webhook not active, releasing notification"
                );
                return self.release(lease).await;
            },
            Err(CoreError::NotFound(_)) => {
                debug!(
                    notification_id = %notification.id,
                    webhook_id = %notification.webhook_id,
                    "webhook missing, releasing notification"
                );
                return self.release(lease).await;
            },
            Err(error) => {
                warn!(
                    notification_id = %notification.id,
                    error = %error,
                    "webhook lookup failed, releasing notification"
                );
                return self.release(lease).await;
            },
        };

        // Batches larger than the worker pool wait for permits while their
        // lease runs down. A call that could outlive the lease goes back to
        // the queue instead of racing a reclaiming dispatcher.
        let remaining = lease.expires_at - self.clock.now_utc();
        let needed = chrono::Duration::from_std(self.config.client_config.timeout)
            .unwrap_or(chrono::Duration::MAX);
        if remaining < needed {
            debug!(
                notification_id = %notification.id,
                remaining_ms = remaining.num_milliseconds(),
                "lease too short for a delivery attempt, releasing notification"
            );
            return self.release(lease).await;
        }

        let outcome = {
            let _in_flight = InFlightGuard::enter(&self.in_flight);
            self.client.deliver(&webhook, &notification).await
        };

        let attempt_count = notification.attempt_count.saturating_add(1);
        let finished_at = self.clock.now_utc();

        let commit = match outcome {
            Outcome::Success { .. } => Commit::Success,
            Outcome::RetryableFailure(error) | Outcome::TerminalFailure(error) => {
                let decision = RetryContext {
                    attempt_count,
                    error: &error,
                    failed_at: finished_at,
                    policy: &webhook.retry_policy,
                    jitter_factor: self.config.retry_jitter,
                    lease_expires_at: lease.expires_at,
                }
                .decide_retry();

                match decision {
                    RetryDecision::Retry { next_attempt_at } => {
                        Commit::Retry { next_attempt_at, error: error.to_string() }
                    },
                    RetryDecision::GiveUp { reason } => Commit::Failed { error: reason },
                }
            },
        };

        self.commit(lease, commit, attempt_count, finished_at).await
    }

    async fn release(&self, lease: Lease) -> Disposition {
        let disposition = match self.store.release(lease).await {
            Ok(()) => Disposition::Released,
            Err(CoreError::LeaseLost(_)) => Disposition::LeaseLost,
            Err(error) => {
                warn!(
                    notification_id = %lease.notification_id,
                    error = %error,
                    "release failed, lease left to expire"
                );
                Disposition::CommitFailed
            },
        };
        self.record(disposition).await;
        disposition
    }

    /// Writes the outcome, retrying transient storage errors.
    ///
    /// A commit that keeps failing is abandoned: the lease expires and the
    /// notification is delivered again, which at-least-once permits.
    async fn commit(
        &self,
        lease: Lease,
        commit: Commit,
        attempt_count: u32,
        finished_at: chrono::DateTime<chrono::Utc>,
    ) -> Disposition {
        let max_attempts = self.config.commit_retry_attempts.max(1);
        let mut attempt = 1;

        let disposition = loop {
            let result = match &commit {
                Commit::Success => self.store.commit_success(lease, finished_at).await,
                Commit::Retry { next_attempt_at, error } => {
                    self.store
                        .commit_retry(
                            lease,
                            *next_attempt_at,
                            error.clone(),
                            attempt_count,
                            finished_at,
                        )
                        .await
                },
                Commit::Failed { error } => {
                    self.store.commit_failed(lease, error.clone(), attempt_count, finished_at).await
                },
            };

            match result {
                Ok(()) => {
                    break match &commit {
                        Commit::Success => Disposition::Succeeded,
                        Commit::Retry { .. } => Disposition::Retried,
                        Commit::Failed { .. } => Disposition::Failed,
                    };
                },
                Err(CoreError::LeaseLost(_)) => {
                    warn!(
                        notification_id = %lease.notification_id,
                        "lease lost before commit, outcome discarded"
                    );
                    break Disposition::LeaseLost;
                },
                Err(error) if error.is_transient() && attempt < max_attempts => {
                    warn!(
                        notification_id = %lease.notification_id,
                        attempt,
                        error = %error,
                        category = %ErrorCategory::Database,
                        "commit failed, retrying"
                    );
                    self.clock.sleep(self.config.commit_retry_delay * attempt).await;
                    attempt += 1;
                },
                Err(error) => {
                    error!(
                        notification_id = %lease.notification_id,
                        attempts = attempt,
                        error = %error,
                        category = %ErrorCategory::Database,
                        "commit failed, lease left to expire"
                    );
                    break Disposition::CommitFailed;
                },
            }
        };

        self.record(disposition).await;
        disposition
    }

    async fn record(&self, disposition: Disposition) {
        let mut stats = self.stats.write().await;
        match disposition {
            Disposition::Succeeded => stats.succeeded += 1,
            Disposition::Retried => stats.retried += 1,
            Disposition::Failed => stats.failed += 1,
            Disposition::Released => stats.released += 1,
            Disposition::LeaseLost => stats.lease_conflicts += 1,
            Disposition::CommitFailed => stats.commit_errors += 1,
        }
    }
}
