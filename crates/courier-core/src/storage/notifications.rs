//! Repository for the notification queue and its leases.
//!
//! Claiming is a single statement: candidates are locked with
//! `FOR UPDATE SKIP LOCKED` and flipped to `SENDING` with a fresh lease in
//! the same round trip, so concurrent dispatchers never receive the same
//! row. Every later write is conditional on the caller still holding the
//! exact lease it was handed.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use sqlx::{Executor, PgPool, Postgres, Transaction};

use crate::{
    error::{CoreError, Result},
    models::{Lease, Notification, NotificationId, WebhookId},
};

const NOTIFICATION_COLUMNS: &str = "id, webhook_id, payload, status, attempt_count, last_error, \
     created_at, last_attempt_at, completed_at, next_attempt_at, processing, processing_until";

/// Matches rows whose stored lease is exactly the presented one.
const LEASE_GUARD: &str =
    "id = $1 AND processing = TRUE AND processing_until = $2 AND status = 'sending'";

fn attempts_param(attempt_count: u32) -> i32 {
    i32::try_from(attempt_count).unwrap_or(i32::MAX)
}

/// Repository for notification database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Returns a reference to the database pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Enqueues a pending notification for a webhook.
    ///
    /// No deduplication is performed; each call creates a new record.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn enqueue(
        &self,
        webhook_id: WebhookId,
        payload: &str,
        created_at: DateTime<Utc>,
    ) -> Result<Notification> {
        self.enqueue_impl(&*self.pool, webhook_id, payload, created_at).await
    }

    /// Enqueues a notification within the caller's transaction.
    ///
    /// Lets event producers commit the event and its notifications together.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn enqueue_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        webhook_id: WebhookId,
        payload: &str,
        created_at: DateTime<Utc>,
    ) -> Result<Notification> {
        self.enqueue_impl(&mut **tx, webhook_id, payload, created_at).await
    }

    async fn enqueue_impl<'e, E>(
        &self,
        executor: E,
        webhook_id: WebhookId,
        payload: &str,
        created_at: DateTime<Utc>,
    ) -> Result<Notification>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let query = format!(
            "INSERT INTO notifications (id, webhook_id, payload, status, created_at) \
             VALUES ($1, $2, $3, 'pending', $4) RETURNING {NOTIFICATION_COLUMNS}"
        );
        let notification = sqlx::query_as::<_, Notification>(&query)
            .bind(NotificationId::new())
            .bind(webhook_id)
            .bind(payload)
            .bind(created_at)
            .fetch_one(executor)
            .await?;

        Ok(notification)
    }

    /// Claims up to `limit` due notifications for `lease_duration`.
    ///
    /// A row is due when it is unleased, queued and past its not-before time,
    /// or when its lease expired at or before `now`. Only notifications for
    /// active webhooks are claimed. Results are ordered by due time, oldest
    /// first.
    ///
    /// # Errors
    ///
    /// Returns error if the statement fails. Losing a race is not an error;
    /// the caller simply receives fewer rows.
    pub async fn claim_due(
        &self,
        limit: usize,
        lease_duration: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<Notification>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let lease = chrono::Duration::from_std(lease_duration)
            .map_err(|_| CoreError::InvalidInput("lease duration out of range".to_string()))?;
        let processing_until = now + lease;

        let query = format!(
            r"
            WITH due AS (
                SELECT n.id
                FROM notifications n
                JOIN webhooks w ON w.id = n.webhook_id AND w.status = 'active'
                WHERE n.status IN ('pending', 'retry', 'sending')
                  AND (
                    (n.processing = FALSE
                        AND (n.next_attempt_at IS NULL OR n.next_attempt_at <= $1))
                    OR (n.processing = TRUE AND n.processing_until <= $1)
                  )
                ORDER BY COALESCE(n.next_attempt_at, n.created_at), n.created_at
                LIMIT $3
                FOR UPDATE OF n SKIP LOCKED
            ),
            claimed AS (
                UPDATE notifications
                SET processing = TRUE, processing_until = $2, status = 'sending'
                FROM due
                WHERE notifications.id = due.id
                RETURNING notifications.*
            )
            SELECT {NOTIFICATION_COLUMNS} FROM claimed
            ORDER BY COALESCE(next_attempt_at, created_at), created_at
            "
        );

        let claimed = sqlx::query_as::<_, Notification>(&query)
            .bind(now)
            .bind(processing_until)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&*self.pool)
            .await?;

        Ok(claimed)
    }

    /// Drops a lease without recording an attempt.
    ///
    /// Status is left as is; the record becomes claimable again immediately.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::LeaseLost` if the lease is no longer held.
    pub async fn release(&self, lease: &Lease) -> Result<()> {
        let query = format!(
            "UPDATE notifications SET processing = FALSE, processing_until = NULL \
             WHERE {LEASE_GUARD}"
        );
        let result = sqlx::query(&query)
            .bind(lease.notification_id)
            .bind(lease.expires_at)
            .execute(&*self.pool)
            .await?;

        Self::expect_one(result.rows_affected(), lease)
    }

    /// Records a successful delivery. Terminal.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::LeaseLost` if the lease is no longer held.
    pub async fn commit_success(&self, lease: &Lease, completed_at: DateTime<Utc>) -> Result<()> {
        let query = format!(
            "UPDATE notifications SET status = 'success', processing = FALSE, \
             processing_until = NULL, completed_at = $3, last_attempt_at = $3, \
             attempt_count = attempt_count + 1, next_attempt_at = NULL \
             WHERE {LEASE_GUARD}"
        );
        let result = sqlx::query(&query)
            .bind(lease.notification_id)
            .bind(lease.expires_at)
            .bind(completed_at)
            .execute(&*self.pool)
            .await?;

        Self::expect_one(result.rows_affected(), lease)
    }

    /// Schedules another attempt no earlier than `next_attempt_at`.
    ///
    /// `attempt_count` is the count including the attempt being committed.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::LeaseLost` if the lease is no longer held.
    pub async fn commit_retry(
        &self,
        lease: &Lease,
        next_attempt_at: DateTime<Utc>,
        error: &str,
        attempt_count: u32,
        attempted_at: DateTime<Utc>,
    ) -> Result<()> {
        let query = format!(
            "UPDATE notifications SET status = 'retry', processing = FALSE, \
             processing_until = NULL, last_error = $3, attempt_count = $4, \
             last_attempt_at = $5, next_attempt_at = $6 \
             WHERE {LEASE_GUARD}"
        );
        let result = sqlx::query(&query)
            .bind(lease.notification_id)
            .bind(lease.expires_at)
            .bind(error)
            .bind(attempts_param(attempt_count))
            .bind(attempted_at)
            .bind(next_attempt_at)
            .execute(&*self.pool)
            .await?;

        Self::expect_one(result.rows_affected(), lease)
    }

    /// Records a permanent failure. Terminal.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::LeaseLost` if the lease is no longer held.
    pub async fn commit_failed(
        &self,
        lease: &Lease,
        error: &str,
        attempt_count: u32,
        completed_at: DateTime<Utc>,
    ) -> Result<()> {
        let query = format!(
            "UPDATE notifications SET status = 'failed', processing = FALSE, \
             processing_until = NULL, last_error = $3, attempt_count = $4, \
             last_attempt_at = $5, completed_at = $5, next_attempt_at = NULL \
             WHERE {LEASE_GUARD}"
        );
        let result = sqlx::query(&query)
            .bind(lease.notification_id)
            .bind(lease.expires_at)
            .bind(error)
            .bind(attempts_param(attempt_count))
            .bind(completed_at)
            .execute(&*self.pool)
            .await?;

        Self::expect_one(result.rows_affected(), lease)
    }

    /// Finds a notification by ID.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id(&self, id: NotificationId) -> Result<Option<Notification>> {
        let query = format!("SELECT {NOTIFICATION_COLUMNS} FROM notifications WHERE id = $1");
        let notification = sqlx::query_as::<_, Notification>(&query)
            .bind(id)
            .fetch_optional(&*self.pool)
            .await?;

        Ok(notification)
    }

    /// Lists the delivery history of a webhook, oldest first.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_webhook(&self, webhook_id: WebhookId) -> Result<Vec<Notification>> {
        let query = format!(
            "SELECT {NOTIFICATION_COLUMNS} FROM notifications \
             WHERE webhook_id = $1 ORDER BY created_at"
        );
        let notifications = sqlx::query_as::<_, Notification>(&query)
            .bind(webhook_id)
            .fetch_all(&*self.pool)
            .await?;

        Ok(notifications)
    }

    fn expect_one(rows_affected: u64, lease: &Lease) -> Result<()> {
        if rows_affected == 0 {
            return Err(CoreError::LeaseLost(lease.notification_id));
        }
        Ok(())
    }
}
