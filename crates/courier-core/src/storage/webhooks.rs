//! Repository for the webhook registry.
//!
//! The delivery side only reads webhooks: active listings, product
//! subscriptions and lookups by ID. The write helpers exist for the
//! administrative surface and for tests seeding fixtures.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{Executor, PgPool, Postgres, Transaction};

use crate::{
    error::{CoreError, Result},
    models::{Webhook, WebhookId, WebhookStatus},
};

const WEBHOOK_COLUMNS: &str = "id, name, url, method, headers, product_ids, status, \
     max_attempts, initial_delay_ms, max_delay_ms, backoff_multiplier, \
     created_at, updated_at, created_by";

fn duration_ms(duration: std::time::Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// Repository for webhook registry operations.
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

    /// Registers a webhook.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidInput` if the retry policy is invalid, or a
    /// database error if the insert fails.
    pub async fn create(&self, webhook: &Webhook) -> Result<WebhookId> {
        self.create_impl(&*self.pool, webhook).await
    }

    /// Registers a webhook within a transaction.
    ///
    /// # Errors
    ///
    /// Returns error if validation or the insert fails.
    pub async fn create_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        webhook: &Webhook,
    ) -> Result<WebhookId> {
        self.create_impl(&mut **tx, webhook).await
    }

    async fn create_impl<'e, E>(&self, executor: E, webhook: &Webhook) -> Result<WebhookId>
    where
        E: Executor<'e, Database = Postgres>,
    {
        webhook.retry_policy.validate()?;

        let policy = &webhook.retry_policy;
        let id = sqlx::query_scalar(
            r"
            INSERT INTO webhooks (
                id, name, url, method, headers, product_ids, status,
                max_attempts, initial_delay_ms, max_delay_ms, backoff_multiplier,
                created_at, updated_at, created_by
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14
            )
            RETURNING id
            ",
        )
        .bind(webhook.id)
        .bind(&webhook.name)
        .bind(&webhook.url)
        .bind(webhook.method)
        .bind(sqlx::types::Json(&webhook.headers))
        .bind(&webhook.product_ids)
        .bind(webhook.status)
        .bind(i32::try_from(policy.max_attempts).unwrap_or(i32::MAX))
        .bind(duration_ms(policy.initial_delay))
        .bind(duration_ms(policy.max_delay))
        .bind(policy.backoff_multiplier)
        .bind(webhook.created_at)
        .bind(webhook.updated_at)
        .bind(&webhook.created_by)
        .fetch_one(executor)
        .await?;

        Ok(WebhookId(id))
    }

    /// Finds a webhook by ID regardless of status.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id(&self, id: WebhookId) -> Result<Option<Webhook>> {
        let query = format!("SELECT {WEBHOOK_COLUMNS} FROM webhooks WHERE id = $1");
        let webhook = sqlx::query_as::<_, Webhook>(&query)
            .bind(id)
            .fetch_optional(&*self.pool)
            .await?;

        Ok(webhook)
    }

    /// Gets a webhook by ID.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if no webhook has this ID.
    pub async fn get(&self, id: WebhookId) -> Result<Webhook> {
        self.find_by_id(id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("webhook {id} not found")))
    }

    /// Lists all active webhooks.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_active(&self) -> Result<Vec<Webhook>> {
        let query = format!(
            "SELECT {WEBHOOK_COLUMNS} FROM webhooks WHERE status = 'active' ORDER BY created_at"
        );
        let webhooks = sqlx::query_as::<_, Webhook>(&query).fetch_all(&*self.pool).await?;

        Ok(webhooks)
    }

    /// Lists active webhooks subscribed to a product.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_active_by_product(&self, product_id: &str) -> Result<Vec<Webhook>> {
        let query = format!(
            "SELECT {WEBHOOK_COLUMNS} FROM webhooks \
             WHERE status = 'active' AND $1 = ANY(product_ids) ORDER BY created_at"
        );
        let webhooks = sqlx::query_as::<_, Webhook>(&query)
            .bind(product_id)
            .fetch_all(&*self.pool)
            .await?;

        Ok(webhooks)
    }

    /// Changes the lifecycle status of a webhook.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if no webhook has this ID.
    pub async fn update_status(
        &self,
        id: WebhookId,
        status: WebhookStatus,
        updated_at: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query("UPDATE webhooks SET status = $2, updated_at = $3 WHERE id = $1")
            .bind(id)
            .bind(status)
            .bind(updated_at)
            .execute(&*self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("webhook {id} not found")));
        }
        Ok(())
    }

    /// Hard-deletes a webhook.
    ///
    /// Notifications addressed to it are kept as history.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if no webhook has this ID.
    pub async fn delete(&self, id: WebhookId) -> Result<()> {
        let result =
            sqlx::query("DELETE FROM webhooks WHERE id = $1").bind(id).execute(&*self.pool).await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("webhook {id} not found")));
        }
        Ok(())
    }
}
