//! Database access layer for the webhook registry and notification queue.
//!
//! Repositories translate between domain models and the PostgreSQL schema.
//! All reads and writes of webhook and notification rows go through them;
//! in particular the lease fields are only ever touched by the conditional
//! updates in [`notifications::Repository`].

use std::sync::Arc;

use sqlx::PgPool;

pub mod notifications;
pub mod webhooks;

use crate::error::Result;

/// Schema statements applied by [`Storage::migrate`], in order.
const SCHEMA: &[&str] = &[
    r"
    CREATE TABLE IF NOT EXISTS webhooks (
        id UUID PRIMARY KEY,
        name TEXT NOT NULL,
        url TEXT NOT NULL,
        method TEXT NOT NULL DEFAULT 'POST',
        headers JSONB NOT NULL DEFAULT '{}'::jsonb,
        product_ids TEXT[] NOT NULL DEFAULT '{}',
        status TEXT NOT NULL DEFAULT 'active'
            CHECK (status IN ('active', 'inactive', 'suspended')),
        max_attempts INTEGER CHECK (max_attempts >= 1),
        initial_delay_ms BIGINT CHECK (initial_delay_ms >= 0),
        max_delay_ms BIGINT CHECK (max_delay_ms >= 0),
        backoff_multiplier DOUBLE PRECISION CHECK (backoff_multiplier >= 1.0),
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        created_by TEXT,
        CHECK (max_delay_ms IS NULL OR initial_delay_ms IS NULL OR max_delay_ms >= initial_delay_ms)
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS notifications (
        id UUID PRIMARY KEY,
        webhook_id UUID NOT NULL,
        payload TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending'
            CHECK (status IN ('pending', 'sending', 'success', 'failed', 'retry')),
        attempt_count INTEGER NOT NULL DEFAULT 0 CHECK (attempt_count >= 0),
        last_error TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        last_attempt_at TIMESTAMPTZ,
        completed_at TIMESTAMPTZ,
        next_attempt_at TIMESTAMPTZ,
        processing BOOLEAN NOT NULL DEFAULT FALSE,
        processing_until TIMESTAMPTZ,
        CHECK (NOT processing OR processing_until IS NOT NULL)
    )
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_notifications_claimable
        ON notifications (next_attempt_at, created_at)
        WHERE status IN ('pending', 'retry', 'sending')
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_notifications_webhook
        ON notifications (webhook_id, created_at)
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_webhooks_product_ids
        ON webhooks USING GIN (product_ids)
    ",
];

/// Container for all repository instances providing unified database access.
#[derive(Clone)]
pub struct Storage {
    /// Repository for the webhook registry.
    pub webhooks: Arc<webhooks::Repository>,

    /// Repository for the notification queue and its leases.
    pub notifications: Arc<notifications::Repository>,

    pool: Arc<PgPool>,
}

impl Storage {
    /// Creates a new storage instance with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self {
            webhooks: Arc::new(webhooks::Repository::new(pool.clone())),
            notifications: Arc::new(notifications::Repository::new(pool.clone())),
            pool,
        }
    }

    /// Returns the shared connection pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Creates tables and indexes if they do not exist yet.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if any DDL statement fails.
    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&*self.pool).await?;
        }

        tracing::debug!(statements = SCHEMA.len(), "schema bootstrap applied");
        Ok(())
    }

    /// Performs a health check on the database connection.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the connection is unhealthy.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.pool).await?;

        Ok(())
    }
}
