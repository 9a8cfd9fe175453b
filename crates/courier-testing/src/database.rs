//! PostgreSQL access for repository tests.
//!
//! Each [`TestDatabase`] gets its own schema, created on connect and pinned
//! through `search_path`, so concurrent tests never claim each other's
//! notifications. Tests are skipped when `DATABASE_URL` is not set.

use std::sync::Arc;

use anyhow::{Context, Result};
use courier_core::storage::Storage;
use sqlx::{postgres::PgPoolOptions, Executor, PgPool};
use tracing::{debug, warn};
use uuid::Uuid;

/// Environment variable holding the test database connection string.
pub const DATABASE_URL_ENV: &str = "DATABASE_URL";

/// Schema-isolated PostgreSQL database for a single test.
pub struct TestDatabase {
    pool: PgPool,
    storage: Arc<Storage>,
    schema: String,
}

impl TestDatabase {
    /// Connects and migrates a fresh schema.
    ///
    /// Returns `Ok(None)` when `DATABASE_URL` is unset so tests can return
    /// early on machines without PostgreSQL.
    ///
    /// # Errors
    ///
    /// Returns error if the database is configured but unreachable, or the
    /// schema cannot be created or migrated.
    pub async fn connect() -> Result<Option<Self>> {
        let Ok(url) = std::env::var(DATABASE_URL_ENV) else {
            warn!("{DATABASE_URL_ENV} not set, skipping database test");
            return Ok(None);
        };

        let schema = format!("courier_test_{}", Uuid::new_v4().simple());

        let admin = PgPoolOptions::new()
            .max_connections(1)
            .connect(&url)
            .await
            .context("failed to connect to test database")?;
        admin
            .execute(format!("CREATE SCHEMA {schema}").as_str())
            .await
            .context("failed to create test schema")?;
        admin.close().await;

        let search_path = format!("SET search_path TO {schema}");
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .after_connect(move |conn, _meta| {
                let search_path = search_path.clone();
                Box::pin(async move {
                    conn.execute(search_path.as_str()).await?;
                    Ok(())
                })
            })
            .connect(&url)
            .await
            .context("failed to connect test pool")?;

        let storage = Arc::new(Storage::new(pool.clone()));
        storage.migrate().await.context("failed to migrate test schema")?;
        debug!(schema = %schema, "test database ready");

        Ok(Some(Self { pool, storage, schema }))
    }

    /// Access to the underlying database pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Repositories bound to this test's schema.
    pub fn storage(&self) -> Arc<Storage> {
        self.storage.clone()
    }

    /// Drops the test schema and closes the pool.
    ///
    /// # Errors
    ///
    /// Returns error if the schema cannot be dropped.
    pub async fn cleanup(self) -> Result<()> {
        self.pool
            .execute(format!("DROP SCHEMA IF EXISTS {} CASCADE", self.schema).as_str())
            .await
            .context("failed to drop test schema")?;
        self.pool.close().await;
        Ok(())
    }
}
