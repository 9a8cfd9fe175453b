//! Courier webhook notification delivery service.
//!
//! Connects to PostgreSQL, bootstraps the schema and runs the dispatch loop
//! until a shutdown signal arrives.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use courier_core::{storage::Storage, RealClock};
use courier_delivery::DeliveryEngine;
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info, warn};

mod config;

use config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(&config.rust_log);

    info!(
        database_url = %config.database_url_masked(),
        batch_size = config.batch_size,
        worker_pool_size = config.worker_pool_size,
        lease_duration_seconds = config.lease_duration_seconds,
        "Starting courier delivery service"
    );

    let pool = create_database_pool(&config).await?;
    info!("Database connection pool established");

    let storage = Arc::new(Storage::new(pool.clone()));
    storage.migrate().await.context("failed to bootstrap database schema")?;
    info!("Database schema ready");

    let mut engine =
        DeliveryEngine::postgres(storage, config.to_delivery_config(), Arc::new(RealClock::new()))
            .context("failed to create delivery engine")?;
    engine.start().await?;

    info!("Courier is dispatching notifications");

    shutdown_signal().await;
    info!("Shutdown signal received, draining in-flight deliveries");

    if let Err(e) = engine.shutdown().await {
        warn!(error = %e, "Delivery engine did not stop cleanly");
    }

    pool.close().await;
    info!("Courier shutdown complete");
    Ok(())
}

/// Initializes tracing, preferring `RUST_LOG` directives from the loaded
/// configuration.
fn init_tracing(directives: &str) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_new(directives).unwrap_or_else(|e| {
        eprintln!("invalid log directives {directives:?}: {e}, falling back to info");
        EnvFilter::new("info")
    });

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

/// Creates the database connection pool, retrying while PostgreSQL comes up.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);
    let mut retries = 0;

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(config.database_min_connections)
            .acquire_timeout(Duration::from_secs(config.database_connection_timeout))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => {
                sqlx::query("SELECT 1")
                    .fetch_one(&pool)
                    .await
                    .context("failed to verify database connection")?;

                return Ok(pool);
            },
            Err(e) if retries < MAX_RETRIES => {
                retries += 1;
                warn!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    error = %e,
                    "Database connection failed, retrying"
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("failed to create database connection pool after retries");
            },
        }
    }
}

/// Resolves on Ctrl+C or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
