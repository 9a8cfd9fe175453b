//! Tests for TestEnv and TestDatabase.

use std::time::Duration;

use anyhow::Result;
use courier_core::{NotificationStatus, WebhookStatus};
use courier_testing::{NotificationBuilder, TestDatabase, TestEnv, WebhookBuilder};

#[tokio::test]
async fn advance_time_moves_enqueue_timestamps() -> Result<()> {
    let env = TestEnv::new().await?;
    let webhook = env.create_webhook(env.webhook()).await;

    let first = env.enqueue(webhook.id, "{}").await?;
    env.advance_time(Duration::from_secs(90));
    let second = env.enqueue(webhook.id, "{}").await?;

    assert_eq!(second.created_at - first.created_at, chrono::Duration::seconds(90));
    Ok(())
}

#[tokio::test]
async fn dispatchers_share_one_queue() -> Result<()> {
    let env = TestEnv::new().await?;
    env.respond_with_status(200).await;
    let webhook = env.create_webhook(env.webhook()).await;
    env.enqueue(webhook.id, "{}").await?;

    let first = env.dispatcher()?.tick().await?;
    let second = env.dispatcher()?.tick().await?;

    assert_eq!(first.claimed, 1);
    assert_eq!(second.claimed, 0);
    assert_eq!(env.stats().await.succeeded, 1);
    Ok(())
}

#[tokio::test]
async fn seeded_stale_lease_is_reclaimed() -> Result<()> {
    let env = TestEnv::new().await?;
    env.respond_with_status(200).await;
    let webhook = env.create_webhook(env.webhook()).await;
    let stale =
        NotificationBuilder::new(webhook.id, env.now()).leased_until(env.now()).build();
    env.store.insert_notification(stale.clone()).await;

    let summary = env.run_delivery_cycle().await?;

    assert_eq!(summary.succeeded, 1);
    assert_eq!(env.notification(stale.id).await?.status, NotificationStatus::Success);
    Ok(())
}

#[tokio::test]
async fn publisher_only_reaches_active_subscribers() -> Result<()> {
    let env = TestEnv::new().await?;
    let active = env.create_webhook(env.webhook().product("p1")).await;
    env.create_webhook(env.webhook().product("p1").status(WebhookStatus::Inactive)).await;

    let notifications = env.publisher().publish("p1", r#"{"price":10}"#).await?;

    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].webhook_id, active.id);
    Ok(())
}

#[tokio::test]
async fn test_databases_are_isolated() -> Result<()> {
    let Some(first) = TestDatabase::connect().await? else {
        return Ok(());
    };
    let Some(second) = TestDatabase::connect().await? else {
        return Ok(());
    };

    let now = chrono::Utc::now();
    let webhook = WebhookBuilder::new("http://localhost/hook").build(now);
    first.storage().webhooks.create(&webhook).await?;
    first.storage().notifications.enqueue(webhook.id, "{}", now).await?;

    let claimed = second
        .storage()
        .notifications
        .claim_due(10, Duration::from_secs(30), now)
        .await?;
    assert!(claimed.is_empty());

    let claimed =
        first.storage().notifications.claim_due(10, Duration::from_secs(30), now).await?;
    assert_eq!(claimed.len(), 1);

    first.cleanup().await?;
    second.cleanup().await?;
    Ok(())
}
