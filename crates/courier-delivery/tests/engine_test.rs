//! Engine lifecycle tests with a real clock and HTTP receiver.

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use courier_core::{Clock, NotificationStatus, RealClock, Webhook};
use courier_delivery::{
    ClientConfig, DeliveryClient, DeliveryConfig, DeliveryEngine, DeliveryError, Dispatcher,
    EngineStats, EventPublisher, MemoryStore, NotificationStore,
};
use courier_testing::{TestDatabase, WebhookBuilder};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

fn fast_config() -> DeliveryConfig {
    DeliveryConfig {
        poll_interval: Duration::from_millis(10),
        lease_duration: Duration::from_secs(4),
        tick_timeout: Duration::from_secs(4),
        client_config: ClientConfig { timeout: Duration::from_secs(2), ..ClientConfig::default() },
        ..DeliveryConfig::default()
    }
}

async fn wait_for<F, Fut>(mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Dispatcher on a real clock, built without config validation so tests can
/// squeeze leases and tick timeouts.
fn dispatcher(store: &MemoryStore, config: DeliveryConfig) -> Result<Dispatcher> {
    let client = Arc::new(DeliveryClient::new(config.client_config.clone())?);
    Ok(Dispatcher::new(
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        client,
        config,
        Arc::new(RwLock::new(EngineStats::default())),
        Arc::new(RealClock::new()),
    ))
}

async fn registered(store: &MemoryStore, server: &MockServer) -> Webhook {
    let webhook = WebhookBuilder::new(server.uri()).build(chrono::Utc::now());
    store.add_webhook(webhook.clone()).await;
    webhook
}

#[tokio::test]
async fn running_engine_delivers_published_events() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(2)
        .mount(&server)
        .await;

    let store = MemoryStore::new();
    let clock = Arc::new(RealClock::new());
    for _ in 0..2 {
        let webhook = WebhookBuilder::new(format!("{}/hook", server.uri()))
            .product("p1")
            .build(chrono::Utc::now());
        store.add_webhook(webhook).await;
    }

    let mut engine = DeliveryEngine::new(
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        fast_config(),
        clock.clone(),
    )?;
    engine.start().await?;

    let publisher = EventPublisher::new(Arc::new(store.clone()), Arc::new(store.clone()), clock);
    let published = publisher.publish("p1", r#"{"price":42}"#).await?;
    assert_eq!(published.len(), 2);

    let delivered = wait_for(|| {
        let store = store.clone();
        async move {
            store.notifications().await.iter().all(|n| n.status == NotificationStatus::Success)
        }
    })
    .await;
    assert!(delivered, "notifications were not delivered in time");

    let stats = engine.stats().await;
    assert_eq!(stats.succeeded, 2);
    assert_eq!(stats.in_flight, 0);

    engine.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn shutdown_waits_for_in_flight_delivery() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(matchers::any())
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(300)))
        .mount(&server)
        .await;

    let store = MemoryStore::new();
    let webhook = WebhookBuilder::new(server.uri()).build(chrono::Utc::now());
    store.add_webhook(webhook.clone()).await;

    let mut engine = DeliveryEngine::new(
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        fast_config(),
        Arc::new(RealClock::new()),
    )?;
    engine.start().await?;

    let publisher = EventPublisher::new(
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        Arc::new(RealClock::new()),
    );
    let notification = publisher.enqueue(webhook.id, "{}").await?;

    let in_flight = wait_for(|| {
        let store = store.clone();
        async move { store.notification(notification.id).await.is_some_and(|n| n.processing) }
    })
    .await;
    assert!(in_flight, "delivery never started");

    engine.shutdown().await?;

    let stored = store.notification(notification.id).await.unwrap();
    assert_eq!(stored.status, NotificationStatus::Success);
    Ok(())
}

#[tokio::test]
async fn shutdown_times_out_on_stuck_delivery() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(matchers::any())
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(1)))
        .mount(&server)
        .await;

    let store = MemoryStore::new();
    let webhook = WebhookBuilder::new(server.uri()).build(chrono::Utc::now());
    store.add_webhook(webhook.clone()).await;

    let config = DeliveryConfig { shutdown_timeout: Duration::from_millis(50), ..fast_config() };
    let mut engine = DeliveryEngine::new(
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        config,
        Arc::new(RealClock::new()),
    )?;
    engine.start().await?;

    let publisher = EventPublisher::new(
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        Arc::new(RealClock::new()),
    );
    let notification = publisher.enqueue(webhook.id, "{}").await?;
    let in_flight = wait_for(|| {
        let store = store.clone();
        async move { store.notification(notification.id).await.is_some_and(|n| n.processing) }
    })
    .await;
    assert!(in_flight, "delivery never started");

    let result = engine.shutdown().await;
    assert!(matches!(result, Err(DeliveryError::ShutdownTimeout { .. })));

    // The abandoned lease is still held; another instance reclaims it on expiry.
    let stored = store.notification(notification.id).await.unwrap();
    assert_eq!(stored.status, NotificationStatus::Sending);
    assert!(stored.processing);
    Ok(())
}

#[tokio::test]
async fn dropping_engine_stops_dispatching() -> Result<()> {
    let store = MemoryStore::new();
    let mut engine = DeliveryEngine::new(
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        fast_config(),
        Arc::new(RealClock::new()),
    )?;
    engine.start().await?;
    drop(engine);

    let server = MockServer::start().await;
    Mock::given(matchers::any())
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    let webhook = WebhookBuilder::new(server.uri()).build(chrono::Utc::now());
    store.add_webhook(webhook.clone()).await;
    let publisher = EventPublisher::new(
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        Arc::new(RealClock::new()),
    );
    publisher.enqueue(webhook.id, "{}").await?;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(store.notifications().await[0].status, NotificationStatus::Pending);
    Ok(())
}

#[tokio::test]
async fn postgres_engine_delivers_end_to_end() -> Result<()> {
    let Some(db) = TestDatabase::connect().await? else {
        return Ok(());
    };

    let server = MockServer::start().await;
    Mock::given(matchers::any()).respond_with(ResponseTemplate::new(503)).mount(&server).await;

    let storage = db.storage();
    let webhook = WebhookBuilder::new(server.uri()).build(chrono::Utc::now());
    storage.webhooks.create(&webhook).await?;
    let notification =
        storage.notifications.enqueue(webhook.id, "{}", RealClock::new().now_utc()).await?;

    let engine =
        DeliveryEngine::postgres(storage.clone(), fast_config(), Arc::new(RealClock::new()))?;
    let summary = engine.run_tick().await?;
    assert_eq!(summary.retried, 1);

    let stored = storage.notifications.find_by_id(notification.id).await?.unwrap();
    assert_eq!(stored.status, NotificationStatus::Retry);
    assert_eq!(stored.attempt_count, 1);
    assert!(!stored.processing);
    assert!(stored.next_attempt_at.is_some());

    engine.shutdown().await?;
    db.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn queued_deliveries_never_start_on_a_nearly_expired_lease() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(matchers::any())
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&server)
        .await;

    let store = MemoryStore::new();
    let webhook = registered(&store, &server).await;
    let now = RealClock::new().now_utc();
    for _ in 0..3 {
        store.enqueue(webhook.id, "{}", now).await?;
    }

    // Three waves of one: the third would start with about 200ms of a
    // 1000ms lease left, less than the 400ms call timeout.
    let config = DeliveryConfig {
        batch_size: 3,
        worker_pool_size: 1,
        lease_duration: Duration::from_millis(1000),
        client_config: ClientConfig {
            timeout: Duration::from_millis(400),
            ..ClientConfig::default()
        },
        ..fast_config()
    };
    let summary = dispatcher(&store, config)?.tick().await?;

    assert_eq!(summary.claimed, 3);
    assert_eq!(summary.retried, 2);
    assert_eq!(summary.released, 1);
    assert_eq!(summary.lease_lost, 0);

    let untouched: Vec<_> = store
        .notifications()
        .await
        .into_iter()
        .filter(|n| n.attempt_count == 0)
        .collect();
    assert_eq!(untouched.len(), 1);
    assert!(!untouched[0].processing);
    Ok(())
}

#[tokio::test]
async fn timed_out_tick_does_not_stop_the_loop_or_leak_in_flight() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(matchers::any())
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(1)))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(matchers::any()).respond_with(ResponseTemplate::new(200)).mount(&server).await;

    let store = MemoryStore::new();
    let webhook = registered(&store, &server).await;
    let notification = store.enqueue(webhook.id, "{}", RealClock::new().now_utc()).await?;

    let config = DeliveryConfig {
        lease_duration: Duration::from_millis(300),
        tick_timeout: Duration::from_millis(100),
        client_config: ClientConfig { timeout: Duration::from_millis(250), ..ClientConfig::default() },
        ..fast_config()
    };
    let dispatcher = dispatcher(&store, config)?;
    let token = CancellationToken::new();
    let handle = tokio::spawn({
        let dispatcher = dispatcher.clone();
        let token = token.clone();
        async move { dispatcher.run(token).await }
    });

    let delivered = wait_for(|| {
        let store = store.clone();
        async move {
            store
                .notification(notification.id)
                .await
                .is_some_and(|n| n.status == NotificationStatus::Success)
        }
    })
    .await;

    token.cancel();
    handle.await??;

    assert!(delivered, "notification was not delivered after the timed-out tick");
    assert_eq!(dispatcher.in_flight(), 0);
    assert_eq!(server.received_requests().await.map_or(0, |r| r.len()), 2);
    Ok(())
}

#[tokio::test]
async fn claim_error_does_not_stop_the_loop() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(matchers::any()).respond_with(ResponseTemplate::new(200)).mount(&server).await;

    let store = MemoryStore::new();
    let webhook = registered(&store, &server).await;
    let notification = store.enqueue(webhook.id, "{}", RealClock::new().now_utc()).await?;
    store.inject_claim_error("connection reset").await;

    let dispatcher = dispatcher(&store, fast_config())?;
    let token = CancellationToken::new();
    let handle = tokio::spawn({
        let dispatcher = dispatcher.clone();
        let token = token.clone();
        async move { dispatcher.run(token).await }
    });

    let delivered = wait_for(|| {
        let store = store.clone();
        async move {
            store
                .notification(notification.id)
                .await
                .is_some_and(|n| n.status == NotificationStatus::Success)
        }
    })
    .await;

    token.cancel();
    handle.await??;

    assert!(delivered, "notification was not delivered after the failed claim");
    assert_eq!(dispatcher.in_flight(), 0);
    Ok(())
}
