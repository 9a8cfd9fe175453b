//! Event fan-out into the notification queue.

use std::sync::Arc;

use courier_core::{Clock, CoreError, Notification, WebhookId};
use tracing::{debug, info};

use crate::{
    error::{DeliveryError, Result},
    storage::{NotificationStore, WebhookRegistry},
};

/// Turns product events into pending notifications.
///
/// One notification is enqueued per active webhook subscribed to the
/// event's product. Nothing is delivered here; the dispatcher picks the
/// notifications up on its next tick.
#[derive(Clone)]
pub struct EventPublisher {
    registry: Arc<dyn WebhookRegistry>,
    store: Arc<dyn NotificationStore>,
    clock: Arc<dyn Clock>,
}

impl EventPublisher {
    /// Creates a publisher over the given registry and store.
    pub fn new(
        registry: Arc<dyn WebhookRegistry>,
        store: Arc<dyn NotificationStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { registry, store, clock }
    }

    /// Enqueues `payload` for every active webhook subscribed to `product_id`.
    ///
    /// Returns the created notifications; an event nobody subscribes to
    /// yields an empty list.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::DatabaseError` if listing subscribers or an
    /// insert fails. Notifications enqueued before the failure are kept.
    pub async fn publish(&self, product_id: &str, payload: &str) -> Result<Vec<Notification>> {
        let webhooks = self.registry.find_active_by_product(product_id).await?;
        let created_at = self.clock.now_utc();

        let mut notifications = Vec::with_capacity(webhooks.len());
        for webhook in &webhooks {
            let notification = self.store.enqueue(webhook.id, payload, created_at).await?;
            debug!(
                notification_id = %notification.id,
                webhook_id = %webhook.id,
                product_id,
                "notification enqueued"
            );
            notifications.push(notification);
        }

        info!(product_id, subscribers = notifications.len(), "event published");
        Ok(notifications)
    }

    /// Enqueues `payload` for a single webhook.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::WebhookUnavailable` if the webhook does not
    /// exist or is not active, or a database error if the insert fails.
    pub async fn enqueue(&self, webhook_id: WebhookId, payload: &str) -> Result<Notification> {
        let webhook = match self.registry.get(webhook_id).await {
            Ok(webhook) => webhook,
            Err(CoreError::NotFound(_)) => {
                return Err(DeliveryError::webhook_unavailable(webhook_id, "not found"));
            },
            Err(error) => return Err(error.into()),
        };

        if !webhook.is_active() {
            return Err(DeliveryError::webhook_unavailable(
                webhook_id,
                format!("status is {}", webhook.status),
            ));
        }

        let notification = self.store.enqueue(webhook_id, payload, self.clock.now_utc()).await?;
        debug!(notification_id = %notification.id, webhook_id = %webhook_id, "notification enqueued");
        Ok(notification)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use courier_core::{NotificationStatus, TestClock, Webhook, WebhookStatus};

    use super::*;
    use crate::storage::memory::MemoryStore;

    fn publisher(store: &MemoryStore) -> EventPublisher {
        EventPublisher::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            Arc::new(TestClock::new()),
        )
    }

    fn subscribed(products: &[&str]) -> Webhook {
        let mut webhook = Webhook::new("hook", "http://localhost/hook", Utc::now());
        webhook.product_ids = products.iter().map(ToString::to_string).collect();
        webhook
    }

    #[tokio::test]
    async fn publish_fans_out_to_active_subscribers() {
        let store = MemoryStore::new();
        let first = subscribed(&["p1"]);
        let second = subscribed(&["p1", "p2"]);
        let other = subscribed(&["p2"]);
        let mut inactive = subscribed(&["p1"]);
        inactive.status = WebhookStatus::Inactive;
        for webhook in [&first, &second, &other, &inactive] {
            store.add_webhook(webhook.clone()).await;
        }

        let notifications = publisher(&store).publish("p1", r#"{"id":1}"#).await.unwrap();

        let mut targets: Vec<_> = notifications.iter().map(|n| n.webhook_id).collect();
        targets.sort();
        let mut expected = vec![first.id, second.id];
        expected.sort();
        assert_eq!(targets, expected);
        assert!(notifications.iter().all(|n| n.status == NotificationStatus::Pending));
        assert!(notifications.iter().all(|n| n.payload == r#"{"id":1}"#));
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_empty() {
        let store = MemoryStore::new();
        assert!(publisher(&store).publish("nobody", "{}").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn enqueue_rejects_inactive_and_missing_webhooks() {
        let store = MemoryStore::new();
        let mut webhook = subscribed(&[]);
        webhook.status = WebhookStatus::Suspended;
        store.add_webhook(webhook.clone()).await;
        let publisher = publisher(&store);

        assert!(matches!(
            publisher.enqueue(webhook.id, "{}").await,
            Err(DeliveryError::WebhookUnavailable { .. })
        ));
        assert!(matches!(
            publisher.enqueue(WebhookId::new(), "{}").await,
            Err(DeliveryError::WebhookUnavailable { .. })
        ));
        assert!(store.notifications().await.is_empty());
    }

    #[tokio::test]
    async fn enqueue_does_not_deduplicate() {
        let store = MemoryStore::new();
        let webhook = subscribed(&[]);
        store.add_webhook(webhook.clone()).await;
        let publisher = publisher(&store);

        let first = publisher.enqueue(webhook.id, "{}").await.unwrap();
        let second = publisher.enqueue(webhook.id, "{}").await.unwrap();

        assert_ne!(first.id, second.id);
        assert_eq!(store.notifications().await.len(), 2);
    }
}
