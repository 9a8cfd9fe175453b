//! Storage seams for the dispatcher and publisher.
//!
//! The dispatcher only sees two traits: a read-only [`WebhookRegistry`] and
//! the lease-aware [`NotificationStore`]. Production wires both to
//! PostgreSQL through [`PostgresStore`]; tests use the in-memory
//! [`memory::MemoryStore`], which honours the same claim and lease rules.

use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use courier_core::{
    storage::Storage, Lease, Notification, NotificationId, Result, Webhook, WebhookId,
};

/// Boxed future returned by storage trait methods.
pub type StorageFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Read access to webhook definitions.
pub trait WebhookRegistry: Send + Sync + 'static {
    /// Lists all active webhooks.
    fn find_active(&self) -> StorageFuture<'_, Vec<Webhook>>;

    /// Lists active webhooks subscribed to `product_id`.
    fn find_active_by_product<'a>(&'a self, product_id: &'a str)
        -> StorageFuture<'a, Vec<Webhook>>;

    /// Gets a webhook by ID, failing with `CoreError::NotFound` if absent.
    fn get(&self, id: WebhookId) -> StorageFuture<'_, Webhook>;
}

/// Notification queue with lease-based claiming.
///
/// Claims are atomic: two concurrent `claim_due` calls never return the same
/// notification while its lease is live. Every commit presents the lease it
/// was handed and fails with `CoreError::LeaseLost` once that lease was
/// reclaimed or already committed.
pub trait NotificationStore: Send + Sync + 'static {
    /// Creates a `PENDING` notification for a webhook.
    fn enqueue<'a>(
        &'a self,
        webhook_id: WebhookId,
        payload: &'a str,
        created_at: DateTime<Utc>,
    ) -> StorageFuture<'a, Notification>;

    /// Claims up to `limit` due notifications, leasing each until
    /// `now + lease_duration`.
    fn claim_due(
        &self,
        limit: usize,
        lease_duration: Duration,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, Vec<Notification>>;

    /// Drops a lease without recording an attempt.
    fn release(&self, lease: Lease) -> StorageFuture<'_, ()>;

    /// Records a successful delivery.
    fn commit_success(&self, lease: Lease, completed_at: DateTime<Utc>) -> StorageFuture<'_, ()>;

    /// Schedules a retry no earlier than `next_attempt_at`.
    fn commit_retry(
        &self,
        lease: Lease,
        next_attempt_at: DateTime<Utc>,
        error: String,
        attempt_count: u32,
        attempted_at: DateTime<Utc>,
    ) -> StorageFuture<'_, ()>;

    /// Records a permanent failure.
    fn commit_failed(
        &self,
        lease: Lease,
        error: String,
        attempt_count: u32,
        completed_at: DateTime<Utc>,
    ) -> StorageFuture<'_, ()>;

    /// Finds a notification by ID.
    fn find(&self, id: NotificationId) -> StorageFuture<'_, Option<Notification>>;
}

/// PostgreSQL-backed registry and store.
///
/// Wraps the repositories of `courier_core::storage::Storage`.
#[derive(Clone)]
pub struct PostgresStore {
    storage: Arc<Storage>,
}

impl PostgresStore {
    /// Creates a new PostgreSQL storage adapter.
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

impl WebhookRegistry for PostgresStore {
    fn find_active(&self) -> StorageFuture<'_, Vec<Webhook>> {
        Box::pin(async move { self.storage.webhooks.find_active().await })
    }

    fn find_active_by_product<'a>(
        &'a self,
        product_id: &'a str,
    ) -> StorageFuture<'a, Vec<Webhook>> {
        Box::pin(async move { self.storage.webhooks.find_active_by_product(product_id).await })
    }

    fn get(&self, id: WebhookId) -> StorageFuture<'_, Webhook> {
        Box::pin(async move { self.storage.webhooks.get(id).await })
    }
}

impl NotificationStore for PostgresStore {
    fn enqueue<'a>(
        &'a self,
        webhook_id: WebhookId,
        payload: &'a str,
        created_at: DateTime<Utc>,
    ) -> StorageFuture<'a, Notification> {
        Box::pin(async move {
            self.storage.notifications.enqueue(webhook_id, payload, created_at).await
        })
    }

    fn claim_due(
        &self,
        limit: usize,
        lease_duration: Duration,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, Vec<Notification>> {
        Box::pin(async move {
            self.storage.notifications.claim_due(limit, lease_duration, now).await
        })
    }

    fn release(&self, lease: Lease) -> StorageFuture<'_, ()> {
        Box::pin(async move { self.storage.notifications.release(&lease).await })
    }

    fn commit_success(&self, lease: Lease, completed_at: DateTime<Utc>) -> StorageFuture<'_, ()> {
        Box::pin(async move {
            self.storage.notifications.commit_success(&lease, completed_at).await
        })
    }

    fn commit_retry(
        &self,
        lease: Lease,
        next_attempt_at: DateTime<Utc>,
        error: String,
        attempt_count: u32,
        attempted_at: DateTime<Utc>,
    ) -> StorageFuture<'_, ()> {
        Box::pin(async move {
            self.storage
                .notifications
                .commit_retry(&lease, next_attempt_at, &error, attempt_count, attempted_at)
                .await
        })
    }

    fn commit_failed(
        &self,
        lease: Lease,
        error: String,
        attempt_count: u32,
        completed_at: DateTime<Utc>,
    ) -> StorageFuture<'_, ()> {
        Box::pin(async move {
            self.storage
                .notifications
                .commit_failed(&lease, &error, attempt_count, completed_at)
                .await
        })
    }

    fn find(&self, id: NotificationId) -> StorageFuture<'_, Option<Notification>> {
        Box::pin(async move { self.storage.notifications.find_by_id(id).await })
    }
}

pub mod memory {
    //! In-memory registry and store for tests.
    //!
    //! Webhooks and notifications live behind one `RwLock`. Claims and
    //! commits hold its write guard, so a claim observes and mutates a
    //! consistent snapshot exactly like the single-statement SQL claim. Failures can be injected into claims and commits.

    use std::{collections::HashMap, sync::Arc, time::Duration};

    use chrono::{DateTime, Utc};
    use courier_core::{
        CoreError, Lease, Notification, NotificationId, NotificationStatus, Result, Webhook,
        WebhookId, WebhookStatus,
    };
    use tokio::sync::RwLock;

    use super::{NotificationStore, StorageFuture, WebhookRegistry};

    #[derive(Default)]
    struct State {
        webhooks: HashMap<WebhookId, Webhook>,
        notifications: HashMap<NotificationId, Notification>,
        claim_error: Option<String>,
        failing_commits: u32,
    }

    impl State {
        fn leased_mut(&mut self, lease: &Lease) -> Result<&mut Notification> {
            match self.notifications.get_mut(&lease.notification_id) {
                Some(notification)
                    if notification.processing
                        && notification.processing_until == Some(lease.expires_at)
                        && notification.status == NotificationStatus::Sending =>
                {
                    Ok(notification)
                },
                _ => Err(CoreError::LeaseLost(lease.notification_id)),
            }
        }

        fn take_commit_failure(&mut self) -> Result<()> {
            if self.failing_commits > 0 {
                self.failing_commits -= 1;
                return Err(CoreError::Database("injected commit failure".to_string()));
            }
            Ok(())
        }
    }

    /// In-memory registry and notification store.
    ///
    /// Cloning shares the underlying state.
    #[derive(Clone, Default)]
    pub struct MemoryStore {
        state: Arc<RwLock<State>>,
    }

    impl MemoryStore {
        /// Creates an empty store.
        pub fn new() -> Self {
            Self::default()
        }

        /// Registers or replaces a webhook.
        pub async fn add_webhook(&self, webhook: Webhook) {
            self.state.write().await.webhooks.insert(webhook.id, webhook);
        }

        /// Changes a webhook's status. Returns false if it does not exist.
        pub async fn set_webhook_status(&self, id: WebhookId, status: WebhookStatus) -> bool {
            match self.state.write().await.webhooks.get_mut(&id) {
                Some(webhook) => {
                    webhook.status = status;
                    true
                },
                None => false,
            }
        }

        /// Returns a snapshot of a webhook in any status.
        pub async fn webhook(&self, id: WebhookId) -> Option<Webhook> {
            self.state.read().await.webhooks.get(&id).cloned()
        }

        /// Removes a webhook, keeping its notifications.
        pub async fn remove_webhook(&self, id: WebhookId) -> Option<Webhook> {
            self.state.write().await.webhooks.remove(&id)
        }

        /// Inserts a notification in an arbitrary state.
        pub async fn insert_notification(&self, notification: Notification) {
            self.state.write().await.notifications.insert(notification.id, notification);
        }

        /// Returns a snapshot of a notification.
        pub async fn notification(&self, id: NotificationId) -> Option<Notification> {
            self.state.read().await.notifications.get(&id).cloned()
        }

        /// Returns a snapshot of all notifications ordered by creation time.
        pub async fn notifications(&self) -> Vec<Notification> {
            let mut notifications: Vec<Notification> =
                self.state.read().await.notifications.values().cloned().collect();
            notifications.sort_by_key(|n| (n.created_at, n.id));
            notifications
        }

        /// Makes the next claim fail with a database error.
        pub async fn inject_claim_error(&self, error: impl Into<String>) {
            self.state.write().await.claim_error = Some(error.into());
        }

        /// Makes the next `count` commits fail with a transient database error
        /// without applying them.
        pub async fn fail_next_commits(&self, count: u32) {
            self.state.write().await.failing_commits = count;
        }
    }

    impl WebhookRegistry for MemoryStore {
        fn find_active(&self) -> StorageFuture<'_, Vec<Webhook>> {
            Box::pin(async move {
                let state = self.state.read().await;
                let mut webhooks: Vec<Webhook> =
                    state.webhooks.values().filter(|w| w.is_active()).cloned().collect();
                webhooks.sort_by_key(|w| (w.created_at, w.id));
                Ok(webhooks)
            })
        }

        fn find_active_by_product<'a>(
            &'a self,
            product_id: &'a str,
        ) -> StorageFuture<'a, Vec<Webhook>> {
            Box::pin(async move {
                let state = self.state.read().await;
                let mut webhooks: Vec<Webhook> = state
                    .webhooks
                    .values()
                    .filter(|w| w.is_active() && w.subscribes_to(product_id))
                    .cloned()
                    .collect();
                webhooks.sort_by_key(|w| (w.created_at, w.id));
                Ok(webhooks)
            })
        }

        fn get(&self, id: WebhookId) -> StorageFuture<'_, Webhook> {
            Box::pin(async move {
                self.state
                    .read()
                    .await
                    .webhooks
                    .get(&id)
                    .cloned()
                    .ok_or_else(|| CoreError::NotFound(format!("webhook {id} not found")))
            })
        }
    }

    impl NotificationStore for MemoryStore {
        fn enqueue<'a>(
            &'a self,
            webhook_id: WebhookId,
            payload: &'a str,
            created_at: DateTime<Utc>,
        ) -> StorageFuture<'a, Notification> {
            Box::pin(async move {
                let notification = Notification::new(webhook_id, payload, created_at);
                self.state
                    .write()
                    .await
                    .notifications
                    .insert(notification.id, notification.clone());
                Ok(notification)
            })
        }

        fn claim_due(
            &self,
            limit: usize,
            lease_duration: Duration,
            now: DateTime<Utc>,
        ) -> StorageFuture<'_, Vec<Notification>> {
            Box::pin(async move {
                let lease = chrono::Duration::from_std(lease_duration)
                    .map_err(|_| CoreError::InvalidInput("lease duration out of range".into()))?;

                let mut state = self.state.write().await;
                if let Some(error) = state.claim_error.take() {
                    return Err(CoreError::Database(error));
                }

                let webhooks = &state.webhooks;
                let mut due: Vec<(DateTime<Utc>, DateTime<Utc>, NotificationId)> = state
                    .notifications
                    .values()
                    .filter(|n| n.is_claimable_at(now))
                    .filter(|n| webhooks.get(&n.webhook_id).is_some_and(Webhook::is_active))
                    .map(|n| (n.next_attempt_at.unwrap_or(n.created_at), n.created_at, n.id))
                    .collect();
                due.sort();
                due.truncate(limit);

                let mut claimed = Vec::with_capacity(due.len());
                for (_, _, id) in due {
                    if let Some(notification) = state.notifications.get_mut(&id) {
                        notification.processing = true;
                        notification.processing_until = Some(now + lease);
                        notification.status = NotificationStatus::Sending;
                        claimed.push(notification.clone());
                    }
                }

                Ok(claimed)
            })
        }

        fn release(&self, lease: Lease) -> StorageFuture<'_, ()> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                let notification = state.leased_mut(&lease)?;
                notification.processing = false;
                notification.processing_until = None;
                Ok(())
            })
        }

        fn commit_success(
            &self,
            lease: Lease,
            completed_at: DateTime<Utc>,
        ) -> StorageFuture<'_, ()> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                state.take_commit_failure()?;
                let notification = state.leased_mut(&lease)?;
                notification.status = NotificationStatus::Success;
                notification.processing = false;
                notification.processing_until = None;
                notification.attempt_count = notification.attempt_count.saturating_add(1);
                notification.last_attempt_at = Some(completed_at);
                notification.completed_at = Some(completed_at);
                notification.next_attempt_at = None;
                Ok(())
            })
        }

        fn commit_retry(
            &self,
            lease: Lease,
            next_attempt_at: DateTime<Utc>,
            error: String,
            attempt_count: u32,
            attempted_at: DateTime<Utc>,
        ) -> StorageFuture<'_, ()> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                state.take_commit_failure()?;
                let notification = state.leased_mut(&lease)?;
                notification.status = NotificationStatus::Retry;
                notification.processing = false;
                notification.processing_until = None;
                notification.last_error = Some(error);
                notification.attempt_count = attempt_count;
                notification.last_attempt_at = Some(attempted_at);
                notification.next_attempt_at = Some(next_attempt_at);
                Ok(())
            })
        }

        fn commit_failed(
            &self,
            lease: Lease,
            error: String,
            attempt_count: u32,
            completed_at: DateTime<Utc>,
        ) -> StorageFuture<'_, ()> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                state.take_commit_failure()?;
                let notification = state.leased_mut(&lease)?;
                notification.status = NotificationStatus::Failed;
                notification.processing = false;
                notification.processing_until = None;
                notification.last_error = Some(error);
                notification.attempt_count = attempt_count;
                notification.last_attempt_at = Some(completed_at);
                notification.completed_at = Some(completed_at);
                notification.next_attempt_at = None;
                Ok(())
            })
        }

        fn find(&self, id: NotificationId) -> StorageFuture<'_, Option<Notification>> {
            Box::pin(async move { Ok(self.notification(id).await) })
        }
    }

}
