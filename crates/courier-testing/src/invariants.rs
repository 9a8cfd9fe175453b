//! Invariant checks over notification state.
//!
//! Each check returns an error describing the first violation, so property
//! tests and scenarios can surface exactly which record broke which rule.

use std::collections::HashSet;

use anyhow::{ensure, Result};
use chrono::{DateTime, Utc};
use courier_core::{Notification, NotificationId, NotificationStatus, RetryPolicy};

use crate::TestEnv;

/// System invariants that must hold after every dispatch step.
pub struct Invariants;

impl Invariants {
    /// Attempts never exceed the webhook's budget.
    pub fn attempts_bounded(notification: &Notification, policy: &RetryPolicy) -> Result<()> {
        ensure!(
            notification.attempt_count <= policy.max_attempts,
            "notification {} exceeded max attempts: {} > {}",
            notification.id,
            notification.attempt_count,
            policy.max_attempts
        );
        Ok(())
    }

    /// Terminal records are unleased and carry a completion time.
    pub fn terminal_is_settled(notification: &Notification) -> Result<()> {
        if !notification.is_terminal() {
            return Ok(());
        }
        ensure!(
            !notification.processing,
            "terminal notification {} is still processing",
            notification.id
        );
        ensure!(
            notification.completed_at.is_some(),
            "terminal notification {} has no completed_at",
            notification.id
        );
        Ok(())
    }

    /// A held lease always has an expiry and a `SENDING` status.
    pub fn lease_is_well_formed(notification: &Notification) -> Result<()> {
        if !notification.processing {
            return Ok(());
        }
        ensure!(
            notification.processing_until.is_some(),
            "notification {} is processing without processing_until",
            notification.id
        );
        ensure!(
            notification.status == NotificationStatus::Sending,
            "notification {} is processing in status {}",
            notification.id,
            notification.status
        );
        Ok(())
    }

    /// Retries always know when they may run next.
    pub fn retry_is_scheduled(notification: &Notification) -> Result<()> {
        if notification.status == NotificationStatus::Retry {
            ensure!(
                notification.next_attempt_at.is_some(),
                "retry notification {} has no next_attempt_at",
                notification.id
            );
        }
        Ok(())
    }

    /// Two claims at the same instant never hand out the same record.
    pub fn claims_disjoint(first: &[Notification], second: &[Notification]) -> Result<()> {
        let seen: HashSet<NotificationId> = first.iter().map(|n| n.id).collect();
        for notification in second {
            ensure!(
                !seen.contains(&notification.id),
                "notification {} was claimed twice",
                notification.id
            );
        }
        Ok(())
    }

    /// Nothing claimed was due later than `now`.
    pub fn claims_due(claimed: &[Notification], now: DateTime<Utc>) -> Result<()> {
        for notification in claimed {
            ensure!(
                notification.created_at <= now,
                "notification {} claimed before it was created",
                notification.id
            );
            ensure!(
                notification.next_attempt_at.map_or(true, |at| at <= now),
                "notification {} claimed before its next attempt",
                notification.id
            );
        }
        Ok(())
    }

    /// Runs every per-record check.
    pub fn check_notification(notification: &Notification, policy: &RetryPolicy) -> Result<()> {
        Self::attempts_bounded(notification, policy)?;
        Self::terminal_is_settled(notification)?;
        Self::lease_is_well_formed(notification)?;
        Self::retry_is_scheduled(notification)
    }

    /// Checks every notification in an environment's store.
    ///
    /// Records whose webhook is no longer registered are checked against the
    /// default policy.
    pub async fn check_env(env: &TestEnv) -> Result<()> {
        for notification in env.store.notifications().await {
            let policy = env
                .store
                .webhook(notification.webhook_id)
                .await
                .map(|webhook| webhook.retry_policy)
                .unwrap_or_default();
            Self::check_notification(&notification, &policy)?;
        }
        Ok(())
    }
}
