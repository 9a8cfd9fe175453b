//! Property-based tests for claiming, attempt accounting and backoff.

use std::{collections::HashSet, sync::Arc, time::Duration};

use chrono::{DateTime, TimeZone, Utc};
use courier_core::{Notification, NotificationStatus, RetryPolicy, Webhook};
use courier_delivery::{backoff, MemoryStore, NotificationStore};
use courier_testing::{Invariants, NotificationBuilder, TestEnv, WebhookBuilder};
use proptest::{prelude::*, test_runner::Config as ProptestConfig};

const LEASE: Duration = Duration::from_secs(30);

fn proptest_config(cases: u32) -> ProptestConfig {
    ProptestConfig { cases, failure_persistence: None, ..ProptestConfig::default() }
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).single().unwrap()
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread().enable_all().build().unwrap()
}

fn policy_strategy() -> impl Strategy<Value = RetryPolicy> {
    (1u32..20, 0u64..60_000, 0u64..600_000, 1.0f64..10.0).prop_map(
        |(max_attempts, initial_ms, extra_ms, multiplier)| RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(initial_ms),
            max_delay: Duration::from_millis(initial_ms + extra_ms),
            backoff_multiplier: multiplier,
        },
    )
}

/// Seeds a store with one active webhook and `count` notifications in mixed
/// states around `t0`.
async fn seeded_store(states: &[(u8, i64)]) -> (MemoryStore, Webhook) {
    let store = MemoryStore::new();
    let webhook = WebhookBuilder::new("http://localhost/hook").build(t0());
    store.add_webhook(webhook.clone()).await;

    for (index, (state, offset)) in states.iter().enumerate() {
        let created_at = t0() - chrono::Duration::seconds(index as i64);
        let at = t0() + chrono::Duration::seconds(*offset);
        let builder = NotificationBuilder::new(webhook.id, created_at);
        let notification = match state % 5 {
            0 => builder.build(),
            1 => builder.status(NotificationStatus::Retry).attempts(1).not_before(at).build(),
            2 => builder.leased_until(at).build(),
            3 => {
                let mut done = builder.status(NotificationStatus::Success).attempts(1).build();
                done.completed_at = Some(created_at);
                done
            },
            _ => {
                let mut done = builder.status(NotificationStatus::Failed).attempts(3).build();
                done.completed_at = Some(created_at);
                done
            },
        };
        store.insert_notification(notification).await;
    }

    (store, webhook)
}

fn ids(notifications: &[Notification]) -> HashSet<courier_core::NotificationId> {
    notifications.iter().map(|n| n.id).collect()
}

proptest! {
    #![proptest_config(proptest_config(64))]

    /// P1: concurrent claims against the same state never overlap.
    #[test]
    fn concurrent_claims_are_disjoint(
        states in prop::collection::vec((any::<u8>(), -120i64..120), 0..40),
        limits in prop::collection::vec(1usize..15, 2..5),
    ) {
        let rt = runtime();
        rt.block_on(async {
            let (store, _) = seeded_store(&states).await;
            let eligible = store
                .notifications()
                .await
                .iter()
                .filter(|n| n.is_claimable_at(t0()))
                .count();

            let mut handles = Vec::new();
            for limit in &limits {
                let store = store.clone();
                let limit = *limit;
                handles.push(tokio::spawn(async move { store.claim_due(limit, LEASE, t0()).await }));
            }

            let mut seen = HashSet::new();
            let mut total = 0;
            for handle in handles {
                let claimed = handle.await.unwrap().unwrap();
                Invariants::claims_due(&claimed, t0()).unwrap();
                for notification in &claimed {
                    prop_assert!(seen.insert(notification.id), "double claim of {}", notification.id);
                }
                total += claimed.len();
            }

            prop_assert_eq!(total, eligible.min(limits.iter().sum()));
            Ok(())
        })?;
    }

    /// P3 and P5: terminal records are never returned, expired leases always
    /// are (given enough room in the batch).
    #[test]
    fn claims_skip_terminal_and_reclaim_stale(
        states in prop::collection::vec((any::<u8>(), -120i64..120), 1..40),
    ) {
        let rt = runtime();
        rt.block_on(async {
            let (store, _) = seeded_store(&states).await;
            let before = store.notifications().await;
            let claimed = store.claim_due(usize::MAX, LEASE, t0()).await.unwrap();
            let claimed_ids = ids(&claimed);

            for notification in &before {
                if notification.is_terminal() {
                    prop_assert!(!claimed_ids.contains(&notification.id));
                }
                if notification.processing
                    && notification.processing_until.is_some_and(|until| until <= t0())
                {
                    prop_assert!(claimed_ids.contains(&notification.id));
                }
            }
            Ok(())
        })?;
    }

    /// P4: no delay ever exceeds the cap.
    #[test]
    fn backoff_never_exceeds_max_delay(
        policy in policy_strategy(),
        attempt_count in any::<u32>(),
        jitter in 0.0f64..=1.0,
    ) {
        let delay = backoff::next_delay(&policy, attempt_count);
        prop_assert!(delay <= policy.max_delay);
        prop_assert!(backoff::apply_jitter(delay, jitter, policy.max_delay) <= policy.max_delay);
    }

    /// Delays never shrink as attempts accumulate.
    #[test]
    fn backoff_is_monotonic(policy in policy_strategy(), attempt_count in 0u32..64) {
        prop_assert!(
            backoff::next_delay(&policy, attempt_count)
                <= backoff::next_delay(&policy, attempt_count + 1)
        );
    }
}

proptest! {
    #![proptest_config(proptest_config(16))]

    /// P2: each attempt adds exactly one to `attempt_count`, whatever the
    /// receiver answers, and nothing is claimed once terminal.
    #[test]
    fn attempts_grow_by_one_per_delivery(
        steps in prop::collection::vec(
            (prop::sample::select(vec![200u16, 404, 429, 500, 503]), 0u64..12),
            1..8,
        ),
    ) {
        let rt = runtime();
        rt.block_on(async {
            let env = TestEnv::new().await.unwrap();
            let webhook = env.create_webhook(env.webhook()).await;
            let id = env.enqueue(webhook.id, "{}").await.unwrap().id;

            for (status, advance_secs) in steps {
                env.respond_with_status(status).await;
                let before = env.notification(id).await.unwrap();
                let summary = env.run_delivery_cycle().await.unwrap();
                let after = env.notification(id).await.unwrap();

                if before.is_terminal() {
                    prop_assert_eq!(summary.claimed, 0);
                    prop_assert_eq!(&after, &before);
                } else if summary.claimed == 1 {
                    prop_assert_eq!(after.attempt_count, before.attempt_count + 1);
                } else {
                    prop_assert_eq!(after.attempt_count, before.attempt_count);
                }

                Invariants::check_env(&env).await.unwrap();
                env.advance_time(Duration::from_secs(advance_secs));
            }
            Ok(())
        })?;
    }
}

#[tokio::test]
async fn two_workers_split_the_pending_set() {
    let store = Arc::new(MemoryStore::new());
    let webhook = WebhookBuilder::new("http://localhost/hook").build(t0());
    store.add_webhook(webhook.clone()).await;
    for i in 0..15 {
        store.enqueue(webhook.id, "{}", t0() - chrono::Duration::seconds(i)).await.unwrap();
    }

    let (a, b) = tokio::join!(store.claim_due(10, LEASE, t0()), store.claim_due(10, LEASE, t0()));
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.len() + b.len(), 15);
    Invariants::claims_disjoint(&a, &b).unwrap();
}

#[test]
fn documented_policy_delays() {
    let policy = RetryPolicy::default();
    let delays: Vec<_> = (0..3).map(|attempt| backoff::next_delay(&policy, attempt)).collect();

    assert_eq!(
        delays,
        vec![Duration::from_millis(1000), Duration::from_millis(2000), Duration::from_millis(4000)]
    );
    assert!(backoff::is_exhausted(&policy, 3));
    assert!(!backoff::is_exhausted(&policy, 2));
}
