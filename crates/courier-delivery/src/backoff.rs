//! Exponential backoff for failed webhook deliveries.
//!
//! Delays are derived only from a webhook's [`RetryPolicy`] and the number of
//! attempts already made. The dispatcher turns a failed attempt into a
//! [`RetryDecision`] through [`RetryContext::decide_retry`].

use std::time::Duration;

use chrono::{DateTime, Utc};
use courier_core::RetryPolicy;
use rand::Rng;

use crate::error::DeliveryError;

/// Upper bound on a receiver-requested `Retry-After` delay.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(24 * 60 * 60);

/// Delay before the attempt following `attempt_count` prior attempts.
///
/// Computes `initial_delay * multiplier^attempt_count` capped at
/// `max_delay`. Overflowing or non-finite intermediate values saturate to
/// `max_delay`.
pub fn next_delay(policy: &RetryPolicy, attempt_count: u32) -> Duration {
    let exponent = i32::try_from(attempt_count).unwrap_or(i32::MAX);
    let factor = policy.backoff_multiplier.powi(exponent);
    let millis = policy.initial_delay.as_millis() as f64 * factor;
    let cap = policy.max_delay.as_millis() as f64;

    if !millis.is_finite() || millis >= cap {
        return policy.max_delay;
    }

    Duration::from_millis(millis.max(0.0) as u64).min(policy.max_delay)
}

/// Whether `attempt_count` attempts use up the policy's budget.
pub fn is_exhausted(policy: &RetryPolicy, attempt_count: u32) -> bool {
    attempt_count >= policy.max_attempts
}

/// Randomizes `delay` by up to plus or minus `jitter_factor`, never above `max_delay`.
///
/// A factor of zero returns the delay unchanged.
pub fn apply_jitter(delay: Duration, jitter_factor: f64, max_delay: Duration) -> Duration {
    if jitter_factor.is_nan() || jitter_factor <= 0.0 {
        return delay;
    }

    let clamped_jitter = jitter_factor.min(1.0);
    let jitter_range = delay.as_secs_f64() * clamped_jitter;
    let jitter_offset = rand::rng().random_range(-jitter_range..=jitter_range);
    let jittered = Duration::from_secs_f64((delay.as_secs_f64() + jitter_offset).max(0.0));

    jittered.min(max_delay)
}

/// Failed attempt awaiting a retry decision.
#[derive(Debug, Clone)]
pub struct RetryContext<'a> {
    /// Attempts made, including the one that just failed.
    pub attempt_count: u32,
    /// Error that caused the failure.
    pub error: &'a DeliveryError,
    /// When the failed attempt finished.
    pub failed_at: DateTime<Utc>,
    /// Retry policy of the target webhook.
    pub policy: &'a RetryPolicy,
    /// Jitter applied to backoff delays.
    pub jitter_factor: f64,
    /// Expiry of the lease under which the attempt ran.
    pub lease_expires_at: DateTime<Utc>,
}

/// Result of retry decision calculation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry no earlier than `next_attempt_at`.
    Retry {
        /// Earliest time of the next attempt
        next_attempt_at: DateTime<Utc>,
    },
    /// Do not retry; the notification has failed permanently.
    GiveUp {
        /// Reason recorded as the final error
        reason: String,
    },
}

impl RetryContext<'_> {
    /// Decides whether and when to retry.
    ///
    /// Non-retryable errors and exhausted budgets give up. Otherwise the
    /// backoff delay is indexed by the attempts made before this one, raised
    /// to any `Retry-After` the receiver sent (capped at [`MAX_RETRY_AFTER`]).
    /// A timed-out attempt may still
    /// be running on the receiver's side, so its retry is never scheduled
    /// before the lease it ran under expires.
    pub fn decide_retry(&self) -> RetryDecision {
        if !self.error.is_retryable() {
            return RetryDecision::GiveUp { reason: format!("non-retryable error: {}", self.error) };
        }

        if is_exhausted(self.policy, self.attempt_count) {
            return RetryDecision::GiveUp {
                reason: format!(
                    "maximum attempts ({}) exhausted: {}",
                    self.policy.max_attempts, self.error
                ),
            };
        }

        let prior_attempts = self.attempt_count.saturating_sub(1);
        let backoff = apply_jitter(
            next_delay(self.policy, prior_attempts),
            self.jitter_factor,
            self.policy.max_delay,
        );
        let delay = match self.error.retry_after() {
            Some(retry_after) => backoff.max(retry_after.min(MAX_RETRY_AFTER)),
            None => backoff,
        };

        let mut next_attempt_at = self
            .scheduled_after(delay)
            .or_else(|| self.scheduled_after(self.policy.max_delay))
            .unwrap_or(self.failed_at);
        if self.error.is_timeout() && next_attempt_at < self.lease_expires_at {
            next_attempt_at = self.lease_expires_at;
        }

        RetryDecision::Retry { next_attempt_at }
    }

    fn scheduled_after(&self, delay: Duration) -> Option<DateTime<Utc>> {
        let delay = chrono::Duration::from_std(delay).ok()?;
        self.failed_at.checked_add_signed(delay)
    }
}
