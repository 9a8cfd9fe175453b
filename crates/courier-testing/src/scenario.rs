//! Scenario builder for multi-step delivery tests.
//!
//! A scenario is a list of steps run against one [`TestEnv`]: dispatch
//! ticks, clock advances, receiver behaviour changes and expectations.
//! Store invariants are checked after every step.

use std::time::Duration;

use anyhow::{ensure, Context, Result};
use courier_core::{Notification, NotificationId, NotificationStatus};
use wiremock::ResponseTemplate;

use crate::{Invariants, TestEnv};

type NotificationCheck = Box<dyn Fn(&Notification) -> Result<()> + Send + Sync>;

/// Receiver failures a scenario can inject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    /// Response slower than the delivery timeout.
    NetworkTimeout,
    /// HTTP 500 Internal Server Error.
    Http500,
    /// HTTP 502 Bad Gateway.
    Http502,
    /// HTTP 503 Service Unavailable.
    Http503,
    /// HTTP 504 Gateway Timeout.
    Http504,
    /// HTTP 429 Too Many Requests.
    Http429 {
        /// Seconds sent in the `Retry-After` header.
        retry_after: Option<u64>,
    },
    /// Any 4xx other than 429; never retried.
    ClientError {
        /// Status code to answer with.
        status: u16,
    },
}

impl FailureKind {
    /// Builds the mock response, using `timeout` to size artificial delays.
    pub fn response(&self, timeout: Duration) -> ResponseTemplate {
        match self {
            Self::NetworkTimeout => ResponseTemplate::new(200).set_delay(timeout * 4),
            Self::Http500 => ResponseTemplate::new(500).set_body_string("internal error"),
            Self::Http502 => ResponseTemplate::new(502).set_body_string("bad gateway"),
            Self::Http503 => ResponseTemplate::new(503).set_body_string("unavailable"),
            Self::Http504 => ResponseTemplate::new(504).set_body_string("gateway timeout"),
            Self::Http429 { retry_after } => {
                let response = ResponseTemplate::new(429);
                match retry_after {
                    Some(seconds) => response.insert_header("Retry-After", seconds.to_string()),
                    None => response,
                }
            },
            Self::ClientError { status } => ResponseTemplate::new(*status).set_body_string("rejected"),
        }
    }
}

enum Step {
    RunDeliveryCycle,
    AdvanceTime(Duration),
    InjectFailure(FailureKind),
    InjectHttpSuccess,
    ExpectStatus(NotificationId, NotificationStatus),
    ExpectAttempts(NotificationId, u32),
    ExpectRequests(usize),
    ExpectNotification(NotificationId, NotificationCheck),
}

/// Deterministic multi-step test scenario.
pub struct ScenarioBuilder {
    name: String,
    steps: Vec<Step>,
    check_invariants: bool,
}

impl ScenarioBuilder {
    /// Creates an empty scenario.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), steps: Vec::new(), check_invariants: true }
    }

    /// Runs one dispatch tick.
    #[must_use]
    pub fn run_delivery_cycle(mut self) -> Self {
        self.steps.push(Step::RunDeliveryCycle);
        self
    }

    /// Advances the test clock.
    #[must_use]
    pub fn advance_time(mut self, duration: Duration) -> Self {
        self.steps.push(Step::AdvanceTime(duration));
        self
    }

    /// Makes the receiver fail from now on.
    #[must_use]
    pub fn inject_failure(mut self, failure: FailureKind) -> Self {
        self.steps.push(Step::InjectFailure(failure));
        self
    }

    /// Makes the receiver answer 200 from now on.
    #[must_use]
    pub fn inject_http_success(mut self) -> Self {
        self.steps.push(Step::InjectHttpSuccess);
        self
    }

    /// Expects a notification to be in `status`.
    #[must_use]
    pub fn expect_status(mut self, id: NotificationId, status: NotificationStatus) -> Self {
        self.steps.push(Step::ExpectStatus(id, status));
        self
    }

    /// Expects a notification's committed attempt count.
    #[must_use]
    pub fn expect_attempts(mut self, id: NotificationId, attempts: u32) -> Self {
        self.steps.push(Step::ExpectAttempts(id, attempts));
        self
    }

    /// Expects the receiver to have seen `count` requests since its
    /// behaviour was last changed.
    #[must_use]
    pub fn expect_requests(mut self, count: usize) -> Self {
        self.steps.push(Step::ExpectRequests(count));
        self
    }

    /// Runs a custom check against a notification's current state.
    #[must_use]
    pub fn expect_notification<F>(mut self, id: NotificationId, check: F) -> Self
    where
        F: Fn(&Notification) -> Result<()> + Send + Sync + 'static,
    {
        self.steps.push(Step::ExpectNotification(id, Box::new(check)));
        self
    }

    /// Skips the per-step invariant checks.
    #[must_use]
    pub fn without_invariants(mut self) -> Self {
        self.check_invariants = false;
        self
    }

    /// Executes the scenario.
    ///
    /// # Errors
    ///
    /// Returns the first failing step or invariant, naming the step.
    pub async fn run(self, env: &TestEnv) -> Result<()> {
        tracing::info!(scenario = %self.name, steps = self.steps.len(), "running scenario");

        for (index, step) in self.steps.into_iter().enumerate() {
            let step_number = index + 1;
            tracing::debug!(step = step_number, "executing step");

            match step {
                Step::RunDeliveryCycle => {
                    let summary = env.run_delivery_cycle().await?;
                    tracing::debug!(?summary, "delivery cycle finished");
                },
                Step::AdvanceTime(duration) => env.advance_time(duration),
                Step::InjectFailure(failure) => {
                    env.respond_with(failure.response(env.config().client_config.timeout)).await;
                },
                Step::InjectHttpSuccess => env.respond_with_status(200).await,
                Step::ExpectStatus(id, expected) => {
                    let notification = env.notification(id).await?;
                    ensure!(
                        notification.status == expected,
                        "step {step_number}: notification {id} is {}, expected {expected}",
                        notification.status
                    );
                },
                Step::ExpectAttempts(id, expected) => {
                    let notification = env.notification(id).await?;
                    ensure!(
                        notification.attempt_count == expected,
                        "step {step_number}: notification {id} has {} attempts, expected {expected}",
                        notification.attempt_count
                    );
                },
                Step::ExpectRequests(expected) => {
                    let received = env.received_requests().await;
                    ensure!(
                        received == expected,
                        "step {step_number}: receiver saw {received} requests, expected {expected}"
                    );
                },
                Step::ExpectNotification(id, check) => {
                    let notification = env.notification(id).await?;
                    check(&notification)
                        .with_context(|| format!("step {step_number}: notification check"))?;
                },
            }

            if self.check_invariants {
                Invariants::check_env(env)
                    .await
                    .with_context(|| format!("invariant violated after step {step_number}"))?;
            }
        }

        Ok(())
    }
}
