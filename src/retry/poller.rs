use log::{debug, warn};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

use crate::retry::BackoffPolicy;

/// Result of a single evaluation of a polled action.
#[derive(Debug)]
pub enum PollOutcome<T, E> {
    Success(T),
    Retryable(String),
    Fatal(E),
}

impl<T, E> PollOutcome<T, E> {
    pub fn retryable(reason: impl Into<String>) -> Self {
        Self::Retryable(reason.into())
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

/// Details of a poll loop that ran out of budget.
#[derive(Debug, Clone, PartialEq)]
pub struct GiveUp {
    pub label: String,
    pub last_reason: String,
    pub elapsed: Duration,
    pub attempts: u32,
}

#[derive(Debug)]
pub enum PollError<E> {
    Fatal(E),
    Timeout(GiveUp),
}

impl<E: fmt::Display> fmt::Display for PollError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PollError::Fatal(error) => write!(f, "{error}"),
            PollError::Timeout(give_up) => write!(
                f,
                "{} timed out after {:?} ({} attempts), last observed: {}",
                give_up.label, give_up.elapsed, give_up.attempts, give_up.last_reason
            ),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for PollError<E> {}

type GiveUpCallback<'a> = Box<dyn FnOnce(&GiveUp) + Send + 'a>;

/// Repeatedly evaluates an action under a [`BackoffPolicy`].
///
/// This is the only place in the crate where retries happen. The poller knows
/// nothing about what it polls: readiness checks and checkpoint waits drive
/// it the same way.
pub struct ConditionPoller<'a> {
    label: String,
    policy: &'a BackoffPolicy,
    attempt_timeout: Option<Duration>,
    on_giveup: Option<GiveUpCallback<'a>>,
}

impl<'a> ConditionPoller<'a> {
    pub fn new(label: impl Into<String>, policy: &'a BackoffPolicy) -> Self {
        Self {
            label: label.into(),
            policy,
            attempt_timeout: None,
            on_giveup: None,
        }
    }

    /// Bounds every attempt; an attempt that overruns counts as retryable.
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    /// Invoked exactly once if the policy gives up without a success.
    pub fn on_giveup<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(&GiveUp) + Send + 'a,
    {
        self.on_giveup = Some(Box::new(callback));
        self
    }

    pub async fn poll<T, E, F, Fut>(self, mut action: F) -> Result<T, PollError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = PollOutcome<T, E>>,
    {
        let started = Instant::now();
        let mut attempts: u32 = 0;

        loop {
            let bound = self.attempt_bound(started.elapsed(), attempts == 0);
            attempts = attempts.saturating_add(1);

            let outcome = match bound {
                Some(bound) => match tokio::time::timeout(bound, action()).await {
                    Ok(outcome) => outcome,
                    Err(_) => PollOutcome::Retryable(format!("attempt timed out after {bound:?}")),
                },
                None => action().await,
            };

            let reason = match outcome {
                PollOutcome::Success(value) => {
                    debug!("{} succeeded after {attempts} attempt(s)", self.label);
                    return Ok(value);
                }
                PollOutcome::Fatal(error) => {
                    debug!("{} hit a fatal condition on attempt {attempts}", self.label);
                    return Err(PollError::Fatal(error));
                }
                PollOutcome::Retryable(reason) => reason,
            };

            let elapsed = started.elapsed();
            if self.policy.is_exhausted(elapsed, attempts) {
                let give_up = GiveUp {
                    label: self.label.clone(),
                    last_reason: reason,
                    elapsed,
                    attempts,
                };
                warn!(
                    "Giving up on {} after {elapsed:?} and {attempts} attempt(s): {}",
                    self.label, give_up.last_reason
                );
                if let Some(callback) = self.on_giveup {
                    callback(&give_up);
                }
                return Err(PollError::Timeout(give_up));
            }

            let mut delay = self
                .policy
                .jittered_delay(attempts - 1, &mut rand::thread_rng());
            if let Some(remaining) = self.policy.remaining(elapsed) {
                delay = delay.min(remaining);
            }

            debug!(
                "{} not ready (attempt {attempts}): {reason}; retrying in {delay:?}",
                self.label
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Same as [`poll`](Self::poll) for a synchronous check.
    pub async fn poll_sync<T, E, F>(self, mut check: F) -> Result<T, PollError<E>>
    where
        F: FnMut() -> PollOutcome<T, E>,
    {
        self.poll(|| std::future::ready(check())).await
    }

    /// Only the first attempt may run on a spent budget. Any later attempt
    /// is bounded by what is left, so one made at the deadline must complete
    /// on its first poll.
    fn attempt_bound(&self, elapsed: Duration, first_attempt: bool) -> Option<Duration> {
        let remaining = self
            .policy
            .remaining(elapsed)
            .filter(|remaining| !(first_attempt && remaining.is_zero()));

        match (self.attempt_timeout, remaining) {
            (Some(timeout), Some(remaining)) => Some(timeout.min(remaining)),
            (Some(timeout), None) => Some(timeout),
            (None, remaining) => remaining,
        }
    }
}
