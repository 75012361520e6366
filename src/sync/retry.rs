//! Retry combinator shared by every backend.

use std::time::Duration;

use tracing::{debug, warn};

use super::backend::{BackendError, BackendFailure, Retried};
use crate::config::GitHubConfig;

/// Exponential backoff with random jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Fraction of the delay (0.0-1.0) added or subtracted at random.
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter_factor: 0.2,
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn from_github(config: &GitHubConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            initial_delay: config.initial_backoff,
            max_delay: config.max_backoff,
            ..Self::default()
        }
    }

    /// No retries at all.
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (0-indexed).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped = base.min(self.max_delay.as_secs_f64());

        let jitter = if self.jitter_factor > 0.0 {
            let range = capped * self.jitter_factor;
            (rand::random::<f64>() - 0.5) * 2.0 * range
        } else {
            0.0
        };

        Duration::from_secs_f64((capped + jitter).clamp(0.0, self.max_delay.as_secs_f64()))
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the policy's backoff delay.
    Backoff,
    /// Retry after exactly this delay.
    After(Duration),
    Stop,
}

/// Default classification: rate limits honour their delay, transient errors
/// back off, everything else is terminal.
#[must_use]
pub fn classify(error: &BackendError) -> RetryDecision {
    match error {
        BackendError::RateLimited { retry_after } => RetryDecision::After(*retry_after),
        BackendError::Transient(_) => RetryDecision::Backoff,
        BackendError::Unauthenticated(_) | BackendError::Permanent(_) | BackendError::NotFound(_) => {
            RetryDecision::Stop
        }
    }
}

/// Blocks the calling thread. Injected so tests need not wait.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Run `op` until it succeeds, `classify` says stop, or attempts run out.
/// `op` receives the 0-indexed attempt number.
pub fn retry<T, C, F>(
    policy: &RetryPolicy,
    sleeper: &dyn Sleeper,
    classify: C,
    mut op: F,
) -> Result<Retried<T>, BackendFailure>
where
    C: Fn(&BackendError) -> RetryDecision,
    F: FnMut(u32) -> Result<T, BackendError>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match op(attempt) {
            Ok(value) => {
                return Ok(Retried {
                    value,
                    retries: attempt,
                });
            }
            Err(error) => {
                let decision = classify(&error);
                let last = attempt + 1 >= max_attempts;
                let delay = match decision {
                    RetryDecision::Stop => None,
                    _ if last => None,
                    RetryDecision::Backoff => Some(policy.delay_for_attempt(attempt)),
                    RetryDecision::After(delay) => Some(delay),
                };
                let Some(delay) = delay else {
                    if decision != RetryDecision::Stop {
                        warn!(attempt, error = %error, "Retries exhausted");
                    }
                    return Err(BackendFailure {
                        error,
                        retries: attempt,
                    });
                };
                debug!(
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %error,
                    "Retrying after backend error"
                );
                sleeper.sleep(delay);
                attempt += 1;
            }
        }
    }
}
