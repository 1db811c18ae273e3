//! Bounded retry around one strategy `apply`.
//!
//! The controller retries only what [`crate::fault::classify`] marks as
//! retryable in place:
//!
//! - transient faults are retried immediately,
//! - transient-with-delay faults sleep the policy delay first,
//! - everything else is returned to the caller on the first failure.
//!
//! Cancellation is observed between attempts and during backoff sleeps,
//! never in the middle of an attempt.
//!
//! # Usage
//!
//! ```rust,ignore
//! use cncflow_core::retry::{RetryController, RetryPolicy};
//!
//! let controller = RetryController::new(RetryPolicy::default());
//! let outcome = controller.run(&cancel, |attempt| strategy.apply(&batch, &store, &cancel));
//! ```

use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::fault::{FaultClass, classify};

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first delayed retry (default: 1s).
    pub initial_delay: Duration,
    /// Maximum delay between retries (default: 30s).
    pub max_delay: Duration,
    /// Multiplier applied to the delay after each delayed retry (default: 1.0, constant delay).
    pub backoff_factor: f64,
    /// Random jitter range as percentage (default: 0.0).
    pub jitter_percent: f64,
    /// Attempt ceiling including the first attempt (default: 3).
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 1.0,
            jitter_percent: 0.0,
            max_attempts: 3,
        }
    }
}

impl RetryPolicy {
    /// Create a new retry policy; out-of-range values are clamped.
    #[must_use]
    pub fn new(
        initial_delay: Duration,
        max_delay: Duration,
        backoff_factor: f64,
        jitter_percent: f64,
        max_attempts: u32,
    ) -> Self {
        Self {
            initial_delay,
            max_delay,
            backoff_factor: backoff_factor.max(1.0),
            jitter_percent: jitter_percent.clamp(0.0, 1.0),
            max_attempts: max_attempts.max(1),
        }
    }

    /// Calculate the delay for a given delayed-retry number (0-indexed).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let initial_ms = u64::try_from(self.initial_delay.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(self.max_delay.as_millis()).unwrap_or(u64::MAX);

        // Cap exponent to prevent overflow in powi
        let exp = attempt.min(31) as i32;
        let base_ms = (initial_ms as f64) * self.backoff_factor.powi(exp);
        let base_ms = base_ms.min(max_ms as f64);

        let jitter = if self.jitter_percent > 0.0 {
            let mut rng = rand::rng();
            let jitter_range = base_ms * self.jitter_percent;
            rng.random_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };

        let delay_ms = (base_ms + jitter).max(0.0);
        Duration::from_millis(delay_ms as u64)
    }
}

/// Outcome of a retried operation.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    /// The result (success or final error).
    pub result: Result<T>,
    /// Number of attempts made.
    pub attempts: u32,
    /// Total time spent (including delays).
    pub elapsed: Duration,
}

/// Wraps an operation with classification-driven bounded retry.
#[derive(Debug, Clone, Default)]
pub struct RetryController {
    policy: RetryPolicy,
}

impl RetryController {
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `operation` until it succeeds, fails with a non-retryable fault,
    /// exhausts the attempt ceiling, or cancellation is requested.
    ///
    /// The operation receives the 1-based attempt number.
    pub fn run<T, F>(&self, cancel: &CancelToken, mut operation: F) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Result<T>,
    {
        let start = Instant::now();
        let mut attempt = 0u32;
        let mut delayed = 0u32;

        loop {
            attempt += 1;
            let error = match operation(attempt) {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(
                            total_attempts = attempt,
                            retries = attempt - 1,
                            "Operation succeeded after retries"
                        );
                    }
                    return RetryOutcome {
                        result: Ok(value),
                        attempts: attempt,
                        elapsed: start.elapsed(),
                    };
                }
                Err(e) => e,
            };

            let class = classify(&error);
            if !class.is_retryable() {
                return RetryOutcome {
                    result: Err(error),
                    attempts: attempt,
                    elapsed: start.elapsed(),
                };
            }

            if attempt >= self.policy.max_attempts {
                warn!(
                    attempt,
                    max_attempts = self.policy.max_attempts,
                    fault = %class,
                    error = %error,
                    "Operation failed after all retry attempts"
                );
                return RetryOutcome {
                    result: Err(error),
                    attempts: attempt,
                    elapsed: start.elapsed(),
                };
            }

            if class == FaultClass::TransientWithDelay {
                let delay = self.policy.delay_for_attempt(delayed);
                delayed += 1;
                debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Retrying operation after delay"
                );
                if !cancel.sleep(delay) {
                    return RetryOutcome {
                        result: Err(Error::Cancelled("retry backoff".to_string())),
                        attempts: attempt,
                        elapsed: start.elapsed(),
                    };
                }
            } else {
                debug!(attempt, error = %error, "Retrying operation immediately");
            }

            if let Err(cancelled) = cancel.check("retry") {
                return RetryOutcome {
                    result: Err(cancelled),
                    attempts: attempt,
                    elapsed: start.elapsed(),
                };
            }
        }
    }
}

/// Check if an error is retried in place by the controller.
#[must_use]
pub fn is_retryable(error: &Error) -> bool {
    classify(error).is_retryable()
}
