//! Bounded retry with exponential backoff
//!
//! Wraps a fallible async operation and re-runs it after a growing delay
//! until it succeeds, the attempt budget runs out, or the caller-supplied
//! classifier declares the failure permanent.
//!
//! # Schedule
//!
//! With `max_attempts = 3`, `base_delay = 5s` and `multiplier = 2.0`:
//!
//! ```text
//! attempt 1 -> fail -> sleep 5s
//! attempt 2 -> fail -> sleep 10s
//! attempt 3 -> fail -> return the third error
//! ```
//!
//! No sleep follows the final attempt.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::{debug, trace, warn};

/// Default number of attempts (including the first one)
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default delay before the second attempt
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(5);

/// Default factor applied to the delay after each failure
pub const DEFAULT_MULTIPLIER: f64 = 2.0;

/// Retry policy with exponential backoff
///
/// The policy itself is stateless; every call to [`RetryPolicy::run`] or
/// [`RetryPolicy::run_if`] starts a fresh attempt budget, so one policy can be
/// shared across concurrent operations.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first (always at least 1)
    max_attempts: u32,
    /// Delay after the first failure
    base_delay: Duration,
    /// Factor applied to the delay after each subsequent failure
    multiplier: f64,
}

impl RetryPolicy {
    /// Create a new retry policy
    ///
    /// `max_attempts` is clamped to at least 1 and `multiplier` to at least
    /// 1.0 so delays never shrink.
    pub fn new(max_attempts: u32, base_delay: Duration, multiplier: f64) -> Self {
        let multiplier = if multiplier.is_finite() {
            multiplier.max(1.0)
        } else {
            DEFAULT_MULTIPLIER
        };

        trace!(
            max_attempts = max_attempts.max(1),
            base_delay_ms = base_delay.as_millis() as u64,
            multiplier = multiplier,
            "Creating retry policy"
        );

        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            multiplier,
        }
    }

    /// A policy that runs the operation exactly once
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO, 1.0)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    /// Delay to wait after the given failed attempt (1-based)
    ///
    /// Attempt 1 waits `base_delay`, attempt 2 waits `base_delay * multiplier`,
    /// and so on.
    pub fn delay_after(&self, failed_attempt: u32) -> Duration {
        let exponent = failed_attempt.saturating_sub(1) as i32;
        let factor = self.multiplier.powi(exponent);
        let secs = self.base_delay.as_secs_f64() * factor;

        // Saturate instead of panicking on absurd configurations
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }

    /// Total time spent sleeping if every attempt fails
    pub fn total_backoff(&self) -> Duration {
        (1..self.max_attempts)
            .map(|attempt| self.delay_after(attempt))
            .fold(Duration::ZERO, Duration::saturating_add)
    }

    /// Run `operation`, retrying every failure
    pub async fn run<T, E, F, Fut>(&self, name: &str, operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        self.run_if(name, operation, |_| true).await
    }

    /// Run `operation`, retrying only failures for which `should_retry`
    /// returns `true`
    ///
    /// A failure classified as permanent is returned immediately without
    /// sleeping. When the attempt budget is exhausted the last failure is
    /// returned.
    pub async fn run_if<T, E, F, Fut, P>(
        &self,
        name: &str,
        mut operation: F,
        should_retry: P,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
        P: Fn(&E) -> bool,
    {
        let mut attempt = 1;

        loop {
            trace!(operation = %name, attempt = attempt, "Starting attempt");

            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(
                            operation = %name,
                            attempt = attempt,
                            "Operation succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(e) if attempt >= self.max_attempts => {
                    warn!(
                        operation = %name,
                        attempts = attempt,
                        error = %e,
                        "Retry attempts exhausted"
                    );
                    return Err(e);
                }
                Err(e) if !should_retry(&e) => {
                    debug!(
                        operation = %name,
                        attempt = attempt,
                        error = %e,
                        "Failure is not retriable"
                    );
                    return Err(e);
                }
                Err(e) => {
                    let delay = self.delay_after(attempt);
                    warn!(
                        operation = %name,
                        attempt = attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Attempt failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, DEFAULT_BASE_DELAY, DEFAULT_MULTIPLIER)
    }
}
