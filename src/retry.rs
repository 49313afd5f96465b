//! Backoff scheduling for recoverable remote failures.
//!
//! Delays grow exponentially from `initial_backoff`, carry random jitter,
//! never shrink from one attempt to the next, and are capped at
//! `max_backoff`.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for retry behavior.
///
/// # Example
///
/// ```rust
/// use repodb::RetryConfig;
/// use std::time::Duration;
///
/// let config = RetryConfig::default()
///     .with_max_retries(5)
///     .with_initial_backoff(Duration::from_millis(200))
///     .with_max_backoff(Duration::from_secs(30));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt.
    pub max_retries: u32,

    /// Backoff before the first retry.
    pub initial_backoff: Duration,

    /// Upper bound for any single delay.
    pub max_backoff: Duration,

    /// Extra random delay as a fraction of the exponential delay, in `[0, 1)`.
    pub jitter: f64,

    /// Whether a server-provided `Retry-After` raises the delay.
    pub respect_retry_after: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(60),
            jitter: 0.3,
            respect_retry_after: true,
        }
    }
}

impl RetryConfig {
    /// Create a new retry config with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a config that disables retries.
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Set maximum number of retries.
    #[must_use]
    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    /// Set initial backoff duration.
    #[must_use]
    pub fn with_initial_backoff(mut self, duration: Duration) -> Self {
        self.initial_backoff = duration;
        self
    }

    /// Set maximum backoff duration.
    #[must_use]
    pub fn with_max_backoff(mut self, duration: Duration) -> Self {
        self.max_backoff = duration;
        self
    }

    /// Set the jitter fraction (clamped into `[0, 0.99]`).
    #[must_use]
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 0.99);
        self
    }

    /// Set whether to respect Retry-After hints.
    #[must_use]
    pub fn with_respect_retry_after(mut self, respect: bool) -> Self {
        self.respect_retry_after = respect;
        self
    }

    /// Exponential delay for the given 1-based attempt, without jitter or cap.
    fn exponential(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_backoff.saturating_mul(factor)
    }
}

/// Result of a retry decision.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Should retry after the specified duration
    Retry(Duration),
    /// Should not retry
    DontRetry,
}

/// Retry state tracking for one class of failure within one call.
#[derive(Debug, Clone)]
pub struct RetryState {
    /// Number of retries granted so far
    pub attempts: u32,
    /// Delay returned by the previous decision
    last_delay: Duration,
    config: RetryConfig,
}

impl RetryState {
    /// Create a new retry state with the given config.
    pub fn new(config: RetryConfig) -> Self {
        Self {
            attempts: 0,
            last_delay: Duration::ZERO,
            config,
        }
    }

    /// Decide whether to retry, and how long to wait first.
    ///
    /// `retry_after` is the server's hint, if any.
    pub fn next_delay(&mut self, retry_after: Option<Duration>) -> RetryDecision {
        self.attempts += 1;

        if self.attempts > self.config.max_retries {
            return RetryDecision::DontRetry;
        }

        let base = self.config.exponential(self.attempts);
        let jitter = if self.config.jitter > 0.0 {
            rand::thread_rng().gen_range(0.0..self.config.jitter)
        } else {
            0.0
        };
        let mut wait = base.mul_f64(1.0 + jitter);

        if self.config.respect_retry_after {
            if let Some(hint) = retry_after {
                wait = wait.max(hint);
            }
        }

        // Non-decreasing across attempts, bounded by the cap.
        wait = wait.max(self.last_delay).min(self.config.max_backoff);
        self.last_delay = wait;

        RetryDecision::Retry(wait)
    }

    /// Reset the retry state (e.g., after progress was made).
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.last_delay = Duration::ZERO;
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }
}

/// Parse a `Retry-After` header value.
///
/// Only the delay-seconds form is supported; HTTP dates yield `None`.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}
