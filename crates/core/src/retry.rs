//! Per-task retry policy with exponential backoff and jitter.

use std::time::Duration;

use rand::Rng;

use crate::error::HandlerError;

/// Predicate deciding whether a handler error may be retried.
pub type RetryPredicate = fn(&HandlerError) -> bool;

/// Retry every handler error.
pub fn retry_any(_: &HandlerError) -> bool {
    true
}

/// Retry nothing.
pub fn retry_none(_: &HandlerError) -> bool {
    false
}

/// Retry only errors the handler flagged as transient.
pub fn retry_transient(err: &HandlerError) -> bool {
    err.is_transient()
}

/// Retry policy configuration.
///
/// Attached to a task at registration and never mutated afterwards.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Maximum number of RETRY transitions before a terminal FAILURE (0 = no retries)
    pub max_retries: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Growth factor applied per retry
    pub backoff_multiplier: f64,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Randomize each delay uniformly within `[0, delay]`
    pub jitter: bool,
    /// Which handler errors are worth retrying
    pub retryable: RetryPredicate,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(600),
            jitter: true,
            retryable: retry_transient,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            retryable: retry_none,
            ..Default::default()
        }
    }

    /// Create a policy with fixed delays.
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay: delay,
            backoff_multiplier: 1.0,
            max_delay: delay,
            jitter: false,
            ..Default::default()
        }
    }

    /// Create a policy with exponential backoff (multiplier 2, jitter on).
    pub fn exponential(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            ..Default::default()
        }
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn retry_if(mut self, predicate: RetryPredicate) -> Self {
        self.retryable = predicate;
        self
    }

    pub fn is_retryable(&self, err: &HandlerError) -> bool {
        (self.retryable)(err)
    }

    /// Whether an attempt that already went through `retries` retries and
    /// failed with `err` gets another one.
    pub fn should_retry(&self, retries: u32, err: &HandlerError) -> bool {
        retries < self.max_retries && self.is_retryable(err)
    }

    /// Un-jittered delay before retry number `retries + 1`:
    /// `min(max_delay, base_delay * backoff_multiplier^retries)`.
    pub fn delay_for_retry(&self, retries: u32) -> Duration {
        let base = self.base_delay.as_nanos() as f64;
        let factor = self.backoff_multiplier.max(1.0).powi(retries.min(i32::MAX as u32) as i32);
        let nanos = base * factor;

        if !nanos.is_finite() || nanos >= self.max_delay.as_nanos() as f64 {
            return self.max_delay;
        }
        Duration::from_nanos(nanos as u64).min(self.max_delay)
    }

    /// Delay with jitter applied using the supplied RNG.
    pub fn jittered_delay<R: Rng + ?Sized>(&self, retries: u32, rng: &mut R) -> Duration {
        let delay = self.delay_for_retry(retries);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let millis = delay.as_millis().min(u64::MAX as u128) as u64;
        Duration::from_millis(rng.gen_range(0..=millis))
    }

    /// Delay actually used by workers.
    pub fn next_delay(&self, retries: u32) -> Duration {
        self.jittered_delay(retries, &mut rand::thread_rng())
    }
}
