//! Failure classification and backoff schedule for the retry wrapper.
//!
//! - Actor failures: invalidate the actor cache, short linear backoff
//! - Connection failures: exponential backoff (capped), full reconnect
//! - Anything else: propagate immediately

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// How the retry wrapper reacts to a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Actor,
    Connection,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub actor_retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff_base: Duration::from_millis(1000),
            backoff_max: Duration::from_millis(5000),
            actor_retry_delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// `base * 2^(n-1)` for the n-th consecutive connection failure, capped at `backoff_max`.
    pub fn connection_backoff(&self, consecutive_failures: u32) -> Duration {
        let exponent = consecutive_failures.saturating_sub(1).min(16);
        self.backoff_base
            .saturating_mul(1u32 << exponent)
            .min(self.backoff_max)
    }

    pub fn actor_backoff(&self, attempt: u32) -> Duration {
        self.actor_retry_delay.saturating_mul(attempt.max(1))
    }

    /// `attempt` counts failures so far, starting at 1.
    pub fn should_retry(&self, class: FailureClass, attempt: u32) -> bool {
        class != FailureClass::Unknown && attempt <= self.max_retries
    }
}

/// Consecutive connection failures, reset on any success.
#[derive(Debug, Default)]
pub struct FailureCounter(AtomicU32);

impl FailureCounter {
    /// Record a failure and return the new count.
    pub fn record(&self) -> u32 {
        self.0.fetch_add(1, Ordering::AcqRel).saturating_add(1)
    }

    pub fn reset(&self) {
        self.0.store(0, Ordering::Release);
    }

    pub fn current(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_backoff_doubles_then_caps() {
        let policy = RetryPolicy::default();
        let delays: Vec<u128> = (1..=4)
            .map(|n| policy.connection_backoff(n).as_millis())
            .collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 5000]);
    }

    #[test]
    fn connection_backoff_saturates_for_large_counts() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.connection_backoff(u32::MAX), Duration::from_millis(5000));
    }

    #[test]
    fn actor_backoff_is_linear() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.actor_backoff(1), Duration::from_millis(100));
        assert_eq!(policy.actor_backoff(2), Duration::from_millis(200));
    }

    #[test]
    fn unknown_failures_are_never_retried() {
        let policy = RetryPolicy::default();
        assert!(!policy.should_retry(FailureClass::Unknown, 1));
        assert!(policy.should_retry(FailureClass::Actor, 2));
        assert!(!policy.should_retry(FailureClass::Connection, 3));
    }

    #[test]
    fn failure_counter_resets() {
        let counter = FailureCounter::default();
        assert_eq!(counter.record(), 1);
        assert_eq!(counter.record(), 2);
        counter.reset();
        assert_eq!(counter.current(), 0);
        assert_eq!(counter.record(), 1);
    }
}
