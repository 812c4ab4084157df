//! Bounded exponential backoff for split reads and batch commits
//!
//! Retry loops in this crate are explicit: the caller keeps an attempt
//! counter as plain data ([`RetryState`]) and asks the policy whether and
//! how long to wait before the next attempt.

use std::time::Duration;

use crate::error::Error;

/// Backoff policy
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_backoff: Duration,
    /// Upper bound on a single delay
    pub max_backoff: Duration,
    /// Growth factor per retry
    pub multiplier: f64,
    /// Jitter as a fraction of the delay (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(10_000),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Fail on the first error
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Set max retries
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the initial backoff
    pub fn with_initial_backoff(mut self, delay: Duration) -> Self {
        self.initial_backoff = delay;
        self
    }

    /// Set the maximum backoff
    pub fn with_max_backoff(mut self, delay: Duration) -> Self {
        self.max_backoff = delay;
        self
    }

    /// Set the backoff multiplier
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Set the jitter fraction
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before retry number `attempt` (1-based; 0 means no delay)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exp = attempt.min(30) as i32 - 1;
        let base = self.initial_backoff.as_millis() as f64 * self.multiplier.powi(exp);
        let capped = base.min(self.max_backoff.as_millis() as f64);

        // golden-ratio sequence spreads retries without an RNG
        let jitter = if self.jitter > 0.0 {
            let phase = (f64::from(attempt) * 0.618033988749895) % 1.0;
            capped * self.jitter * (phase - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((capped + jitter).max(0.0) as u64)
    }
}

/// Attempt counter for one retry loop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryState {
    attempts: u32,
}

impl RetryState {
    /// Fresh counter
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempts started so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Record the start of an attempt
    pub fn begin_attempt(&mut self) {
        self.attempts += 1;
    }

    /// Forget previous failures after progress was made
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Backoff before the next attempt after `error`, or `None` when the
    /// error is permanent or the retries are used up
    pub fn backoff(&self, policy: &RetryPolicy, error: &Error) -> Option<Duration> {
        if error.root().is_retriable() && self.attempts <= policy.max_retries {
            Some(policy.delay_for_attempt(self.attempts.max(1)))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_without_jitter() {
        let policy = RetryPolicy::default().with_jitter(0.0);
        assert_eq!(policy.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(20), Duration::from_millis(10_000));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy::default().with_jitter(0.5);
        for attempt in 1..10 {
            let base = RetryPolicy::default()
                .with_jitter(0.0)
                .delay_for_attempt(attempt)
                .as_millis() as f64;
            let jittered = policy.delay_for_attempt(attempt).as_millis() as f64;
            assert!(jittered >= base * 0.5 - 1.0 && jittered <= base * 1.5 + 1.0);
        }
    }

    #[test]
    fn test_retry_state() {
        let policy = RetryPolicy::default().with_max_retries(2).with_jitter(0.0);
        let transient = Error::timeout("slow");
        let permanent = Error::query("syntax error");

        let mut state = RetryState::new();
        state.begin_attempt();
        assert_eq!(
            state.backoff(&policy, &transient),
            Some(Duration::from_millis(100))
        );
        assert_eq!(state.backoff(&policy, &permanent), None);
        state.begin_attempt();
        assert!(state.backoff(&policy, &transient).is_some());
        state.begin_attempt();
        assert_eq!(state.backoff(&policy, &transient), None);
        assert_eq!(state.attempts(), 3);

        state.reset();
        assert_eq!(state.attempts(), 0);
    }
}
