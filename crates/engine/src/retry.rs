//! Retry scheduling: exponential backoff with jitter and the
//! retry-vs-give-up decision.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::clock::chrono_duration;

/// Exponential backoff policy.
///
/// The nominal delay after the `n`-th attempt is `base_delay * 2^(n-1)`,
/// capped at `max_delay`. The applied delay is the nominal one scaled by a
/// uniform factor in `[1 - jitter, 1 + jitter]`, then capped at `max_delay`
/// again.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Jitter factor (0.0 - 1.0).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            jitter: 0.25,
        }
    }
}

/// Outcome of a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry {
        delay: Duration,
        next_retry_at: DateTime<Utc>,
    },
    GiveUp(GiveUpReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GiveUpReason {
    /// The failure was classified as permanent.
    NotRetryable,
    /// `attempt_count` reached `max_attempts`.
    AttemptsExhausted,
}

impl GiveUpReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            GiveUpReason::NotRetryable => "not_retryable",
            GiveUpReason::AttemptsExhausted => "attempts_exhausted",
        }
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration, jitter: f64) -> Self {
        Self {
            base_delay,
            max_delay,
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    /// Deterministic policy for tests.
    pub fn without_jitter(base_delay: Duration, max_delay: Duration) -> Self {
        Self::new(base_delay, max_delay, 0.0)
    }

    /// Backoff before jitter; zero for attempt 0.
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;
        let exp = 2_f64.powi(attempt.saturating_sub(1).min(62) as i32);

        Duration::from_millis((base_ms * exp).min(max_ms) as u64)
    }

    /// Nominal delay scaled by `factor`, where `factor` is in `[-1, 1]` and
    /// maps onto the jitter band.
    pub fn delay_with_factor(&self, attempt: u32, factor: f64) -> Duration {
        let nominal_ms = self.nominal_delay(attempt).as_millis() as f64;
        let jitter = self.jitter.clamp(0.0, 1.0);
        let scaled = nominal_ms * (1.0 + jitter * factor.clamp(-1.0, 1.0));

        Duration::from_millis(scaled.max(0.0).round() as u64).min(self.max_delay)
    }

    /// Delay to wait after the `attempt`-th failed attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = if self.jitter > 0.0 {
            rand::thread_rng().gen_range(-1.0..=1.0)
        } else {
            0.0
        };
        self.delay_with_factor(attempt, factor)
    }

    /// Inclusive range every jittered delay for `attempt` falls into.
    pub fn delay_bounds(&self, attempt: u32) -> (Duration, Duration) {
        (
            self.delay_with_factor(attempt, -1.0),
            self.delay_with_factor(attempt, 1.0),
        )
    }

    /// Whether another attempt is allowed after `attempt_count` attempts.
    pub fn should_retry(&self, attempt_count: u32, max_attempts: u32, retryable: bool) -> bool {
        retryable && attempt_count < max_attempts
    }

    /// Decide what happens after the `attempt_count`-th attempt failed.
    pub fn decide(
        &self,
        attempt_count: u32,
        max_attempts: u32,
        retryable: bool,
        now: DateTime<Utc>,
    ) -> RetryDecision {
        if !retryable {
            return RetryDecision::GiveUp(GiveUpReason::NotRetryable);
        }
        if !self.should_retry(attempt_count, max_attempts, retryable) {
            return RetryDecision::GiveUp(GiveUpReason::AttemptsExhausted);
        }

        let delay = self.delay_for_attempt(attempt_count);
        RetryDecision::Retry {
            delay,
            next_retry_at: now + chrono_duration(delay),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let policy = RetryPolicy::without_jitter(Duration::from_millis(100), Duration::from_secs(10));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(800));
    }

    #[test]
    fn backoff_is_capped() {
        let policy = RetryPolicy::without_jitter(Duration::from_secs(5), Duration::from_secs(300));

        assert_eq!(policy.delay_for_attempt(7), Duration::from_secs(300));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(300));
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_secs(300));
    }

    #[test]
    fn default_policy_matches_documented_schedule() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.nominal_delay(1), Duration::from_secs(5));
        assert_eq!(policy.nominal_delay(2), Duration::from_secs(10));
        assert_eq!(policy.nominal_delay(3), Duration::from_secs(20));
        assert_eq!(
            policy.delay_bounds(1),
            (Duration::from_millis(3750), Duration::from_millis(6250))
        );
    }

    #[test]
    fn decide_respects_max_attempts() {
        let policy = RetryPolicy::default();
        let now = Utc::now();

        assert!(matches!(policy.decide(1, 3, true, now), RetryDecision::Retry { .. }));
        assert!(matches!(policy.decide(2, 3, true, now), RetryDecision::Retry { .. }));
        assert_eq!(
            policy.decide(3, 3, true, now),
            RetryDecision::GiveUp(GiveUpReason::AttemptsExhausted)
        );
        assert_eq!(
            policy.decide(1, 3, false, now),
            RetryDecision::GiveUp(GiveUpReason::NotRetryable)
        );
    }

    #[test]
    fn retry_deadline_is_now_plus_delay() {
        let policy = RetryPolicy::without_jitter(Duration::from_secs(5), Duration::from_secs(300));
        let now = Utc::now();

        match policy.decide(2, 5, true, now) {
            RetryDecision::Retry { delay, next_retry_at } => {
                assert_eq!(delay, Duration::from_secs(10));
                assert_eq!(next_retry_at, now + chrono::Duration::seconds(10));
            }
            other => panic!("expected retry, got {other:?}"),
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 256, .. ProptestConfig::default() })]

        #[test]
        fn jittered_delay_stays_in_band(attempt in 1u32..40) {
            let policy = RetryPolicy::default();
            let (lo, hi) = policy.delay_bounds(attempt);
            let delay = policy.delay_for_attempt(attempt);

            prop_assert!(delay >= lo && delay <= hi);
            prop_assert!(hi <= policy.max_delay);
        }

        #[test]
        fn nominal_delay_is_monotonic(attempt in 1u32..60) {
            let policy = RetryPolicy::default();
            prop_assert!(policy.nominal_delay(attempt) <= policy.nominal_delay(attempt + 1));
        }

        #[test]
        fn band_edges_never_shrink(attempt in 1u32..60) {
            let policy = RetryPolicy::default();
            let (lo, hi) = policy.delay_bounds(attempt);
            let (next_lo, next_hi) = policy.delay_bounds(attempt + 1);
            prop_assert!(lo <= next_lo && hi <= next_hi);
        }
    }
}
