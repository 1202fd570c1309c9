//! Retry/backoff policy shared by the publisher and the consumer loop.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::time::Duration;

/// Exponential backoff: `base * 2^(attempt-1)`, capped at `max_delay`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one (1 = no retries).
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub base_delay: Duration,
    /// Maximum delay cap.
    pub max_delay: Duration,
    /// Jitter factor (0.0-1.0) applied around the computed delay.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// A single attempt, no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            jitter: 0.1,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay to wait after failed attempt number `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.jittered_delay(attempt, 0)
    }

    /// Like `delay_for_attempt`, with the jitter also derived from `key`
    /// (an event or message id), so concurrent retriers spread out instead of
    /// waking together.
    pub fn delay_for_key(&self, attempt: u32, key: &str) -> Duration {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        self.jittered_delay(attempt, hasher.finish())
    }

    fn jittered_delay(&self, attempt: u32, seed: u64) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let exp = 2_f64.powi(attempt.saturating_sub(1).min(62) as i32);
        let delay_ms = (base_ms * exp).min(max_ms);

        // Deterministic jitter derived from the attempt number and the seed.
        let jitter_range = delay_ms * self.jitter;
        let jitter = if jitter_range > 0.0 {
            let bucket = (u64::from(attempt) * 17).wrapping_add(seed) % 100;
            let pseudo_random = bucket as f64 / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).clamp(0.0, max_ms) as u64)
    }

    /// Whether another attempt is allowed after `attempt` attempts were made.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_exponentially_and_are_capped() {
        let policy = RetryPolicy::exponential(10, Duration::from_millis(100), Duration::from_millis(1000))
            .with_jitter(0.0);

        assert_eq!(policy.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(60), Duration::from_millis(1000));
    }

    #[test]
    fn jitter_never_exceeds_cap() {
        let policy = RetryPolicy::exponential(10, Duration::from_millis(100), Duration::from_millis(400))
            .with_jitter(1.0);
        for attempt in 1..20 {
            assert!(policy.delay_for_attempt(attempt) <= Duration::from_millis(400));
        }
    }

    #[test]
    fn keyed_delays_differ_between_keys_but_are_stable_per_key() {
        let policy = RetryPolicy::exponential(10, Duration::from_millis(1000), Duration::from_secs(60))
            .with_jitter(0.5);

        let delays: std::collections::HashSet<Duration> = (0..20)
            .map(|n| policy.delay_for_key(1, &format!("order.created:{n}")))
            .collect();
        assert!(delays.len() > 1, "every key got the same delay");

        assert_eq!(policy.delay_for_key(3, "order.created:7"), policy.delay_for_key(3, "order.created:7"));
        for n in 0..20 {
            let delay = policy.delay_for_key(1, &format!("order.created:{n}"));
            assert!(delay >= Duration::from_millis(500) && delay <= Duration::from_millis(1500));
        }
    }

    #[test]
    fn attempts_are_bounded() {
        let policy = RetryPolicy::exponential(3, Duration::from_millis(1), Duration::from_millis(1));
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!RetryPolicy::no_retry().should_retry(1));
    }
}
