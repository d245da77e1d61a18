//! Reconnection Backoff
//!
//! Exponential backoff for stream reconnection: 5 s, 10 s, 20 s, ... capped
//! at 300 s by default, optionally randomized. The policy is reset after
//! every successful connect and on deliberate credential changes, so a
//! credential rotation never inherits the delay of an earlier outage.

use std::time::Duration;

use rand::Rng;

/// Backoff parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first reconnect attempt.
    pub initial_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Growth factor per consecutive failure.
    pub multiplier: f64,
    /// Randomization as a fraction of the delay (0.2 = up to ±20%).
    pub jitter_factor: f64,
    /// Give up after this many attempts (0 = never).
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
            jitter_factor: 0.0,
            max_attempts: 0,
        }
    }
}

impl BackoffConfig {
    /// Deterministic doubling between `initial_delay` and `max_delay`.
    #[must_use]
    pub fn doubling(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            ..Self::default()
        }
    }
}

/// Tracks consecutive failures and yields the delay before the next attempt.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    config: BackoffConfig,
    failures: u32,
}

impl ReconnectPolicy {
    /// Create a policy with no recorded failures.
    #[must_use]
    pub const fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            failures: 0,
        }
    }

    /// Record a failure and return how long to wait before retrying.
    ///
    /// Returns `None` once `max_attempts` is exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.should_retry() {
            return None;
        }
        let delay = self.delay_for(self.failures);
        self.failures = self.failures.saturating_add(1);
        Some(self.jittered(delay))
    }

    /// Delay the next call to [`Self::next_delay`] would return, before jitter.
    #[must_use]
    pub fn peek_delay(&self) -> Duration {
        self.delay_for(self.failures)
    }

    /// Forget all failures.
    pub const fn reset(&mut self) {
        self.failures = 0;
    }

    /// Attempts made since the last reset.
    #[must_use]
    pub const fn attempt_count(&self) -> u32 {
        self.failures
    }

    /// Whether another attempt is allowed.
    #[must_use]
    pub const fn should_retry(&self) -> bool {
        self.config.max_attempts == 0 || self.failures < self.config.max_attempts
    }

    fn delay_for(&self, failures: u32) -> Duration {
        let exponent = i32::try_from(failures).unwrap_or(i32::MAX);
        let scaled = self.config.initial_delay.as_secs_f64() * self.config.multiplier.powi(exponent);
        let capped = if scaled.is_finite() {
            scaled.min(self.config.max_delay.as_secs_f64())
        } else {
            self.config.max_delay.as_secs_f64()
        };
        Duration::try_from_secs_f64(capped.max(0.0)).unwrap_or(self.config.max_delay)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        let factor = self.config.jitter_factor;
        if factor <= 0.0 {
            return delay;
        }
        let spread = delay.as_secs_f64() * factor;
        let offset: f64 = rand::rng().random_range(-spread..=spread);
        Duration::try_from_secs_f64((delay.as_secs_f64() + offset).max(0.001)).unwrap_or(delay)
    }
}

/// Reconnection failures surfaced to callers.
#[derive(Debug, thiserror::Error)]
pub enum ReconnectError {
    /// `max_attempts` consecutive attempts failed.
    #[error("gave up after {0} reconnection attempts")]
    AttemptsExhausted(u32),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn defaults_are_five_seconds_doubling_to_five_minutes() {
        let config = BackoffConfig::default();
        assert_eq!(config.initial_delay, secs(5));
        assert_eq!(config.max_delay, secs(300));
        assert!((config.multiplier - 2.0).abs() < f64::EPSILON);
        assert_eq!(config.max_attempts, 0);
    }

    #[test]
    fn sequence_doubles_then_caps() {
        let mut policy = ReconnectPolicy::new(BackoffConfig::default());
        let delays: Vec<u64> = (0..9)
            .map(|_| policy.next_delay().unwrap().as_secs())
            .collect();
        assert_eq!(delays, vec![5, 10, 20, 40, 80, 160, 300, 300, 300]);
        assert_eq!(policy.attempt_count(), 9);
    }

    #[test]
    fn reset_returns_to_initial_delay() {
        let mut policy = ReconnectPolicy::new(BackoffConfig::default());
        policy.next_delay();
        policy.next_delay();
        assert_eq!(policy.peek_delay(), secs(20));

        policy.reset();
        assert_eq!(policy.attempt_count(), 0);
        assert_eq!(policy.next_delay(), Some(secs(5)));
    }

    #[test]
    fn bounded_attempts_run_out() {
        let mut policy = ReconnectPolicy::new(BackoffConfig {
            max_attempts: 2,
            ..BackoffConfig::default()
        });
        assert!(policy.next_delay().is_some());
        assert!(policy.next_delay().is_some());
        assert!(policy.next_delay().is_none());
        assert!(!policy.should_retry());
    }

    #[test]
    fn jitter_stays_in_band() {
        let config = BackoffConfig {
            initial_delay: Duration::from_millis(1000),
            jitter_factor: 0.2,
            ..BackoffConfig::default()
        };
        for _ in 0..200 {
            let millis = ReconnectPolicy::new(config.clone())
                .next_delay()
                .unwrap()
                .as_millis();
            assert!((800..=1200).contains(&millis), "{millis}ms outside ±20%");
        }
    }

    #[test]
    fn huge_failure_count_stays_capped() {
        let mut policy = ReconnectPolicy::new(BackoffConfig::doubling(secs(1), secs(60)));
        for _ in 0..5_000 {
            policy.next_delay();
        }
        assert_eq!(policy.peek_delay(), secs(60));
    }
}
