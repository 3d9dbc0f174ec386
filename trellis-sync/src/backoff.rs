//! Exponential reconnect backoff with symmetric jitter.
//!
//! ```text
//! base(n)  = clamp(initial * multiplier^(n-1), initial, max)
//! delay(n) = max(initial, base(n) + base(n) * jitter * u)    u ∈ [-1, 1]
//! ```

use std::time::Duration;

use rand::Rng;
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Fraction of the base delay added or removed at random, 0.0..=1.0.
    pub jitter: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        // 1s, 2s, 4s ... capped at 30s
        Self { initial_delay_ms: 1_000, max_delay_ms: 30_000, multiplier: 2.0, jitter: 0.2 }
    }
}

impl ReconnectPolicy {
    /// Short, jitter-free delays.
    pub fn for_testing() -> Self {
        Self { initial_delay_ms: 100, max_delay_ms: 1_000, multiplier: 2.0, jitter: 0.0 }
    }

    /// Un-jittered delay before attempt `attempt` (1-based).
    pub fn base_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.base_millis(attempt).round() as u64)
    }

    fn base_millis(&self, attempt: u32) -> f64 {
        let initial = self.initial_delay_ms as f64;
        let max = (self.max_delay_ms as f64).max(initial);
        let exponent = attempt.max(1).saturating_sub(1).min(i32::MAX as u32) as i32;
        let raw = initial * self.multiplier.max(1.0).powi(exponent);
        if raw.is_nan() {
            return max;
        }
        raw.clamp(initial, max)
    }

    /// Delay for `attempt` given a jitter sample in `[-1, 1]`.
    pub fn delay_with_sample(&self, attempt: u32, sample: f64) -> Duration {
        let base = self.base_millis(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        let offset = base * jitter * sample.clamp(-1.0, 1.0);
        let millis = (base + offset).max(self.initial_delay_ms as f64);
        Duration::from_millis(millis.round() as u64)
    }

    pub fn delay<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        let sample = if self.jitter > 0.0 { rng.gen_range(-1.0..=1.0) } else { 0.0 };
        self.delay_with_sample(attempt, sample)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_doubles_until_capped() {
        let policy = ReconnectPolicy { jitter: 0.0, ..Default::default() };
        let delays: Vec<u64> = (1..=7).map(|n| policy.base_delay(n).as_millis() as u64).collect();
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000, 16_000, 30_000, 30_000]);
    }

    #[test]
    fn test_attempt_zero_behaves_like_first() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.base_delay(0), policy.base_delay(1));
    }

    #[test]
    fn test_huge_attempts_do_not_overflow() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.base_delay(u32::MAX), Duration::from_millis(30_000));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = ReconnectPolicy::default();
        let mut rng = StdRng::seed_from_u64(7);
        let mut previous_base = Duration::ZERO;
        for attempt in 1..=12 {
            let base = policy.base_delay(attempt);
            assert!(base >= previous_base, "base delay is non-decreasing");
            previous_base = base;

            for _ in 0..50 {
                let delay = policy.delay(attempt, &mut rng);
                assert!(delay >= Duration::from_millis(policy.initial_delay_ms));
                let ceiling = policy.max_delay_ms as f64 * (1.0 + policy.jitter) + 1.0;
                assert!(delay.as_millis() as f64 <= ceiling);
            }
        }
    }

    #[test]
    fn test_extreme_samples() {
        let policy = ReconnectPolicy { jitter: 0.5, ..Default::default() };
        assert_eq!(policy.delay_with_sample(3, 1.0), Duration::from_millis(6_000));
        assert_eq!(policy.delay_with_sample(3, -1.0), Duration::from_millis(2_000));
        // Negative jitter never drops below the initial delay
        assert_eq!(policy.delay_with_sample(1, -1.0), Duration::from_millis(1_000));
    }

    #[test]
    fn test_cap_below_initial_is_lifted() {
        let policy = ReconnectPolicy { max_delay_ms: 10, ..Default::default() };
        assert_eq!(policy.base_delay(5), Duration::from_millis(1_000));
    }
}
