use std::time::Duration;

use crate::config::BackoffConfig;

/// Exponential resubscribe delay with bounded jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    base_delay_ms: u64,
    max_delay_ms: u64,
    jitter_ratio: f64,
    max_attempts: u32,
}

impl BackoffPolicy {
    pub fn new(base_delay_ms: u64, max_delay_ms: u64, jitter_ratio: f64, max_attempts: u32) -> Self {
        Self {
            base_delay_ms,
            max_delay_ms: max_delay_ms.max(base_delay_ms),
            jitter_ratio: jitter_ratio.clamp(0.0, 1.0),
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn from_config(config: &BackoffConfig) -> Self {
        Self::new(
            config.base_delay_ms,
            config.max_delay_ms,
            config.jitter_ratio,
            config.max_attempts,
        )
    }

    pub fn base_delay_ms(&self) -> u64 {
        self.base_delay_ms
    }

    pub fn max_delay_ms(&self) -> u64 {
        self.max_delay_ms
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// `min(base * 2^attempt, max)` without jitter.
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let shift = attempt.min(20);
        let multiplier = 1_u64 << shift;
        let calculated = self.base_delay_ms.saturating_mul(multiplier);
        Duration::from_millis(calculated.min(self.max_delay_ms))
    }

    /// Delay before the next attempt after `attempt` prior consecutive
    /// failures. `jitter_unit` in `[0, 1]` adds up to `jitter_ratio` of the
    /// nominal delay. Once exhausted the cadence stays at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32, jitter_unit: f64) -> Duration {
        let nominal = if self.is_exhausted(attempt) {
            self.max_delay_ms
        } else {
            self.nominal_delay(attempt).as_millis() as u64
        };
        let unit = jitter_unit.clamp(0.0, 1.0);
        let jitter = (nominal as f64 * self.jitter_ratio * unit) as u64;
        Duration::from_millis(nominal.saturating_add(jitter))
    }

    /// Whether `failures` consecutive failures should report `failed`.
    pub fn is_exhausted(&self, failures: u32) -> bool {
        failures >= self.max_attempts
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&BackoffConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_with_base_delay() {
        let policy = BackoffPolicy::new(250, 8_000, 0.0, 10);
        assert_eq!(policy.delay_for_attempt(0, 0.5), Duration::from_millis(250));
    }

    #[test]
    fn test_doubles_until_capped() {
        let policy = BackoffPolicy::new(100, 1_000, 0.0, 10);
        let delays: Vec<u64> = (0..6)
            .map(|attempt| policy.delay_for_attempt(attempt, 0.0).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1_000, 1_000]);
    }

    #[test]
    fn test_jitter_stays_within_ratio() {
        let policy = BackoffPolicy::new(1_000, 60_000, 0.25, 10);
        for attempt in 0..5 {
            let nominal = policy.nominal_delay(attempt);
            let low = policy.delay_for_attempt(attempt, 0.0);
            let high = policy.delay_for_attempt(attempt, 1.0);
            assert_eq!(low, nominal);
            assert_eq!(high, nominal + nominal / 4);
            // Out-of-range units are clamped
            assert_eq!(policy.delay_for_attempt(attempt, 7.0), high);
        }
    }

    #[test]
    fn test_exhausted_cadence_is_max_delay() {
        let policy = BackoffPolicy::new(10, 500, 0.0, 3);
        assert!(!policy.is_exhausted(2));
        assert!(policy.is_exhausted(3));
        assert_eq!(policy.delay_for_attempt(3, 0.0), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(40, 0.0), Duration::from_millis(500));
    }

    #[test]
    fn test_huge_attempt_does_not_overflow() {
        let policy = BackoffPolicy::new(u64::MAX / 2, u64::MAX, 0.0, u32::MAX);
        assert_eq!(policy.nominal_delay(u32::MAX), Duration::from_millis(u64::MAX));
    }
}
