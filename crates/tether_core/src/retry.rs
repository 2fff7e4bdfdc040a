//! Retry policy: bounded exponential backoff.

use std::time::Duration;

/// Configuration for retry behavior.
///
/// The delay for attempt `n` (0-indexed: the delay scheduled after the
/// first failure is `delay_for_attempt(0)`) follows
/// `min(max_delay, initial_delay * multiplier^n)`. Jitter, when enabled,
/// is added on top of that floor and never reduces it.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts before a task is marked dead.
    pub max_attempts: u32,
    /// Delay after the first failure.
    pub initial_delay: Duration,
    /// Upper bound on the backoff floor.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub multiplier: f64,
    /// Whether to add jitter (up to 25% above the floor).
    pub jitter: bool,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    #[must_use]
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
            jitter: true,
        }
    }

    /// Creates a configuration with no retries.
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
            jitter: false,
        }
    }

    /// The small bounded backoff used while id negotiation waits for an
    /// in-flight holder of a contested record (1s, 2s, 4s).
    #[must_use]
    pub fn negotiation() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(4),
            multiplier: 2.0,
            jitter: false,
        }
    }

    /// Sets the initial delay.
    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    #[must_use]
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Disables jitter.
    #[must_use]
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Returns the deterministic backoff floor for an attempt (0-indexed).
    #[must_use]
    pub fn floor_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt.min(64) as i32);
        let capped = base.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// Calculates the delay for a given attempt (0-indexed).
    ///
    /// `delay_for_attempt(0)` equals `initial_delay` (capped at
    /// `max_delay`); with jitter enabled the result is never below the
    /// floor for the same attempt.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let floor = self.floor_for_attempt(attempt);
        if self.jitter {
            let extra = floor.as_secs_f64() * 0.25 * rand_jitter();
            floor + Duration::from_secs_f64(extra)
        } else {
            floor
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Simple deterministic "jitter" (no external RNG dependency).
fn rand_jitter() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (nanos % 1000) as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_attempt_uses_initial_delay() {
        let config = RetryConfig::new(5)
            .with_initial_delay(Duration::from_millis(100))
            .without_jitter();

        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(100));
    }

    #[test]
    fn floor_is_monotone_and_bounded() {
        let config = RetryConfig::new(20)
            .with_initial_delay(Duration::from_millis(50))
            .with_max_delay(Duration::from_secs(10))
            .without_jitter();

        for attempt in 0..30 {
            let current = config.delay_for_attempt(attempt);
            let next = config.delay_for_attempt(attempt + 1);
            assert!(next >= current, "delay decreased at attempt {attempt}");
            assert!(next <= Duration::from_secs(10));
        }
    }

    #[test]
    fn jitter_never_drops_below_floor() {
        let config = RetryConfig::new(10)
            .with_initial_delay(Duration::from_millis(200))
            .with_max_delay(Duration::from_secs(30));

        for attempt in 0..10 {
            let floor = config.floor_for_attempt(attempt);
            let delay = config.delay_for_attempt(attempt);
            assert!(delay >= floor);
            // Jitter adds at most 25%.
            assert!(delay.as_secs_f64() <= floor.as_secs_f64() * 1.25 + f64::EPSILON);
        }
    }

    #[test]
    fn doubles_each_attempt() {
        let config = RetryConfig::new(5)
            .with_initial_delay(Duration::from_secs(1))
            .without_jitter();

        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(4));
    }

    #[test]
    fn no_retry_config() {
        let config = RetryConfig::no_retry();
        assert_eq!(config.max_attempts, 1);
        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);
    }

    #[test]
    fn negotiation_backoff_shape() {
        let config = RetryConfig::negotiation();
        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(4));
    }
}
