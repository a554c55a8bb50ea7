// Exponential reconnect backoff with jitter.
use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct BackoffConfig {
    // First retry delay; doubled per consecutive failure.
    pub base: Duration,
    // Ceiling for the exponential growth.
    pub max: Duration,
    // Fraction of the delay randomized away (0.0..=1.0). Jitter spreads
    // reconnect stampedes after a server restart.
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max: Duration::from_secs(15),
            jitter: 0.25,
        }
    }
}

impl BackoffConfig {
    /// Delay before retry number `attempt` (0-based consecutive failures).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.min(31);
        let scaled = self
            .base
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.max);
        if self.jitter <= 0.0 {
            return scaled;
        }
        let jitter = self.jitter.min(1.0);
        // Uniform in [1 - jitter, 1].
        let factor = 1.0 - rand::thread_rng().gen_range(0.0..jitter);
        scaled.mul_f64(factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> BackoffConfig {
        BackoffConfig {
            base: Duration::from_millis(100),
            max: Duration::from_secs(10),
            jitter: 0.0,
        }
    }

    #[test]
    fn grows_exponentially_until_capped() {
        let backoff = no_jitter();
        assert_eq!(backoff.delay(0), Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(800));
        assert_eq!(backoff.delay(10), Duration::from_secs(10));
        // No overflow panic at absurd attempt counts.
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let backoff = BackoffConfig {
            base: Duration::from_millis(1000),
            max: Duration::from_secs(10),
            jitter: 0.5,
        };
        for _ in 0..100 {
            let delay = backoff.delay(0);
            assert!(delay >= Duration::from_millis(500), "delay {delay:?}");
            assert!(delay <= Duration::from_millis(1000), "delay {delay:?}");
        }
    }
}
