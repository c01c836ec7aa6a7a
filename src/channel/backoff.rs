use rand::Rng;
use std::time::Duration;

/// Delay schedule between reconnect attempts: exponential, capped, with optional jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub initial: Duration,
    pub multiplier: u32,
    pub max: Duration,
    /// Fraction of the base delay added at random, in `0.0..=1.0`.
    pub jitter: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy {
            initial: Duration::from_millis(500),
            multiplier: 2,
            max: Duration::from_secs(30),
            jitter: 0.1,
        }
    }
}

impl ReconnectPolicy {
    pub fn fixed(delay: Duration) -> Self {
        ReconnectPolicy {
            initial: delay,
            multiplier: 1,
            max: delay,
            jitter: 0.0,
        }
    }

    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1).saturating_pow(attempt);
        self.initial.saturating_mul(factor).min(self.max)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter <= 0.0 {
            return base;
        }
        let fraction = rand::thread_rng().gen_range(0.0..=self.jitter.min(1.0));
        base + base.mul_f64(fraction)
    }
}
