use std::time::Duration;

use rand::Rng;

/// Exponential retry delays with multiplicative jitter and an attempt budget.
pub struct Backoff {
    attempt: u32,
    base: Duration,
    max: Duration,
    jitter: f64,
    max_attempts: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, jitter: f64, max_attempts: u32) -> Self {
        Self {
            attempt: 0,
            base,
            max,
            jitter: jitter.clamp(0.0, 0.999),
            max_attempts,
        }
    }

    /// Delay before the `attempt`-th try, without jitter: `base * 2^(attempt-1)`, capped.
    pub fn nominal(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        self.base
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.max)
    }

    pub fn next(&mut self) -> Duration {
        self.attempt += 1;
        let nominal = self.nominal(self.attempt);
        let factor = if self.jitter > 0.0 {
            1.0 + rand::thread_rng().gen_range(0.0..self.jitter)
        } else {
            1.0
        };
        nominal.mul_f64(factor).min(self.max)
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_cap() {
        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(5), 0.0, 10);
        assert_eq!(backoff.nominal(1), Duration::from_secs(1));
        assert_eq!(backoff.nominal(2), Duration::from_secs(2));
        assert_eq!(backoff.nominal(3), Duration::from_secs(4));
        assert_eq!(backoff.nominal(4), Duration::from_secs(5));
    }

    #[test]
    fn jittered_delays_strictly_increase_below_cap() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30), 0.2, 4);
        let delays: Vec<_> = (0..4).map(|_| backoff.next()).collect();
        assert!(delays.windows(2).all(|w| w[0] < w[1]), "{:?}", delays);
        assert!(delays[0] >= Duration::from_secs(1) && delays[0] < Duration::from_millis(1200));
        assert!(backoff.is_exhausted());

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert!(!backoff.is_exhausted());
    }
}
