use std::time::Duration;

use rand::Rng;

use crate::config::TransportConfig;

#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    max_attempts: u32,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max,
            max_attempts,
            attempt: 0,
        }
    }

    pub fn from_config(config: &TransportConfig) -> Self {
        Self::new(config.base_delay, config.max_delay, config.max_attempts)
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Delay for `attempt` given a jitter fraction in `[0.0, 0.5]`.
    pub fn delay_for(&self, attempt: u32, jitter: f64) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        let computed = self.base.saturating_mul(factor);
        let jitter = computed.mul_f64(jitter.clamp(0.0, 0.5));
        computed.saturating_add(jitter).min(self.max)
    }

    /// Advances the schedule. Returns `None` once `max_attempts` is reached.
    pub fn next_delay<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }
        let delay = self.delay_for(self.attempt, rng.gen_range(0.0..=0.5));
        self.attempt += 1;
        Some(delay)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff() -> Backoff {
        Backoff::new(Duration::from_secs(1), Duration::from_secs(30), 10)
    }

    #[test]
    fn test_delay_doubles_without_jitter() {
        let b = backoff();
        assert_eq!(b.delay_for(0, 0.0), Duration::from_secs(1));
        assert_eq!(b.delay_for(1, 0.0), Duration::from_secs(2));
        assert_eq!(b.delay_for(3, 0.0), Duration::from_secs(8));
    }

    #[test]
    fn test_jitter_is_at_most_half() {
        let b = backoff();
        assert_eq!(b.delay_for(2, 0.5), Duration::from_secs(6));
        assert_eq!(b.delay_for(2, 0.9), Duration::from_secs(6));
    }

    #[test]
    fn test_delay_is_capped() {
        let b = backoff();
        assert_eq!(b.delay_for(5, 0.0), Duration::from_secs(30));
        assert_eq!(b.delay_for(40, 0.5), Duration::from_secs(30));
    }

    #[test]
    fn test_sequence_is_non_decreasing() {
        let mut rng = rand::thread_rng();
        for _ in 0..50 {
            let mut b = backoff();
            let mut last = Duration::ZERO;
            while let Some(delay) = b.next_delay(&mut rng) {
                assert!(delay >= last, "{delay:?} < {last:?}");
                assert!(delay <= Duration::from_secs(30));
                last = delay;
            }
            assert_eq!(b.attempts(), 10);
        }
    }

    #[test]
    fn test_exhaustion_and_reset() {
        let mut rng = rand::thread_rng();
        let mut b = Backoff::new(Duration::from_millis(100), Duration::from_secs(1), 2);
        assert!(b.next_delay(&mut rng).is_some());
        assert!(b.next_delay(&mut rng).is_some());
        assert!(b.next_delay(&mut rng).is_none());
        assert!(b.is_exhausted());

        b.reset();
        let delay = b.next_delay(&mut rng).unwrap();
        assert!(delay >= Duration::from_millis(100) && delay <= Duration::from_millis(150));
    }
}
