use std::time::Duration;

use rand::Rng;

/// Capped exponential backoff with jitter, driving the reconnection
/// schedule: `base * 2^attempt`, capped at `max`, spread by up to
/// `jitter * delay` in either direction so a fleet of clients does not
/// reconnect in lockstep.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: f64,
    max_attempts: Option<u32>,
    attempts: u32,
}

impl Backoff {
    /// `jitter` is clamped to `[0, 1]`; `max_attempts: None` retries
    /// forever.
    pub fn new(base: Duration, max: Duration, jitter: f64, max_attempts: Option<u32>) -> Self {
        Self {
            base,
            max,
            jitter: jitter.clamp(0.0, 1.0),
            max_attempts,
            attempts: 0,
        }
    }

    /// The delay before the next attempt, or `None` once the attempt cap is
    /// reached.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if let Some(max_attempts) = self.max_attempts {
            if self.attempts >= max_attempts {
                return None;
            }
        }
        let exp = 2u64.saturating_pow(self.attempts.min(32));
        self.attempts += 1;

        let delay = self
            .base
            .saturating_mul(exp.min(u32::MAX as u64) as u32)
            .min(self.max);
        if self.jitter == 0.0 {
            return Some(delay);
        }
        let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        let jittered = delay.as_secs_f64() * (1.0 + spread);
        Some(Duration::from_secs_f64(jittered.max(0.0)).min(self.max))
    }

    /// Number of attempts consumed since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Forgets past failures. Called after a successful connection.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(
            Duration::from_secs(1),
            Duration::from_secs(5),
            0.5,
            None,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_up_to_the_cap() {
        let mut backoff = Backoff::new(
            Duration::from_millis(100),
            Duration::from_millis(450),
            0.0,
            None,
        );
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(100)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(200)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(400)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(450)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(450)));
    }

    #[test]
    fn attempt_cap_stops_the_schedule() {
        let mut backoff = Backoff::new(
            Duration::from_millis(10),
            Duration::from_millis(100),
            0.0,
            Some(2),
        );
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert_eq!(backoff.next_delay(), None);
        assert_eq!(backoff.attempts(), 2);
    }

    #[test]
    fn reset_restarts_the_schedule() {
        let mut backoff = Backoff::new(
            Duration::from_millis(100),
            Duration::from_secs(10),
            0.0,
            Some(3),
        );
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let mut backoff = Backoff::new(
            Duration::from_millis(100),
            Duration::from_secs(10),
            0.5,
            None,
        );
        for _ in 0..32 {
            let delay = backoff.next_delay().unwrap();
            assert!(delay <= Duration::from_secs(10));
        }
    }
}
