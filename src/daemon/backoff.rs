//! Restart backoff for supervised services.
//!
//! The delay starts at `backoff-delay`, is multiplied by `backoff-factor`
//! after every unplanned exit, and is capped at `backoff-limit`. A service
//! that stays up for `backoff-limit` starts over at `backoff-delay`.
//! Jitter is added to the sleep only and never feeds back into the
//! escalating delay.

use crate::plan::Service;
use rand::Rng;
use std::time::Duration;

/// Upper bound of the random jitter, as a fraction of the delay.
const MAX_JITTER: f64 = 0.1;

#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    first: Duration,
    factor: f64,
    limit: Duration,
    current: Duration,
    restarts: u32,
}

impl Backoff {
    pub fn new(first: Duration, factor: f64, limit: Duration) -> Self {
        Self {
            first,
            factor: factor.max(1.0),
            limit,
            current: first.min(limit),
            restarts: 0,
        }
    }

    pub fn for_service(service: &Service) -> Self {
        Self::new(
            service.backoff_delay,
            service.backoff_factor,
            service.backoff_limit,
        )
    }

    /// Delay to wait before the next restart, given how long the process ran
    /// before it exited. Escalates the delay for the restart after.
    pub fn on_exit(&mut self, ran_for: Duration) -> Duration {
        if ran_for >= self.limit {
            self.reset();
        }
        let delay = self.current;
        let next = self.current.as_secs_f64() * self.factor;
        self.current = if !next.is_finite() || next > self.limit.as_secs_f64() {
            self.limit
        } else {
            Duration::from_secs_f64(next)
        };
        self.restarts += 1;
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.first.min(self.limit);
        self.restarts = 0;
    }

    /// Delay the next exit would be given, without escalating it.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Consecutive restarts since the last reset.
    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    /// How long the process must stay up before the delay starts over.
    pub fn limit(&self) -> Duration {
        self.limit
    }
}

/// Add up to 10% random jitter to a sleep.
pub fn jitter(delay: Duration) -> Duration {
    let fraction = rand::thread_rng().gen_range(0.0..MAX_JITTER);
    delay + delay.mul_f64(fraction)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> Backoff {
        Backoff::new(Duration::from_millis(500), 2.0, Duration::from_secs(30))
    }

    #[test]
    fn default_sequence_is_capped_at_limit() {
        let mut backoff = defaults();
        let delays: Vec<Duration> = (0..9).map(|_| backoff.on_exit(Duration::ZERO)).collect();
        let expected: Vec<Duration> = [500, 1000, 2000, 4000, 8000, 16000, 30000, 30000, 30000]
            .iter()
            .map(|ms| Duration::from_millis(*ms))
            .collect();
        assert_eq!(delays, expected);
        assert_eq!(backoff.restarts(), 9);
    }

    #[test]
    fn long_run_resets_delay() {
        let mut backoff = defaults();
        for _ in 0..5 {
            backoff.on_exit(Duration::from_secs(1));
        }
        assert_eq!(backoff.current(), Duration::from_secs(16));

        let delay = backoff.on_exit(Duration::from_secs(30));
        assert_eq!(delay, Duration::from_millis(500));
        assert_eq!(backoff.restarts(), 1);
        assert_eq!(backoff.current(), Duration::from_secs(1));
    }

    #[test]
    fn short_run_keeps_escalating() {
        let mut backoff = defaults();
        backoff.on_exit(Duration::ZERO);
        let delay = backoff.on_exit(Duration::from_secs(29));
        assert_eq!(delay, Duration::from_secs(1));
    }

    #[test]
    fn factor_one_is_constant() {
        let mut backoff = Backoff::new(Duration::from_secs(2), 1.0, Duration::from_secs(30));
        for _ in 0..5 {
            assert_eq!(backoff.on_exit(Duration::ZERO), Duration::from_secs(2));
        }
    }

    #[test]
    fn jitter_stays_within_ten_percent() {
        let delay = Duration::from_secs(10);
        for _ in 0..100 {
            let jittered = jitter(delay);
            assert!(jittered >= delay);
            assert!(jittered < Duration::from_secs(11));
        }
    }
}
