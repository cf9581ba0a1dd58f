//! Backoff schedule for connection retries.

use std::time::Duration;

/// Exponential backoff with no elapsed-time limit. The supervisor retries
/// until it connects or is stopped; the schedule only paces the attempts.
pub(crate) struct ExponentialBackoff {
    next: Duration,
    max: Duration,
    factor: f64,
}

impl ExponentialBackoff {
    pub(crate) fn new(initial: Duration, max: Duration, factor: f64) -> Self {
        Self {
            next: initial,
            max,
            factor,
        }
    }

    /// Returns the wait before the next attempt and advances the schedule.
    pub(crate) fn next_interval(&mut self) -> Duration {
        let interval = self.next;
        let grown = self.next.as_secs_f64() * self.factor;
        self.next = Duration::from_secs_f64(grown.min(self.max.as_secs_f64()));
        interval
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(60), 1.5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intervals_are_non_decreasing() {
        let mut backoff = ExponentialBackoff::default();
        let mut previous = Duration::ZERO;
        for _ in 0..32 {
            let interval = backoff.next_interval();
            assert!(interval >= previous, "{interval:?} < {previous:?}");
            previous = interval;
        }
    }

    #[test]
    fn intervals_cap_at_max() {
        let mut backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(4), 2.0);
        assert_eq!(backoff.next_interval(), Duration::from_secs(1));
        assert_eq!(backoff.next_interval(), Duration::from_secs(2));
        assert_eq!(backoff.next_interval(), Duration::from_secs(4));
        assert_eq!(backoff.next_interval(), Duration::from_secs(4));
    }

    #[test]
    fn first_interval_is_the_initial_delay() {
        let mut backoff = ExponentialBackoff::default();
        assert_eq!(backoff.next_interval(), Duration::from_millis(500));
    }
}
