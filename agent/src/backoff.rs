//! # Reconnect Backoff
//!
//! Delay policy for the connection loop: exponential from 1 s with a
//! 60 s cap and ±20 % uniform jitter. A connection that stayed up for at
//! least five minutes counts as healthy, so the next failure starts the
//! schedule over at 1 s instead of resuming where it left off.

use std::time::Duration;

use rand::Rng;

const INITIAL_DELAY_SECS: u64 = 1;
const MAX_DELAY_SECS: u64 = 60;
const JITTER_FACTOR: f64 = 0.2;

/// A connected run at least this long resets the schedule.
const HEALTHY_CONNECTION: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Default)]
pub struct Backoff {
    /// Consecutive failures so far; the k-th failure (1-based) waits
    /// around `min(2^(k-1), 60)` seconds.
    failures: u32,
}

impl Backoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unjittered delay for the next attempt.
    fn base_delay(&self) -> Duration {
        let exp = self.failures.min(63);
        let secs = (1u64 << exp).min(MAX_DELAY_SECS) * INITIAL_DELAY_SECS;
        Duration::from_secs(secs)
    }

    /// Delay before the next connection attempt, jitter applied.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.base_delay();
        self.failures = self.failures.saturating_add(1);

        let jitter = rand::rng().random_range(1.0 - JITTER_FACTOR..=1.0 + JITTER_FACTOR);
        base.mul_f64(jitter)
    }

    /// Record how long the last connection lasted. Long-lived runs reset
    /// the schedule; short-lived ones keep escalating.
    pub fn record_connected(&mut self, connected_for: Duration) {
        if connected_for >= HEALTHY_CONNECTION {
            self.failures = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kth_failure_stays_within_jitter_bounds() {
        let mut backoff = Backoff::new();
        for k in 1u32..=12 {
            let expected = (1u64 << (k - 1)).min(60) as f64;
            let delay = backoff.next_delay().as_secs_f64();
            assert!(
                delay >= expected * 0.8 - f64::EPSILON && delay <= expected * 1.2 + f64::EPSILON,
                "failure {k}: delay {delay}s outside [{}, {}]",
                expected * 0.8,
                expected * 1.2,
            );
        }
    }

    #[test]
    fn delay_caps_at_sixty_seconds() {
        let mut backoff = Backoff::new();
        for _ in 0..20 {
            backoff.next_delay();
        }
        let delay = backoff.next_delay().as_secs_f64();
        assert!(delay <= 60.0 * 1.2);
        assert!(delay >= 60.0 * 0.8);
    }

    #[test]
    fn long_connection_resets_the_schedule() {
        let mut backoff = Backoff::new();
        for _ in 0..6 {
            backoff.next_delay();
        }

        backoff.record_connected(Duration::from_secs(5 * 60));
        let delay = backoff.next_delay().as_secs_f64();
        assert!(delay <= 1.2, "expected a ~1s delay after reset, got {delay}s");
    }

    #[test]
    fn short_connection_keeps_escalating() {
        let mut backoff = Backoff::new();
        backoff.next_delay(); // 1s
        backoff.record_connected(Duration::from_secs(3));
        let delay = backoff.next_delay().as_secs_f64();
        assert!(delay >= 2.0 * 0.8, "schedule must not reset, got {delay}s");
    }
}
