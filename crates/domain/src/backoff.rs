//! Jittered exponential back-off, shared by the LLM retry path and the
//! bridge reconnect loop.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Backoff {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Cap on the delay between attempts.
    pub max_delay: Duration,
    /// Multiplier applied after each failed attempt.
    pub factor: f64,
}

impl Backoff {
    pub fn new(initial_delay: Duration, max_delay: Duration, factor: f64) -> Self {
        Self {
            initial_delay,
            max_delay,
            factor,
        }
    }

    /// Doubling policy from millisecond bounds; the cap never drops
    /// below the initial delay.
    pub fn from_bounds(initial_ms: u64, cap_ms: u64) -> Self {
        Self::new(
            Duration::from_millis(initial_ms),
            Duration::from_millis(cap_ms.max(initial_ms)),
            2.0,
        )
    }

    /// Compute the delay for the given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_delay.as_millis() as f64;
        let delay_ms = base_ms * self.factor.powi(attempt as i32);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);

        // ~25% jitter so callers across sessions do not retry in
        // lockstep.
        let jitter = capped_ms * 0.25 * pseudo_random_fraction(attempt);
        Duration::from_millis((capped_ms + jitter) as u64)
    }
}

/// Cheap deterministic "random" fraction [0, 1) based on attempt number.
/// Not cryptographically secure — just enough to spread retry storms.
fn pseudo_random_fraction(attempt: u32) -> f64 {
    let hash = attempt.wrapping_mul(2654435761); // Knuth multiplicative hash
    f64::from(hash as u32) / f64::from(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_with_attempts() {
        let policy = Backoff::from_bounds(250, 10_000);
        assert!(policy.delay_for_attempt(1) > policy.delay_for_attempt(0));
        assert!(policy.delay_for_attempt(2) > policy.delay_for_attempt(1));
    }

    #[test]
    fn delay_capped_at_max_plus_jitter() {
        let policy = Backoff::from_bounds(1_000, 3_000);
        // Far past the cap: bounded by max + 25% jitter.
        assert!(policy.delay_for_attempt(12) <= Duration::from_millis(3_750));
    }

    #[test]
    fn cap_never_below_initial() {
        let policy = Backoff::from_bounds(2_000, 500);
        assert_eq!(policy.max_delay, Duration::from_millis(2_000));
    }

    #[test]
    fn jitter_is_deterministic_per_attempt() {
        let policy = Backoff::from_bounds(500, 5_000);
        assert_eq!(policy.delay_for_attempt(3), policy.delay_for_attempt(3));
    }
}
