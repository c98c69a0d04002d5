//! Exponential backoff with jitter for the retrying loops.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Backoff settings shared by the subscriber, the consumer and the task queues.
///
/// The delay doubles with each attempt, starting from `initial_delay`, and is capped at
/// `max_delay`. A ±10% random jitter keeps retrying processes from hitting a recovering
/// collaborator in lockstep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backoff {
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl Backoff {
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
        }
    }

    /// The delay before retry number `attempt` (0-indexed), with jitter applied.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with_jitter(attempt, true)
    }

    /// The delay before retry number `attempt` without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        self.delay_with_jitter(attempt, false)
    }

    fn delay_with_jitter(&self, attempt: u32, apply_jitter: bool) -> Duration {
        let initial_ms = self.initial_delay.as_millis() as u64;
        let max_ms = self.max_delay.as_millis() as u64;

        // 2^63 is the largest power that fits in u64
        let capped_attempt = attempt.min(63);
        let multiplier = 2u64.saturating_pow(capped_attempt);
        let base_delay_ms = initial_ms.saturating_mul(multiplier).min(max_ms);

        if !apply_jitter || base_delay_ms == 0 {
            return Duration::from_millis(base_delay_ms);
        }

        let jitter_range = (base_delay_ms as f64 * 0.1) as u64;
        if jitter_range == 0 {
            return Duration::from_millis(base_delay_ms);
        }

        let mut rng = rand::thread_rng();
        let jitter: i64 = rng.gen_range(-(jitter_range as i64)..=(jitter_range as i64));
        let final_delay_ms = (base_delay_ms as i64 + jitter).max(1) as u64;

        Duration::from_millis(final_delay_ms.min(max_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_per_attempt() {
        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));

        assert_eq!(backoff.base_delay(0), Duration::from_secs(1));
        assert_eq!(backoff.base_delay(1), Duration::from_secs(2));
        assert_eq!(backoff.base_delay(2), Duration::from_secs(4));
    }

    #[test]
    fn delay_is_capped_for_large_attempts() {
        let backoff = Backoff::default();
        assert_eq!(backoff.base_delay(100), Duration::from_secs(60));
    }

    #[test]
    fn jitter_stays_within_ten_percent() {
        let backoff = Backoff::new(Duration::from_secs(10), Duration::from_secs(60));

        for _ in 0..100 {
            let delay = backoff.delay(0);
            assert!(
                delay >= Duration::from_secs(9) && delay <= Duration::from_secs(11),
                "Delay {:?} out of expected range",
                delay
            );
        }
    }

    #[test]
    fn jittered_delay_never_exceeds_the_cap() {
        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
        for _ in 0..100 {
            assert!(backoff.delay(10) <= Duration::from_secs(60));
        }
    }

    #[test]
    fn millisecond_delays_keep_their_precision() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(10));

        assert_eq!(backoff.base_delay(0), Duration::from_millis(100));
        assert_eq!(backoff.base_delay(1), Duration::from_millis(200));
    }

    #[test]
    fn zero_initial_delay_never_waits() {
        let backoff = Backoff::new(Duration::ZERO, Duration::from_secs(1));
        assert_eq!(backoff.delay(5), Duration::ZERO);
    }
}
