//! Logarithmic backoff policy with jitter

use std::fmt;
use std::time::Duration;

use rand::Rng;

const FAST_SLOT: Duration = Duration::from_millis(5);
const SLOW_SLOT: Duration = Duration::from_secs(1);
const DEFAULT_CEILING: u32 = 6;

/// Maps a retry index to a delay
///
/// Index 0 is the first retry after the initial failure.
pub trait Backoff: Send + Sync + fmt::Debug {
    fn delay(&self, attempt: usize) -> Duration;

    /// Signal that fires once the delay for `attempt` has elapsed
    fn wait(&self, attempt: usize) -> tokio::time::Sleep {
        tokio::time::sleep(self.delay(attempt))
    }
}

/// Exponential delay growth capped at `slot * 2^ceiling`
///
/// # Examples
///
/// ```
/// use sessionpool::{Backoff, LogBackoff};
/// use std::time::Duration;
///
/// let backoff = LogBackoff::new(Duration::from_millis(10), 3, 1.0);
///
/// assert_eq!(backoff.delay(0), Duration::from_millis(10));
/// assert_eq!(backoff.delay(2), Duration::from_millis(40));
/// assert_eq!(backoff.delay(9), Duration::from_millis(80));
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LogBackoff {
    /// Size of a single slot. Zero means one second.
    pub slot: Duration,

    /// Maximum exponent of delay growth. Values below 1 act as 1.
    pub ceiling: u32,

    /// Fixed share of the delay, in `[0, 1]`. The rest is uniformly random.
    pub jitter_limit: f64,
}

impl LogBackoff {
    pub fn new(slot: Duration, ceiling: u32, jitter_limit: f64) -> Self {
        Self {
            slot,
            ceiling,
            jitter_limit,
        }
    }

    /// Preset for failures expected to clear within milliseconds
    pub fn fast() -> Self {
        Self::new(FAST_SLOT, DEFAULT_CEILING, 0.0)
    }

    /// Preset for overload conditions
    pub fn slow() -> Self {
        Self::new(SLOW_SLOT, DEFAULT_CEILING, 0.0)
    }

    /// Upper bound of [`delay`](Backoff::delay) for `attempt`
    pub fn max_delay(&self, attempt: usize) -> Duration {
        let slot = if self.slot.is_zero() {
            Duration::from_secs(1)
        } else {
            self.slot
        };
        let exponent = attempt.min(self.ceiling.clamp(1, 31) as usize) as u32;
        slot.saturating_mul(1u32 << exponent)
    }
}

impl Backoff for LogBackoff {
    fn delay(&self, attempt: usize) -> Duration {
        let delay = self.max_delay(attempt);
        let jitter_limit = self.jitter_limit.clamp(0.0, 1.0);
        if jitter_limit >= 1.0 {
            return delay;
        }

        let total = delay.as_nanos().min(u64::MAX as u128) as u64;
        let fixed = ((total as f64 * jitter_limit) as u64).min(total);
        Duration::from_nanos(fixed + rand::thread_rng().gen_range(0..=total - fixed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets() {
        let fast = LogBackoff::fast();
        assert_eq!(fast.slot, Duration::from_millis(5));
        assert_eq!(fast.ceiling, 6);

        let slow = LogBackoff::slow();
        assert_eq!(slow.slot, Duration::from_secs(1));
        assert_eq!(slow.max_delay(100), Duration::from_secs(64));
    }

    #[test]
    fn test_without_jitter_spread_delay_is_exact() {
        let backoff = LogBackoff::new(Duration::from_millis(1), 6, 1.0);
        let expected = [1, 2, 4, 8, 16, 32, 64, 64, 64];
        for (attempt, ms) in expected.iter().enumerate() {
            assert_eq!(backoff.delay(attempt), Duration::from_millis(*ms));
        }
    }

    #[test]
    fn test_max_delay_is_non_decreasing_and_bounded() {
        let backoff = LogBackoff::new(Duration::from_millis(3), 5, 0.0);
        let bound = Duration::from_millis(3) * 32;

        let mut previous = Duration::ZERO;
        for attempt in 0..20 {
            let max = backoff.max_delay(attempt);
            assert!(max >= previous);
            assert!(max <= bound);
            previous = max;
        }
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let backoff = LogBackoff::new(Duration::from_millis(10), 6, 0.5);
        for attempt in 0..10 {
            let max = backoff.max_delay(attempt);
            for _ in 0..50 {
                let delay = backoff.delay(attempt);
                assert!(delay >= max / 2, "{delay:?} below fixed part of {max:?}");
                assert!(delay <= max);
            }
        }
    }

    #[test]
    fn test_jitter_limit_is_clamped() {
        let backoff = LogBackoff::new(Duration::from_millis(2), 2, 7.0);
        assert_eq!(backoff.delay(1), Duration::from_millis(4));

        let backoff = LogBackoff::new(Duration::from_millis(2), 2, -3.0);
        assert!(backoff.delay(1) <= Duration::from_millis(4));
    }

    #[test]
    fn test_zero_ceiling_still_grows_once() {
        let backoff = LogBackoff::new(Duration::from_millis(1), 0, 1.0);
        assert_eq!(backoff.delay(0), Duration::from_millis(1));
        assert_eq!(backoff.delay(1), Duration::from_millis(2));
        assert_eq!(backoff.delay(5), Duration::from_millis(2));
    }

    #[test]
    fn test_zero_slot_defaults_to_one_second() {
        let backoff = LogBackoff::new(Duration::ZERO, 1, 1.0);
        assert_eq!(backoff.delay(0), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_wait_fires() {
        let backoff = LogBackoff::new(Duration::from_micros(10), 1, 1.0);
        backoff.wait(0).await;
    }
}
