//! Per-item bookkeeping and idle-staleness eviction

use std::time::{Duration, Instant};

use crate::clock::Clock;

/// Idle-staleness policy for pooled items
///
/// # Examples
///
/// ```
/// use sessionpool::IdleThreshold;
/// use std::time::Duration;
///
/// assert_eq!(IdleThreshold::from(Duration::ZERO), IdleThreshold::Disabled);
/// assert_eq!(
///     IdleThreshold::from(Duration::from_secs(300)),
///     IdleThreshold::After(Duration::from_secs(300))
/// );
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IdleThreshold {
    /// Idle items never go stale
    #[default]
    Disabled,

    /// Items idle for longer than this are closed instead of handed out
    After(Duration),
}

impl From<Duration> for IdleThreshold {
    fn from(threshold: Duration) -> Self {
        if threshold.is_zero() {
            IdleThreshold::Disabled
        } else {
            IdleThreshold::After(threshold)
        }
    }
}

impl IdleThreshold {
    pub fn is_stale(&self, touched: Instant, clock: &dyn Clock) -> bool {
        match self {
            IdleThreshold::Disabled => false,
            IdleThreshold::After(threshold) => clock.since(touched) > *threshold,
        }
    }
}

/// Metadata the pool keeps for every live item
#[derive(Debug, Clone, Copy)]
pub(crate) struct ItemInfo {
    pub idle: bool,
    pub touched: Instant,
}

impl ItemInfo {
    /// A freshly created item, owned by whoever asked for it
    pub fn busy(now: Instant) -> Self {
        Self {
            idle: false,
            touched: now,
        }
    }

    pub fn make_idle(&mut self, now: Instant) {
        self.idle = true;
        self.touched = now;
    }

    pub fn make_busy(&mut self) {
        self.idle = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn test_disabled_never_stale() {
        let clock = ManualClock::new();
        let touched = clock.now();
        clock.advance(Duration::from_secs(86400));
        assert!(!IdleThreshold::Disabled.is_stale(touched, &clock));
    }

    #[test]
    fn test_stale_only_past_threshold() {
        let clock = ManualClock::new();
        let policy = IdleThreshold::After(Duration::from_secs(10));
        let touched = clock.now();

        clock.advance(Duration::from_secs(10));
        assert!(!policy.is_stale(touched, &clock));

        clock.advance(Duration::from_millis(1));
        assert!(policy.is_stale(touched, &clock));
    }

    #[test]
    fn test_item_info_transitions() {
        let clock = ManualClock::new();
        let mut info = ItemInfo::busy(clock.now());
        assert!(!info.idle);

        clock.advance(Duration::from_secs(5));
        info.make_idle(clock.now());
        assert!(info.idle);
        assert_eq!(info.touched, clock.now());

        info.make_busy();
        assert!(!info.idle);
    }
}
