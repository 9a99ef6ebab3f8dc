//! Resync rate limiting.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Decides whether a resync pass may run, given the last completed pass.
///
/// Holds no state of its own; the last-sync timestamp is read from the
/// queue store by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimiter {
    min_interval: Duration,
    disabled: bool,
}

impl RateLimiter {
    #[must_use]
    pub const fn new(min_interval: Duration, disabled: bool) -> Self {
        Self {
            min_interval,
            disabled,
        }
    }

    /// A limiter that always allows.
    #[must_use]
    pub const fn unlimited() -> Self {
        Self::new(Duration::ZERO, false)
    }

    #[must_use]
    pub const fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Returns true when a pass may start at `now`.
    #[must_use]
    pub fn allowed(&self, last_sync_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        if self.disabled {
            return false;
        }
        if self.min_interval.is_zero() {
            return true;
        }
        let Some(last) = last_sync_at else {
            return true;
        };
        // A cursor in the future (clock moved backwards) counts as elapsed.
        let Ok(elapsed) = (now - last).to_std() else {
            return true;
        };
        elapsed >= self.min_interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(secs: u64) -> RateLimiter {
        RateLimiter::new(Duration::from_secs(secs), false)
    }

    #[test]
    fn denies_inside_window() {
        let now = Utc::now();
        assert!(!limiter(10).allowed(Some(now - chrono::Duration::seconds(5)), now));
    }

    #[test]
    fn allows_after_window() {
        let now = Utc::now();
        assert!(limiter(10).allowed(Some(now - chrono::Duration::seconds(15)), now));
        assert!(limiter(10).allowed(Some(now - chrono::Duration::seconds(10)), now));
    }

    #[test]
    fn allows_without_cursor() {
        assert!(limiter(10).allowed(None, Utc::now()));
    }

    #[test]
    fn zero_interval_always_allows() {
        let now = Utc::now();
        assert!(limiter(0).allowed(Some(now), now));
        assert!(RateLimiter::unlimited().allowed(Some(now), now));
    }

    #[test]
    fn disabled_never_allows() {
        let limiter = RateLimiter::new(Duration::from_secs(10), true);
        assert!(!limiter.allowed(None, Utc::now()));
    }

    #[test]
    fn cursor_in_future_allows() {
        let now = Utc::now();
        assert!(limiter(10).allowed(Some(now + chrono::Duration::seconds(60)), now));
    }
}
