//! Monotonic clock with an explicitly invalidated cache.
//!
//! Readers call [`Clock::now`] as often as they like; the value only moves
//! when someone calls [`Clock::invalidate`] (normally once per scheduling
//! pass). A manual clock is available for deterministic tests.

use std::ops::{Add, Sub};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// A point in time, in microseconds since the owning clock was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClockTime(u64);

impl ClockTime {
    /// The clock origin.
    pub const ZERO: Self = Self(0);

    /// Create a time from microseconds since the origin.
    pub fn from_micros(micros: u64) -> Self {
        Self(micros)
    }

    /// Microseconds since the origin.
    pub fn as_micros(self) -> u64 {
        self.0
    }

    /// Whole seconds since the origin.
    pub fn as_secs(self) -> u64 {
        self.0 / 1_000_000
    }

    /// Time elapsed from `earlier` to `self`, zero if `earlier` is later.
    pub fn saturating_since(self, earlier: ClockTime) -> Duration {
        Duration::from_micros(self.0.saturating_sub(earlier.0))
    }
}

impl Add<Duration> for ClockTime {
    type Output = ClockTime;

    fn add(self, rhs: Duration) -> ClockTime {
        let micros = u64::try_from(rhs.as_micros()).unwrap_or(u64::MAX);
        ClockTime(self.0.saturating_add(micros))
    }
}

impl Sub<ClockTime> for ClockTime {
    type Output = Duration;

    fn sub(self, rhs: ClockTime) -> Duration {
        self.saturating_since(rhs)
    }
}

#[derive(Debug)]
enum Source {
    System(Instant),
    Manual(AtomicU64),
}

/// Cached monotonic clock.
#[derive(Debug)]
pub struct Clock {
    source: Source,
    cached: AtomicU64,
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock {
    /// Create a clock backed by the system monotonic clock.
    pub fn new() -> Self {
        Self {
            source: Source::System(Instant::now()),
            cached: AtomicU64::new(0),
        }
    }

    /// Create a clock that only moves through [`Clock::advance`].
    pub fn manual() -> Self {
        Self {
            source: Source::Manual(AtomicU64::new(0)),
            cached: AtomicU64::new(0),
        }
    }

    /// Cached current time.
    pub fn now(&self) -> ClockTime {
        ClockTime(self.cached.load(Ordering::Acquire))
    }

    /// Re-read the underlying source. The cached value never moves backward.
    pub fn invalidate(&self) -> ClockTime {
        let fresh = match &self.source {
            Source::System(origin) => u64::try_from(origin.elapsed().as_micros()).unwrap_or(u64::MAX),
            Source::Manual(now) => now.load(Ordering::Acquire),
        };
        let previous = self.cached.fetch_max(fresh, Ordering::AcqRel);
        ClockTime(previous.max(fresh))
    }

    /// Move a manual clock forward and refresh the cache.
    ///
    /// Has no effect on a system clock beyond the refresh.
    pub fn advance(&self, by: Duration) -> ClockTime {
        if let Source::Manual(now) = &self.source {
            let micros = u64::try_from(by.as_micros()).unwrap_or(u64::MAX);
            now.fetch_add(micros, Ordering::AcqRel);
        }
        self.invalidate()
    }

    /// Whether this clock is driven manually.
    pub fn is_manual(&self) -> bool {
        matches!(self.source, Source::Manual(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cached_until_invalidated() {
        let clock = Clock::manual();
        assert_eq!(clock.now(), ClockTime::ZERO);

        if let Source::Manual(now) = &clock.source {
            now.store(5_000, Ordering::Release);
        }
        assert_eq!(clock.now(), ClockTime::ZERO);
        assert_eq!(clock.invalidate(), ClockTime::from_micros(5_000));
        assert_eq!(clock.now(), ClockTime::from_micros(5_000));
    }

    #[test]
    fn test_advance() {
        let clock = Clock::manual();
        clock.advance(Duration::from_millis(250));
        assert_eq!(clock.now().as_micros(), 250_000);
        clock.advance(Duration::from_secs(2));
        assert_eq!(clock.now().as_secs(), 2);
    }

    #[test]
    fn test_system_clock_monotonic() {
        let clock = Clock::new();
        let a = clock.invalidate();
        let b = clock.invalidate();
        assert!(b >= a);
        assert!(!clock.is_manual());
    }

    #[test]
    fn test_time_arithmetic() {
        let t = ClockTime::from_micros(1_000);
        let later = t + Duration::from_millis(3);
        assert_eq!(later.as_micros(), 4_000);
        assert_eq!(later - t, Duration::from_millis(3));
        assert_eq!(t - later, Duration::ZERO);
    }
}
