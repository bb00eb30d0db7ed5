//! Tick-based time: a signed span and a monotonic time point.
//!
//! One tick is `1 / TICKS_PER_SECOND` seconds, 1 ms by default. The time
//! point is 64 bit so it never wraps within the lifetime of a device.

use core::ops::{Add, AddAssign, Neg, Sub, SubAssign};

use crate::config::TICKS_PER_SECOND;

/// A span of time, counted in scheduler ticks.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct Duration(i32);

impl Duration {
    /// The empty span.
    pub const ZERO: Duration = Duration(0);

    /// Builds a `Duration` from a raw tick count.
    pub const fn from_ticks(ticks: i32) -> Duration {
        Duration(ticks)
    }

    /// Builds a `Duration` from milliseconds.
    pub const fn from_millis(millis: i32) -> Duration {
        Duration(millis * (TICKS_PER_SECOND / 1_000) as i32)
    }

    /// Builds a `Duration` from seconds.
    pub const fn from_secs(secs: i32) -> Duration {
        Duration(secs * TICKS_PER_SECOND as i32)
    }

    /// The raw tick count.
    pub const fn ticks(self) -> i32 {
        self.0
    }
}

impl Add for Duration {
    type Output = Duration;
    fn add(self, other: Duration) -> Duration {
        Duration(self.0 + other.0)
    }
}

impl Sub for Duration {
    type Output = Duration;
    fn sub(self, other: Duration) -> Duration {
        Duration(self.0 - other.0)
    }
}

impl Neg for Duration {
    type Output = Duration;
    fn neg(self) -> Duration {
        Duration(-self.0)
    }
}

/// A point in time, counted in scheduler ticks since [`STARTUP`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct Instant(i64);

impl Instant {
    /// Builds an `Instant` from a raw tick count.
    pub const fn from_ticks(ticks: i64) -> Instant {
        Instant(ticks)
    }

    /// The raw tick count.
    pub const fn ticks(self) -> i64 {
        self.0
    }
}

/// The time reference taken when the scheduler starts.
pub const STARTUP: Instant = Instant::from_ticks(0);

impl Add<Duration> for Instant {
    type Output = Instant;
    fn add(self, span: Duration) -> Instant {
        Instant(self.0 + span.ticks() as i64)
    }
}

impl AddAssign<Duration> for Instant {
    fn add_assign(&mut self, span: Duration) {
        self.0 += span.ticks() as i64;
    }
}

impl Sub<Duration> for Instant {
    type Output = Instant;
    fn sub(self, span: Duration) -> Instant {
        Instant(self.0 - span.ticks() as i64)
    }
}

impl SubAssign<Duration> for Instant {
    fn sub_assign(&mut self, span: Duration) {
        self.0 -= span.ticks() as i64;
    }
}

impl Sub for Instant {
    type Output = Duration;
    fn sub(self, earlier: Instant) -> Duration {
        Duration::from_ticks((self.0 - earlier.0) as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arithmetic() {
        let t = STARTUP + Duration::from_millis(10);
        assert_eq!(t.ticks(), 10);
        assert_eq!(t - STARTUP, Duration::from_ticks(10));
        assert_eq!(t - Duration::from_ticks(3), Instant::from_ticks(7));
        assert_eq!(Duration::from_secs(1), Duration::from_ticks(1_000));
    }

    #[test]
    fn ordering() {
        assert!(STARTUP < STARTUP + Duration::from_ticks(1));
        assert!(Duration::from_ticks(-1) < Duration::ZERO);
        let mut t = STARTUP;
        t += Duration::from_ticks(5);
        t -= Duration::from_ticks(2);
        assert_eq!(t.ticks(), 3);
    }
}
