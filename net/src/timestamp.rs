//! Monotonic microsecond timestamps.

use std::fmt;
use std::ops::Add;
use std::time::Duration;

const MICROS_PER_SECOND: i64 = 1_000_000;

/// A monotonic instant with microsecond resolution.
///
/// Reads `CLOCK_MONOTONIC`, so values are unaffected by wall-clock
/// adjustments and totally ordered within a process. The zero value is the
/// invalid sentinel and never compares equal to a real instant.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp {
    micros: i64,
}

impl Timestamp {
    /// The current monotonic instant.
    pub fn now() -> Self {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
        debug_assert_eq!(rc, 0, "clock_gettime(CLOCK_MONOTONIC) failed");
        Self {
            micros: ts.tv_sec * MICROS_PER_SECOND + ts.tv_nsec / 1_000,
        }
    }

    /// The invalid sentinel instant.
    pub const fn invalid() -> Self {
        Self { micros: 0 }
    }

    pub const fn from_micros(micros: i64) -> Self {
        Self { micros }
    }

    pub const fn micros(self) -> i64 {
        self.micros
    }

    pub const fn is_valid(self) -> bool {
        self.micros > 0
    }

    /// Microseconds from `self` until `later`; negative if `later` precedes it.
    pub const fn micros_until(self, later: Timestamp) -> i64 {
        later.micros - self.micros
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Timestamp {
        Timestamp {
            micros: self.micros + rhs.as_micros() as i64,
        }
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{:06}s",
            self.micros / MICROS_PER_SECOND,
            self.micros % MICROS_PER_SECOND
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn now_is_monotonic() {
        let a = Timestamp::now();
        let b = Timestamp::now();
        assert!(a <= b);
        assert!(a.is_valid());
    }

    #[test]
    fn invalid_never_equals_now() {
        assert!(!Timestamp::invalid().is_valid());
        assert_ne!(Timestamp::invalid(), Timestamp::now());
    }

    #[test]
    fn ordering_tracks_offsets() {
        let a = Timestamp::from_micros(1_000);
        let b = a + Duration::from_millis(5);
        assert!(a < b);
        assert_eq!(a.micros_until(b), 5_000);
        assert_eq!(b.micros_until(a), -5_000);
    }
}
