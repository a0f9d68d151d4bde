//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Clock types for packet timing. Subtracting one time from another never panics here:
//! packets arrive out of order, so "earlier" times are routinely later.

use std::{
    fmt,
    ops::{Add, AddAssign, Div, Mul, Sub},
};

/// Monotonic time. Use [`Instant::saturating_duration_since`] instead of subtraction.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Instant(std::time::Instant);

/// Wall clock time, for NTP timestamps in sender reports.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SystemTime(std::time::SystemTime);

/// A span of time with a saturating difference.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Duration(std::time::Duration);

macro_rules! wrap_std {
    ($wrapper:ident, $std:ty) => {
        impl From<$std> for $wrapper {
            fn from(inner: $std) -> Self {
                Self(inner)
            }
        }

        impl From<$wrapper> for $std {
            fn from(wrapper: $wrapper) -> Self {
                wrapper.0
            }
        }

        impl fmt::Debug for $wrapper {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl Add<Duration> for $wrapper {
            type Output = Self;

            fn add(self, rhs: Duration) -> Self {
                Self(self.0 + rhs.0)
            }
        }

        impl AddAssign<Duration> for $wrapper {
            fn add_assign(&mut self, rhs: Duration) {
                self.0 += rhs.0
            }
        }
    };
}

wrap_std!(Instant, std::time::Instant);
wrap_std!(SystemTime, std::time::SystemTime);
wrap_std!(Duration, std::time::Duration);

impl Instant {
    pub fn now() -> Self {
        Self(std::time::Instant::now())
    }

    pub fn saturating_duration_since(&self, earlier: Instant) -> Duration {
        Duration(self.0.saturating_duration_since(earlier.0))
    }
}

// Panics if it would go before the clock's origin, which only happens for bogus durations.
impl Sub<Duration> for Instant {
    type Output = Self;

    fn sub(self, rhs: Duration) -> Self {
        Self(self.0 - rhs.0)
    }
}

impl SystemTime {
    pub const UNIX_EPOCH: SystemTime = SystemTime(std::time::SystemTime::UNIX_EPOCH);

    pub fn now() -> Self {
        Self(std::time::SystemTime::now())
    }

    pub fn saturating_duration_since(&self, earlier: SystemTime) -> Duration {
        self.0
            .duration_since(earlier.0)
            .map_or(Duration::ZERO, Duration)
    }
}

impl Sub<Duration> for SystemTime {
    type Output = Self;

    fn sub(self, rhs: Duration) -> Self {
        Self(self.0 - rhs.0)
    }
}

impl Duration {
    pub const ZERO: Duration = Duration::from_secs(0);
    pub const MILLISECOND: Duration = Duration::from_millis(1);
    pub const SECOND: Duration = Duration::from_secs(1);

    pub const fn from_secs(secs: u64) -> Self {
        Self(std::time::Duration::from_secs(secs))
    }

    pub const fn from_millis(millis: u64) -> Self {
        Self(std::time::Duration::from_millis(millis))
    }

    pub const fn from_micros(micros: u64) -> Self {
        Self(std::time::Duration::from_micros(micros))
    }

    pub const fn from_nanos(nanos: u64) -> Self {
        Self(std::time::Duration::from_nanos(nanos))
    }

    pub const fn as_secs(&self) -> u64 {
        self.0.as_secs()
    }

    pub const fn as_millis(&self) -> u128 {
        self.0.as_millis()
    }

    pub const fn as_micros(&self) -> u128 {
        self.0.as_micros()
    }

    pub const fn as_nanos(&self) -> u128 {
        self.0.as_nanos()
    }

    pub const fn subsec_micros(&self) -> u32 {
        self.0.subsec_micros()
    }

    pub fn checked_sub(&self, rhs: Duration) -> Option<Self> {
        self.0.checked_sub(rhs.0).map(Self)
    }

    pub fn saturating_sub(&self, rhs: Duration) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }
}

impl Mul<u32> for Duration {
    type Output = Self;

    fn mul(self, rhs: u32) -> Self {
        Self(self.0 * rhs)
    }
}

impl Div<u32> for Duration {
    type Output = Self;

    fn div(self, rhs: u32) -> Self {
        Self(self.0 / rhs)
    }
}
