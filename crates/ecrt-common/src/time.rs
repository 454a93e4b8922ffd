//! Nanosecond timestamps and deadline arithmetic.
//!
//! A [`Timestamp`] is a `(seconds, nanoseconds)` pair in the monotonic clock
//! domain. Seconds are 32 bits wide (about 136 years of uptime), which keeps
//! every signed difference between two timestamps inside an `i64`.
//!
//! All arithmetic is pure and panic-free: additions saturate at
//! [`Timestamp::MAX`], subtractions clamp at [`Timestamp::ZERO`].

use std::fmt;
use std::time::Duration;

/// Nanoseconds per second.
pub const NSEC_PER_SEC: u64 = 1_000_000_000;
/// Nanoseconds per millisecond.
pub const NSEC_PER_MSEC: u64 = 1_000_000;
/// Nanoseconds per microsecond.
pub const NSEC_PER_USEC: u64 = 1_000;

const NSEC_PER_SEC_U32: u32 = 1_000_000_000;
const NSEC_PER_SEC_I64: i64 = 1_000_000_000;
const SEC_PER_MIN: u32 = 60;
const SEC_PER_HR: u32 = 60 * SEC_PER_MIN;
const SEC_PER_DAY: u32 = 24 * SEC_PER_HR;

/// Absolute or relative point in time with nanosecond resolution.
///
/// The nanosecond field is always normalized into `[0, 1e9)`, so the derived
/// ordering on `(secs, nanos)` is chronological.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, serde::Serialize)]
pub struct Timestamp {
    secs: u32,
    nanos: u32,
}

impl Timestamp {
    /// The zero timestamp; also the clamp value for underflowing subtraction.
    pub const ZERO: Self = Self { secs: 0, nanos: 0 };

    /// Largest representable timestamp; additions saturate here.
    pub const MAX: Self = Self {
        secs: u32::MAX,
        nanos: NSEC_PER_SEC_U32 - 1,
    };

    /// Last instant of the final whole day a signed 32-bit seconds counter can hold.
    pub const UPTIME_WRAP_SIGNED: Self = Self::from_dhms(24_854, 23, 59, 59, 999_999_999);

    /// Last instant of the final whole day an unsigned 32-bit seconds counter can hold.
    pub const UPTIME_WRAP_UNSIGNED: Self = Self::from_dhms(49_709, 23, 59, 59, 999_999_999);

    /// Create a timestamp, carrying excess nanoseconds into the seconds field.
    #[must_use]
    pub const fn new(secs: u32, nanos: u32) -> Self {
        let carry = nanos / NSEC_PER_SEC_U32;
        Self {
            secs: secs.saturating_add(carry),
            nanos: nanos % NSEC_PER_SEC_U32,
        }
    }

    /// Build a timestamp from days, hours, minutes, seconds and nanoseconds
    /// since clock start. Mostly used for test fixtures and sequence files.
    #[must_use]
    pub const fn from_dhms(day: u32, hr: u32, min: u32, sec: u32, ns: u32) -> Self {
        let secs = day
            .saturating_mul(SEC_PER_DAY)
            .saturating_add(hr.saturating_mul(SEC_PER_HR))
            .saturating_add(min.saturating_mul(SEC_PER_MIN))
            .saturating_add(sec);
        Self::new(secs, ns)
    }

    /// Build a timestamp from a nanosecond count, saturating at [`Self::MAX`].
    #[must_use]
    pub fn from_nanos(nanos: u64) -> Self {
        match u32::try_from(nanos / NSEC_PER_SEC) {
            // Remainder is always below 1e9.
            Ok(secs) => Self {
                secs,
                nanos: (nanos % NSEC_PER_SEC) as u32,
            },
            Err(_) => Self::MAX,
        }
    }

    /// Sample the monotonic system clock.
    #[must_use]
    pub fn now() -> Self {
        #[cfg(unix)]
        {
            use nix::time::{clock_gettime, ClockId};

            // CLOCK_MONOTONIC cannot fail with a valid clock id; a zero
            // sample surfaces downstream as a clock anomaly.
            clock_gettime(ClockId::CLOCK_MONOTONIC).map_or(Self::ZERO, |ts| {
                Self::new(
                    u32::try_from(ts.tv_sec()).unwrap_or(u32::MAX),
                    u32::try_from(ts.tv_nsec()).unwrap_or(0),
                )
            })
        }

        #[cfg(not(unix))]
        {
            use std::sync::OnceLock;
            use std::time::Instant;

            static EPOCH: OnceLock<Instant> = OnceLock::new();
            Self::from(EPOCH.get_or_init(Instant::now).elapsed())
        }
    }

    /// Whole seconds.
    #[must_use]
    pub const fn secs(&self) -> u32 {
        self.secs
    }

    /// Sub-second nanoseconds, always below one billion.
    #[must_use]
    pub const fn subsec_nanos(&self) -> u32 {
        self.nanos
    }

    /// Total nanoseconds. Always fits: `u32::MAX` seconds is about 4.3e18 ns.
    #[must_use]
    pub const fn as_nanos(&self) -> u64 {
        self.secs as u64 * NSEC_PER_SEC + self.nanos as u64
    }

    /// Returns true for the zero timestamp.
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.secs == 0 && self.nanos == 0
    }

    /// Add `secs` seconds and `nanos` nanoseconds, saturating at [`Self::MAX`].
    #[must_use]
    pub fn add(self, secs: u32, nanos: u64) -> Self {
        let total = u128::from(self.as_nanos())
            + u128::from(secs) * u128::from(NSEC_PER_SEC)
            + u128::from(nanos);
        u64::try_from(total).map_or(Self::MAX, Self::from_nanos)
    }

    /// Subtract `secs` seconds and `nanos` nanoseconds.
    ///
    /// If the subtrahend is greater than or equal to `self`, the result is
    /// [`Self::ZERO`]; a timestamp never goes negative.
    #[must_use]
    pub fn sub(self, secs: u32, nanos: u64) -> Self {
        let minuend = u128::from(self.as_nanos());
        let subtrahend = u128::from(secs) * u128::from(NSEC_PER_SEC) + u128::from(nanos);
        if subtrahend >= minuend {
            return Self::ZERO;
        }
        // The difference is below `minuend`, which fits in u64.
        u64::try_from(minuend - subtrahend).map_or(Self::ZERO, Self::from_nanos)
    }

    /// Add a [`Duration`], saturating at [`Self::MAX`].
    #[must_use]
    pub fn add_duration(self, duration: Duration) -> Self {
        let secs = u32::try_from(duration.as_secs()).unwrap_or(u32::MAX);
        self.add(secs, u64::from(duration.subsec_nanos()))
    }

    /// Subtract another timestamp, clamping at zero.
    #[must_use]
    pub fn sub_timestamp(self, other: Self) -> Self {
        self.sub(other.secs, u64::from(other.nanos))
    }

    /// Signed difference `self - other` in nanoseconds.
    ///
    /// Positive when `self` is later than `other`. The seconds and
    /// nanoseconds deltas are reconciled by borrowing across the seconds
    /// boundary so that both carry the same sign before they are combined.
    #[must_use]
    pub fn diff_ns(self, other: Self) -> i64 {
        let mut dt_sec = i64::from(self.secs) - i64::from(other.secs);
        let mut dt_ns = i64::from(self.nanos) - i64::from(other.nanos);

        if dt_sec > 0 && dt_ns < 0 {
            dt_sec -= 1;
            dt_ns += NSEC_PER_SEC_I64;
        } else if dt_sec < 0 && dt_ns > 0 {
            dt_sec += 1;
            dt_ns -= NSEC_PER_SEC_I64;
        }

        // |dt_sec| <= u32::MAX, so the product stays below 4.3e18.
        dt_sec * NSEC_PER_SEC_I64 + dt_ns
    }

    /// Time elapsed from `earlier` to `self`, or zero if `earlier` is later.
    #[must_use]
    pub fn saturating_duration_since(self, earlier: Self) -> Duration {
        Duration::from_nanos(u64::try_from(self.diff_ns(earlier)).unwrap_or(0))
    }

    /// Value in seconds as a float, e.g. `1.000000501`.
    #[must_use]
    pub fn as_secs_f64(&self) -> f64 {
        f64::from(self.secs) + f64::from(self.nanos) / 1e9
    }

    /// Convert to a [`Duration`] measured from the clock origin.
    #[must_use]
    pub fn to_duration(self) -> Duration {
        Duration::new(u64::from(self.secs), self.nanos)
    }
}

impl From<Duration> for Timestamp {
    fn from(duration: Duration) -> Self {
        Self::ZERO.add_duration(duration)
    }
}

impl fmt::Display for Timestamp {
    /// Formats as `"{days}d HH:MM:SS.nnnnnnnnn"`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let day = self.secs / SEC_PER_DAY;
        let rem = self.secs % SEC_PER_DAY;
        let hr = rem / SEC_PER_HR;
        let min = (rem % SEC_PER_HR) / SEC_PER_MIN;
        let sec = rem % SEC_PER_MIN;
        write!(
            f,
            "{day}d {hr:02}:{min:02}:{sec:02}.{:09}",
            self.nanos
        )
    }
}
