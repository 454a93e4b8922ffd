//! Clock sources for the scheduler and sequencer.
//!
//! A [`Clock`] provides monotonic time and an absolute-deadline sleep.
//! Absolute deadlines keep the loop free of drift: the time spent in the
//! cycle work never shifts later deadlines.
//!
//! Two implementations are provided:
//!
//! - [`MonotonicClock`]: `CLOCK_MONOTONIC` with `clock_nanosleep(TIMER_ABSTIME)`
//!   on Linux, `std::thread::sleep` elsewhere.
//! - [`ManualClock`]: simulated time for deterministic tests.

use ecrt_common::time::Timestamp;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Result of one attempt to sleep until a deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepStatus {
    /// The deadline has been reached.
    Completed,
    /// A signal ended the sleep early.
    Interrupted {
        /// Nanoseconds left until the deadline.
        remaining_ns: u64,
    },
}

/// Monotonic time source with an absolute-deadline sleep.
pub trait Clock: Send + Sync {
    /// Sample the clock.
    fn now(&self) -> Timestamp;

    /// Sleep once towards `deadline`; may return early.
    ///
    /// Returns immediately with [`SleepStatus::Completed`] if the deadline
    /// has already passed.
    fn sleep_until_once(&self, deadline: Timestamp) -> SleepStatus;

    /// Sleep until `deadline`, retrying interrupted sleeps.
    fn sleep_until(&self, deadline: Timestamp) {
        while let SleepStatus::Interrupted { remaining_ns } = self.sleep_until_once(deadline) {
            trace!(remaining_ns, "Sleep interrupted, retrying");
        }
    }

    /// Called on each iteration of a busy-wait loop.
    fn spin_hint(&self) {
        std::hint::spin_loop();
    }
}

/// The system monotonic clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct MonotonicClock;

impl MonotonicClock {
    /// Create a handle to the system monotonic clock.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }

    #[cfg(target_os = "linux")]
    #[allow(unsafe_code)]
    fn sleep_until_once(&self, deadline: Timestamp) -> SleepStatus {
        #[allow(clippy::cast_possible_wrap)]
        let ts = libc::timespec {
            tv_sec: deadline.secs() as libc::time_t,
            tv_nsec: deadline.subsec_nanos() as libc::c_long,
        };

        // SAFETY: `ts` is a valid timespec for the duration of the call and
        // the remainder pointer may be null with TIMER_ABSTIME.
        let rc = unsafe {
            libc::clock_nanosleep(
                libc::CLOCK_MONOTONIC,
                libc::TIMER_ABSTIME,
                &ts,
                std::ptr::null_mut(),
            )
        };

        if rc == libc::EINTR {
            let remaining_ns = u64::try_from(deadline.diff_ns(self.now())).unwrap_or(0);
            SleepStatus::Interrupted { remaining_ns }
        } else {
            SleepStatus::Completed
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn sleep_until_once(&self, deadline: Timestamp) -> SleepStatus {
        let remaining = deadline.saturating_duration_since(self.now());
        if !remaining.is_zero() {
            std::thread::sleep(remaining);
        }
        SleepStatus::Completed
    }
}

#[derive(Debug, Default)]
struct ManualClockInner {
    now_ns: AtomicU64,
    step_ns: AtomicU64,
    pending_interrupts: AtomicU32,
    sleeps: AtomicU64,
}

/// Simulated clock for tests.
///
/// Time moves only when a sleep reaches its deadline, when [`advance`] is
/// called, or by a fixed step after every [`Clock::now`] sample. Clones
/// share the same time, so a test can drive or observe a worker thread.
///
/// [`advance`]: ManualClock::advance
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    inner: Arc<ManualClockInner>,
}

impl ManualClock {
    /// Create a clock reading `start`.
    #[must_use]
    pub fn new(start: Timestamp) -> Self {
        let clock = Self::default();
        clock.set(start);
        clock
    }

    /// Advance the clock by `step_ns` after every `now()` sample.
    ///
    /// Busy-wait loops need this to make progress.
    #[must_use]
    pub fn with_auto_advance(self, step_ns: u64) -> Self {
        self.inner.step_ns.store(step_ns, Ordering::Relaxed);
        self
    }

    /// Set the current time.
    pub fn set(&self, t: Timestamp) {
        self.inner.now_ns.store(t.as_nanos(), Ordering::Release);
    }

    /// Move the clock forward by `ns` nanoseconds.
    pub fn advance(&self, ns: u64) {
        self.inner.now_ns.fetch_add(ns, Ordering::AcqRel);
    }

    /// Current time without the auto-advance step.
    #[must_use]
    pub fn peek(&self) -> Timestamp {
        Timestamp::from_nanos(self.inner.now_ns.load(Ordering::Acquire))
    }

    /// Make the next `count` sleeps return [`SleepStatus::Interrupted`]
    /// halfway to their deadline.
    pub fn interrupt_next_sleeps(&self, count: u32) {
        self.inner.pending_interrupts.store(count, Ordering::Release);
    }

    /// Number of `sleep_until_once` calls that actually waited.
    #[must_use]
    pub fn sleep_count(&self) -> u64 {
        self.inner.sleeps.load(Ordering::Acquire)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        let step = self.inner.step_ns.load(Ordering::Relaxed);
        Timestamp::from_nanos(self.inner.now_ns.fetch_add(step, Ordering::AcqRel))
    }

    fn sleep_until_once(&self, deadline: Timestamp) -> SleepStatus {
        let now = self.inner.now_ns.load(Ordering::Acquire);
        let target = deadline.as_nanos();
        if target <= now {
            return SleepStatus::Completed;
        }
        self.inner.sleeps.fetch_add(1, Ordering::AcqRel);

        let interrupted = self
            .inner
            .pending_interrupts
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if interrupted {
            let halfway = now + (target - now) / 2;
            self.inner.now_ns.fetch_max(halfway, Ordering::AcqRel);
            return SleepStatus::Interrupted {
                remaining_ns: target - halfway,
            };
        }

        self.inner.now_ns.fetch_max(target, Ordering::AcqRel);
        SleepStatus::Completed
    }

    fn spin_hint(&self) {}
}
