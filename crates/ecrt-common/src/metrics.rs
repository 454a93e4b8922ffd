//! Cycle statistics for jitter and overrun monitoring.
//!
//! Counters are updated once per cycle by the scheduler thread without
//! allocation. Reporting threads read a [`StatsSnapshot`], which can be
//! flattened into a fixed array of words for lock-free publication.

use std::time::Duration;

/// Running statistics of a cyclic loop.
#[derive(Debug, Clone)]
pub struct CycleStats {
    /// Total cycles executed.
    total_cycles: u64,
    /// Cycles whose work reported failure.
    overrun_count: u64,
    /// Cycles whose work reported success.
    cycles_without_errors: u64,
    /// Current run of consecutive failed cycles.
    current_streak: u32,
    /// Longest run of consecutive failed cycles.
    max_streak: u32,
    /// Minimum inter-cycle delta in nanoseconds.
    min_delta_ns: u64,
    /// Maximum inter-cycle delta in nanoseconds.
    max_delta_ns: u64,
    /// Sum of folded deltas.
    delta_sum_ns: u128,
    /// Number of folded deltas.
    delta_samples: u64,
    /// Negative deltas observed (never folded).
    clock_anomalies: u64,
    /// Wakeups later than their deadline by more than one period.
    late_wakeups: u64,
    /// Configured period in nanoseconds.
    period_ns: u64,
    /// Streak length that escalates an overrun.
    overrun_threshold: u32,
}

/// What a single [`CycleStats::record_cycle`] call observed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleOutcome {
    /// The work reported success.
    pub ok: bool,
    /// The failure streak reached the overrun threshold on this cycle.
    pub threshold_reached: bool,
    /// Negative delta observed on this cycle, if any.
    pub clock_anomaly: Option<i64>,
    /// The wakeup trailed its deadline by more than one period.
    pub late_wakeup: bool,
}

impl CycleStats {
    /// Create empty statistics for a loop with the given period.
    #[must_use]
    pub fn new(period: Duration, overrun_threshold: u32) -> Self {
        Self {
            total_cycles: 0,
            overrun_count: 0,
            cycles_without_errors: 0,
            current_streak: 0,
            max_streak: 0,
            min_delta_ns: u64::MAX,
            max_delta_ns: 0,
            delta_sum_ns: 0,
            delta_samples: 0,
            clock_anomalies: 0,
            late_wakeups: 0,
            period_ns: u64::try_from(period.as_nanos()).unwrap_or(u64::MAX),
            overrun_threshold: overrun_threshold.max(1),
        }
    }

    /// Fold one cycle into the statistics.
    ///
    /// * `ok` - success reported by the cycle work.
    /// * `delta_ns` - signed time between this cycle's wakeup and the previous one.
    /// * `lateness_ns` - signed time between this cycle's wakeup and its deadline.
    pub fn record_cycle(&mut self, ok: bool, delta_ns: i64, lateness_ns: i64) -> CycleOutcome {
        self.total_cycles += 1;

        let mut threshold_reached = false;
        if ok {
            self.cycles_without_errors += 1;
            self.current_streak = 0;
        } else {
            self.overrun_count += 1;
            self.current_streak = self.current_streak.saturating_add(1);
            self.max_streak = self.max_streak.max(self.current_streak);
            threshold_reached = self.current_streak == self.overrun_threshold;
        }

        let clock_anomaly = if let Ok(delta) = u64::try_from(delta_ns) {
            self.min_delta_ns = self.min_delta_ns.min(delta);
            self.max_delta_ns = self.max_delta_ns.max(delta);
            self.delta_sum_ns += u128::from(delta);
            self.delta_samples += 1;
            None
        } else {
            self.clock_anomalies += 1;
            Some(delta_ns)
        };

        let late_wakeup = u64::try_from(lateness_ns).is_ok_and(|late| late > self.period_ns);
        if late_wakeup {
            self.late_wakeups += 1;
        }

        CycleOutcome {
            ok,
            threshold_reached,
            clock_anomaly,
            late_wakeup,
        }
    }

    /// Get total number of cycles executed.
    #[must_use]
    pub fn total_cycles(&self) -> u64 {
        self.total_cycles
    }

    /// Get number of failed cycles.
    #[must_use]
    pub fn overrun_count(&self) -> u64 {
        self.overrun_count
    }

    /// Get the current run of consecutive failed cycles.
    #[must_use]
    pub fn current_streak(&self) -> u32 {
        self.current_streak
    }

    /// Get the longest run of consecutive failed cycles.
    #[must_use]
    pub fn max_streak(&self) -> u32 {
        self.max_streak
    }

    /// Get the configured overrun threshold.
    #[must_use]
    pub fn overrun_threshold(&self) -> u32 {
        self.overrun_threshold
    }

    /// Get a snapshot of current statistics.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        let has_samples = self.delta_samples > 0;
        let avg = if has_samples {
            u64::try_from(self.delta_sum_ns / u128::from(self.delta_samples)).ok()
        } else {
            None
        };
        StatsSnapshot {
            total_cycles: self.total_cycles,
            overrun_count: self.overrun_count,
            cycles_without_errors: self.cycles_without_errors,
            current_overrun_streak: self.current_streak,
            max_overrun_streak: self.max_streak,
            min_delta_ns: has_samples.then_some(self.min_delta_ns),
            max_delta_ns: has_samples.then_some(self.max_delta_ns),
            avg_delta_ns: avg,
            delta_samples: self.delta_samples,
            clock_anomalies: self.clock_anomalies,
            late_wakeups: self.late_wakeups,
            period_ns: self.period_ns,
        }
    }

    /// Reset all counters, keeping period and threshold.
    pub fn reset(&mut self) {
        *self = Self::new(Duration::from_nanos(self.period_ns), self.overrun_threshold);
    }
}

/// Immutable snapshot of cycle statistics for reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct StatsSnapshot {
    /// Total cycles executed.
    pub total_cycles: u64,
    /// Cycles whose work reported failure.
    pub overrun_count: u64,
    /// Cycles whose work reported success.
    pub cycles_without_errors: u64,
    /// Current run of consecutive failed cycles.
    pub current_overrun_streak: u32,
    /// Longest run of consecutive failed cycles.
    pub max_overrun_streak: u32,
    /// Minimum inter-cycle delta in nanoseconds.
    pub min_delta_ns: Option<u64>,
    /// Maximum inter-cycle delta in nanoseconds.
    pub max_delta_ns: Option<u64>,
    /// Average inter-cycle delta in nanoseconds.
    pub avg_delta_ns: Option<u64>,
    /// Number of deltas folded into min/max/average.
    pub delta_samples: u64,
    /// Negative deltas observed.
    pub clock_anomalies: u64,
    /// Wakeups later than their deadline by more than one period.
    pub late_wakeups: u64,
    /// Configured period in nanoseconds.
    pub period_ns: u64,
}

/// Number of words in the flattened form of a [`StatsSnapshot`].
pub const SNAPSHOT_WORDS: usize = 11;

const NONE_WORD: u64 = u64::MAX;

impl StatsSnapshot {
    /// Get jitter (max - min) in nanoseconds.
    #[must_use]
    pub fn jitter_ns(&self) -> Option<u64> {
        match (self.min_delta_ns, self.max_delta_ns) {
            (Some(min), Some(max)) => Some(max - min),
            _ => None,
        }
    }

    /// Largest absolute deviation of a delta from the period.
    #[must_use]
    pub fn max_deviation_ns(&self) -> Option<u64> {
        match (self.min_delta_ns, self.max_delta_ns) {
            (Some(min), Some(max)) => Some(
                self.period_ns
                    .abs_diff(min)
                    .max(self.period_ns.abs_diff(max)),
            ),
            _ => None,
        }
    }

    /// Flatten into words for publication through a seqlock.
    #[must_use]
    pub fn to_words(&self) -> [u64; SNAPSHOT_WORDS] {
        [
            self.total_cycles,
            self.overrun_count,
            self.cycles_without_errors,
            (u64::from(self.current_overrun_streak) << 32) | u64::from(self.max_overrun_streak),
            self.min_delta_ns.unwrap_or(NONE_WORD),
            self.max_delta_ns.unwrap_or(NONE_WORD),
            self.avg_delta_ns.unwrap_or(NONE_WORD),
            self.delta_samples,
            self.clock_anomalies,
            self.late_wakeups,
            self.period_ns,
        ]
    }

    /// Rebuild a snapshot from [`Self::to_words`] output.
    #[must_use]
    pub fn from_words(words: &[u64; SNAPSHOT_WORDS]) -> Self {
        let opt = |w: u64| (w != NONE_WORD).then_some(w);
        #[allow(clippy::cast_possible_truncation)]
        Self {
            total_cycles: words[0],
            overrun_count: words[1],
            cycles_without_errors: words[2],
            current_overrun_streak: (words[3] >> 32) as u32,
            max_overrun_streak: words[3] as u32,
            min_delta_ns: opt(words[4]),
            max_delta_ns: opt(words[5]),
            avg_delta_ns: opt(words[6]),
            delta_samples: words[7],
            clock_anomalies: words[8],
            late_wakeups: words[9],
            period_ns: words[10],
        }
    }
}
