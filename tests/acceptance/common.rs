//! Common utilities for acceptance tests.
//!
//! Provides helpers for:
//! - Checking real-time prerequisites (PREEMPT_RT, privileges)
//! - Running a cyclic worker for a fixed wall-clock time
//! - Judging cycle statistics against acceptance criteria
//! - Generating JSON test reports

#![allow(dead_code)]

use ecrt_common::config::{CpuAffinity, RealtimeConfig};
use ecrt_common::metrics::StatsSnapshot;
use ecrt_runtime::clock::MonotonicClock;
use ecrt_runtime::realtime::check_rt_capabilities;
use ecrt_runtime::scheduler::{CycleWork, CyclicWorker, WorkerBuilder};
use std::fs;
use std::time::Duration;

/// Check if the system has a PREEMPT_RT kernel.
pub fn has_preempt_rt() -> bool {
    check_rt_capabilities().preempt_rt
}

/// Check if running as root (required for RT priority).
pub fn is_root() -> bool {
    // SAFETY: geteuid has no preconditions.
    unsafe { libc::geteuid() == 0 }
}

/// Get the number of CPUs.
pub fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1)
}

/// Check all prerequisites for privileged real-time tests.
pub fn check_rt_prerequisites() -> Result<(), String> {
    let caps = check_rt_capabilities();
    let mut errors = Vec::new();

    if !caps.can_use_rt_scheduling() {
        errors.push("RT scheduling not permitted - run as root or raise RLIMIT_RTPRIO");
    }
    if !caps.can_lock_memory() {
        errors.push("Memory locking not permitted - raise RLIMIT_MEMLOCK");
    }
    if !caps.preempt_rt {
        eprintln!("WARNING: PREEMPT_RT kernel not detected - latency results may be unreliable");
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.join("; "))
    }
}

/// Real-time settings used by privileged tests.
pub fn rt_config(cpu: Option<usize>) -> RealtimeConfig {
    RealtimeConfig {
        enabled: true,
        priority: 80,
        cpu_affinity: cpu.map_or(CpuAffinity::None, CpuAffinity::Single),
        ..RealtimeConfig::default()
    }
}

/// Spawn a worker, let it run for `duration`, stop it and return its stats.
pub fn run_worker_for<W>(
    period: Duration,
    realtime: RealtimeConfig,
    duration: Duration,
    work: W,
) -> StatsSnapshot
where
    W: CycleWork + Send + 'static,
{
    let mut worker: CyclicWorker = WorkerBuilder::default()
        .period(period)
        .thread_name("ecrt-accept")
        .realtime(realtime)
        .spawn(MonotonicClock::new(), work)
        .expect("failed to spawn worker");

    std::thread::sleep(duration);
    worker.stop().expect("worker did not stop")
}

/// Get current process memory usage in bytes.
pub fn get_memory_usage() -> u64 {
    if let Ok(status) = fs::read_to_string("/proc/self/status") {
        for line in status.lines() {
            if let Some(rest) = line.strip_prefix("VmRSS:") {
                if let Some(kb) = rest.split_whitespace().next().and_then(|v| v.parse::<u64>().ok()) {
                    return kb * 1024;
                }
            }
        }
    }
    0
}

/// Generate a JSON report from test results.
pub fn generate_report(test_name: &str, stats: &StatsSnapshot, passed: bool, notes: &str) -> String {
    serde_json::to_string_pretty(&serde_json::json!({
        "test": test_name,
        "passed": passed,
        "stats": stats,
        "jitter_ns": stats.jitter_ns(),
        "notes": notes,
    }))
    .unwrap_or_default()
}

/// Acceptance criteria for cycle timing.
#[derive(Debug, Clone)]
pub struct AcceptanceCriteria {
    /// Maximum deviation of any inter-cycle delta from the period.
    pub max_deviation: Duration,
    /// Maximum tolerated average drift from the period.
    pub max_avg_drift: Duration,
    /// Maximum number of failed cycles.
    pub max_overruns: u64,
    /// Maximum number of wakeups more than a period late.
    pub max_late_wakeups: u64,
}

impl Default for AcceptanceCriteria {
    fn default() -> Self {
        Self {
            max_deviation: Duration::from_micros(100),
            max_avg_drift: Duration::from_micros(10),
            max_overruns: 0,
            max_late_wakeups: 0,
        }
    }
}

impl AcceptanceCriteria {
    /// Lenient criteria for unprivileged runs on shared machines.
    pub fn best_effort(period: Duration) -> Self {
        Self {
            max_deviation: Duration::MAX,
            max_avg_drift: period / 4,
            max_overruns: 0,
            max_late_wakeups: u64::MAX,
        }
    }

    /// Check if statistics meet the criteria.
    pub fn check(&self, stats: &StatsSnapshot) -> bool {
        let as_ns = |d: Duration| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX);
        let deviation_ok = stats
            .max_deviation_ns()
            .is_some_and(|dev| dev <= as_ns(self.max_deviation));
        let drift_ok = stats
            .avg_delta_ns
            .is_some_and(|avg| avg.abs_diff(stats.period_ns) <= as_ns(self.max_avg_drift));

        deviation_ok
            && drift_ok
            && stats.overrun_count <= self.max_overruns
            && stats.late_wakeups <= self.max_late_wakeups
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ecrt_common::metrics::CycleStats;

    fn snapshot(deltas_us: &[i64]) -> StatsSnapshot {
        let mut stats = CycleStats::new(Duration::from_millis(1), 15);
        for &delta in deltas_us {
            stats.record_cycle(true, delta * 1_000, 0);
        }
        stats.snapshot()
    }

    #[test]
    fn test_acceptance_criteria_default() {
        let criteria = AcceptanceCriteria::default();
        assert_eq!(criteria.max_deviation, Duration::from_micros(100));
        assert_eq!(criteria.max_overruns, 0);
    }

    #[test]
    fn test_acceptance_criteria_pass() {
        let stats = snapshot(&[1_000, 990, 1_010, 1_000]);
        assert!(AcceptanceCriteria::default().check(&stats));
    }

    #[test]
    fn test_acceptance_criteria_fail_deviation() {
        let stats = snapshot(&[1_000, 1_150, 850]);
        assert!(!AcceptanceCriteria::default().check(&stats));
        assert!(AcceptanceCriteria::best_effort(Duration::from_millis(1)).check(&stats));
    }

    #[test]
    fn test_acceptance_criteria_no_samples() {
        assert!(!AcceptanceCriteria::default().check(&StatsSnapshot::default()));
    }

    #[test]
    fn test_generate_report() {
        let stats = snapshot(&[1_000, 1_002]);
        let report = generate_report("test", &stats, true, "ok");
        let value: serde_json::Value = serde_json::from_str(&report).unwrap();
        assert_eq!(value["test"], "test");
        assert_eq!(value["passed"], true);
        assert_eq!(value["stats"]["total_cycles"], 2);
        assert_eq!(value["jitter_ns"], 2_000);
    }

    #[test]
    fn test_memory_usage_is_reported() {
        if cfg!(target_os = "linux") {
            assert!(get_memory_usage() > 0);
        }
    }
}
