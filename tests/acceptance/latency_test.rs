//! Cycle timing acceptance tests.
//!
//! These tests run the cyclic worker against the monotonic clock and judge
//! the inter-cycle deltas it records.
//!
//! # Requirements
//!
//! The unprivileged tests run anywhere with lenient bounds. The ignored
//! tests need RT scheduling and memory locking permissions and, for
//! meaningful numbers, a PREEMPT_RT kernel.
//!
//! # Acceptance Criteria
//!
//! - Average period drift within 10µs
//! - No inter-cycle delta deviating more than 100µs from the period
//! - Zero failed cycles and zero late wakeups

use super::common::{
    check_rt_prerequisites, generate_report, num_cpus, rt_config, run_worker_for,
    AcceptanceCriteria,
};
use ecrt_common::config::RealtimeConfig;
use std::time::Duration;

/// The deadline schedule is absolute, so the average period holds even
/// without real-time priority.
#[test]
fn test_average_period_best_effort() {
    let period = Duration::from_millis(5);
    let stats = run_worker_for(
        period,
        RealtimeConfig::default(),
        Duration::from_millis(600),
        || true,
    );

    println!("{}", generate_report("average_period_best_effort", &stats, true, ""));

    assert!(stats.total_cycles >= 50, "only {} cycles", stats.total_cycles);
    assert_eq!(stats.overrun_count, 0);
    assert_eq!(stats.clock_anomalies, 0);
    assert!(
        AcceptanceCriteria::best_effort(period).check(&stats),
        "average delta {:?}ns too far from {}ns",
        stats.avg_delta_ns,
        stats.period_ns
    );
}

/// Failed work is counted without disturbing the schedule.
#[test]
fn test_failed_cycles_keep_schedule() {
    let period = Duration::from_millis(4);
    let mut cycle = 0u64;
    let stats = run_worker_for(period, RealtimeConfig::default(), Duration::from_millis(400), move || {
        cycle += 1;
        cycle % 4 != 0
    });

    assert!(stats.total_cycles >= 40);
    assert_eq!(
        stats.overrun_count + stats.cycles_without_errors,
        stats.total_cycles
    );
    assert!(stats.overrun_count >= stats.total_cycles / 4 - 1);
    assert_eq!(stats.max_overrun_streak, 1);
}

/// Baseline latency with RT priority and no load.
#[test]
#[ignore = "Requires RT scheduling and memory locking permissions"]
fn test_latency_rt_no_load() {
    if let Err(e) = check_rt_prerequisites() {
        eprintln!("Skipping test: {}", e);
        return;
    }

    let stats = run_worker_for(
        Duration::from_millis(1),
        rt_config(None),
        Duration::from_secs(10),
        || true,
    );

    let criteria = AcceptanceCriteria::default();
    let passed = criteria.check(&stats);
    println!("{}", generate_report("latency_rt_no_load", &stats, passed, "10s at 1ms"));
    assert!(
        passed,
        "Latency test failed: max deviation={:?}ns, late wakeups={}",
        stats.max_deviation_ns(),
        stats.late_wakeups
    );
}

/// Latency with RT priority while other threads load every other CPU.
#[test]
#[ignore = "Requires RT scheduling permissions - long running"]
fn test_latency_rt_under_cpu_load() {
    if let Err(e) = check_rt_prerequisites() {
        eprintln!("Skipping test: {}", e);
        return;
    }

    let stop = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
    let burners: Vec<_> = (1..num_cpus())
        .map(|_| {
            let stop = std::sync::Arc::clone(&stop);
            std::thread::spawn(move || {
                let mut x = 0u64;
                while !stop.load(std::sync::atomic::Ordering::Relaxed) {
                    x = x.wrapping_mul(6364136223846793005).wrapping_add(1);
                    std::hint::black_box(x);
                }
            })
        })
        .collect();

    let stats = run_worker_for(
        Duration::from_millis(1),
        rt_config(Some(0)),
        Duration::from_secs(60),
        || true,
    );

    stop.store(true, std::sync::atomic::Ordering::Relaxed);
    for burner in burners {
        let _ = burner.join();
    }

    let passed = AcceptanceCriteria::default().check(&stats);
    println!("{}", generate_report("latency_rt_under_cpu_load", &stats, passed, "60s at 1ms"));
    assert!(passed, "Latency under load failed: {:?}", stats);
}

/// Tight 250µs period on an isolated CPU.
#[test]
#[ignore = "Requires RT scheduling permissions and an isolated CPU"]
fn test_latency_isolated_cpu() {
    if let Err(e) = check_rt_prerequisites() {
        eprintln!("Skipping test: {}", e);
        return;
    }

    let isolated_cpu = num_cpus().saturating_sub(1);
    let stats = run_worker_for(
        Duration::from_micros(250),
        rt_config(Some(isolated_cpu)),
        Duration::from_secs(30),
        || true,
    );

    let criteria = AcceptanceCriteria {
        max_deviation: Duration::from_micros(50),
        ..AcceptanceCriteria::default()
    };
    let passed = criteria.check(&stats);
    println!("{}", generate_report("latency_isolated_cpu", &stats, passed, "30s at 250us"));
    assert!(passed, "Isolated CPU latency failed: {:?}", stats);
}
