//! Shutdown and fault handling acceptance tests.
//!
//! These tests verify that the cyclic worker stops within its bounded
//! shutdown timeout, reports workers that do not stop, and flags runs of
//! consecutive failed cycles.
//!
//! # Acceptance Criteria
//!
//! - A healthy worker exits within two periods of a stop request
//! - A blocked worker yields `ShutdownTimeout` after the configured bound
//! - A streak of failed cycles reaching the threshold is visible in stats
//! - A panicking worker is reported, not propagated

use ecrt_common::error::RtError;
use ecrt_common::state::WorkerState;
use ecrt_runtime::clock::MonotonicClock;
use ecrt_runtime::scheduler::WorkerBuilder;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Stop is observed within a couple of periods.
#[test]
fn test_stop_latency() {
    let period = Duration::from_millis(2);
    let mut worker = WorkerBuilder::default()
        .period(period)
        .thread_name("ecrt-stop")
        .spawn(MonotonicClock::new(), || true)
        .unwrap();

    thread::sleep(Duration::from_millis(50));
    assert_eq!(worker.state(), WorkerState::Running);

    let started = Instant::now();
    let stats = worker.stop().unwrap();
    let elapsed = started.elapsed();

    println!("stop took {:?} after {} cycles", elapsed, stats.total_cycles);
    assert!(elapsed < Duration::from_millis(500), "stop took {elapsed:?}");
    assert_eq!(worker.state(), WorkerState::Stopped);
    assert!(stats.total_cycles > 0);
}

/// A blocked cycle times out the stop, and a later stop succeeds.
#[test]
fn test_blocked_worker_times_out() {
    let release = Arc::new(AtomicBool::new(false));
    let blocked = {
        let release = Arc::clone(&release);
        move || {
            while !release.load(Ordering::Acquire) {
                thread::sleep(Duration::from_millis(1));
            }
            true
        }
    };

    let timeout = Duration::from_millis(50);
    let mut worker = WorkerBuilder::default()
        .period(Duration::from_millis(1))
        .shutdown_timeout(timeout)
        .thread_name("ecrt-blocked")
        .spawn(MonotonicClock::new(), blocked)
        .unwrap();

    thread::sleep(Duration::from_millis(10));
    let started = Instant::now();
    let err = worker.stop().unwrap_err();
    let waited = started.elapsed();

    assert_eq!(err, RtError::ShutdownTimeout { timeout_ms: 50 });
    assert!(waited >= timeout);
    assert!(waited < timeout * 10, "waited {waited:?}");
    assert_eq!(worker.state(), WorkerState::Stopping);

    release.store(true, Ordering::Release);
    let mut stopped = false;
    for _ in 0..100 {
        if worker.stop().is_ok() {
            stopped = true;
            break;
        }
    }
    assert!(stopped);
    assert_eq!(worker.state(), WorkerState::Stopped);
}

/// Consecutive failures reaching the threshold are recorded.
#[test]
fn test_overrun_streak_reaches_threshold() {
    let cycles = Arc::new(AtomicU64::new(0));
    let work = {
        let cycles = Arc::clone(&cycles);
        // Cycles 10..30 fail
        move || {
            let n = cycles.fetch_add(1, Ordering::Relaxed);
            !(10..30).contains(&n)
        }
    };

    let mut worker = WorkerBuilder::default()
        .period(Duration::from_millis(1))
        .overrun_threshold(15)
        .thread_name("ecrt-streak")
        .spawn(MonotonicClock::new(), work)
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while cycles.load(Ordering::Relaxed) < 40 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }

    let stats = worker.stop().unwrap();
    assert!(stats.total_cycles >= 40);
    assert_eq!(stats.overrun_count, 20);
    assert_eq!(stats.max_overrun_streak, 20);
    assert!(stats.max_overrun_streak >= 15);
    assert_eq!(stats.current_overrun_streak, 0);
}

/// A panic in the cycle work surfaces as `WorkerPanicked`.
#[test]
fn test_panicking_worker_is_reported() {
    let mut worker = WorkerBuilder::default()
        .period(Duration::from_millis(1))
        .thread_name("ecrt-panic")
        .spawn(MonotonicClock::new(), || -> bool { panic!("injected fault") })
        .unwrap();

    thread::sleep(Duration::from_millis(30));
    assert_eq!(worker.state(), WorkerState::Stopped);
    assert_eq!(
        worker.stop(),
        Err(RtError::WorkerPanicked("ecrt-panic".into()))
    );
}

/// Dropping a running worker stops it.
#[test]
fn test_drop_stops_worker() {
    let cycles = Arc::new(AtomicU64::new(0));
    {
        let cycles = Arc::clone(&cycles);
        let _worker = WorkerBuilder::default()
            .period(Duration::from_millis(1))
            .thread_name("ecrt-drop")
            .spawn(MonotonicClock::new(), move || {
                cycles.fetch_add(1, Ordering::Relaxed);
                true
            })
            .unwrap();
        thread::sleep(Duration::from_millis(20));
    }

    let after_drop = cycles.load(Ordering::Relaxed);
    thread::sleep(Duration::from_millis(20));
    assert_eq!(cycles.load(Ordering::Relaxed), after_drop);
}
