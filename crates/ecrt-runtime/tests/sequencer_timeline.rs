//! Sequencer integration tests against the monotonic clock.
//!
//! These tests verify:
//! - Multi-track merge order when running in real time
//! - Events are never dispatched before their due time
//! - Rewinding with `set_time` and `reset` replays the expected tail

use ecrt_common::config::SequencerConfig;
use ecrt_common::time::Timestamp;
use ecrt_runtime::clock::{Clock, MonotonicClock};
use ecrt_runtime::sequencer::{Event, RunOutcome, Sequencer, Track};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

// ============================================================================
// Test Helpers
// ============================================================================

static INIT_LOGGING: Once = Once::new();

/// Route runtime log output to the test harness.
fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .with_thread_ids(true)
            .with_ansi(false)
            .try_init();
    });
}

/// (track, payload, dispatch time)
type Dispatches = Arc<Mutex<Vec<(usize, u32, Timestamp)>>>;

fn ms(value: u64) -> Timestamp {
    Timestamp::from_nanos(value * 1_000_000)
}

fn track(name: &str, times_ms: &[u64], log: &Dispatches) -> Track<u32> {
    let log = Arc::clone(log);
    let events = times_ms
        .iter()
        .map(|&t| Event::new(ms(t), u32::try_from(t).unwrap()))
        .collect();
    Track::new(name, events, move |index, event: &Event<u32>| {
        log.lock()
            .unwrap()
            .push((index, event.payload, MonotonicClock.now()));
    })
}

/// Short margins so the tests mostly sleep instead of spinning a core.
fn test_config() -> SequencerConfig {
    SequencerConfig {
        wake_latency: Duration::from_millis(1),
        scheduler_uncertainty: Duration::from_micros(200),
    }
}

// ============================================================================
// Real-Time Run Tests
// ============================================================================

#[test]
fn test_real_time_run_merges_tracks() {
    init_test_logging();
    let log = Dispatches::default();
    let mut seq = Sequencer::new(MonotonicClock, &test_config())
        .with_track(track("A", &[0, 10, 30], &log))
        .with_track(track("B", &[5, 15, 25], &log));

    let started = MonotonicClock.now();
    assert_eq!(seq.run(), Ok(RunOutcome::Exhausted));

    let dispatches = log.lock().unwrap();
    let order: Vec<(usize, u32)> = dispatches.iter().map(|&(i, p, _)| (i, p)).collect();
    assert_eq!(
        order,
        vec![(0, 0), (1, 5), (0, 10), (1, 15), (1, 25), (0, 30)]
    );

    for &(_, payload, at) in dispatches.iter() {
        let offset = at.sub_timestamp(started);
        assert!(
            offset >= ms(u64::from(payload)),
            "event {payload}ms dispatched early at {offset}"
        );
    }
    assert!(seq.is_finished());
    assert_eq!(seq.stats().dispatched, 6);
}

#[test]
fn test_run_until_then_resume() {
    init_test_logging();
    let log = Dispatches::default();
    let mut seq = Sequencer::new(MonotonicClock, &test_config())
        .with_track(track("A", &[0, 10, 20, 30], &log));

    assert_eq!(seq.run_until(ms(15)), RunOutcome::StopTimeReached);
    assert_eq!(log.lock().unwrap().len(), 2);

    // Resuming continues from the current sequence time
    assert_eq!(seq.run(), Ok(RunOutcome::Exhausted));
    let payloads: Vec<u32> = log.lock().unwrap().iter().map(|&(_, p, _)| p).collect();
    assert_eq!(payloads, vec![0, 10, 20, 30]);
}

#[test]
fn test_set_time_skips_earlier_events() {
    init_test_logging();
    let log = Dispatches::default();
    let mut seq = Sequencer::new(MonotonicClock, &test_config())
        .with_track(track("A", &[0, 10, 20, 30], &log))
        .with_track(track("B", &[5, 15, 25], &log));

    seq.set_time(ms(18));
    assert_eq!(seq.run(), Ok(RunOutcome::Exhausted));

    let order: Vec<(usize, u32)> = log.lock().unwrap().iter().map(|&(i, p, _)| (i, p)).collect();
    assert_eq!(order, vec![(0, 20), (1, 25), (0, 30)]);
}

#[test]
fn test_reset_replays_everything() {
    init_test_logging();
    let log = Dispatches::default();
    let mut seq = Sequencer::new(MonotonicClock, &test_config())
        .with_track(track("A", &[0, 3, 6], &log));

    seq.run().unwrap();
    seq.reset();
    assert!(!seq.is_finished());
    assert_eq!(seq.stats().dispatched, 0);

    seq.run().unwrap();
    assert_eq!(log.lock().unwrap().len(), 6);
}

#[test]
fn test_stop_flag_from_other_track() {
    init_test_logging();
    let log = Dispatches::default();
    let mut seq = Sequencer::new(MonotonicClock, &test_config())
        .with_track(track("A", &[0, 10, 20, 30, 40], &log));
    let stop = seq.stop_flag();
    seq.add_track(Track::new(
        "stop",
        vec![Event::new(ms(15), 0)],
        move |_, _: &Event<u32>| stop.store(true, std::sync::atomic::Ordering::Relaxed),
    ));

    assert_eq!(seq.run(), Ok(RunOutcome::Stopped));
    let payloads: Vec<u32> = log.lock().unwrap().iter().map(|&(_, p, _)| p).collect();
    assert_eq!(payloads, vec![0, 10]);
    assert_eq!(seq.track(0).unwrap().cursor(), 2);
}
