//! Soak tests: a cyclic worker streaming over the SPSC queue for a long time.
//!
//! The worker enqueues `{counter, timestamp}` every cycle; the test thread
//! drains the queue and checks that nothing is lost, duplicated or
//! reordered, and that memory stays flat.
//!
//! # Acceptance Criteria
//!
//! - Every successfully enqueued message is received exactly once, in order
//! - Failed cycles only when the consumer is deliberately stalled
//! - Memory growth below 1 MiB per hour

use super::common::get_memory_usage;
use ecrt_common::metrics::StatsSnapshot;
use ecrt_common::time::Timestamp;
use ecrt_runtime::clock::{Clock, MonotonicClock};
use ecrt_runtime::scheduler::WorkerBuilder;
use ecrt_runtime::spsc::{channel, Consumer, Producer};
use std::time::{Duration, Instant};

/// Soak test configuration.
#[derive(Debug, Clone)]
pub struct SoakConfig {
    /// Total test duration.
    pub duration: Duration,
    /// Worker period.
    pub period: Duration,
    /// Queue depth.
    pub depth: usize,
    /// Pause between consumer drains.
    pub drain_interval: Duration,
    /// Progress print interval.
    pub log_interval: Duration,
    /// Maximum acceptable memory growth per hour in bytes.
    pub max_memory_growth_per_hour: u64,
}

impl SoakConfig {
    /// Quick sanity run.
    pub fn short() -> Self {
        Self {
            duration: Duration::from_millis(500),
            period: Duration::from_millis(1),
            depth: 16,
            drain_interval: Duration::from_millis(2),
            log_interval: Duration::from_secs(10),
            max_memory_growth_per_hour: u64::MAX,
        }
    }

    /// Ten-minute run.
    pub fn medium() -> Self {
        Self {
            duration: Duration::from_secs(600),
            max_memory_growth_per_hour: 1024 * 1024,
            ..Self::short()
        }
    }

    /// Twenty-four-hour run.
    pub fn long() -> Self {
        Self {
            duration: Duration::from_secs(24 * 3600),
            log_interval: Duration::from_secs(600),
            ..Self::medium()
        }
    }
}

/// Outcome of a soak run.
#[derive(Debug, Clone)]
pub struct SoakResult {
    /// Final worker statistics.
    pub stats: StatsSnapshot,
    /// Messages received.
    pub received: u64,
    /// Sequence gaps or reorderings seen by the consumer.
    pub gaps: u64,
    /// Largest enqueue-to-dequeue latency.
    pub max_queue_latency: Duration,
    /// Memory growth over the run, extrapolated per hour.
    pub memory_growth_per_hour: u64,
}

fn producer_work(mut producer: Producer) -> impl FnMut() -> bool + Send {
    let clock = MonotonicClock::new();
    let mut counter = 0u64;
    move || {
        let mut payload = [0u8; 16];
        payload[..8].copy_from_slice(&counter.to_le_bytes());
        payload[8..].copy_from_slice(&clock.now().as_nanos().to_le_bytes());
        if producer.try_enqueue(&payload).is_ok() {
            counter += 1;
            true
        } else {
            false
        }
    }
}

struct Drain {
    consumer: Consumer,
    expected: u64,
    gaps: u64,
    max_latency_ns: u64,
}

impl Drain {
    fn run(&mut self, clock: &MonotonicClock) {
        let mut buf = [0u8; 16];
        while let Ok(len) = self.consumer.try_dequeue(&mut buf) {
            assert_eq!(len, 16);
            let mut word = [0u8; 8];
            word.copy_from_slice(&buf[..8]);
            let counter = u64::from_le_bytes(word);
            word.copy_from_slice(&buf[8..]);
            let sent = Timestamp::from_nanos(u64::from_le_bytes(word));

            if counter != self.expected {
                self.gaps += 1;
            }
            self.expected = counter + 1;
            let latency = clock.now().diff_ns(sent).max(0).unsigned_abs();
            self.max_latency_ns = self.max_latency_ns.max(latency);
        }
    }
}

/// Run a soak test with the given configuration.
pub fn run_soak_test(config: &SoakConfig) -> SoakResult {
    let clock = MonotonicClock::new();
    let initial_memory = get_memory_usage();

    let (producer, consumer) = channel(config.depth, 16).expect("queue allocation failed");
    let mut worker = WorkerBuilder::default()
        .period(config.period)
        .thread_name("ecrt-soak")
        .spawn(MonotonicClock::new(), producer_work(producer))
        .expect("failed to spawn worker");

    let mut drain = Drain {
        consumer,
        expected: 0,
        gaps: 0,
        max_latency_ns: 0,
    };

    let started = Instant::now();
    let mut last_log = Instant::now();
    while started.elapsed() < config.duration {
        drain.run(&clock);
        std::thread::sleep(config.drain_interval);

        if last_log.elapsed() >= config.log_interval {
            let stats = worker.stats();
            println!(
                "  [{:?}] cycles={} failed={} received={} gaps={} mem={:.1}MB",
                started.elapsed(),
                stats.total_cycles,
                stats.overrun_count,
                drain.expected,
                drain.gaps,
                get_memory_usage() as f64 / (1024.0 * 1024.0)
            );
            last_log = Instant::now();
        }
    }

    let stats = worker.stop().expect("worker did not stop");
    drain.run(&clock);

    let hours = started.elapsed().as_secs_f64() / 3600.0;
    let growth = get_memory_usage().saturating_sub(initial_memory);
    let memory_growth_per_hour = if hours > 0.0 {
        (growth as f64 / hours) as u64
    } else {
        0
    };

    SoakResult {
        stats,
        received: drain.expected,
        gaps: drain.gaps,
        max_queue_latency: Duration::from_nanos(drain.max_latency_ns),
        memory_growth_per_hour,
    }
}

fn assert_lossless(result: &SoakResult) {
    assert_eq!(result.gaps, 0, "consumer saw gaps");
    assert_eq!(
        result.received, result.stats.cycles_without_errors,
        "every successful cycle enqueued exactly one message"
    );
}

/// Short soak run: lossless delivery at 1ms.
#[test]
fn test_soak_short() {
    let result = run_soak_test(&SoakConfig::short());
    assert!(result.stats.total_cycles > 0);
    assert_lossless(&result);
}

/// A depth-1 queue with a slow consumer fails cycles but never loses data.
#[test]
fn test_soak_backpressure() {
    let config = SoakConfig {
        depth: 1,
        period: Duration::from_micros(500),
        drain_interval: Duration::from_millis(5),
        ..SoakConfig::short()
    };
    let result = run_soak_test(&config);

    assert!(result.stats.overrun_count > 0, "slow consumer must fill the queue");
    assert_lossless(&result);
}

/// Ten-minute soak with memory check.
#[test]
#[ignore = "Soak test - takes 10 minutes"]
fn test_soak_medium() {
    let config = SoakConfig::medium();
    let result = run_soak_test(&config);
    assert_lossless(&result);
    assert_eq!(result.stats.overrun_count, 0);
    assert!(
        result.memory_growth_per_hour <= config.max_memory_growth_per_hour,
        "memory grew {} bytes/hour",
        result.memory_growth_per_hour
    );
    println!("max queue latency: {:?}", result.max_queue_latency);
}

/// Twenty-four-hour soak.
#[test]
#[ignore = "Soak test - takes 24 hours"]
fn test_soak_long() {
    let config = SoakConfig::long();
    let result = run_soak_test(&config);
    assert_lossless(&result);
    assert!(result.memory_growth_per_hour <= config.max_memory_growth_per_hour);
}
