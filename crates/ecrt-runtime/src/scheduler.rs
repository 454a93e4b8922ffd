//! Deadline-driven cyclic scheduler.
//!
//! Each cycle:
//! 1. Advance the absolute deadline by one period
//! 2. Sleep until the deadline
//! 3. Run the cycle work and capture success/failure
//! 4. Fold the wakeup delta and the result into [`CycleStats`]
//!
//! Deadlines advance from the previous deadline, never from the wakeup time,
//! so the cost of the work never accumulates as drift. A failed or late cycle
//! only updates statistics; the loop stops only when its stop flag is set.

use crate::clock::Clock;
use crate::realtime;
use crate::stats_cell::SharedStats;
use ecrt_common::config::{CycleConfig, RealtimeConfig, RuntimeConfig};
use ecrt_common::error::{RtError, RtResult};
use ecrt_common::metrics::{CycleOutcome, CycleStats, StatsSnapshot};
use ecrt_common::state::WorkerState;
use ecrt_common::time::Timestamp;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Interval at which [`CyclicWorker::stop`] polls for exit.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// One unit of periodic work.
///
/// Returns `true` on success. A failure counts towards the overrun streak
/// but never stops the loop.
pub trait CycleWork {
    /// Execute one cycle.
    fn execute(&mut self) -> bool;
}

impl<F> CycleWork for F
where
    F: FnMut() -> bool,
{
    fn execute(&mut self) -> bool {
        self()
    }
}

/// Stop flag and lifecycle state shared between a loop and its controllers.
#[derive(Debug)]
pub struct WorkerControl {
    stop: AtomicBool,
    state: AtomicU8,
}

impl Default for WorkerControl {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerControl {
    /// Create a control block in the RUNNING state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            stop: AtomicBool::new(false),
            state: AtomicU8::new(WorkerState::Running.as_u8()),
        }
    }

    /// Ask the loop to exit at its next check. Safe to call from any thread.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
        let _ = self.transition(WorkerState::Stopping);
    }

    /// Returns true once a stop was requested.
    ///
    /// Relaxed: the flag only moves false to true, and observing it one
    /// cycle late is acceptable.
    #[must_use]
    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire)).unwrap_or(WorkerState::Stopped)
    }

    /// Returns true once the loop has exited.
    #[must_use]
    pub fn has_exited(&self) -> bool {
        self.state().is_stopped()
    }

    /// Record that the loop has exited.
    pub fn mark_stopped(&self) {
        let _ = self.transition(WorkerState::Stopped);
    }

    fn transition(&self, target: WorkerState) -> RtResult<()> {
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                let current = WorkerState::from_u8(raw)?;
                current
                    .can_transition_to(target)
                    .then_some(target.as_u8())
            })
            .map(|_| ())
            .map_err(|raw| RtError::InvalidStateTransition {
                from: WorkerState::from_u8(raw)
                    .map_or_else(|| raw.to_string(), |s| s.to_string()),
                to: target.to_string(),
            })
    }
}

/// Marks the control block stopped when the loop thread unwinds or returns.
struct ExitGuard<'a>(&'a WorkerControl);

impl Drop for ExitGuard<'_> {
    fn drop(&mut self) {
        self.0.mark_stopped();
    }
}

/// Cyclic scheduler running on the calling thread.
pub struct CyclicScheduler<C: Clock> {
    clock: C,
    period: Duration,
    stats: CycleStats,
    next_deadline: Option<Timestamp>,
    last_wake: Timestamp,
    shared: Option<Arc<SharedStats>>,
}

impl<C: Clock> CyclicScheduler<C> {
    /// Create a scheduler with the given clock and cycle configuration.
    pub fn new(clock: C, config: &CycleConfig) -> Self {
        Self {
            clock,
            period: config.period,
            stats: CycleStats::new(config.period, config.overrun_threshold),
            next_deadline: None,
            last_wake: Timestamp::ZERO,
            shared: None,
        }
    }

    /// Publish a statistics snapshot into `shared` after every cycle.
    #[must_use]
    pub fn with_shared_stats(mut self, shared: Arc<SharedStats>) -> Self {
        self.shared = Some(shared);
        self
    }

    /// Cycle statistics so far.
    pub fn stats(&self) -> &CycleStats {
        &self.stats
    }

    /// Configured period.
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Deadline of the next cycle, once started.
    pub fn next_deadline(&self) -> Option<Timestamp> {
        self.next_deadline
    }

    /// Anchor the deadline sequence at `now + period`.
    ///
    /// Called implicitly by the first [`run_cycle`](Self::run_cycle).
    pub fn start(&mut self) {
        let now = self.clock.now();
        self.last_wake = now;
        self.next_deadline = Some(now.add_duration(self.period));
        info!(
            period_us = self.period.as_micros(),
            start = %now,
            "Cyclic scheduler started"
        );
    }

    /// Sleep until the next deadline, run `work` once and update statistics.
    pub fn run_cycle<W>(&mut self, work: &mut W) -> CycleOutcome
    where
        W: CycleWork + ?Sized,
    {
        let deadline = match self.next_deadline {
            Some(deadline) => deadline,
            None => {
                self.start();
                self.last_wake.add_duration(self.period)
            }
        };

        self.clock.sleep_until(deadline);
        let wake = self.clock.now();

        let ok = work.execute();

        let delta_ns = wake.diff_ns(self.last_wake);
        let lateness_ns = wake.diff_ns(deadline);
        let outcome = self.stats.record_cycle(ok, delta_ns, lateness_ns);
        self.report(&outcome, delta_ns, lateness_ns);

        self.last_wake = wake;
        self.next_deadline = Some(deadline.add_duration(self.period));

        if let Some(shared) = &self.shared {
            shared.publish(&self.stats.snapshot());
        }

        outcome
    }

    /// Run cycles until `control` requests a stop.
    ///
    /// Marks `control` stopped on return and yields the final statistics.
    pub fn run<W>(&mut self, work: &mut W, control: &WorkerControl) -> StatsSnapshot
    where
        W: CycleWork + ?Sized,
    {
        let _exit = ExitGuard(control);

        while !control.stop_requested() {
            self.run_cycle(work);
        }

        let snapshot = self.stats.snapshot();
        info!(
            cycles = snapshot.total_cycles,
            overruns = snapshot.overrun_count,
            max_streak = snapshot.max_overrun_streak,
            "Cyclic scheduler exited"
        );
        snapshot
    }

    fn report(&self, outcome: &CycleOutcome, delta_ns: i64, lateness_ns: i64) {
        let cycle = self.stats.total_cycles();

        if let Some(delta_ns) = outcome.clock_anomaly {
            error!(cycle, "{}", RtError::ClockAnomaly { delta_ns });
        }

        if outcome.late_wakeup {
            warn!(
                cycle,
                lateness_us = lateness_ns / 1_000,
                period_us = self.period.as_micros(),
                "Late wakeup"
            );
        }

        if outcome.threshold_reached {
            error!(
                cycle,
                "{}",
                RtError::DeadlineOverrun {
                    consecutive: self.stats.current_streak(),
                    threshold: self.stats.overrun_threshold(),
                }
            );
        } else if !outcome.ok {
            debug!(cycle, streak = self.stats.current_streak(), "Cycle work failed");
        }

        trace!(cycle, delta_ns, lateness_ns, ok = outcome.ok, "Cycle complete");
    }
}

/// Cyclic scheduler running on its own named thread.
pub struct CyclicWorker {
    name: String,
    control: Arc<WorkerControl>,
    stats: Arc<SharedStats>,
    handle: Option<JoinHandle<StatsSnapshot>>,
    shutdown_timeout: Duration,
}

impl CyclicWorker {
    /// Spawn a worker configured from `config.cycle` and `config.realtime`.
    ///
    /// # Errors
    ///
    /// [`RtError::ThreadSpawn`] if the thread cannot be created,
    /// [`RtError::Realtime`] if the thread's real-time setup fails.
    pub fn spawn<C, W>(config: &RuntimeConfig, clock: C, work: W) -> RtResult<Self>
    where
        C: Clock + 'static,
        W: CycleWork + Send + 'static,
    {
        WorkerBuilder::from_config(config).spawn(clock, work)
    }

    /// Create a builder with default configuration.
    #[must_use]
    pub fn builder() -> WorkerBuilder {
        WorkerBuilder::default()
    }

    /// Thread name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Latest published statistics.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.read()
    }

    /// Statistics cell for reporter threads.
    #[must_use]
    pub fn shared_stats(&self) -> Arc<SharedStats> {
        Arc::clone(&self.stats)
    }

    /// Control block, e.g. for a signal handler that requests a stop.
    #[must_use]
    pub fn control(&self) -> Arc<WorkerControl> {
        Arc::clone(&self.control)
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> WorkerState {
        self.control.state()
    }

    /// Request a stop and wait a bounded time for the loop to exit.
    ///
    /// Polls the exited flag every millisecond for at most the configured
    /// shutdown timeout, then joins the thread. May be called again after
    /// a timeout.
    ///
    /// # Errors
    ///
    /// [`RtError::ShutdownTimeout`] if the loop did not exit in time,
    /// [`RtError::WorkerPanicked`] if the thread panicked.
    pub fn stop(&mut self) -> RtResult<StatsSnapshot> {
        let Some(handle) = self.handle.take() else {
            return Ok(self.stats.read());
        };

        info!(worker = %self.name, "Stopping cyclic worker");
        self.control.request_stop();

        let started = Instant::now();
        while !self.control.has_exited() {
            if started.elapsed() >= self.shutdown_timeout {
                let err = RtError::ShutdownTimeout {
                    timeout_ms: u64::try_from(self.shutdown_timeout.as_millis())
                        .unwrap_or(u64::MAX),
                };
                error!(worker = %self.name, "{err}");
                self.handle = Some(handle);
                return Err(err);
            }
            thread::sleep(EXIT_POLL_INTERVAL);
        }

        handle
            .join()
            .map_err(|_| RtError::WorkerPanicked(self.name.clone()))
    }
}

impl Drop for CyclicWorker {
    fn drop(&mut self) {
        if self.handle.is_some() {
            if let Err(e) = self.stop() {
                warn!(worker = %self.name, "Cyclic worker not joined on drop: {e}");
            }
        }
    }
}

impl std::fmt::Debug for CyclicWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CyclicWorker")
            .field("name", &self.name)
            .field("state", &self.control.state())
            .field("shutdown_timeout", &self.shutdown_timeout)
            .finish_non_exhaustive()
    }
}

/// Builder for [`CyclicWorker`].
#[derive(Debug, Clone, Default)]
pub struct WorkerBuilder {
    cycle: CycleConfig,
    realtime: RealtimeConfig,
}

impl WorkerBuilder {
    /// Start from the cycle and real-time sections of a runtime config.
    #[must_use]
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            cycle: config.cycle.clone(),
            realtime: config.realtime.clone(),
        }
    }

    /// Set the cycle period.
    #[must_use]
    pub fn period(mut self, period: Duration) -> Self {
        self.cycle.period = period;
        self
    }

    /// Set the consecutive-failure threshold.
    #[must_use]
    pub fn overrun_threshold(mut self, threshold: u32) -> Self {
        self.cycle.overrun_threshold = threshold;
        self
    }

    /// Set the bounded wait used by [`CyclicWorker::stop`].
    #[must_use]
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.cycle.shutdown_timeout = timeout;
        self
    }

    /// Set the worker thread name.
    #[must_use]
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.cycle.thread_name = name.into();
        self
    }

    /// Set the real-time configuration applied by the worker thread.
    #[must_use]
    pub fn realtime(mut self, realtime: RealtimeConfig) -> Self {
        self.realtime = realtime;
        self
    }

    /// Spawn the worker thread and wait until its real-time setup is done.
    ///
    /// # Errors
    ///
    /// [`RtError::ThreadSpawn`] if the thread cannot be created,
    /// [`RtError::Realtime`] if the thread's real-time setup fails.
    pub fn spawn<C, W>(self, clock: C, mut work: W) -> RtResult<CyclicWorker>
    where
        C: Clock + 'static,
        W: CycleWork + Send + 'static,
    {
        let control = Arc::new(WorkerControl::new());
        let stats = Arc::new(SharedStats::new());
        let (ready_tx, ready_rx) = mpsc::channel::<RtResult<()>>();

        let name = self.cycle.thread_name.clone();
        let shutdown_timeout = self.cycle.shutdown_timeout;

        let handle = {
            let control = Arc::clone(&control);
            let stats = Arc::clone(&stats);
            let cycle = self.cycle;
            let realtime = self.realtime;

            thread::Builder::new()
                .name(name.clone())
                .spawn(move || {
                    if let Err(e) = realtime::prepare_thread(&realtime) {
                        control.mark_stopped();
                        let _ = ready_tx.send(Err(e));
                        return StatsSnapshot::default();
                    }
                    let _ = ready_tx.send(Ok(()));

                    let mut scheduler =
                        CyclicScheduler::new(clock, &cycle).with_shared_stats(stats);
                    scheduler.run(&mut work, &control)
                })
                .map_err(|e| RtError::ThreadSpawn(e.to_string()))?
        };

        let ready = ready_rx
            .recv()
            .unwrap_or_else(|_| Err(RtError::WorkerPanicked(name.clone())));
        if let Err(e) = ready {
            let _ = handle.join();
            return Err(e);
        }

        info!(worker = %name, "Cyclic worker started");

        Ok(CyclicWorker {
            name,
            control,
            stats,
            handle: Some(handle),
            shutdown_timeout,
        })
    }
}
