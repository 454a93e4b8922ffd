//! ecat-rt daemon entry point.
//!
//! Drives the real-time core from the command line: `cycle` runs cyclic
//! workers that stream timestamped messages over SPSC queues, `sequence`
//! plays a timeline file through the event sequencer.

mod report;
mod signals;
mod timeline;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use ecrt_common::config::RuntimeConfig;
use ecrt_common::state::WorkerState;
use ecrt_common::time::Timestamp;
use ecrt_runtime::clock::{Clock, MonotonicClock};
use ecrt_runtime::realtime::{check_rt_capabilities, validate_rt_capabilities};
use ecrt_runtime::registry::{Handle, Registry};
use ecrt_runtime::scheduler::{CyclicWorker, WorkerBuilder};
use ecrt_runtime::sequencer::Sequencer;
use ecrt_runtime::spsc::{channel, Consumer, Producer};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::report::{health, ReportFormat, WorkerReport};
use crate::signals::{wait_for_shutdown, SignalHandler};
use crate::timeline::SequenceFile;

/// Counter and enqueue timestamp, both little-endian u64.
const MESSAGE_LEN: usize = 16;

/// ecat-rt daemon command-line arguments.
#[derive(Parser, Debug)]
#[command(
    name = "ecrt-daemon",
    about = "Real-time cyclic core daemon - deadline scheduler, SPSC queue and event sequencer",
    version,
    long_about = None
)]
struct Args {
    /// Path to a runtime configuration file (TOML).
    #[arg(long, short = 'c', value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, short = 'l', default_value = "info", global = true)]
    log_level: String,

    /// Report format (overrides `report.json` in the config).
    #[arg(long, short = 'f', value_enum, global = true)]
    format: Option<ReportFormat>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run cyclic workers streaming timestamped messages to the main thread.
    Cycle {
        /// Number of workers, each with its own queue.
        #[arg(long, short = 'n', default_value = "1")]
        workers: usize,

        /// Cycle period (overrides config), e.g. "500us".
        #[arg(long, value_parser = humantime::parse_duration)]
        period: Option<Duration>,

        /// Stop after this many cycles per worker (0 = run until signalled).
        #[arg(long, default_value = "0")]
        max_cycles: u64,

        /// Stop after this long (default: run until signalled).
        #[arg(long, value_parser = humantime::parse_duration)]
        duration: Option<Duration>,
    },
    /// Play a sequence file in real time.
    Sequence {
        /// Sequence file (TOML).
        file: PathBuf,

        /// Start at this offset instead of zero.
        #[arg(long, value_parser = humantime::parse_duration)]
        start: Option<Duration>,

        /// Stop once sequence time passes this offset.
        #[arg(long, value_parser = humantime::parse_duration)]
        until: Option<Duration>,
    },
    /// Report real-time capabilities of this process.
    CheckRt,
    /// Print the effective configuration as TOML.
    ShowConfig,
}

fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting ecrt daemon");

    let config = load_config(&args)?;
    let format = args.format.unwrap_or(if config.report.json {
        ReportFormat::Json
    } else {
        ReportFormat::Text
    });

    match args.command {
        Command::Cycle {
            workers,
            period,
            max_cycles,
            duration,
        } => {
            let mut config = config;
            if let Some(period) = period {
                config.cycle.period = period;
            }
            config.validate().context("Invalid configuration")?;
            let signals = SignalHandler::new().context("Failed to set up signal handlers")?;
            run_cycle(&config, &signals, format, workers, max_cycles, duration)
        }
        Command::Sequence { file, start, until } => {
            let signals = SignalHandler::new().context("Failed to set up signal handlers")?;
            run_sequence(&config, &signals, format, &file, start, until)
        }
        Command::CheckRt => check_rt(&config, format),
        Command::ShowConfig => {
            print!("{}", config.to_toml().context("Failed to serialize config")?);
            Ok(())
        }
    }
}

/// Initialize logging with the specified log level.
fn init_logging(level: &str) {
    let filter = format!("ecrt_daemon={level},ecrt_runtime={level},ecrt_common={level}");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&filter)),
        )
        .with_target(true)
        .with_thread_ids(true)
        .init();
}

/// Load configuration from file or use defaults.
///
/// Resolution priority (first existing file wins):
/// 1. Command-line `--config` argument
/// 2. `ECRT_CONFIG_PATH` environment variable
/// 3. `/etc/ecrt/config.toml` (system path)
/// 4. Built-in defaults
fn load_config(args: &Args) -> Result<RuntimeConfig> {
    if let Some(config_path) = &args.config {
        info!(?config_path, "Loading config from command-line argument");
        return RuntimeConfig::from_file(config_path)
            .with_context(|| format!("Failed to load config from {}", config_path.display()));
    }

    if let Ok(env_path) = std::env::var("ECRT_CONFIG_PATH") {
        let config_path = PathBuf::from(&env_path);
        if config_path.exists() {
            info!(?config_path, "Loading config from ECRT_CONFIG_PATH");
            return RuntimeConfig::from_file(&config_path)
                .with_context(|| format!("Failed to load config from ECRT_CONFIG_PATH={env_path}"));
        }
        warn!(
            path = %env_path,
            "ECRT_CONFIG_PATH set but file does not exist, checking other locations"
        );
    }

    let system_path = PathBuf::from("/etc/ecrt/config.toml");
    if system_path.exists() {
        info!(?system_path, "Loading config from system path");
        return RuntimeConfig::from_file(&system_path)
            .with_context(|| format!("Failed to load config from {}", system_path.display()));
    }

    info!("No config file found, using built-in defaults");
    Ok(RuntimeConfig::default())
}

/// Producer side of a worker: publishes `{counter, timestamp}` each cycle.
///
/// A full queue means the consumer fell behind; the cycle reports failure
/// and the counter does not advance.
fn stream_work(mut producer: Producer) -> impl FnMut() -> bool + Send {
    let clock = MonotonicClock::new();
    let mut counter = 0u64;
    move || {
        let Some(mut slot) = producer.head_slot() else {
            return false;
        };
        slot[..8].copy_from_slice(&counter.to_le_bytes());
        slot[8..MESSAGE_LEN].copy_from_slice(&clock.now().as_nanos().to_le_bytes());
        if slot.commit(MESSAGE_LEN).is_err() {
            return false;
        }
        counter += 1;
        true
    }
}

/// Consumer side of a worker, owned by the main thread.
struct Stream {
    name: String,
    consumer: Consumer,
    started: Instant,
    messages: u64,
    gaps: u64,
    max_latency_ns: u64,
}

impl Stream {
    /// Drain every waiting message.
    fn drain(&mut self, clock: &MonotonicClock) {
        while let Some(slot) = self.consumer.tail_slot() {
            if slot.len() >= MESSAGE_LEN {
                let mut word = [0u8; 8];
                word.copy_from_slice(&slot[..8]);
                let counter = u64::from_le_bytes(word);
                word.copy_from_slice(&slot[8..MESSAGE_LEN]);
                let sent = Timestamp::from_nanos(u64::from_le_bytes(word));

                if counter != self.messages {
                    self.gaps += 1;
                    warn!(worker = %self.name, expected = self.messages, got = counter, "Message sequence gap");
                }
                self.messages = counter + 1;
                let latency = clock.now().diff_ns(sent).max(0).unsigned_abs();
                self.max_latency_ns = self.max_latency_ns.max(latency);
            }
            slot.release();
        }
    }
}

fn worker_report(config: &RuntimeConfig, worker: &CyclicWorker, stream: &Stream) -> WorkerReport {
    let stats = worker.stats();
    let state = worker.state();
    WorkerReport {
        worker: worker.name().to_string(),
        state,
        health: health(state, &stats, config.cycle.overrun_threshold),
        stats,
        messages: stream.messages,
        max_queue_latency_ns: stream.max_latency_ns,
        uptime: stream.started.elapsed(),
    }
}

fn emit(report: &WorkerReport, format: ReportFormat) {
    match report.render(format) {
        Ok(text) => println!("{}", text.trim_end()),
        Err(e) => error!("Failed to render report: {e}"),
    }
}

/// Run cyclic workers until signalled or a limit is reached.
fn run_cycle(
    config: &RuntimeConfig,
    signals: &SignalHandler,
    format: ReportFormat,
    workers: usize,
    max_cycles: u64,
    duration: Option<Duration>,
) -> Result<()> {
    if config.queue.slot_size < MESSAGE_LEN {
        bail!(
            "queue.slot_size must be at least {MESSAGE_LEN} bytes, got {}",
            config.queue.slot_size
        );
    }
    if workers == 0 {
        bail!("at least one worker is required");
    }

    let clock = MonotonicClock::new();
    let mut registry: Registry<(CyclicWorker, Stream)> = Registry::with_capacity(workers);
    let mut handles: Vec<Handle> = Vec::with_capacity(workers);

    for index in 0..workers {
        let (producer, consumer) = channel(usize::from(config.queue.depth), config.queue.slot_size)
            .context("Failed to allocate queue")?;
        let name = if workers == 1 {
            config.cycle.thread_name.clone()
        } else {
            format!("{}-{index}", config.cycle.thread_name)
        };
        let worker = WorkerBuilder::from_config(config)
            .thread_name(name.clone())
            .spawn(MonotonicClock::new(), stream_work(producer))
            .with_context(|| format!("Failed to start worker {name}"))?;
        let stream = Stream {
            name,
            consumer,
            started: Instant::now(),
            messages: 0,
            gaps: 0,
            max_latency_ns: 0,
        };
        let handle = registry.insert((worker, stream))?;
        info!(%handle, period = ?config.cycle.period, "Cyclic worker started");
        handles.push(handle);
    }

    let started = Instant::now();
    let mut last_report = Instant::now();

    while !wait_for_shutdown(signals, Duration::from_millis(1)) {
        let mut all_done = max_cycles > 0;
        for &handle in &handles {
            let (worker, stream) = registry.get_mut(handle)?;
            stream.drain(&clock);
            if worker.state() != WorkerState::Running {
                warn!(worker = %worker.name(), "Worker stopped unexpectedly");
                signals.request_shutdown();
            }
            all_done &= worker.stats().total_cycles >= max_cycles;
        }

        if all_done {
            info!(cycles = max_cycles, "Maximum cycle count reached");
            break;
        }
        if duration.is_some_and(|limit| started.elapsed() >= limit) {
            info!("Run duration reached");
            break;
        }

        if signals.take_report_request() || last_report.elapsed() >= config.report.interval {
            last_report = Instant::now();
            for &handle in &handles {
                let (worker, stream) = registry.get(handle)?;
                emit(&worker_report(config, worker, stream), format);
            }
        }
    }

    info!("Shutting down...");

    let mut failures = 0usize;
    for (handle, (mut worker, mut stream)) in registry.drain() {
        match worker.stop() {
            Ok(_) => {
                stream.drain(&clock);
                let report = worker_report(config, &worker, &stream);
                emit(&report, format);
                info!(
                    %handle,
                    total_cycles = report.stats.total_cycles,
                    overruns = report.stats.overrun_count,
                    messages = stream.messages,
                    gaps = stream.gaps,
                    "Worker stopped"
                );
            }
            Err(e) => {
                failures += 1;
                error!(%handle, worker = %worker.name(), "Worker stop failed: {e}");
            }
        }
    }

    info!(
        signals = signals.state().signal_count(),
        uptime_secs = started.elapsed().as_secs(),
        "Daemon shutdown complete"
    );

    if failures > 0 {
        bail!("{failures} worker(s) did not stop cleanly");
    }
    Ok(())
}

/// Play a sequence file until it ends, `until` passes, or a signal arrives.
fn run_sequence(
    config: &RuntimeConfig,
    signals: &SignalHandler,
    format: ReportFormat,
    file: &std::path::Path,
    start: Option<Duration>,
    until: Option<Duration>,
) -> Result<()> {
    let sequence = SequenceFile::from_file(file)?;
    info!(
        file = %file.display(),
        tracks = sequence.tracks.len(),
        events = sequence.event_count(),
        "Sequence loaded"
    );

    let mut sequencer = Sequencer::new(MonotonicClock::new(), &config.sequencer);
    for track in sequence.into_tracks() {
        sequencer.add_track(track);
    }
    signals.forward_to(sequencer.stop_flag());

    if let Some(start) = start {
        sequencer.set_time(Timestamp::from(start));
    }

    let outcome = match until {
        Some(until) => sequencer.run_until(Timestamp::from(until)),
        None => sequencer.run().context("Nothing to play")?,
    };

    let stats = sequencer.stats();
    info!(?outcome, time = %sequencer.time(), "Sequence finished");
    match format {
        ReportFormat::Json => println!("{}", serde_json::to_string(&stats)?),
        ReportFormat::Text | ReportFormat::Prometheus => println!(
            "dispatched={} late={} max_lateness={}us sleeps={} spins={}",
            stats.dispatched,
            stats.late_dispatches,
            stats.max_lateness_ns / 1_000,
            stats.sleeps,
            stats.spin_iterations
        ),
    }
    Ok(())
}

/// Print real-time capabilities and validate the configured RT settings.
fn check_rt(config: &RuntimeConfig, format: ReportFormat) -> Result<()> {
    let caps = check_rt_capabilities();
    match format {
        ReportFormat::Json => println!("{}", serde_json::to_string(&caps)?),
        ReportFormat::Text | ReportFormat::Prometheus => {
            println!("root:           {}", caps.is_root);
            println!("preempt_rt:     {}", caps.preempt_rt);
            println!("rtprio limit:   {:?}", caps.rtprio_limit);
            println!("memlock limit:  {:?}", caps.memlock_limit);
            println!("rt scheduling:  {}", caps.can_use_rt_scheduling());
            println!("memory locking: {}", caps.can_lock_memory());
        }
    }

    if config.realtime.enabled {
        validate_rt_capabilities(&config.realtime)
            .context("Configured real-time settings cannot be applied")?;
        info!("Configured real-time settings are supported");
    }
    Ok(())
}
