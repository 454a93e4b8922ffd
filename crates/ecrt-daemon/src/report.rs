//! Statistics reporting for the daemon.
//!
//! Turns published [`StatsSnapshot`]s into health-rated reports and renders
//! them as log-friendly text, JSON, or Prometheus text exposition.

use ecrt_common::metrics::StatsSnapshot;
use ecrt_common::state::WorkerState;
use serde::Serialize;
use std::fmt::Write as _;
use std::time::Duration;

/// Health rating of a cyclic worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Running with no failure streak and under 1% failed cycles.
    Healthy,
    /// Running, but failing cycles or waking late.
    Degraded,
    /// Failure streak at or beyond the overrun threshold.
    Unhealthy,
    /// Stop requested or completed.
    ShuttingDown,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
            HealthStatus::ShuttingDown => write!(f, "shutting_down"),
        }
    }
}

/// Rate a worker from its state and statistics.
#[allow(clippy::cast_precision_loss)]
pub fn health(state: WorkerState, stats: &StatsSnapshot, overrun_threshold: u32) -> HealthStatus {
    if state != WorkerState::Running {
        return HealthStatus::ShuttingDown;
    }
    if stats.current_overrun_streak >= overrun_threshold.max(1) {
        return HealthStatus::Unhealthy;
    }
    let failure_rate = if stats.total_cycles > 0 {
        stats.overrun_count as f64 / stats.total_cycles as f64
    } else {
        0.0
    };
    if failure_rate > 0.01 || stats.current_overrun_streak > 0 || stats.clock_anomalies > 0 {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

/// Output format for reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum ReportFormat {
    /// One human-readable line per worker.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
    /// Prometheus text exposition.
    Prometheus,
}

/// Point-in-time report for one cyclic worker.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerReport {
    /// Worker thread name.
    pub worker: String,
    /// Lifecycle state.
    pub state: WorkerState,
    /// Health rating.
    pub health: HealthStatus,
    /// Cycle statistics.
    pub stats: StatsSnapshot,
    /// Messages drained from the worker's queue.
    pub messages: u64,
    /// Largest enqueue-to-dequeue latency in nanoseconds.
    pub max_queue_latency_ns: u64,
    /// Time since the worker started.
    #[serde(with = "ecrt_common::config::humantime_serde")]
    pub uptime: Duration,
}

impl WorkerReport {
    /// Render in `format`.
    ///
    /// # Errors
    ///
    /// Returns the serializer error for [`ReportFormat::Json`].
    pub fn render(&self, format: ReportFormat) -> serde_json::Result<String> {
        match format {
            ReportFormat::Text => Ok(format_text(self)),
            ReportFormat::Json => serde_json::to_string(self),
            ReportFormat::Prometheus => Ok(format_prometheus(self)),
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn fmt_ns(value: Option<u64>) -> String {
    value.map_or_else(|| "-".to_string(), |ns| format!("{:.3}ms", ns as f64 / 1e6))
}

/// Render a single-line text report.
#[allow(clippy::cast_precision_loss)]
pub fn format_text(report: &WorkerReport) -> String {
    let s = &report.stats;
    format!(
        "{} [{} {}] cycles={} ok={} overruns={} streak={}/{} delta min={} avg={} max={} jitter={} late={} anomalies={} msgs={} qlat_max={}",
        report.worker,
        report.state,
        report.health,
        s.total_cycles,
        s.cycles_without_errors,
        s.overrun_count,
        s.current_overrun_streak,
        s.max_overrun_streak,
        fmt_ns(s.min_delta_ns),
        fmt_ns(s.avg_delta_ns),
        fmt_ns(s.max_delta_ns),
        fmt_ns(s.jitter_ns()),
        s.late_wakeups,
        s.clock_anomalies,
        report.messages,
        fmt_ns(Some(report.max_queue_latency_ns)),
    )
}

/// Render Prometheus text exposition, labelled by worker.
pub fn format_prometheus(report: &WorkerReport) -> String {
    let mut output = String::new();
    let worker = &report.worker;
    let s = &report.stats;

    let mut metric = |name: &str, kind: &str, help: &str, value: String| {
        let _ = writeln!(output, "# HELP ecrt_{name} {help}");
        let _ = writeln!(output, "# TYPE ecrt_{name} {kind}");
        let _ = writeln!(output, "ecrt_{name}{{worker=\"{worker}\"}} {value}");
    };

    metric(
        "healthy",
        "gauge",
        "Worker health (1=healthy, 0=not healthy)",
        u8::from(report.health == HealthStatus::Healthy).to_string(),
    );
    metric("cycles_total", "counter", "Total cycles executed", s.total_cycles.to_string());
    metric("overruns_total", "counter", "Cycles whose work failed", s.overrun_count.to_string());
    metric(
        "overrun_streak_max",
        "gauge",
        "Longest run of consecutive failed cycles",
        s.max_overrun_streak.to_string(),
    );
    metric("late_wakeups_total", "counter", "Wakeups more than one period late", s.late_wakeups.to_string());
    metric("clock_anomalies_total", "counter", "Negative inter-cycle deltas", s.clock_anomalies.to_string());
    metric(
        "period_seconds",
        "gauge",
        "Configured cycle period",
        format!("{:.9}", Duration::from_nanos(s.period_ns).as_secs_f64()),
    );
    if let Some(avg) = s.avg_delta_ns {
        metric(
            "cycle_delta_avg_seconds",
            "gauge",
            "Average inter-cycle delta",
            format!("{:.9}", Duration::from_nanos(avg).as_secs_f64()),
        );
    }
    if let Some(jitter) = s.jitter_ns() {
        metric(
            "cycle_jitter_seconds",
            "gauge",
            "Max minus min inter-cycle delta",
            format!("{:.9}", Duration::from_nanos(jitter).as_secs_f64()),
        );
    }
    metric("queue_messages_total", "counter", "Messages drained from the queue", report.messages.to_string());

    output
}
