//! Configuration structures for the cyclic core.
//!
//! Supports TOML deserialization with sensible defaults for
//! development and explicit values for production deployment.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level runtime configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Cyclic scheduler configuration.
    pub cycle: CycleConfig,

    /// Real-time configuration for the cyclic thread.
    pub realtime: RealtimeConfig,

    /// SPSC queue geometry.
    pub queue: QueueConfig,

    /// Event sequencer sleep-vs-spin margins.
    pub sequencer: SequencerConfig,

    /// Statistics reporting.
    pub report: ReportConfig,
}

/// Cyclic scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CycleConfig {
    /// Period between consecutive deadlines.
    #[serde(with = "humantime_serde")]
    pub period: Duration,

    /// Consecutive failed cycles after which the overrun is escalated.
    pub overrun_threshold: u32,

    /// Bounded wait for the worker to report exit after a stop request.
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,

    /// Name given to the worker thread.
    pub thread_name: String,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_millis(1),
            overrun_threshold: 15,
            shutdown_timeout: Duration::from_secs(1),
            thread_name: String::from("ecrt-cyclic"),
        }
    }
}

/// Real-time scheduling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// Enable real-time scheduling (requires privileges).
    pub enabled: bool,

    /// Scheduler policy: "fifo", "rr" or "other".
    pub policy: SchedPolicy,

    /// Scheduler priority (1-99 for RT policies).
    pub priority: u8,

    /// CPU affinity for the cyclic thread.
    pub cpu_affinity: CpuAffinity,

    /// Lock all memory pages (mlockall).
    pub lock_memory: bool,

    /// Pre-fault stack size in bytes.
    pub prefault_stack_size: usize,

    /// Fail at startup if RT requirements cannot be met instead of
    /// degrading to best-effort scheduling.
    pub fail_fast: bool,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            policy: SchedPolicy::Fifo,
            priority: 90,
            cpu_affinity: CpuAffinity::None,
            lock_memory: true,
            prefault_stack_size: 256 * 1024,
            fail_fast: false,
        }
    }
}

/// Scheduler policy for real-time threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SchedPolicy {
    /// SCHED_FIFO: First-in-first-out real-time.
    #[default]
    Fifo,
    /// SCHED_RR: Round-robin real-time.
    Rr,
    /// SCHED_OTHER: Normal time-sharing (non-RT).
    Other,
}

/// CPU affinity specification.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CpuAffinity {
    /// No affinity set (OS chooses).
    #[default]
    None,
    /// Pin to a single CPU core.
    Single(usize),
    /// Pin to a set of CPU cores.
    Set(Vec<usize>),
}

impl CpuAffinity {
    /// CPU indices named by this affinity, empty when unset.
    #[must_use]
    pub fn cpus(&self) -> Vec<usize> {
        match self {
            CpuAffinity::None => Vec::new(),
            CpuAffinity::Single(cpu) => vec![*cpu],
            CpuAffinity::Set(cpus) => cpus.clone(),
        }
    }
}

impl Serialize for CpuAffinity {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            // TOML has no null; an empty array round-trips to None.
            CpuAffinity::None => serializer.collect_seq(std::iter::empty::<usize>()),
            CpuAffinity::Single(cpu) => serializer.serialize_u64(*cpu as u64),
            CpuAffinity::Set(cpus) => cpus.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for CpuAffinity {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::{self, Visitor};

        struct CpuAffinityVisitor;

        impl<'de> Visitor<'de> for CpuAffinityVisitor {
            type Value = CpuAffinity;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("null, \"none\", an integer, or an array of integers")
            }

            fn visit_none<E>(self) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(CpuAffinity::None)
            }

            fn visit_unit<E>(self) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(CpuAffinity::None)
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                if value.eq_ignore_ascii_case("none") {
                    Ok(CpuAffinity::None)
                } else {
                    Err(de::Error::invalid_value(de::Unexpected::Str(value), &self))
                }
            }

            fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(CpuAffinity::Single(value as usize))
            }

            fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                if value < 0 {
                    return Err(de::Error::custom("CPU index cannot be negative"));
                }
                Ok(CpuAffinity::Single(value as usize))
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: de::SeqAccess<'de>,
            {
                let mut cpus = Vec::new();
                while let Some(cpu) = seq.next_element::<usize>()? {
                    cpus.push(cpu);
                }
                if cpus.is_empty() {
                    Ok(CpuAffinity::None)
                } else {
                    Ok(CpuAffinity::Set(cpus))
                }
            }
        }

        deserializer.deserialize_any(CpuAffinityVisitor)
    }
}

/// SPSC queue geometry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Number of message slots (1-255).
    pub depth: u8,

    /// Size of each message slot in bytes.
    pub slot_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            depth: 16,
            slot_size: 256,
        }
    }
}

/// Event sequencer margins used to decide between sleeping and spinning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SequencerConfig {
    /// Worst-case time the OS takes to wake a sleeping thread.
    #[serde(with = "humantime_serde")]
    pub wake_latency: Duration,

    /// Additional scheduling slack on top of the wake latency.
    #[serde(with = "humantime_serde")]
    pub scheduler_uncertainty: Duration,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            wake_latency: Duration::from_millis(22),
            scheduler_uncertainty: Duration::from_millis(2),
        }
    }
}

/// Statistics reporting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    /// Interval between statistics reports.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    /// Emit reports as JSON lines instead of log records.
    pub json: bool,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            json: false,
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or fails validation.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails validation.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Check value ranges that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cycle.period.is_zero() {
            return Err(ConfigError::Invalid("cycle.period must be non-zero".into()));
        }
        if self.cycle.overrun_threshold == 0 {
            return Err(ConfigError::Invalid(
                "cycle.overrun_threshold must be at least 1".into(),
            ));
        }
        if self.cycle.shutdown_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "cycle.shutdown_timeout must be non-zero".into(),
            ));
        }
        if self.queue.depth == 0 {
            return Err(ConfigError::Invalid("queue.depth must be 1-255".into()));
        }
        if self.queue.slot_size == 0 {
            return Err(ConfigError::Invalid(
                "queue.slot_size must be non-zero".into(),
            ));
        }
        if self.report.interval.is_zero() {
            return Err(ConfigError::Invalid(
                "report.interval must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File I/O error.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// TOML parsing error.
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize TOML: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A value is outside its permitted range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Serde helper module for `Duration` using humantime format.
pub mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    /// Serialize a duration as a humantime string such as `"1ms"`.
    ///
    /// # Errors
    ///
    /// Propagates serializer errors.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    /// Deserialize a humantime string such as `"1s 500ms"`.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not a valid duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
