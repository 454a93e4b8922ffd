use thiserror::Error;

/// Expected, recoverable outcomes of queue operations.
///
/// These are ordinary results on the hot path, not faults.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// Every slot holds an unconsumed message.
    #[error("queue full")]
    Full,

    /// No message is waiting.
    #[error("queue empty")]
    Empty,

    /// Payload does not fit in a message slot.
    #[error("payload of {len} bytes exceeds slot size {capacity}")]
    PayloadTooLarge {
        /// Payload length in bytes.
        len: usize,
        /// Slot size in bytes.
        capacity: usize,
    },
}

/// Runtime error types covering configuration, construction and shutdown.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RtError {
    /// Configuration or initialization error.
    #[error("configuration error: {0}")]
    Config(String),

    /// The message slot array could not be created.
    #[error("queue allocation failed: {0}")]
    QueueAllocation(String),

    /// The worker thread could not be created.
    #[error("failed to spawn worker thread: {0}")]
    ThreadSpawn(String),

    /// A negative delta between consecutive clock samples.
    #[error("clock anomaly: negative cycle delta of {delta_ns}ns")]
    ClockAnomaly {
        /// Observed delta in nanoseconds.
        delta_ns: i64,
    },

    /// Consecutive failed cycles reached the configured threshold.
    #[error("deadline overrun: {consecutive} consecutive failed cycles (threshold: {threshold})")]
    DeadlineOverrun {
        /// Number of consecutive failed cycles.
        consecutive: u32,
        /// Configured threshold.
        threshold: u32,
    },

    /// Worker did not report exit within the bounded wait after stop.
    #[error("worker did not exit within {timeout_ms}ms of stop request")]
    ShutdownTimeout {
        /// Configured wait in milliseconds.
        timeout_ms: u64,
    },

    /// Worker thread panicked instead of exiting its loop.
    #[error("worker thread {0} panicked")]
    WorkerPanicked(String),

    /// Handle does not refer to a live registry entry.
    #[error("invalid instance handle {0}")]
    InvalidHandle(String),

    /// Registry has no free slots.
    #[error("instance registry full ({capacity} entries)")]
    RegistryFull {
        /// Maximum number of live instances.
        capacity: usize,
    },

    /// Worker lifecycle transition not permitted from the current state.
    #[error("invalid worker state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current state name.
        from: String,
        /// Requested state name.
        to: String,
    },

    /// Real-time thread setup failed.
    #[error("real-time setup failed: {0}")]
    Realtime(String),

    /// A sequence has no events to play.
    #[error("sequence has no events")]
    SequenceEmpty,
}

/// Convenience type alias for runtime operations.
pub type RtResult<T> = Result<T, RtError>;
