//! Signal handling for graceful daemon shutdown.
//!
//! SIGTERM and SIGINT request shutdown, SIGHUP requests a statistics report.
//! The handlers only store into static atomics; a watcher thread moves them
//! into the shared [`SignalState`] and raises any registered stop flags, such
//! as a sequencer's.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

/// Signals the daemon reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SignalKind {
    /// SIGTERM.
    Terminate = 1,
    /// SIGINT (Ctrl+C).
    Interrupt = 2,
    /// SIGHUP, used to request an immediate report.
    Hangup = 3,
}

impl SignalKind {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Terminate),
            2 => Some(Self::Interrupt),
            3 => Some(Self::Hangup),
            _ => None,
        }
    }
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalKind::Terminate => write!(f, "SIGTERM"),
            SignalKind::Interrupt => write!(f, "SIGINT"),
            SignalKind::Hangup => write!(f, "SIGHUP"),
        }
    }
}

/// State shared between the signal watcher and the main loop.
#[derive(Debug, Default)]
pub struct SignalState {
    shutdown_requested: AtomicBool,
    report_requested: AtomicBool,
    signal_count: AtomicU32,
    last_signal: AtomicU8,
    stop_flags: Mutex<Vec<Arc<AtomicBool>>>,
}

impl SignalState {
    /// Create a new signal state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if shutdown has been requested.
    #[inline]
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::Relaxed)
    }

    /// Check if a report has been requested and clear the flag.
    #[inline]
    pub fn take_report_request(&self) -> bool {
        self.report_requested.swap(false, Ordering::Relaxed)
    }

    /// Request shutdown and raise every registered stop flag.
    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::Relaxed);
        if let Ok(flags) = self.stop_flags.lock() {
            for flag in flags.iter() {
                flag.store(true, Ordering::Relaxed);
            }
        }
    }

    /// Request a statistics report.
    pub fn request_report(&self) {
        self.report_requested.store(true, Ordering::Relaxed);
    }

    /// Raise `flag` on shutdown; raised at once if shutdown was already requested.
    pub fn forward_to(&self, flag: Arc<AtomicBool>) {
        if self.shutdown_requested() {
            flag.store(true, Ordering::Relaxed);
        }
        if let Ok(mut flags) = self.stop_flags.lock() {
            flags.push(flag);
        }
    }

    fn record_signal(&self, kind: SignalKind) {
        self.signal_count.fetch_add(1, Ordering::Relaxed);
        self.last_signal.store(kind as u8, Ordering::Relaxed);
    }

    /// Total number of signals received.
    pub fn signal_count(&self) -> u32 {
        self.signal_count.load(Ordering::Relaxed)
    }

    /// Most recent signal received.
    pub fn last_signal(&self) -> Option<SignalKind> {
        SignalKind::from_u8(self.last_signal.load(Ordering::Relaxed))
    }
}

/// Pending signal from the async-signal context, 0 when none.
static PENDING_SHUTDOWN: AtomicU8 = AtomicU8::new(0);
static PENDING_HANGUP: AtomicBool = AtomicBool::new(false);

const WATCH_INTERVAL: Duration = Duration::from_millis(10);

/// Handle for signal management.
#[derive(Debug, Clone)]
pub struct SignalHandler {
    state: Arc<SignalState>,
}

impl SignalHandler {
    /// Create a handler and, on Unix, install the process signal handlers.
    ///
    /// # Errors
    ///
    /// Returns the `sigaction` error if a handler cannot be installed.
    pub fn new() -> nix::Result<Self> {
        let handler = Self {
            state: Arc::new(SignalState::new()),
        };

        #[cfg(unix)]
        handler.install()?;

        Ok(handler)
    }

    #[cfg(unix)]
    fn install(&self) -> nix::Result<()> {
        use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
        use std::os::raw::c_int;

        extern "C" fn on_shutdown(signo: c_int) {
            let kind = if signo == Signal::SIGINT as c_int {
                SignalKind::Interrupt
            } else {
                SignalKind::Terminate
            };
            PENDING_SHUTDOWN.store(kind as u8, Ordering::Relaxed);
        }

        extern "C" fn on_hangup(_: c_int) {
            PENDING_HANGUP.store(true, Ordering::Relaxed);
        }

        let shutdown = SigAction::new(
            SigHandler::Handler(on_shutdown),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        let hangup = SigAction::new(
            SigHandler::Handler(on_hangup),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );

        // SAFETY: the handlers only store into static atomics, which is
        // async-signal-safe.
        unsafe {
            sigaction(Signal::SIGTERM, &shutdown)?;
            sigaction(Signal::SIGINT, &shutdown)?;
            sigaction(Signal::SIGHUP, &hangup)?;
        }

        let state = Arc::clone(&self.state);
        std::thread::Builder::new()
            .name("ecrt-signals".into())
            .spawn(move || watch(&state))
            .map_err(|_| nix::Error::EAGAIN)?;

        debug!("Unix signal handlers registered");
        Ok(())
    }

    /// Check if shutdown has been requested.
    #[inline]
    pub fn shutdown_requested(&self) -> bool {
        self.state.shutdown_requested()
    }

    /// Check if a report has been requested and clear the flag.
    #[inline]
    pub fn take_report_request(&self) -> bool {
        self.state.take_report_request()
    }

    /// Manually request shutdown.
    pub fn request_shutdown(&self) {
        info!("Manual shutdown requested");
        self.state.request_shutdown();
    }

    /// Raise `flag` when shutdown is requested.
    pub fn forward_to(&self, flag: Arc<AtomicBool>) {
        self.state.forward_to(flag);
    }

    /// Shared state for inspection.
    pub fn state(&self) -> &SignalState {
        &self.state
    }
}

/// Move pending signals into `state` until shutdown.
fn watch(state: &SignalState) {
    loop {
        if let Some(kind) = SignalKind::from_u8(PENDING_SHUTDOWN.swap(0, Ordering::Relaxed)) {
            info!(signal = %kind, "Shutdown signal received");
            state.record_signal(kind);
            state.request_shutdown();
        }
        if PENDING_HANGUP.swap(false, Ordering::Relaxed) {
            info!(signal = %SignalKind::Hangup, "Report requested");
            state.record_signal(SignalKind::Hangup);
            state.request_report();
        }
        if state.shutdown_requested() {
            break;
        }
        std::thread::sleep(WATCH_INTERVAL);
    }
}

/// Block until shutdown is requested or `timeout` expires.
///
/// Returns `true` if shutdown was requested.
pub fn wait_for_shutdown(handler: &SignalHandler, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    let poll_interval = Duration::from_millis(50);

    while start.elapsed() < timeout {
        if handler.shutdown_requested() {
            return true;
        }
        std::thread::sleep(poll_interval.min(timeout.saturating_sub(start.elapsed())));
    }

    handler.shutdown_requested()
}
