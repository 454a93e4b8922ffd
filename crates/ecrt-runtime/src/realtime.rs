//! Real-time setup for the calling thread.
//!
//! Applied by a worker thread to itself right after it starts:
//! - memory locking (mlockall) so the loop never takes a page fault
//! - stack pre-faulting so the pages the loop will touch are resident
//! - SCHED_FIFO / SCHED_RR priority
//! - CPU pinning to keep the loop away from housekeeping cores
//!
//! Missing privileges (EPERM) degrade to a warning unless `fail_fast` is set.

#![allow(unused_imports)] // Platform-specific code may not use all imports

use ecrt_common::config::{CpuAffinity, RealtimeConfig, SchedPolicy};
use ecrt_common::error::{RtError, RtResult};
use tracing::{debug, error, info, warn};

/// What [`prepare_thread`] actually applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RealtimeStatus {
    /// Whether memory was locked.
    pub memory_locked: bool,
    /// Stack bytes pre-faulted.
    pub stack_prefaulted: usize,
    /// Applied scheduler policy.
    pub scheduler_policy: Option<SchedPolicy>,
    /// Applied scheduler priority.
    pub scheduler_priority: Option<u8>,
    /// CPUs the thread is pinned to.
    pub cpu_affinity: Option<Vec<usize>>,
}

/// Apply the real-time configuration to the calling thread.
///
/// CPU pinning is applied even when `enabled` is false, since it needs no
/// privileges and is the cheapest jitter reduction available.
///
/// # Errors
///
/// Returns [`RtError::Realtime`] if a setup step fails for a reason other
/// than missing privileges, or if `fail_fast` is set and the process lacks
/// the required capabilities.
pub fn prepare_thread(config: &RealtimeConfig) -> RtResult<RealtimeStatus> {
    let cpu_affinity = pin_current_thread(&config.cpu_affinity)?;

    if !config.enabled {
        debug!("Real-time scheduling disabled in configuration");
        return Ok(RealtimeStatus {
            cpu_affinity,
            ..RealtimeStatus::default()
        });
    }

    if config.fail_fast {
        validate_rt_capabilities(config)?;
    }

    let memory_locked = if config.lock_memory {
        lock_memory()?
    } else {
        false
    };

    let stack_prefaulted = prefault_stack(config.prefault_stack_size);

    let (scheduler_policy, scheduler_priority) = set_scheduler(config.policy, config.priority)?;

    let status = RealtimeStatus {
        memory_locked,
        stack_prefaulted,
        scheduler_policy,
        scheduler_priority,
        cpu_affinity,
    };

    info!(?status, "Real-time thread setup complete");
    Ok(status)
}

#[cfg(target_os = "linux")]
fn lock_memory() -> RtResult<bool> {
    use nix::sys::mman::{mlockall, MlockAllFlags};

    match mlockall(MlockAllFlags::MCL_CURRENT | MlockAllFlags::MCL_FUTURE) {
        Ok(()) => {
            debug!("Memory locked");
            Ok(true)
        }
        Err(nix::errno::Errno::EPERM) => {
            warn!("mlockall failed with EPERM (no CAP_IPC_LOCK); page faults may add jitter");
            Ok(false)
        }
        Err(e) => Err(RtError::Realtime(format!("mlockall failed: {e}"))),
    }
}

#[cfg(not(target_os = "linux"))]
fn lock_memory() -> RtResult<bool> {
    warn!("mlockall not available on this platform");
    Ok(false)
}

/// Touch `size` bytes of stack below the current frame.
fn prefault_stack(size: usize) -> usize {
    if size == 0 {
        return 0;
    }
    let faulted = touch_stack_frames(size, 0);
    debug!(faulted, "Stack pre-faulted");
    faulted
}

#[inline(never)]
fn touch_stack_frames(remaining: usize, depth: usize) -> usize {
    const FRAME_SIZE: usize = 4096;
    const MAX_DEPTH: usize = 2048;

    if remaining < FRAME_SIZE || depth >= MAX_DEPTH {
        return 0;
    }

    let mut frame = [0u8; FRAME_SIZE];
    frame[0] = 0xAA;
    frame[FRAME_SIZE - 1] = 0x55;
    std::hint::black_box(&mut frame);

    FRAME_SIZE + touch_stack_frames(remaining - FRAME_SIZE, depth + 1)
}

#[cfg(target_os = "linux")]
#[allow(unsafe_code)]
fn set_scheduler(policy: SchedPolicy, priority: u8) -> RtResult<(Option<SchedPolicy>, Option<u8>)> {
    let linux_policy = match policy {
        SchedPolicy::Fifo => libc::SCHED_FIFO,
        SchedPolicy::Rr => libc::SCHED_RR,
        SchedPolicy::Other => return Ok((Some(SchedPolicy::Other), None)),
    };

    let clamped = priority.clamp(1, 99);
    if clamped != priority {
        warn!(original = priority, clamped, "Scheduler priority clamped to 1-99");
    }

    let param = libc::sched_param {
        sched_priority: i32::from(clamped),
    };

    // SAFETY: pid 0 names the calling thread and `param` outlives the call.
    let result = unsafe { libc::sched_setscheduler(0, linux_policy, &param) };
    if result == -1 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EPERM) {
            warn!("sched_setscheduler failed with EPERM (no CAP_SYS_NICE); running best-effort");
            return Ok((None, None));
        }
        return Err(RtError::Realtime(format!("sched_setscheduler failed: {err}")));
    }

    info!(?policy, priority = clamped, "Real-time scheduler configured");
    Ok((Some(policy), Some(clamped)))
}

#[cfg(not(target_os = "linux"))]
fn set_scheduler(policy: SchedPolicy, priority: u8) -> RtResult<(Option<SchedPolicy>, Option<u8>)> {
    warn!(?policy, priority, "Real-time scheduling not available on this platform");
    Ok((None, None))
}

/// Pin the calling thread to the given CPUs.
///
/// Returns the applied set, or `None` when no affinity is configured or the
/// set names CPUs that do not exist.
///
/// # Errors
///
/// Returns [`RtError::Realtime`] if a CPU index is out of range for the
/// affinity mask or the kernel rejects the request for another reason.
#[cfg(target_os = "linux")]
pub fn pin_current_thread(affinity: &CpuAffinity) -> RtResult<Option<Vec<usize>>> {
    use nix::sched::{sched_setaffinity, CpuSet};
    use nix::unistd::Pid;

    let cpus = affinity.cpus();
    if cpus.is_empty() {
        return Ok(None);
    }

    let mut cpu_set = CpuSet::new();
    for &cpu in &cpus {
        cpu_set
            .set(cpu)
            .map_err(|e| RtError::Realtime(format!("invalid CPU index {cpu}: {e}")))?;
    }

    match sched_setaffinity(Pid::from_raw(0), &cpu_set) {
        Ok(()) => {
            debug!(?cpus, "Thread pinned");
            Ok(Some(cpus))
        }
        Err(nix::errno::Errno::EINVAL) => {
            warn!(?cpus, "CPU set rejected; some CPUs may not exist");
            Ok(None)
        }
        Err(e) => Err(RtError::Realtime(format!("sched_setaffinity failed: {e}"))),
    }
}

/// Pin the calling thread to the given CPUs.
///
/// # Errors
///
/// Never fails on this platform; affinity is ignored with a warning.
#[cfg(not(target_os = "linux"))]
pub fn pin_current_thread(affinity: &CpuAffinity) -> RtResult<Option<Vec<usize>>> {
    if !affinity.cpus().is_empty() {
        warn!("CPU affinity not available on this platform");
    }
    Ok(None)
}

/// Real-time capabilities of the current process.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct RtCapabilities {
    /// Whether running as root.
    pub is_root: bool,
    /// RLIMIT_RTPRIO soft limit.
    pub rtprio_limit: Option<u64>,
    /// RLIMIT_MEMLOCK soft limit.
    pub memlock_limit: Option<u64>,
    /// Whether the kernel reports PREEMPT_RT.
    pub preempt_rt: bool,
}

impl RtCapabilities {
    /// Check if RT scheduling is likely to succeed.
    #[must_use]
    pub fn can_use_rt_scheduling(&self) -> bool {
        self.is_root || self.rtprio_limit.is_some_and(|l| l > 0)
    }

    /// Check if memory locking is likely to succeed.
    #[must_use]
    pub fn can_lock_memory(&self) -> bool {
        if self.is_root {
            return true;
        }

        #[cfg(unix)]
        {
            self.memlock_limit.is_some_and(|l| l == libc::RLIM_INFINITY)
        }

        #[cfg(not(unix))]
        {
            false
        }
    }
}

/// Probe the real-time capabilities of the current process.
#[cfg(target_os = "linux")]
#[must_use]
pub fn check_rt_capabilities() -> RtCapabilities {
    use nix::sys::resource::{getrlimit, Resource};

    let mut caps = RtCapabilities {
        is_root: nix::unistd::geteuid().is_root(),
        ..RtCapabilities::default()
    };

    caps.rtprio_limit = getrlimit(Resource::RLIMIT_RTPRIO).ok().map(|(soft, _)| soft);
    caps.memlock_limit = getrlimit(Resource::RLIMIT_MEMLOCK).ok().map(|(soft, _)| soft);

    if let Ok(version) = std::fs::read_to_string("/proc/version") {
        caps.preempt_rt = version.contains("PREEMPT_RT") || version.contains("PREEMPT RT");
    }

    caps
}

/// Probe the real-time capabilities of the current process.
#[cfg(not(target_os = "linux"))]
#[must_use]
pub fn check_rt_capabilities() -> RtCapabilities {
    RtCapabilities::default()
}

/// Check that the process can meet the configured real-time requirements.
///
/// A missing PREEMPT_RT kernel is only logged.
///
/// # Errors
///
/// Returns [`RtError::Realtime`] listing each unmet requirement.
pub fn validate_rt_capabilities(config: &RealtimeConfig) -> RtResult<()> {
    if !config.enabled {
        return Ok(());
    }

    let caps = check_rt_capabilities();
    let mut issues = Vec::new();

    if !caps.preempt_rt {
        warn!("PREEMPT_RT kernel not detected; wakeup latency may be degraded");
    }

    if config.policy != SchedPolicy::Other && !caps.can_use_rt_scheduling() {
        issues.push(format!(
            "cannot use SCHED_{:?}: RLIMIT_RTPRIO={:?}, is_root={}",
            config.policy, caps.rtprio_limit, caps.is_root
        ));
    }

    if config.lock_memory && !caps.can_lock_memory() {
        issues.push(format!(
            "cannot lock memory: RLIMIT_MEMLOCK={:?}, is_root={}",
            caps.memlock_limit, caps.is_root
        ));
    }

    if issues.is_empty() {
        Ok(())
    } else {
        let message = format!(
            "real-time requirements not met (fail_fast=true): {}",
            issues.join("; ")
        );
        error!("{message}");
        Err(RtError::Realtime(message))
    }
}
