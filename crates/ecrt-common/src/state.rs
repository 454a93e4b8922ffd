//! Lifecycle state of a cyclic worker.
//!
//! RUNNING → STOPPING → STOPPED
//!
//! The worker enters RUNNING when its thread starts. Any thread may
//! request STOPPING; only the worker itself moves to STOPPED, after it has
//! left its loop.

use crate::error::{RtError, RtResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Worker lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerState {
    /// Loop is executing cycles.
    #[default]
    Running,
    /// Stop was requested; the loop exits at its next check.
    Stopping,
    /// Loop has exited.
    Stopped,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "RUNNING"),
            Self::Stopping => write!(f, "STOPPING"),
            Self::Stopped => write!(f, "STOPPED"),
        }
    }
}

impl WorkerState {
    /// Check if a transition to `target` is valid from the current state.
    #[must_use]
    pub fn can_transition_to(&self, target: WorkerState) -> bool {
        use WorkerState::{Running, Stopped, Stopping};

        matches!(
            (self, target),
            (Running, Stopping)
                | (Stopping, Stopped)
                // A loop can end on its own, e.g. when the work is exhausted
                | (Running, Stopped)
        )
    }

    /// Attempt to transition to `target`, returning error if invalid.
    ///
    /// # Errors
    ///
    /// Returns [`RtError::InvalidStateTransition`] if the move is not allowed.
    pub fn transition_to(&mut self, target: WorkerState) -> RtResult<()> {
        if self.can_transition_to(target) {
            *self = target;
            Ok(())
        } else {
            Err(RtError::InvalidStateTransition {
                from: self.to_string(),
                to: target.to_string(),
            })
        }
    }

    /// Returns true once the worker has exited.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Stopped)
    }

    /// Encoding used for atomic storage.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Running => 0,
            Self::Stopping => 1,
            Self::Stopped => 2,
        }
    }

    /// Decode a value produced by [`Self::as_u8`].
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Running),
            1 => Some(Self::Stopping),
            2 => Some(Self::Stopped),
            _ => None,
        }
    }
}
