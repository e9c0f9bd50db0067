//! Runner lifecycle states

use std::fmt;

/// Lifecycle state of the worker, driven by the master
///
/// `Ready` is initial; `Quitting` is terminal. `Missing` is entered when
/// the master goes silent and left on a reconnect acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    /// Registered and waiting for a spawn
    Ready,
    /// Reconciling the user population toward a target
    Spawning,
    /// Population matches the target, load is flowing
    Running,
    /// All users torn down, awaiting a new spawn
    Stopped,
    /// Shutting down for good
    Quitting,
    /// Master has gone silent
    Missing,
}

impl RunnerState {
    /// Wire form used in heartbeats
    pub fn as_str(self) -> &'static str {
        match self {
            RunnerState::Ready => "ready",
            RunnerState::Spawning => "spawning",
            RunnerState::Running => "running",
            RunnerState::Stopped => "stopped",
            RunnerState::Quitting => "quitting",
            RunnerState::Missing => "missing",
        }
    }
}

impl fmt::Display for RunnerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
