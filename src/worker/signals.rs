//! Termination analysis for worker processes.

use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;

/// Why a worker process went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// Normal exit with status code.
    Exited(i32),
    /// Killed by signal.
    Signaled(Signal),
    /// Process is still running.
    StillAlive,
    /// Already reaped elsewhere, or not a process at all.
    Unknown,
}

impl TerminationReason {
    /// Exit code 0: the worker reached its task limit or saw the pool close
    /// its end of the pipe.
    pub fn is_clean(&self) -> bool {
        matches!(self, Self::Exited(0))
    }

    /// Terminated by the pool itself (timeout, cancellation or shutdown).
    pub fn is_requested(&self) -> bool {
        matches!(self, Self::Signaled(Signal::SIGTERM | Signal::SIGKILL))
    }

    pub fn description(&self) -> String {
        match self {
            Self::Exited(code) => format!("exited with code {}", code),
            Self::Signaled(Signal::SIGSEGV) => "crashed (SIGSEGV)".to_string(),
            Self::Signaled(Signal::SIGABRT) => "aborted (SIGABRT)".to_string(),
            Self::Signaled(sig) => format!("killed by signal {:?}", sig),
            Self::StillAlive => "still running".to_string(),
            Self::Unknown => "unknown reason".to_string(),
        }
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

impl From<WaitStatus> for TerminationReason {
    fn from(status: WaitStatus) -> Self {
        match status {
            WaitStatus::Exited(_, code) => Self::Exited(code),
            WaitStatus::Signaled(_, signal, _) => Self::Signaled(signal),
            WaitStatus::StillAlive => Self::StillAlive,
            _ => Self::Unknown,
        }
    }
}
