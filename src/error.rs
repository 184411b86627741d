//! Error types for procpool.

use crate::pool::PoolState;
use crate::task::TaskError;
use crate::worker::ChannelError;
use std::time::Duration;
use thiserror::Error;

/// Main error type for procpool.
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Pool is not running (state: {0})")]
    NotRunning(PoolState),

    #[error("Pool cannot be started from state {0}")]
    AlreadyStarted(PoolState),

    #[error("Pool is closing and no longer accepts tasks")]
    Closing,

    #[error("Pool failed: {0}")]
    PoolFailed(String),

    #[error("Invalid pool configuration: {0}")]
    InvalidConfig(String),

    #[error("Task {number} timed out after {timeout:?}")]
    TaskTimeout { number: u64, timeout: Duration },

    #[error("Task {0} was cancelled")]
    TaskCancelled(u64),

    #[error("Task {0} lost its worker and could not be rescheduled")]
    WorkerLost(u64),

    #[error("Task {number} failed: {source}")]
    TaskFailed {
        number: u64,
        #[source]
        source: TaskError,
    },

    #[error("Task {0} is still pending")]
    Pending(u64),

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PoolError {
    /// The underlying task error, if this error carries one.
    pub fn task_error(&self) -> Option<&TaskError> {
        match self {
            Self::TaskFailed { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Result type alias for procpool operations.
pub type Result<T> = std::result::Result<T, PoolError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_not_running_error_message() {
        let err = PoolError::NotRunning(PoolState::Stopped);
        let msg = err.to_string();
        assert!(msg.contains("not running"));
        assert!(msg.contains("stopped"));
    }

    #[test]
    fn test_task_timeout_error_message() {
        let err = PoolError::TaskTimeout {
            number: 7,
            timeout: Duration::from_millis(100),
        };
        let msg = err.to_string();
        assert!(msg.contains("Task 7"));
        assert!(msg.contains("100ms"));
    }

    #[test]
    fn test_task_failed_exposes_source() {
        let err = PoolError::TaskFailed {
            number: 3,
            source: TaskError::raised("boom"),
        };
        assert!(err.to_string().contains("boom"));
        assert_eq!(err.task_error(), Some(&TaskError::raised("boom")));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_cancelled_and_lost_messages() {
        assert!(PoolError::TaskCancelled(1).to_string().contains("cancelled"));
        assert!(PoolError::WorkerLost(2).to_string().contains("lost its worker"));
        assert!(PoolError::Pending(3).to_string().contains("pending"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed");
        let err: PoolError = io_err.into();
        assert!(err.to_string().contains("pipe closed"));
        assert!(err.task_error().is_none());
    }

    #[test]
    fn test_channel_error_conversion() {
        let err: PoolError = ChannelError::Broken.into();
        assert!(err.to_string().contains("Channel error"));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{ nope }").unwrap_err();
        let err: PoolError = json_err.into();
        assert!(err.to_string().contains("JSON"));
    }
}
