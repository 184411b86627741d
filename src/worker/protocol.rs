//! IPC protocol between the pool and its worker processes.
//!
//! Messages are JSON-serialized and newline-delimited. The pool sends one
//! [`TaskDescriptor`] at a time; the worker answers with an
//! [`WorkerMessage::Ack`] as soon as it claims the task and a
//! [`WorkerMessage::Result`] once the function returns.

use crate::task::{TaskError, TaskOutcome};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Request from pool to worker: run `function(*args, **kwargs)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "task")]
pub struct TaskDescriptor {
    /// Task number, echoed back in the ACK and RESULT.
    pub number: u64,
    /// Registered function name.
    pub function: String,
    /// Positional arguments.
    #[serde(default)]
    pub args: Vec<Value>,
    /// Keyword arguments.
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

/// Result payload carried by [`WorkerMessage::Result`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WireOutcome {
    Ok { value: Value },
    Error { error: TaskError },
}

impl From<Result<Value, TaskError>> for WireOutcome {
    fn from(result: Result<Value, TaskError>) -> Self {
        match result {
            Ok(value) => Self::Ok { value },
            Err(error) => Self::Error { error },
        }
    }
}

impl From<WireOutcome> for TaskOutcome {
    fn from(outcome: WireOutcome) -> Self {
        match outcome {
            WireOutcome::Ok { value } => TaskOutcome::Ok(value),
            WireOutcome::Error { error } => TaskOutcome::Failed(error),
        }
    }
}

/// Message from worker to pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkerMessage {
    /// The worker claimed task `number` and is about to execute it.
    #[serde(rename = "ack")]
    Ack { number: u64, pid: u32 },

    /// Task `number` finished.
    #[serde(rename = "result")]
    Result { number: u64, outcome: WireOutcome },
}

impl WorkerMessage {
    pub fn ack(number: u64, pid: u32) -> Self {
        Self::Ack { number, pid }
    }

    pub fn result(number: u64, outcome: impl Into<WireOutcome>) -> Self {
        Self::Result {
            number,
            outcome: outcome.into(),
        }
    }

    pub fn number(&self) -> u64 {
        match self {
            Self::Ack { number, .. } | Self::Result { number, .. } => *number,
        }
    }

    pub fn is_result(&self) -> bool {
        matches!(self, Self::Result { .. })
    }
}

/// Newline-delimited JSON encoding shared by both message directions.
pub trait Line: Serialize + for<'de> Deserialize<'de> {
    /// Serialize to a JSON line (with newline).
    fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    /// Deserialize from a JSON line.
    fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}

impl Line for TaskDescriptor {}
impl Line for WorkerMessage {}
