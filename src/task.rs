//! Scheduled units of work and their outcome slot.
//!
//! A [`Task`] is created by [`Pool::schedule`](crate::Pool::schedule) and shared
//! between the caller and the pool loops. It moves monotonically through
//! `created -> scheduled -> started -> ready`; the outcome is written once and the
//! callback (if any) runs exactly once.

use crate::error::{PoolError, Result};
use crate::worker::TaskDescriptor;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Completion callback, invoked with the resolved task.
pub type Callback = Arc<dyn Fn(&Task) + Send + Sync>;

/// Error produced while running a task inside a worker.
///
/// These cross the process boundary, so they carry messages rather than
/// source errors.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskError {
    /// The function returned an error.
    #[error("{message}")]
    Raised { message: String },

    /// The function panicked.
    #[error("task panicked: {message}")]
    Panicked { message: String },

    /// Arguments or result could not be marshaled.
    #[error("serialization failed: {message}")]
    Serialization { message: String },

    /// No function registered under this name in the worker.
    #[error("unknown function '{name}'")]
    UnknownFunction { name: String },

    /// An argument could not be decoded into the expected type.
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    /// The worker initializer failed before the task could run.
    #[error("worker initializer failed: {message}")]
    Initializer { message: String },
}

impl TaskError {
    /// Create an error for a function that returned a failure.
    pub fn raised(message: impl Into<String>) -> Self {
        Self::Raised {
            message: message.into(),
        }
    }

    /// Create a marshaling error.
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Create an argument decoding error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }
}

impl From<String> for TaskError {
    fn from(message: String) -> Self {
        Self::raised(message)
    }
}

impl From<&str> for TaskError {
    fn from(message: &str) -> Self {
        Self::raised(message)
    }
}

/// Final state of a task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// The function returned a value.
    Ok(Value),
    /// Execution exceeded the task timeout.
    TimedOut,
    /// The task was cancelled before it finished.
    Cancelled,
    /// The function (or its marshaling) failed.
    Failed(TaskError),
    /// The worker went away and the task could not be rescheduled.
    WorkerLost,
}

impl TaskOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }
}

impl From<std::result::Result<Value, TaskError>> for TaskOutcome {
    fn from(result: std::result::Result<Value, TaskError>) -> Self {
        match result {
            Ok(value) => Self::Ok(value),
            Err(error) => Self::Failed(error),
        }
    }
}

/// Per-task scheduling options.
#[derive(Clone, Default)]
pub struct TaskOptions {
    pub(crate) kwargs: Map<String, Value>,
    pub(crate) identifier: Option<String>,
    pub(crate) callback: Option<Callback>,
    pub(crate) timeout: Option<Duration>,
}

impl TaskOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the keyword arguments.
    pub fn with_kwargs(mut self, kwargs: Map<String, Value>) -> Self {
        self.kwargs = kwargs;
        self
    }

    /// Add a single keyword argument.
    pub fn with_kwarg(mut self, key: impl Into<String>, value: Value) -> Self {
        self.kwargs.insert(key.into(), value);
        self
    }

    /// Attach an opaque correlation tag. The pool never interprets it.
    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    /// Run `callback` once the task is resolved.
    pub fn with_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Task) + Send + Sync + 'static,
    {
        self.callback = Some(Arc::new(callback));
        self
    }

    /// Limit execution time, measured from the worker's acknowledgment.
    /// A zero duration means no timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }
}

impl fmt::Debug for TaskOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskOptions")
            .field("kwargs", &self.kwargs)
            .field("identifier", &self.identifier)
            .field("callback", &self.callback.is_some())
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[derive(Debug, Default)]
struct TaskState {
    started: bool,
    pid: Option<u32>,
    timestamp: Option<Instant>,
    outcome: Option<TaskOutcome>,
}

/// One scheduled unit of work.
pub struct Task {
    number: u64,
    function: String,
    args: Vec<Value>,
    kwargs: Map<String, Value>,
    timeout: Option<Duration>,
    identifier: Option<String>,
    callback: Option<Callback>,
    cancelled: AtomicBool,
    state: Mutex<TaskState>,
    resolved: Condvar,
}

impl Task {
    pub(crate) fn new(
        number: u64,
        function: impl Into<String>,
        args: Vec<Value>,
        options: TaskOptions,
    ) -> Self {
        Self {
            number,
            function: function.into(),
            args,
            kwargs: options.kwargs,
            timeout: options.timeout,
            identifier: options.identifier,
            callback: options.callback,
            cancelled: AtomicBool::new(false),
            state: Mutex::new(TaskState::default()),
            resolved: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TaskState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Unique, monotonically increasing task number.
    pub fn number(&self) -> u64 {
        self.number
    }

    pub fn function(&self) -> &str {
        &self.function
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn kwargs(&self) -> &Map<String, Value> {
        &self.kwargs
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn identifier(&self) -> Option<&str> {
        self.identifier.as_deref()
    }

    /// Request cancellation.
    ///
    /// Advisory: the supervisor acts on it at its next scan, unless the task
    /// has already resolved, in which case the existing outcome stands.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Whether a worker has acknowledged this task.
    pub fn started(&self) -> bool {
        self.lock().started
    }

    /// Whether the task has been resolved.
    pub fn ready(&self) -> bool {
        self.lock().outcome.is_some()
    }

    /// Pid of the worker that acknowledged the task.
    pub fn pid(&self) -> Option<u32> {
        self.lock().pid
    }

    pub(crate) fn started_at(&self) -> Option<Instant> {
        self.lock().timestamp
    }

    /// The outcome, once resolved.
    pub fn outcome(&self) -> Option<TaskOutcome> {
        self.lock().outcome.clone()
    }

    /// Record the acknowledgment from worker `pid`.
    ///
    /// Returns `false` if the task was already resolved.
    pub(crate) fn mark_started(&self, pid: u32) -> bool {
        let mut state = self.lock();
        if state.outcome.is_some() {
            return false;
        }
        state.started = true;
        state.pid = Some(pid);
        state.timestamp = Some(Instant::now());
        true
    }

    /// Forget the owning worker so the task can be dispatched again.
    pub(crate) fn reset(&self) {
        let mut state = self.lock();
        state.started = false;
        state.pid = None;
        state.timestamp = None;
    }

    /// Store the outcome, run the callback and wake waiters.
    ///
    /// Only the first call has an effect; later calls return `false`.
    pub(crate) fn resolve(&self, outcome: TaskOutcome) -> bool {
        {
            let mut state = self.lock();
            if state.outcome.is_some() {
                tracing::debug!(task_number = self.number, "Ignoring second resolution");
                return false;
            }
            state.outcome = Some(outcome);
        }

        if let Some(callback) = &self.callback
            && catch_unwind(AssertUnwindSafe(|| callback(self))).is_err()
        {
            tracing::warn!(task_number = self.number, "Task callback panicked");
        }

        self.resolved.notify_all();
        true
    }

    /// Block until the task is resolved or `timeout` elapses.
    ///
    /// Returns whether the task is ready.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let guard = self.lock();
        match timeout {
            None => {
                let _guard = self
                    .resolved
                    .wait_while(guard, |s| s.outcome.is_none())
                    .unwrap_or_else(PoisonError::into_inner);
                true
            }
            Some(timeout) => {
                let (guard, _) = self
                    .resolved
                    .wait_timeout_while(guard, timeout, |s| s.outcome.is_none())
                    .unwrap_or_else(PoisonError::into_inner);
                guard.outcome.is_some()
            }
        }
    }

    /// Wait for the result.
    ///
    /// With a `timeout`, returns [`PoolError::Pending`] if the task is still
    /// unresolved when it elapses.
    pub fn get(&self, timeout: Option<Duration>) -> Result<Value> {
        if !self.wait(timeout) {
            return Err(PoolError::Pending(self.number));
        }
        match self.outcome() {
            Some(TaskOutcome::Ok(value)) => Ok(value),
            Some(TaskOutcome::TimedOut) => Err(PoolError::TaskTimeout {
                number: self.number,
                timeout: self.timeout.unwrap_or_default(),
            }),
            Some(TaskOutcome::Cancelled) => Err(PoolError::TaskCancelled(self.number)),
            Some(TaskOutcome::Failed(source)) => Err(PoolError::TaskFailed {
                number: self.number,
                source,
            }),
            Some(TaskOutcome::WorkerLost) => Err(PoolError::WorkerLost(self.number)),
            None => Err(PoolError::Pending(self.number)),
        }
    }

    /// Wait for the result and decode it.
    pub fn get_as<T: DeserializeOwned>(&self, timeout: Option<Duration>) -> Result<T> {
        let value = self.get(timeout)?;
        serde_json::from_value(value).map_err(|e| PoolError::TaskFailed {
            number: self.number,
            source: TaskError::serialization(e.to_string()),
        })
    }

    pub(crate) fn descriptor(&self) -> TaskDescriptor {
        TaskDescriptor {
            number: self.number,
            function: self.function.clone(),
            args: self.args.clone(),
            kwargs: self.kwargs.clone(),
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("Task")
            .field("number", &self.number)
            .field("function", &self.function)
            .field("identifier", &self.identifier)
            .field("timeout", &self.timeout)
            .field("cancelled", &self.cancelled())
            .field("started", &state.started)
            .field("pid", &state.pid)
            .field("ready", &state.outcome.is_some())
            .finish()
    }
}
