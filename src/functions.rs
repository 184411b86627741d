//! Named functions a worker process can execute.
//!
//! Closures cannot cross a process boundary, so tasks refer to functions by
//! name. The worker binary builds a [`FunctionRegistry`] at startup and the
//! pool ships `(name, args, kwargs)` descriptors to it.

use crate::task::TaskError;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};

/// Arguments of a single invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Call {
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

impl Call {
    pub fn new(args: Vec<Value>, kwargs: Map<String, Value>) -> Self {
        Self { args, kwargs }
    }

    /// Decode positional argument `index`.
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> Result<T, TaskError> {
        let value = self.args.get(index).ok_or_else(|| {
            TaskError::invalid_argument(format!(
                "missing positional argument {} (got {})",
                index,
                self.args.len()
            ))
        })?;
        serde_json::from_value(value.clone())
            .map_err(|e| TaskError::invalid_argument(format!("argument {}: {}", index, e)))
    }

    /// Decode keyword argument `name`, if present.
    pub fn kwarg<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, TaskError> {
        self.kwargs
            .get(name)
            .map(|value| {
                serde_json::from_value(value.clone())
                    .map_err(|e| TaskError::invalid_argument(format!("keyword '{}': {}", name, e)))
            })
            .transpose()
    }
}

type BoxedFn = Box<dyn Fn(&Call) -> Result<Value, TaskError> + Send + Sync>;

/// Table of functions callable by name.
#[derive(Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, BoxedFn>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `f` under `name`, replacing any previous entry.
    ///
    /// The return value is marshaled to JSON when the function returns; if
    /// that fails the call resolves to [`TaskError::Serialization`]. A
    /// [`TaskError`] returned by `f` is kept as is, while plain string errors
    /// become [`TaskError::Raised`].
    pub fn register<F, R, E>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(&Call) -> Result<R, E> + Send + Sync + 'static,
        R: Serialize,
        E: Into<TaskError>,
    {
        let wrapped = move |call: &Call| -> Result<Value, TaskError> {
            let value = f(call).map_err(|e| -> TaskError { e.into() })?;
            serde_json::to_value(value).map_err(|e| TaskError::serialization(e.to_string()))
        };
        self.functions.insert(name.into(), Box::new(wrapped));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Invoke `name`. Panics are caught and reported as task errors so the
    /// worker survives them.
    pub fn call(&self, name: &str, call: &Call) -> Result<Value, TaskError> {
        let function = self
            .functions
            .get(name)
            .ok_or_else(|| TaskError::UnknownFunction {
                name: name.to_string(),
            })?;

        match catch_unwind(AssertUnwindSafe(|| function(call))) {
            Ok(result) => result,
            Err(payload) => Err(TaskError::Panicked {
                message: panic_message(payload.as_ref()),
            }),
        }
    }
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("functions", &self.names())
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
