//! Functions shipped with the `procpool` binary.
//!
//! These back the `run` command and the end-to-end tests. Nothing here may
//! write to stdout: in a worker, stdout is the IPC channel.

use crate::functions::{Call, FunctionRegistry};
use crate::task::TaskError;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

/// Value stored by the `init_marker` initializer in this worker process.
static INIT_MARKER: OnceLock<Value> = OnceLock::new();

fn double(call: &Call) -> Result<Value, TaskError> {
    let value: Value = call.arg(0)?;
    if let Some(n) = value.as_i64() {
        return n
            .checked_mul(2)
            .map(Value::from)
            .ok_or_else(|| TaskError::raised("integer overflow"));
    }
    match value.as_f64() {
        Some(x) => Ok(json!(x * 2.0)),
        None => Err(TaskError::invalid_argument(format!(
            "expected a number, got {}",
            value
        ))),
    }
}

fn add(call: &Call) -> Result<i64, TaskError> {
    let a: i64 = call.arg(0)?;
    let b: i64 = call.arg(1)?;
    a.checked_add(b)
        .ok_or_else(|| TaskError::raised("integer overflow"))
}

fn seconds(value: f64) -> Result<Duration, TaskError> {
    Duration::try_from_secs_f64(value)
        .map_err(|e| TaskError::invalid_argument(format!("bad duration {}: {}", value, e)))
}

fn sleep(call: &Call) -> Result<f64, TaskError> {
    let secs: f64 = call.arg(0)?;
    std::thread::sleep(seconds(secs)?);
    Ok(secs)
}

/// `sleep_double(x, seconds=0.5)`: sleep, then double `x`.
fn sleep_double(call: &Call) -> Result<Value, TaskError> {
    let secs = match call.kwarg::<f64>("seconds")? {
        Some(secs) => secs,
        None if call.args.len() > 1 => call.arg(1)?,
        None => 0.5,
    };
    std::thread::sleep(seconds(secs)?);
    double(call)
}

fn fail(call: &Call) -> Result<(), String> {
    let message = call
        .arg::<String>(0)
        .unwrap_or_else(|_| "task failed".to_string());
    Err(message)
}

fn panic(call: &Call) -> Result<(), TaskError> {
    let message = call
        .arg::<String>(0)
        .unwrap_or_else(|_| "task panicked".to_string());
    panic!("{}", message);
}

fn echo(call: &Call) -> Result<Value, TaskError> {
    Ok(json!({ "args": call.args, "kwargs": call.kwargs }))
}

/// A map with tuple keys has no JSON form.
fn unserializable(_: &Call) -> Result<HashMap<(i32, i32), i32>, TaskError> {
    Ok(HashMap::from([((1, 2), 3)]))
}

fn init_marker(call: &Call) -> Result<(), TaskError> {
    let marker = call.args.first().cloned().unwrap_or(Value::Bool(true));
    // A second initialization in the same process keeps the first marker
    let _ = INIT_MARKER.set(marker);
    Ok(())
}

fn init_fail(call: &Call) -> Result<(), String> {
    let message = call
        .arg::<String>(0)
        .unwrap_or_else(|_| "initializer failed".to_string());
    Err(message)
}

fn init_value(_: &Call) -> Result<Value, TaskError> {
    Ok(INIT_MARKER.get().cloned().unwrap_or(Value::Null))
}

/// Registry with every builtin function and initializer.
pub fn registry() -> FunctionRegistry {
    let mut functions = FunctionRegistry::new();
    functions
        .register("double", double)
        .register("add", add)
        .register("sleep", sleep)
        .register("sleep_double", sleep_double)
        .register("fail", fail)
        .register("panic", panic)
        .register("pid", |_: &Call| Ok::<_, TaskError>(std::process::id()))
        .register("echo", echo)
        .register("unserializable", unserializable)
        .register("init_marker", init_marker)
        .register("init_fail", init_fail)
        .register("init_value", init_value);
    functions
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn call(name: &str, args: Vec<Value>) -> Result<Value, TaskError> {
        registry().call(name, &Call::new(args, Map::new()))
    }

    #[test]
    fn test_double_integers_and_floats() {
        assert_eq!(call("double", vec![json!(21)]).unwrap(), json!(42));
        assert_eq!(call("double", vec![json!(1.5)]).unwrap(), json!(3.0));
        assert!(matches!(
            call("double", vec![json!("x")]),
            Err(TaskError::InvalidArgument { .. })
        ));
        assert!(call("double", vec![json!(i64::MAX)]).is_err());
    }

    #[test]
    fn test_add_and_missing_argument() {
        assert_eq!(call("add", vec![json!(2), json!(3)]).unwrap(), json!(5));
        assert!(matches!(
            call("add", vec![json!(2)]),
            Err(TaskError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_sleep_double_keyword() {
        let mut kwargs = Map::new();
        kwargs.insert("seconds".into(), json!(0.01));
        let result = registry().call("sleep_double", &Call::new(vec![json!(4)], kwargs));
        assert_eq!(result.unwrap(), json!(8));
        assert!(call("sleep", vec![json!(-1.0)]).is_err());
    }

    #[test]
    fn test_fail_and_panic_are_task_errors() {
        assert_eq!(
            call("fail", vec![json!("nope")]),
            Err(TaskError::raised("nope"))
        );
        assert!(matches!(
            call("panic", vec![json!("kaboom")]),
            Err(TaskError::Panicked { message }) if message == "kaboom"
        ));
    }

    #[test]
    fn test_unserializable_result() {
        assert!(matches!(
            call("unserializable", vec![]),
            Err(TaskError::Serialization { .. })
        ));
    }

    #[test]
    fn test_echo_and_pid() {
        assert_eq!(
            call("echo", vec![json!("hi")]).unwrap(),
            json!({ "args": ["hi"], "kwargs": {} })
        );
        assert_eq!(
            call("pid", vec![]).unwrap(),
            json!(std::process::id())
        );
    }

    #[test]
    fn test_init_marker_round_trip() {
        call("init_marker", vec![json!("ready")]).unwrap();
        assert_eq!(call("init_value", vec![]).unwrap(), json!("ready"));
        assert!(call("init_fail", vec![]).is_err());
    }

    #[test]
    fn test_registry_names() {
        let functions = registry();
        assert!(functions.contains("sleep_double"));
        assert_eq!(functions.names().len(), 12);
    }
}
