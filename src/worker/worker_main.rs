//! Worker subprocess main entry point.
//!
//! This module runs when `procpool internal-worker` is invoked. It claims task
//! descriptors from stdin, runs them against the [`FunctionRegistry`] and
//! writes ACK/RESULT lines to stdout. Logs go to stderr.

use super::channel::{ChannelError, DuplexChannel, WorkerEndpoint};
use super::protocol::{WireOutcome, WorkerMessage};
use crate::functions::{Call, FunctionRegistry};
use crate::task::TaskError;
use clap::Args;
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How long a claim blocks before the loop checks in again.
const CLAIM_POLL: Duration = Duration::from_millis(500);

/// Worker-mode flags appended by the pool when spawning a worker.
#[derive(Args, Debug, Clone, Default)]
pub struct WorkerArgs {
    /// Exit after this many tasks (0 = unlimited)
    #[arg(long, default_value_t = 0)]
    pub task_limit: usize,

    /// Function to run once before the first task
    #[arg(long)]
    pub initializer: Option<String>,

    /// JSON array of initializer arguments
    #[arg(long, default_value = "[]")]
    pub initargs: String,
}

impl WorkerArgs {
    fn parsed_initargs(&self) -> Result<Vec<Value>, serde_json::Error> {
        if self.initargs.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&self.initargs)
    }
}

/// Run the configured initializer, if any.
///
/// A failure is kept and handed to the first task instead of killing the
/// worker silently.
fn initialize(functions: &FunctionRegistry, args: &WorkerArgs) -> Option<TaskError> {
    let name = args.initializer.as_deref()?;
    let initargs = match args.parsed_initargs() {
        Ok(initargs) => initargs,
        Err(e) => {
            return Some(TaskError::Initializer {
                message: format!("invalid initargs: {}", e),
            });
        }
    };

    match functions.call(name, &Call::new(initargs, Map::new())) {
        Ok(_) => {
            debug!(initializer = name, "Initializer completed");
            None
        }
        Err(e) => {
            warn!(initializer = name, error = %e, "Initializer failed");
            Some(TaskError::Initializer {
                message: e.to_string(),
            })
        }
    }
}

/// Send a RESULT, substituting an error outcome if the value cannot be
/// marshaled.
fn send_result(
    endpoint: &WorkerEndpoint,
    number: u64,
    outcome: Result<Value, TaskError>,
) -> Result<(), ChannelError> {
    match endpoint.send(&WorkerMessage::result(number, outcome)) {
        Err(ChannelError::Serialization(message)) => {
            warn!(task_number = number, error = %message, "Result not serializable");
            let substitute = WireOutcome::Error {
                error: TaskError::serialization(message),
            };
            endpoint.send(&WorkerMessage::result(number, substitute))
        }
        other => other,
    }
}

/// Worker main loop.
///
/// Returns the number of tasks executed once the task limit is reached or
/// the pool closes the channel.
pub fn worker_loop(
    endpoint: &WorkerEndpoint,
    functions: &FunctionRegistry,
    task_limit: usize,
    init_error: Option<TaskError>,
) -> Result<usize, ChannelError> {
    let pid = std::process::id();
    let mut executed = 0;

    while task_limit == 0 || executed < task_limit {
        let descriptor = match endpoint.claim(Some(CLAIM_POLL), pid) {
            Ok(descriptor) => descriptor,
            Err(ChannelError::Timeout) => continue,
            Err(ChannelError::Broken) => {
                debug!(executed, "Task channel closed");
                return Ok(executed);
            }
            Err(e) => return Err(e),
        };
        executed += 1;
        let number = descriptor.number;

        if let Some(error) = init_error {
            let sent = send_result(endpoint, number, Err(error));
            return match sent {
                Ok(()) | Err(ChannelError::Broken) => Ok(executed),
                Err(e) => Err(e),
            };
        }

        debug!(task_number = number, function = %descriptor.function, "Executing task");
        let call = Call::new(descriptor.args, descriptor.kwargs);
        let outcome = functions.call(&descriptor.function, &call);

        match send_result(endpoint, number, outcome) {
            Ok(()) => {}
            Err(ChannelError::Broken) => {
                debug!(task_number = number, "Result channel closed");
                return Ok(executed);
            }
            Err(e) => return Err(e),
        }
    }

    debug!(executed, task_limit, "Task limit reached");
    Ok(executed)
}

/// Run the worker subprocess main function.
///
/// Never returns: exits 0 when the loop ends normally and 1 on an
/// unexpected channel failure.
pub fn run_worker_main(functions: FunctionRegistry, args: WorkerArgs) -> ! {
    // Ignore SIGPIPE - pipe errors surface as io::Error
    unsafe {
        nix::sys::signal::signal(
            nix::sys::signal::Signal::SIGPIPE,
            nix::sys::signal::SigHandler::SigIgn,
        )
        .ok();
    }

    let endpoint = match WorkerEndpoint::from_stdio() {
        Ok(endpoint) => endpoint,
        Err(e) => {
            error!(error = %e, "Failed to open worker channel");
            std::process::exit(1);
        }
    };

    let init_error = initialize(&functions, &args);
    match worker_loop(&endpoint, &functions, args.task_limit, init_error) {
        Ok(executed) => {
            info!(pid = std::process::id(), executed, "Worker exiting");
            std::process::exit(0)
        }
        Err(e) => {
            error!(error = %e, "Worker error");
            std::process::exit(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::ipc::{LineReader, LineWriter, pipe};
    use crate::worker::protocol::{Line, TaskDescriptor};
    use serde_json::json;
    use std::thread;

    fn functions() -> FunctionRegistry {
        let mut functions = FunctionRegistry::new();
        functions
            .register("double", |call: &Call| call.arg::<i64>(0).map(|x| x * 2))
            .register("fail", |_: &Call| Err::<(), _>("boom"))
            .register("init_fail", |_: &Call| Err::<(), _>("no database"));
        functions
    }

    struct Harness {
        tasks: LineWriter,
        replies: LineReader,
        handle: thread::JoinHandle<Result<usize, ChannelError>>,
    }

    fn start(task_limit: usize, init_error: Option<TaskError>) -> Harness {
        let (task_reader, tasks) = pipe().unwrap();
        let (replies, reply_writer) = pipe().unwrap();
        let handle = thread::spawn(move || {
            let endpoint = WorkerEndpoint::new(task_reader, reply_writer).unwrap();
            worker_loop(&endpoint, &functions(), task_limit, init_error)
        });
        Harness {
            tasks,
            replies,
            handle,
        }
    }

    impl Harness {
        fn submit(&mut self, number: u64, function: &str, args: Vec<Value>) {
            let descriptor = TaskDescriptor {
                number,
                function: function.into(),
                args,
                kwargs: Map::new(),
            };
            self.tasks
                .write_line(&descriptor.to_line().unwrap())
                .unwrap();
        }

        fn next(&mut self) -> WorkerMessage {
            let line = self.replies.read_line().unwrap().unwrap().to_string();
            WorkerMessage::from_line(&line).unwrap()
        }
    }

    fn outcome(message: WorkerMessage) -> WireOutcome {
        match message {
            WorkerMessage::Result { outcome, .. } => outcome,
            other => panic!("Expected result, got {:?}", other),
        }
    }

    #[test]
    fn test_ack_precedes_result() {
        let mut harness = start(0, None);
        harness.submit(1, "double", vec![json!(21)]);

        assert_eq!(harness.next(), WorkerMessage::ack(1, std::process::id()));
        assert_eq!(
            outcome(harness.next()),
            WireOutcome::Ok { value: json!(42) }
        );

        drop(harness.tasks);
        assert_eq!(harness.handle.join().unwrap(), Ok(1));
    }

    #[test]
    fn test_function_error_keeps_worker_running() {
        let mut harness = start(0, None);
        harness.submit(1, "fail", vec![]);
        harness.next();
        assert_eq!(
            outcome(harness.next()),
            WireOutcome::Error {
                error: TaskError::raised("boom")
            }
        );

        harness.submit(2, "double", vec![json!(2)]);
        assert_eq!(harness.next().number(), 2);
        assert_eq!(outcome(harness.next()), WireOutcome::Ok { value: json!(4) });

        drop(harness.tasks);
        assert_eq!(harness.handle.join().unwrap(), Ok(2));
    }

    #[test]
    fn test_unknown_function_is_reported() {
        let mut harness = start(0, None);
        harness.submit(5, "missing", vec![]);
        harness.next();
        assert_eq!(
            outcome(harness.next()),
            WireOutcome::Error {
                error: TaskError::UnknownFunction {
                    name: "missing".into()
                }
            }
        );
        drop(harness.tasks);
        harness.handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_task_limit_stops_loop() {
        let mut harness = start(2, None);
        for n in 1..=3 {
            harness.submit(n, "double", vec![json!(n)]);
        }
        for _ in 0..4 {
            harness.next();
        }
        // Third descriptor is never claimed
        assert_eq!(harness.handle.join().unwrap(), Ok(2));
        assert_eq!(harness.replies.read_line().unwrap(), None);
    }

    #[test]
    fn test_initializer_error_goes_to_first_task() {
        let init_error = initialize(
            &functions(),
            &WorkerArgs {
                initializer: Some("init_fail".into()),
                ..WorkerArgs::default()
            },
        )
        .expect("initializer should fail");
        assert!(init_error.to_string().contains("no database"));

        let mut harness = start(0, Some(init_error.clone()));
        harness.submit(9, "double", vec![json!(1)]);
        harness.next();
        assert_eq!(
            outcome(harness.next()),
            WireOutcome::Error { error: init_error }
        );
        assert_eq!(harness.handle.join().unwrap(), Ok(1));
    }

    #[test]
    fn test_initializer_success_and_bad_initargs() {
        let ok = WorkerArgs {
            initializer: Some("double".into()),
            initargs: "[3]".into(),
            ..WorkerArgs::default()
        };
        assert!(initialize(&functions(), &ok).is_none());

        let bad = WorkerArgs {
            initializer: Some("double".into()),
            initargs: "{not json".into(),
            ..WorkerArgs::default()
        };
        assert!(matches!(
            initialize(&functions(), &bad),
            Some(TaskError::Initializer { .. })
        ));

        assert!(initialize(&functions(), &WorkerArgs::default()).is_none());
    }
}
