//! Worker subprocess spawning.
//!
//! The pool only sees the [`WorkerSpawner`] / [`WorkerHandle`] pair. The
//! production implementation re-invokes the current executable in its hidden
//! `internal-worker` mode and connects it to the shared wire through a pump
//! thread.

use super::channel::WorkerWire;
use super::ipc::{LineReader, LineWriter};
use super::proc::Proc;
use super::pump::pump;
use super::signals::TerminationReason;
use crate::error::{PoolError, Result};
use serde_json::Value;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Subcommand the binary dispatches to worker mode.
pub const WORKER_SUBCOMMAND: &str = "internal-worker";

/// Program and leading arguments used to start a worker.
///
/// The default re-invokes the current executable with `internal-worker`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    program: Option<PathBuf>,
    args: Vec<OsString>,
}

impl Default for WorkerCommand {
    fn default() -> Self {
        Self {
            program: None,
            args: vec![WORKER_SUBCOMMAND.into()],
        }
    }
}

impl WorkerCommand {
    /// Start workers with `program` and no leading arguments.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: Some(program.into()),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    fn command(&self) -> Result<Command> {
        let program = match &self.program {
            Some(program) => program.clone(),
            None => std::env::current_exe().map_err(|e| {
                PoolError::Worker(format!("Failed to get current executable: {}", e))
            })?,
        };
        let mut command = Command::new(program);
        command.args(&self.args);
        Ok(command)
    }
}

/// Everything a new worker needs.
#[derive(Debug, Clone)]
pub struct WorkerLaunch {
    pub wire: WorkerWire,
    pub initializer: Option<String>,
    pub initargs: Vec<Value>,
    /// Tasks to run before exiting; 0 means unlimited.
    pub task_limit: usize,
}

/// Creates workers.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, launch: &WorkerLaunch) -> Result<Box<dyn WorkerHandle>>;
}

/// A running worker as seen by the pool.
pub trait WorkerHandle: Send {
    fn pid(&self) -> u32;

    /// Non-blocking liveness check; reaps the worker if it has exited.
    fn is_alive(&mut self) -> bool;

    /// Best-effort request to stop immediately.
    fn terminate(&mut self) -> Result<()>;

    /// Let the worker finish within `grace`, then force it, and reap it.
    fn join(&mut self, grace: Duration) -> Result<TerminationReason>;
}

/// Spawns workers as subprocesses speaking JSON lines over stdin/stdout.
#[derive(Debug, Clone, Default)]
pub struct ProcessSpawner {
    command: WorkerCommand,
}

impl ProcessSpawner {
    pub fn new(command: WorkerCommand) -> Self {
        Self { command }
    }
}

impl WorkerSpawner for ProcessSpawner {
    fn spawn(&self, launch: &WorkerLaunch) -> Result<Box<dyn WorkerHandle>> {
        let mut command = self.command.command()?;
        command
            .arg("--task-limit")
            .arg(launch.task_limit.to_string());
        if let Some(initializer) = &launch.initializer {
            command.arg("--initializer").arg(initializer);
            command
                .arg("--initargs")
                .arg(serde_json::to_string(&launch.initargs)?);
        }

        let (proc, writer, reader) = Proc::spawn(&mut command)?;
        let worker = ProcessWorker::start(proc, writer, reader, launch)?;
        Ok(Box::new(worker))
    }
}

/// A worker subprocess plus the pump thread feeding it.
#[derive(Debug)]
pub struct ProcessWorker {
    proc: Proc,
    pump: Option<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
}

impl ProcessWorker {
    fn start(
        proc: Proc,
        writer: LineWriter,
        reader: LineReader,
        launch: &WorkerLaunch,
    ) -> Result<Self> {
        let pid = proc.pid().as_raw() as u32;
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let wire = launch.wire.clone();
        let task_limit = launch.task_limit;
        let handle = thread::Builder::new()
            .name(format!("worker-pump-{}", pid))
            .spawn(move || pump(pid, writer, reader, wire, task_limit, flag))?;
        Ok(Self {
            proc,
            pump: Some(handle),
            stop,
        })
    }
}

impl WorkerHandle for ProcessWorker {
    fn pid(&self) -> u32 {
        self.proc.pid().as_raw() as u32
    }

    fn is_alive(&mut self) -> bool {
        self.proc.is_running()
    }

    fn terminate(&mut self) -> Result<()> {
        self.proc.terminate()
    }

    fn join(&mut self, grace: Duration) -> Result<TerminationReason> {
        // An idle pump exits on the flag and closes the worker's stdin
        self.stop.store(true, Ordering::SeqCst);
        let reason = self.proc.stop(grace)?;
        if let Some(pump) = self.pump.take()
            && pump.join().is_err()
        {
            tracing::warn!(worker_pid = self.pid(), "Pump thread panicked");
        }
        Ok(reason)
    }
}

impl Drop for ProcessWorker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::channel::{DuplexChannel, PoolEndpoint};
    use crate::worker::protocol::{Line, TaskDescriptor, WorkerMessage};
    use serde_json::{Map, json};

    fn launch(endpoint: &PoolEndpoint) -> WorkerLaunch {
        WorkerLaunch {
            wire: endpoint.wire(),
            initializer: None,
            initargs: Vec::new(),
            task_limit: 0,
        }
    }

    #[test]
    fn test_default_command_uses_worker_subcommand() {
        let command = WorkerCommand::default();
        assert!(command.program.is_none());
        assert_eq!(command.args, vec![OsString::from("internal-worker")]);

        let command = WorkerCommand::new("/bin/true").arg("x");
        assert_eq!(command.program, Some(PathBuf::from("/bin/true")));
        assert_eq!(command.args, vec![OsString::from("x")]);
    }

    #[test]
    fn test_idle_worker_exits_cleanly_on_join() {
        let endpoint = PoolEndpoint::new();
        let spawner = ProcessSpawner::new(WorkerCommand::new("sh").arg("-c").arg("cat >/dev/null"));
        let mut worker = spawner.spawn(&launch(&endpoint)).unwrap();
        assert!(worker.pid() > 0);
        assert!(worker.is_alive());

        // The pump closes the worker's stdin, so cat sees EOF
        let reason = worker.join(Duration::from_secs(2)).unwrap();
        assert!(reason.is_clean());
        assert!(!worker.is_alive());
    }

    #[test]
    fn test_scripted_worker_round_trip() {
        let endpoint = PoolEndpoint::new();
        let ack = WorkerMessage::ack(1, 7).to_line().unwrap();
        let result = WorkerMessage::result(1, Ok::<Value, _>(json!("done")))
            .to_line()
            .unwrap();
        let script = format!(
            "read line; printf '%s\\n' '{}' '{}'; read line; exit 0",
            ack.trim_end(),
            result.trim_end()
        );
        let spawner = ProcessSpawner::new(WorkerCommand::new("sh").arg("-c").arg(script));
        let mut worker = spawner.spawn(&launch(&endpoint)).unwrap();

        endpoint
            .send(&TaskDescriptor {
                number: 1,
                function: "anything".into(),
                args: Vec::new(),
                kwargs: Map::new(),
            })
            .unwrap();

        let wait = Some(Duration::from_secs(5));
        assert_eq!(
            endpoint.receive(wait).unwrap(),
            Some(WorkerMessage::ack(1, 7))
        );
        assert!(endpoint.receive(wait).unwrap().unwrap().is_result());

        assert!(worker.join(Duration::from_secs(2)).unwrap().is_clean());
    }

    #[test]
    fn test_terminate_stops_busy_worker() {
        let endpoint = PoolEndpoint::new();
        let spawner = ProcessSpawner::new(WorkerCommand::new("sh").arg("-c").arg("exec sleep 60"));
        let mut worker = spawner.spawn(&launch(&endpoint)).unwrap();
        assert!(worker.is_alive());

        worker.terminate().unwrap();
        let reason = worker.join(Duration::from_secs(2)).unwrap();
        assert!(reason.is_requested());
    }

    #[test]
    fn test_spawn_failure_is_reported() {
        let endpoint = PoolEndpoint::new();
        let spawner = ProcessSpawner::new(WorkerCommand::new("/nonexistent/procpool"));
        assert!(spawner.spawn(&launch(&endpoint)).is_err());
    }
}
