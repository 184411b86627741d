//! The process pool façade and its background loops.
//!
//! A running pool owns four named threads sharing one [`PoolContext`]:
//!
//! - `procpool-scheduler` moves tasks from the inbound queue onto the channel
//! - `procpool-messages` applies ACK and RESULT messages
//! - `procpool-supervisor` enforces timeouts and cancellation and
//!   re-enqueues tasks whose worker died
//! - `procpool-manager` reaps dead workers and spawns replacements
//!
//! The loops never call each other; they meet only at the task registry, the
//! inbound queue and the channel.

mod context;
mod manager;
mod messages;
mod scheduler;
mod supervisor;

use crate::error::{PoolError, Result};
use crate::task::{Task, TaskError, TaskOptions, TaskOutcome};
use crate::worker::{ProcessSpawner, WorkerCommand, WorkerSpawner};
use context::PoolContext;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Lifecycle of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Created,
    Running,
    Stopped,
    /// An internal loop failed. Terminal.
    Error,
}

impl fmt::Display for PoolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of worker processes to keep alive.
    pub workers: usize,
    /// Tasks a worker runs before it is recycled (0 = unlimited).
    pub task_limit: usize,
    /// Registered function run once in every new worker.
    pub initializer: Option<String>,
    pub initargs: Vec<Value>,
    pub worker_command: WorkerCommand,
    /// How often timeouts, cancellation and worker liveness are checked.
    pub supervisor_interval: Duration,
    /// Bounded wait of the scheduler and message loops.
    pub poll_interval: Duration,
    /// Time idle workers get to exit on `stop` before being signaled.
    pub stop_grace: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: thread::available_parallelism().map_or(1, |n| n.get()),
            task_limit: 0,
            initializer: None,
            initargs: Vec::new(),
            worker_command: WorkerCommand::default(),
            supervisor_interval: Duration::from_millis(200),
            poll_interval: Duration::from_millis(100),
            stop_grace: Duration::from_secs(2),
        }
    }
}

impl PoolConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_task_limit(mut self, task_limit: usize) -> Self {
        self.task_limit = task_limit;
        self
    }

    pub fn with_initializer(mut self, name: impl Into<String>, initargs: Vec<Value>) -> Self {
        self.initializer = Some(name.into());
        self.initargs = initargs;
        self
    }

    pub fn with_worker_command(mut self, command: WorkerCommand) -> Self {
        self.worker_command = command;
        self
    }

    pub fn with_supervisor_interval(mut self, interval: Duration) -> Self {
        self.supervisor_interval = interval;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(PoolError::InvalidConfig(
                "at least one worker is required".into(),
            ));
        }
        if self.supervisor_interval.is_zero() || self.poll_interval.is_zero() {
            return Err(PoolError::InvalidConfig(
                "loop intervals must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Point-in-time counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub workers: usize,
    pub live_workers: usize,
    pub queued: usize,
    pub in_flight: usize,
    pub scheduled: u64,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub cancelled: u64,
    pub lost: u64,
    pub requeued: u64,
    pub worker_restarts: u64,
}

type LoopFn = fn(&PoolContext) -> Result<()>;

/// A fixed-size pool of worker processes.
pub struct Pool {
    context: Arc<PoolContext>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl Pool {
    /// Pool whose workers are subprocesses started with
    /// `config.worker_command`.
    pub fn new(config: PoolConfig) -> Self {
        let spawner = ProcessSpawner::new(config.worker_command.clone());
        Self::with_spawner(config, spawner)
    }

    /// Pool with a custom worker spawner.
    pub fn with_spawner(config: PoolConfig, spawner: impl WorkerSpawner + 'static) -> Self {
        Self {
            context: Arc::new(PoolContext::new(config, Box::new(spawner))),
            loops: Mutex::new(Vec::new()),
        }
    }

    pub fn state(&self) -> PoolState {
        self.context.state()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.context.config
    }

    /// Spawn the initial workers and the background loops.
    pub fn start(&self) -> Result<()> {
        self.context.config.validate()?;
        self.context
            .transition(PoolState::Created, PoolState::Running)
            .map_err(PoolError::AlreadyStarted)?;

        // Spawn errors surface here rather than in the manager loop
        if let Err(e) = self.context.manager.maintain() {
            self.context.fail(e.to_string());
            self.shutdown_now();
            return Err(e);
        }

        let loops: [(&str, LoopFn); 4] = [
            ("procpool-scheduler", scheduler::scheduler_loop),
            ("procpool-messages", messages::message_loop),
            ("procpool-supervisor", supervisor::supervisor_loop),
            ("procpool-manager", manager_loop),
        ];
        for (name, body) in loops {
            let handle = spawn_loop(name, Arc::clone(&self.context), body)?;
            self.lock_loops().push(handle);
        }

        info!(
            workers = self.context.config.workers,
            task_limit = self.context.config.task_limit,
            "Pool started"
        );
        Ok(())
    }

    fn check_accepting(&self) -> Result<()> {
        match self.context.state() {
            PoolState::Running if self.context.is_closing() => Err(PoolError::Closing),
            PoolState::Running => Ok(()),
            PoolState::Error => Err(PoolError::PoolFailed(
                self.context.failure().unwrap_or_default(),
            )),
            state => Err(PoolError::NotRunning(state)),
        }
    }

    /// Schedule `function` with positional `args`.
    ///
    /// `args` may be a tuple, array or `Vec` (each element is one argument),
    /// `()` for none, or any other value as the single argument.
    pub fn schedule(&self, function: &str, args: impl Serialize) -> Result<Arc<Task>> {
        self.schedule_with(function, args, TaskOptions::new())
    }

    /// Schedule with keyword arguments, timeout, callback or identifier.
    ///
    /// Returns immediately; use [`Task::get`] to wait for the result. If
    /// `args` cannot be marshaled the returned task is already resolved with
    /// a serialization error.
    pub fn schedule_with(
        &self,
        function: &str,
        args: impl Serialize,
        options: TaskOptions,
    ) -> Result<Arc<Task>> {
        self.check_accepting()?;

        let number = self.context.next_number();
        let args = match serde_json::to_value(args) {
            Ok(Value::Array(args)) => args,
            Ok(Value::Null) => Vec::new(),
            Ok(value) => vec![value],
            Err(e) => {
                let task = Arc::new(Task::new(number, function, Vec::new(), options));
                task.resolve(TaskOutcome::Failed(TaskError::serialization(e.to_string())));
                return Ok(task);
            }
        };

        let task = Arc::new(Task::new(number, function, args, options));
        debug!(task_number = number, function, "Task scheduled");
        self.context.enqueue(Arc::clone(&task));
        Ok(task)
    }

    /// Stop the pool: end the loops, let idle workers exit, then terminate
    /// the rest.
    ///
    /// Tasks still queued are abandoned. Tasks in flight resolve as
    /// [`TaskOutcome::WorkerLost`].
    pub fn stop(&self) -> Result<()> {
        match self.context.state() {
            PoolState::Created => {
                self.context.mark_stopped();
                return Ok(());
            }
            PoolState::Stopped => return Ok(()),
            PoolState::Running | PoolState::Error => {}
        }
        if !self.context.begin_shutdown() {
            return Ok(());
        }

        self.join_loops();
        let discarded = self.context.endpoint.discard_undelivered();
        self.context.manager.shutdown(self.context.config.stop_grace);

        let lost = self.context.registry.drain();
        for task in &lost {
            self.context.complete(task, TaskOutcome::WorkerLost);
        }
        let abandoned = self.context.queue_rx.try_iter().flatten().count();

        self.context.mark_stopped();
        info!(
            in_flight = lost.len(),
            abandoned = abandoned + discarded,
            "Pool stopped"
        );
        Ok(())
    }

    /// Stop immediately: terminate every worker without waiting. In-flight
    /// tasks are left unresolved.
    pub fn kill(&self) {
        if matches!(self.context.state(), PoolState::Created | PoolState::Stopped) {
            self.context.mark_stopped();
            return;
        }
        self.shutdown_now();
        self.context.mark_stopped();
        info!("Pool killed");
    }

    fn shutdown_now(&self) {
        if self.context.begin_shutdown() {
            self.context.manager.kill_all();
            self.join_loops();
        }
    }

    /// Stop accepting tasks, wait until every scheduled task is resolved,
    /// then stop.
    ///
    /// Returns `false` if `timeout` elapsed with tasks still pending; they
    /// are then handled as by [`stop`](Self::stop).
    pub fn close(&self, timeout: Option<Duration>) -> Result<bool> {
        if let state @ (PoolState::Created | PoolState::Stopped) = self.context.state() {
            return Err(PoolError::NotRunning(state));
        }
        self.context.set_closing();
        let drained = self.context.wait_drained(timeout);
        if !drained {
            warn!("Pool close timed out with tasks pending");
        }
        self.stop()?;
        Ok(drained)
    }

    /// Pids of the current workers.
    pub fn worker_pids(&self) -> Vec<u32> {
        self.context.manager.pids()
    }

    pub fn stats(&self) -> PoolStats {
        self.context.stats()
    }

    fn lock_loops(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.loops.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn join_loops(&self) {
        let handles: Vec<_> = self.lock_loops().drain(..).collect();
        for handle in handles {
            let name = handle.thread().name().unwrap_or("loop").to_string();
            if handle.join().is_err() {
                warn!(thread = %name, "Pool loop panicked while joining");
            }
        }
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        if matches!(self.context.state(), PoolState::Running | PoolState::Error) {
            self.kill();
        }
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("state", &self.state())
            .field("workers", &self.context.config.workers)
            .field("pids", &self.worker_pids())
            .finish()
    }
}

/// Reap and replace workers every `supervisor_interval`.
fn manager_loop(context: &PoolContext) -> Result<()> {
    const MAX_SPAWN_FAILURES: u32 = 10;
    let mut failures = 0;
    while !context.sleep(context.config.supervisor_interval) {
        match context.manager.maintain() {
            Ok(0) => failures = 0,
            Ok(spawned) => {
                failures = 0;
                debug!(spawned, "Replaced workers");
            }
            Err(e) => {
                failures += 1;
                warn!(error = %e, failures, "Failed to spawn worker");
                if failures >= MAX_SPAWN_FAILURES {
                    return Err(e);
                }
            }
        }
    }
    Ok(())
}

fn spawn_loop(name: &'static str, context: Arc<PoolContext>, body: LoopFn) -> Result<JoinHandle<()>> {
    let handle = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || match catch_unwind(AssertUnwindSafe(|| body(&context))) {
            Ok(Ok(())) => debug!(thread = name, "Pool loop exited"),
            Ok(Err(e)) => context.fail(format!("{} failed: {}", name, e)),
            Err(_) => context.fail(format!("{} panicked", name)),
        })?;
    Ok(handle)
}
