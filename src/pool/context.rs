//! State shared by the pool façade and its background loops.

use super::manager::WorkerManager;
use super::{PoolConfig, PoolState, PoolStats};
use crate::registry::TaskRegistry;
use crate::task::{Task, TaskOutcome};
use crate::worker::{PoolEndpoint, WorkerLaunch, WorkerSpawner};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, error};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
struct Counters {
    scheduled: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    cancelled: AtomicU64,
    lost: AtomicU64,
    requeued: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// Everything the loops share, passed to each as an `Arc`.
pub(crate) struct PoolContext {
    pub(crate) config: PoolConfig,
    pub(crate) registry: TaskRegistry,
    pub(crate) endpoint: PoolEndpoint,
    pub(crate) manager: WorkerManager,

    state: Mutex<PoolState>,
    failure: Mutex<Option<String>>,

    /// Inbound FIFO of tasks awaiting dispatch; `None` stops the scheduler.
    queue_tx: Sender<Option<Arc<Task>>>,
    pub(crate) queue_rx: Receiver<Option<Arc<Task>>>,

    /// Dropped on shutdown so sleeping loops wake at once.
    wakeup: Mutex<Option<Sender<()>>>,
    sleeper: Receiver<()>,
    shutdown: AtomicBool,
    closing: AtomicBool,

    next_number: AtomicU64,
    /// Scheduled tasks not yet resolved.
    outstanding: Mutex<u64>,
    drained: Condvar,
    counters: Counters,
}

impl PoolContext {
    pub(crate) fn new(config: PoolConfig, spawner: Box<dyn WorkerSpawner>) -> Self {
        let endpoint = PoolEndpoint::new();
        let launch = WorkerLaunch {
            wire: endpoint.wire(),
            initializer: config.initializer.clone(),
            initargs: config.initargs.clone(),
            task_limit: config.task_limit,
        };
        let manager = WorkerManager::new(spawner, launch, config.workers);
        let (queue_tx, queue_rx) = unbounded();
        let (wakeup, sleeper) = unbounded();

        Self {
            config,
            registry: TaskRegistry::new(),
            endpoint,
            manager,
            state: Mutex::new(PoolState::Created),
            failure: Mutex::new(None),
            queue_tx,
            queue_rx,
            wakeup: Mutex::new(Some(wakeup)),
            sleeper,
            shutdown: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            next_number: AtomicU64::new(0),
            outstanding: Mutex::new(0),
            drained: Condvar::new(),
            counters: Counters::default(),
        }
    }

    pub(crate) fn state(&self) -> PoolState {
        *lock(&self.state)
    }

    /// Move from `from` to `to`; returns the state actually found.
    pub(crate) fn transition(&self, from: PoolState, to: PoolState) -> Result<(), PoolState> {
        let mut state = lock(&self.state);
        if *state != from {
            return Err(*state);
        }
        *state = to;
        Ok(())
    }

    /// Final state after a stop or kill. `Error` is terminal and kept.
    pub(crate) fn mark_stopped(&self) {
        let mut state = lock(&self.state);
        if *state != PoolState::Error {
            *state = PoolState::Stopped;
        }
    }

    /// Record an internal loop failure and move to `Error`.
    pub(crate) fn fail(&self, message: String) {
        error!(error = %message, "Pool loop failed");
        let mut failure = lock(&self.failure);
        if failure.is_none() {
            *failure = Some(message);
        }
        {
            let mut state = lock(&self.state);
            if *state == PoolState::Running {
                *state = PoolState::Error;
            }
        }
        // Nothing will drain a failed pool; release `close` callers
        let _outstanding = lock(&self.outstanding);
        self.drained.notify_all();
    }

    pub(crate) fn failure(&self) -> Option<String> {
        lock(&self.failure).clone()
    }

    pub(crate) fn next_number(&self) -> u64 {
        self.next_number.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Raise the shutdown flag. Returns `false` if it was already raised.
    pub(crate) fn begin_shutdown(&self) -> bool {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return false;
        }
        lock(&self.wakeup).take();
        let _ = self.queue_tx.send(None);
        self.endpoint.wake();
        true
    }

    pub(crate) fn set_closing(&self) {
        self.closing.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Sleep for `interval` or until shutdown. Returns `true` on shutdown.
    pub(crate) fn sleep(&self, interval: Duration) -> bool {
        match self.sleeper.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => self.is_shutdown(),
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
        }
    }

    /// Queue a newly scheduled task.
    pub(crate) fn enqueue(&self, task: Arc<Task>) {
        *lock(&self.outstanding) += 1;
        Counters::bump(&self.counters.scheduled);
        let _ = self.queue_tx.send(Some(task));
    }

    /// Put a task whose worker died back on the queue, or give up on it if
    /// the pool is shutting down.
    pub(crate) fn requeue(&self, task: Arc<Task>) {
        if self.is_shutdown() {
            self.complete(&task, TaskOutcome::WorkerLost);
            return;
        }
        Counters::bump(&self.counters.requeued);
        debug!(task_number = task.number(), "Re-enqueueing task");
        let _ = self.queue_tx.send(Some(task));
    }

    /// Resolve `task` and account for it. Only the first resolution counts.
    pub(crate) fn complete(&self, task: &Task, outcome: TaskOutcome) -> bool {
        let counter = match &outcome {
            TaskOutcome::Ok(_) => &self.counters.completed,
            TaskOutcome::Failed(_) => &self.counters.failed,
            TaskOutcome::TimedOut => &self.counters.timed_out,
            TaskOutcome::Cancelled => &self.counters.cancelled,
            TaskOutcome::WorkerLost => &self.counters.lost,
        };
        if !task.resolve(outcome) {
            return false;
        }
        Counters::bump(counter);

        let mut outstanding = lock(&self.outstanding);
        *outstanding = outstanding.saturating_sub(1);
        if *outstanding == 0 {
            self.drained.notify_all();
        }
        true
    }

    /// Block until every scheduled task is resolved. Returns `false` if
    /// `timeout` elapsed first or the pool failed.
    pub(crate) fn wait_drained(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut outstanding = lock(&self.outstanding);
        while *outstanding > 0 {
            if self.state() == PoolState::Error {
                return false;
            }
            match deadline {
                None => {
                    outstanding = self
                        .drained
                        .wait(outstanding)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    outstanding = self
                        .drained
                        .wait_timeout(outstanding, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        }
        true
    }

    pub(crate) fn stats(&self) -> PoolStats {
        let c = &self.counters;
        PoolStats {
            workers: self.config.workers,
            live_workers: self.manager.live_count(),
            queued: self.queue_rx.len(),
            in_flight: self.registry.len(),
            scheduled: Counters::get(&c.scheduled),
            completed: Counters::get(&c.completed),
            failed: Counters::get(&c.failed),
            timed_out: Counters::get(&c.timed_out),
            cancelled: Counters::get(&c.cancelled),
            lost: Counters::get(&c.lost),
            requeued: Counters::get(&c.requeued),
            worker_restarts: self.manager.restarts(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::manager::tests::FakeSpawner;
    use crate::task::TaskOptions;
    use std::thread;

    fn context() -> Arc<PoolContext> {
        let config = PoolConfig::default().with_workers(1);
        Arc::new(PoolContext::new(config, Box::new(FakeSpawner::default())))
    }

    fn task(number: u64) -> Arc<Task> {
        Arc::new(Task::new(number, "pid", Vec::new(), TaskOptions::new()))
    }

    #[test]
    fn test_complete_counts_once() {
        let context = context();
        let task = task(1);
        context.enqueue(task.clone());

        assert!(context.complete(&task, TaskOutcome::Cancelled));
        assert!(!context.complete(&task, TaskOutcome::WorkerLost));
        let stats = context.stats();
        assert_eq!(stats.scheduled, 1);
        assert_eq!(stats.cancelled, 1);
        assert_eq!(stats.lost, 0);
        assert!(context.wait_drained(Some(Duration::ZERO)));
    }

    #[test]
    fn test_wait_drained_times_out() {
        let context = context();
        context.enqueue(task(1));
        assert!(!context.wait_drained(Some(Duration::from_millis(20))));
    }

    #[test]
    fn test_failure_releases_drain_waiters() {
        let context = context();
        context.transition(PoolState::Created, PoolState::Running).unwrap();
        context.enqueue(task(1));

        let waiter = {
            let context = Arc::clone(&context);
            thread::spawn(move || context.wait_drained(None))
        };
        thread::sleep(Duration::from_millis(20));
        context.fail("scheduler failed".into());

        assert!(!waiter.join().unwrap());
        assert_eq!(context.state(), PoolState::Error);
        assert_eq!(context.failure().as_deref(), Some("scheduler failed"));
    }

    #[test]
    fn test_requeue_after_shutdown_loses_task() {
        let context = context();
        let task = task(1);
        context.enqueue(task.clone());
        assert!(context.begin_shutdown());
        assert!(!context.begin_shutdown());

        context.requeue(task.clone());
        assert_eq!(task.outcome(), Some(TaskOutcome::WorkerLost));
        assert_eq!(context.stats().requeued, 0);
    }

    #[test]
    fn test_sleep_wakes_on_shutdown() {
        let context = context();
        assert!(!context.sleep(Duration::from_millis(1)));
        context.begin_shutdown();
        let begin = Instant::now();
        assert!(context.sleep(Duration::from_secs(10)));
        assert!(begin.elapsed() < Duration::from_secs(1));
    }
}
