//! Keeps the live worker set at its target size.

use crate::error::Result;
use crate::worker::{TerminationReason, WorkerHandle, WorkerLaunch, WorkerSpawner};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

struct Workers {
    live: HashMap<u32, Box<dyn WorkerHandle>>,
    closed: bool,
}

pub(crate) struct WorkerManager {
    spawner: Box<dyn WorkerSpawner>,
    launch: WorkerLaunch,
    target: usize,
    workers: Mutex<Workers>,
    /// Serializes `maintain` so concurrent callers never overshoot target.
    maintaining: Mutex<()>,
    spawned: AtomicU64,
}

impl WorkerManager {
    pub(crate) fn new(spawner: Box<dyn WorkerSpawner>, launch: WorkerLaunch, target: usize) -> Self {
        Self {
            spawner,
            launch,
            target,
            workers: Mutex::new(Workers {
                live: HashMap::new(),
                closed: false,
            }),
            maintaining: Mutex::new(()),
            spawned: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Workers> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reap dead workers, then spawn until the live count is back at target.
    ///
    /// Processes are reaped and spawned outside the worker-set lock so
    /// liveness checks never wait on a spawn. Returns how many workers were
    /// spawned.
    pub(crate) fn maintain(&self) -> Result<usize> {
        let _maintaining = self
            .maintaining
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let (dead, missing) = {
            let mut workers = self.lock();
            let pids: Vec<u32> = workers
                .live
                .iter_mut()
                .filter_map(|(pid, worker)| (!worker.is_alive()).then_some(*pid))
                .collect();
            let dead: Vec<(u32, Box<dyn WorkerHandle>)> = pids
                .iter()
                .filter_map(|pid| workers.live.remove_entry(pid))
                .collect();
            let missing = if workers.closed {
                0
            } else {
                self.target.saturating_sub(workers.live.len())
            };
            (dead, missing)
        };

        for (pid, mut worker) in dead {
            let reason = worker
                .join(Duration::ZERO)
                .unwrap_or(TerminationReason::Unknown);
            log_reaped(pid, reason);
        }

        let mut spawned = 0;
        for _ in 0..missing {
            let mut worker = self.spawner.spawn(&self.launch)?;
            let pid = worker.pid();
            let mut workers = self.lock();
            if workers.closed {
                drop(workers);
                let _ = worker.terminate();
                let _ = worker.join(Duration::ZERO);
                break;
            }
            workers.live.insert(pid, worker);
            debug!(worker_pid = pid, "Spawned worker");
            self.spawned.fetch_add(1, Ordering::Relaxed);
            spawned += 1;
        }
        Ok(spawned)
    }

    /// Whether worker `pid` is known and running. An unknown pid has already
    /// been reaped.
    pub(crate) fn is_alive(&self, pid: u32) -> bool {
        self.lock()
            .live
            .get_mut(&pid)
            .is_some_and(|worker| worker.is_alive())
    }

    /// Ask worker `pid` to stop. The next [`maintain`](Self::maintain) reaps
    /// and replaces it.
    pub(crate) fn terminate(&self, pid: u32) {
        if let Some(worker) = self.lock().live.get_mut(&pid) {
            debug!(worker_pid = pid, "Terminating worker");
            if let Err(e) = worker.terminate() {
                warn!(worker_pid = pid, error = %e, "Failed to terminate worker");
            }
        }
    }

    pub(crate) fn live_count(&self) -> usize {
        self.lock()
            .live
            .values_mut()
            .filter_map(|worker| worker.is_alive().then_some(()))
            .count()
    }

    pub(crate) fn pids(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = self.lock().live.keys().copied().collect();
        pids.sort_unstable();
        pids
    }

    /// Workers spawned beyond the initial set.
    pub(crate) fn restarts(&self) -> u64 {
        self.spawned
            .load(Ordering::Relaxed)
            .saturating_sub(self.target as u64)
    }

    fn close(&self) -> Vec<(u32, Box<dyn WorkerHandle>)> {
        let mut workers = self.lock();
        workers.closed = true;
        workers.live.drain().collect()
    }

    /// Stop spawning and join every worker, giving each `grace` to exit.
    pub(crate) fn shutdown(&self, grace: Duration) {
        let workers = self.close();
        thread::scope(|scope| {
            for (pid, mut worker) in workers {
                scope.spawn(move || match worker.join(grace) {
                    Ok(reason) => log_reaped(pid, reason),
                    Err(e) => warn!(worker_pid = pid, error = %e, "Failed to join worker"),
                });
            }
        });
    }

    /// Stop spawning and terminate every worker without waiting on tasks.
    pub(crate) fn kill_all(&self) {
        let mut workers = self.close();
        for (_, worker) in workers.iter_mut() {
            let _ = worker.terminate();
        }
        for (pid, mut worker) in workers {
            if let Err(e) = worker.join(Duration::ZERO) {
                warn!(worker_pid = pid, error = %e, "Failed to reap worker");
            }
        }
    }
}

fn log_reaped(pid: u32, reason: TerminationReason) {
    if reason.is_clean() || reason.is_requested() {
        debug!(worker_pid = pid, reason = %reason, "Worker reaped");
    } else {
        info!(worker_pid = pid, reason = %reason, "Worker died unexpectedly");
    }
}
