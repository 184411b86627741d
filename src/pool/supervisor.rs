//! Supervisor loop: enforces timeouts and cancellation, and recovers tasks
//! whose worker died.

use super::context::PoolContext;
use crate::error::Result;
use crate::task::{Task, TaskOutcome};
use std::collections::HashSet;
use std::time::Instant;
use tracing::{debug, info};

/// What a scan decided about one in-flight task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Verdict {
    Healthy,
    TimedOut,
    Cancelled,
    /// The owning worker is gone; the task goes back on the queue.
    Orphaned,
}

/// Judge a registered task. Timeout wins over cancellation, which wins over
/// a dead owner.
pub(crate) fn inspect(task: &Task, now: Instant, owner_alive: impl FnOnce(u32) -> bool) -> Verdict {
    if task.ready() {
        return Verdict::Healthy;
    }

    let (Some(started_at), Some(pid)) = (task.started_at(), task.pid()) else {
        // Dispatched but not yet claimed by any worker
        return if task.cancelled() {
            Verdict::Cancelled
        } else {
            Verdict::Healthy
        };
    };

    if let Some(timeout) = task.timeout()
        && now.saturating_duration_since(started_at) > timeout
    {
        Verdict::TimedOut
    } else if task.cancelled() {
        Verdict::Cancelled
    } else if !owner_alive(pid) {
        Verdict::Orphaned
    } else {
        Verdict::Healthy
    }
}

/// One pass over the registry.
///
/// An orphan is only re-enqueued once it is seen in two consecutive scans, so
/// a RESULT the worker sent just before exiting is processed first.
pub(crate) fn scan(context: &PoolContext, suspects: &mut HashSet<u64>) {
    let now = Instant::now();
    let mut orphans = HashSet::new();

    for task in context.registry.snapshot() {
        let number = task.number();
        let verdict = inspect(&task, now, |pid| context.manager.is_alive(pid));

        let outcome = match verdict {
            Verdict::Healthy => continue,
            Verdict::TimedOut => TaskOutcome::TimedOut,
            Verdict::Cancelled => TaskOutcome::Cancelled,
            Verdict::Orphaned => {
                if !suspects.contains(&number) {
                    orphans.insert(number);
                    continue;
                }
                if context.registry.remove(number).is_some() {
                    info!(task_number = number, worker_pid = ?task.pid(), "Worker lost, rescheduling task");
                    task.reset();
                    context.requeue(task);
                }
                continue;
            }
        };

        // Whoever removes the entry owns the resolution
        if context.registry.remove(number).is_none() {
            continue;
        }
        debug!(task_number = number, verdict = ?verdict, "Forcing task resolution");
        context.complete(&task, outcome);

        match task.pid() {
            // The worker's state is indeterminate now
            Some(pid) => context.manager.terminate(pid),
            None => context.endpoint.withdraw(number),
        }
    }

    *suspects = orphans;
}

/// Scan the registry every `supervisor_interval` until shutdown.
pub(crate) fn supervisor_loop(context: &PoolContext) -> Result<()> {
    let mut suspects = HashSet::new();
    while !context.sleep(context.config.supervisor_interval) {
        scan(context, &mut suspects);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolConfig;
    use crate::pool::manager::tests::FakeSpawner;
    use crate::task::TaskOptions;
    use std::sync::Arc;
    use std::time::Duration;

    fn task(options: TaskOptions) -> Task {
        Task::new(1, "sleep", Vec::new(), options)
    }

    fn alive(_: u32) -> bool {
        true
    }

    fn dead(_: u32) -> bool {
        false
    }

    #[test]
    fn test_unstarted_task_is_healthy() {
        let task = task(TaskOptions::new().with_timeout(Duration::from_millis(1)));
        let later = Instant::now() + Duration::from_secs(10);
        assert_eq!(inspect(&task, later, dead), Verdict::Healthy);
    }

    #[test]
    fn test_timeout_measured_from_ack() {
        let task = task(TaskOptions::new().with_timeout(Duration::from_millis(100)));
        task.mark_started(7);
        let now = Instant::now();
        assert_eq!(inspect(&task, now, alive), Verdict::Healthy);
        assert_eq!(
            inspect(&task, now + Duration::from_millis(200), alive),
            Verdict::TimedOut
        );
    }

    #[test]
    fn test_timeout_precedes_cancel_and_orphan() {
        let task = task(TaskOptions::new().with_timeout(Duration::from_millis(10)));
        task.mark_started(7);
        task.cancel();
        let later = Instant::now() + Duration::from_secs(1);
        assert_eq!(inspect(&task, later, dead), Verdict::TimedOut);
        assert_eq!(inspect(&task, Instant::now(), dead), Verdict::Cancelled);
    }

    #[test]
    fn test_dead_owner_is_orphan() {
        let task = task(TaskOptions::new());
        task.mark_started(7);
        assert_eq!(inspect(&task, Instant::now(), dead), Verdict::Orphaned);
        assert_eq!(inspect(&task, Instant::now(), alive), Verdict::Healthy);
    }

    #[test]
    fn test_cancelled_before_ack() {
        let task = task(TaskOptions::new());
        task.cancel();
        assert_eq!(inspect(&task, Instant::now(), alive), Verdict::Cancelled);
    }

    #[test]
    fn test_resolved_task_is_left_alone() {
        let task = task(TaskOptions::new());
        task.mark_started(7);
        task.resolve(TaskOutcome::Ok(serde_json::json!(1)));
        task.cancel();
        assert_eq!(inspect(&task, Instant::now(), dead), Verdict::Healthy);
        assert_eq!(task.outcome(), Some(TaskOutcome::Ok(serde_json::json!(1))));
    }

    fn context(spawner: &FakeSpawner) -> PoolContext {
        let config = PoolConfig::default().with_workers(1);
        let context = PoolContext::new(config, Box::new(spawner.clone()));
        context.manager.maintain().unwrap();
        context
    }

    #[test]
    fn test_scan_times_out_and_terminates_worker() {
        let spawner = FakeSpawner::default();
        let context = context(&spawner);
        let task = Arc::new(Task::new(
            1,
            "sleep",
            Vec::new(),
            TaskOptions::new().with_timeout(Duration::from_millis(1)),
        ));
        context.enqueue(task.clone());
        context.registry.insert(task.clone());
        task.mark_started(1000);
        std::thread::sleep(Duration::from_millis(5));

        scan(&context, &mut HashSet::new());
        assert_eq!(task.outcome(), Some(TaskOutcome::TimedOut));
        assert!(context.registry.is_empty());
        assert!(!spawner.is_alive(1000));
        assert_eq!(context.stats().timed_out, 1);
    }

    #[test]
    fn test_scan_requeues_orphan_after_second_sighting() {
        let spawner = FakeSpawner::default();
        let context = context(&spawner);
        let task = Arc::new(Task::new(2, "sleep", Vec::new(), TaskOptions::new()));
        context.enqueue(task.clone());
        // Drain the enqueued copy so only the requeue is observed
        context.queue_rx.try_recv().unwrap();
        context.registry.insert(task.clone());
        task.mark_started(1000);
        spawner.kill(1000);

        let mut suspects = HashSet::new();
        scan(&context, &mut suspects);
        assert!(suspects.contains(&2));
        assert_eq!(context.registry.len(), 1);

        scan(&context, &mut suspects);
        assert!(context.registry.is_empty());
        assert!(!task.ready());
        assert!(!task.started());
        let requeued = context.queue_rx.try_recv().unwrap().unwrap();
        assert_eq!(requeued.number(), 2);
        assert_eq!(context.stats().requeued, 1);
    }

    #[test]
    fn test_scan_withdraws_unclaimed_cancelled_task() {
        let spawner = FakeSpawner::default();
        let context = context(&spawner);
        let task = Arc::new(Task::new(4, "sleep", Vec::new(), TaskOptions::new()));
        context.enqueue(task.clone());
        context.registry.insert(task.clone());
        task.cancel();

        scan(&context, &mut HashSet::new());
        assert_eq!(task.outcome(), Some(TaskOutcome::Cancelled));
        assert!(spawner.is_alive(1000));
        assert!(context.endpoint.take_withdrawn(4));
    }

    #[test]
    fn test_orphan_after_shutdown_is_lost() {
        let spawner = FakeSpawner::default();
        let context = context(&spawner);
        let task = Arc::new(Task::new(3, "sleep", Vec::new(), TaskOptions::new()));
        context.enqueue(task.clone());
        context.registry.insert(task.clone());
        task.mark_started(1000);
        spawner.kill(1000);
        context.begin_shutdown();

        let mut suspects = HashSet::from([3]);
        scan(&context, &mut suspects);
        assert_eq!(task.outcome(), Some(TaskOutcome::WorkerLost));
    }
}
