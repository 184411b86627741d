//! Scheduler loop: moves tasks from the inbound queue onto the channel.

use super::context::PoolContext;
use crate::error::Result;
use crate::task::{Task, TaskError, TaskOutcome};
use crate::worker::{ChannelError, DuplexChannel};
use crossbeam_channel::RecvTimeoutError;
use std::sync::Arc;
use tracing::{debug, trace};

/// Register `task` and send its descriptor, in FIFO order.
pub(crate) fn dispatch(context: &PoolContext, task: Arc<Task>) -> Result<()> {
    let number = task.number();
    if task.ready() {
        return Ok(());
    }
    if task.cancelled() {
        debug!(task_number = number, "Task cancelled before dispatch");
        context.complete(&task, TaskOutcome::Cancelled);
        return Ok(());
    }

    context.registry.insert(Arc::clone(&task));
    match context.endpoint.send(&task.descriptor()) {
        Ok(()) => {
            trace!(task_number = number, function = task.function(), "Task dispatched");
            Ok(())
        }
        Err(ChannelError::Serialization(message)) => {
            context.registry.remove(number);
            context.complete(
                &task,
                TaskOutcome::Failed(TaskError::serialization(message)),
            );
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

pub(crate) fn scheduler_loop(context: &PoolContext) -> Result<()> {
    loop {
        match context.queue_rx.recv_timeout(context.config.poll_interval) {
            Ok(Some(task)) => {
                if context.is_shutdown() {
                    return Ok(());
                }
                dispatch(context, task)?;
            }
            Ok(None) | Err(RecvTimeoutError::Disconnected) => return Ok(()),
            Err(RecvTimeoutError::Timeout) => {
                if context.is_shutdown() {
                    return Ok(());
                }
            }
        }
    }
}
