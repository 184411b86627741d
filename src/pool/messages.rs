//! Message loop: applies ACK and RESULT messages from workers.

use super::context::PoolContext;
use crate::error::Result;
use crate::worker::{ChannelError, DuplexChannel, WorkerMessage};
use tracing::{debug, info, trace};

/// Apply one worker message. Messages for tasks no longer registered were
/// already force-resolved and are dropped, except that an ACK for a withdrawn
/// task terminates the worker that claimed it.
pub(crate) fn handle_message(context: &PoolContext, message: WorkerMessage) {
    match message {
        WorkerMessage::Ack { number, pid } => match context.registry.get(number) {
            Some(task) => {
                if task.mark_started(pid) {
                    trace!(task_number = number, worker_pid = pid, "Task acknowledged");
                }
            }
            None => {
                if context.endpoint.take_withdrawn(number) {
                    // Resolved before this worker claimed it; stop the run
                    info!(
                        task_number = number,
                        worker_pid = pid,
                        "Worker claimed a withdrawn task"
                    );
                    context.manager.terminate(pid);
                } else {
                    debug!(
                        task_number = number,
                        worker_pid = pid,
                        "Discarding ACK for unknown task"
                    );
                }
            }
        },
        WorkerMessage::Result { number, outcome } => match context.registry.remove(number) {
            Some(task) => {
                trace!(task_number = number, "Task finished");
                context.complete(&task, outcome.into());
            }
            None => debug!(task_number = number, "Discarding RESULT for unknown task"),
        },
    }
}

pub(crate) fn message_loop(context: &PoolContext) -> Result<()> {
    loop {
        match context.endpoint.receive(Some(context.config.poll_interval)) {
            Ok(Some(message)) => handle_message(context, message),
            Ok(None) => return Ok(()),
            Err(ChannelError::Timeout) => {
                if context.is_shutdown() {
                    return Ok(());
                }
            }
            Err(e) => {
                if context.is_shutdown() {
                    return Ok(());
                }
                return Err(e.into());
            }
        }
    }
}
