//! Pool-side relay between the shared task wire and one worker's pipes.
//!
//! The pump takes a descriptor off the wire only while its worker is idle,
//! so descriptors stay on the wire for whichever worker frees up first.

use super::channel::WorkerWire;
use super::ipc::{LineReader, LineWriter};
use super::protocol::{Line, WorkerMessage};
use crossbeam_channel::RecvTimeoutError;
use serde::Deserialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// How often an idle pump checks its stop flag.
const IDLE_POLL: Duration = Duration::from_millis(50);

/// The only descriptor field the pump looks at.
#[derive(Deserialize)]
struct Numbered {
    number: u64,
}

/// Relay descriptors to the worker `pid` and its replies to the pool until
/// the worker exits, `stop` is raised, or the worker has returned
/// `task_limit` results (0 means no limit).
///
/// A descriptor the worker never acknowledged goes back to the front of the
/// wire. Descriptors of withdrawn tasks are dropped unsent.
pub fn pump(
    pid: u32,
    mut writer: LineWriter,
    mut reader: LineReader,
    wire: WorkerWire,
    task_limit: usize,
    stop: Arc<AtomicBool>,
) {
    let mut finished = 0;
    loop {
        if task_limit > 0 && finished >= task_limit {
            debug!(pid, task_limit, "Worker reached its task limit, pump done");
            return;
        }

        let line = match wire.next_task(IDLE_POLL) {
            Ok(line) => line,
            Err(RecvTimeoutError::Timeout) => {
                if stop.load(Ordering::SeqCst) {
                    debug!(pid, "Pump stopping while idle");
                    return;
                }
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => return,
        };

        if let Ok(Numbered { number }) = serde_json::from_str(&line)
            && wire.withdrawn.take(number)
        {
            debug!(pid, task_number = number, "Dropping descriptor of withdrawn task");
            continue;
        }

        if stop.load(Ordering::SeqCst) {
            let _ = wire.put_back.send(line);
            return;
        }

        if let Err(e) = writer.write_line(&line) {
            debug!(pid, error = %e, "Worker stdin closed, returning descriptor");
            let _ = wire.put_back.send(line);
            return;
        }

        match relay_replies(pid, &mut reader, &wire) {
            Relay::Done => finished += 1,
            Relay::Lost { acked } => {
                if !acked {
                    debug!(pid, "Worker exited before claiming, returning descriptor");
                    let _ = wire.put_back.send(line);
                }
                return;
            }
        }
    }
}

enum Relay {
    /// The worker produced a RESULT and is idle again.
    Done,
    /// The worker's stdout closed mid-task.
    Lost { acked: bool },
}

fn relay_replies(pid: u32, reader: &mut LineReader, wire: &WorkerWire) -> Relay {
    let mut acked = false;
    loop {
        let line = match reader.read_line() {
            Ok(Some("")) => continue,
            Ok(Some(line)) => line,
            Ok(None) => return Relay::Lost { acked },
            Err(e) => {
                debug!(pid, error = %e, "Worker stdout read failed");
                return Relay::Lost { acked };
            }
        };

        let message = match WorkerMessage::from_line(line) {
            Ok(message) => message,
            Err(e) => {
                warn!(pid, error = %e, "Discarding malformed worker message");
                continue;
            }
        };
        trace!(pid, number = message.number(), "Worker message");

        let finished = message.is_result();
        if !finished {
            acked = true;
        }
        if wire.messages.send(Some(message)).is_err() {
            return Relay::Lost { acked };
        }
        if finished {
            return Relay::Done;
        }
    }
}
