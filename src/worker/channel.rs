//! Duplex channel between the pool and its workers.
//!
//! Two endpoint types share the [`DuplexChannel`] contract:
//!
//! - [`PoolEndpoint`] lives in the pool process. Task descriptors sent on it
//!   land on a shared wire that every idle worker pulls from; ACK and RESULT
//!   messages from all workers arrive on its inbox.
//! - [`WorkerEndpoint`] lives in a worker process and speaks JSON lines over
//!   stdin/stdout.
//!
//! Each endpoint serializes concurrent senders with a write lock and
//! concurrent readers with a read lock, so a message is consumed by exactly
//! one reader.

use super::ipc::{LineReader, LineWriter, PipeFd};
use super::protocol::{Line, TaskDescriptor, WorkerMessage};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, unbounded};
use std::collections::HashSet;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;
use thiserror::Error;

/// Channel-level failure. Never surfaced to task callers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// Nothing arrived before the timeout. Callers poll again.
    #[error("timed out waiting for a message")]
    Timeout,

    /// The peer is gone; the endpoint will never deliver again.
    #[error("channel peer disconnected")]
    Broken,

    /// The message could not be marshaled.
    #[error("message could not be serialized: {0}")]
    Serialization(String),
}

/// Common contract of both channel endpoints.
pub trait DuplexChannel {
    type Outgoing;
    type Incoming;

    /// Marshal and transmit `message`, atomically with respect to other senders.
    fn send(&self, message: &Self::Outgoing) -> Result<(), ChannelError>;

    /// Wait for the next message. `None` blocks indefinitely.
    fn receive(&self, timeout: Option<Duration>) -> Result<Self::Incoming, ChannelError>;

    /// Check whether a message is available without consuming it.
    /// `None` checks without waiting.
    fn poll(&self, timeout: Option<Duration>) -> Result<bool, ChannelError>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Receiving half with a one-message stash so `poll` can peek.
///
/// The stash mutex doubles as the endpoint's read lock.
struct Inbox<T> {
    receiver: Receiver<T>,
    stash: Mutex<Option<T>>,
}

impl<T> Inbox<T> {
    fn new(receiver: Receiver<T>) -> Self {
        Self {
            receiver,
            stash: Mutex::new(None),
        }
    }

    fn read_lock(&self) -> MutexGuard<'_, Option<T>> {
        lock(&self.stash)
    }

    fn take(&self, stash: &mut Option<T>, timeout: Option<Duration>) -> Result<T, ChannelError> {
        if let Some(message) = stash.take() {
            return Ok(message);
        }
        match timeout {
            None => self.receiver.recv().map_err(|_| ChannelError::Broken),
            Some(timeout) => self.receiver.recv_timeout(timeout).map_err(|e| match e {
                RecvTimeoutError::Timeout => ChannelError::Timeout,
                RecvTimeoutError::Disconnected => ChannelError::Broken,
            }),
        }
    }

    fn receive(&self, timeout: Option<Duration>) -> Result<T, ChannelError> {
        let mut stash = self.read_lock();
        self.take(&mut stash, timeout)
    }

    fn poll(&self, timeout: Option<Duration>) -> Result<bool, ChannelError> {
        let mut stash = self.read_lock();
        if stash.is_some() {
            return Ok(true);
        }
        let next = match timeout {
            None => self.receiver.try_recv().map_err(|e| match e {
                TryRecvError::Empty => ChannelError::Timeout,
                TryRecvError::Disconnected => ChannelError::Broken,
            }),
            Some(_) => self.take(&mut stash, timeout),
        };
        match next {
            Ok(message) => {
                *stash = Some(message);
                Ok(true)
            }
            Err(ChannelError::Timeout) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Numbers of tasks resolved while their descriptor was still unclaimed.
#[derive(Debug, Clone, Default)]
pub(crate) struct Withdrawn(Arc<Mutex<HashSet<u64>>>);

impl Withdrawn {
    pub(crate) fn insert(&self, number: u64) {
        lock(&self.0).insert(number);
    }

    /// Forget `number`, reporting whether it was withdrawn.
    pub(crate) fn take(&self, number: u64) -> bool {
        lock(&self.0).remove(&number)
    }
}

/// Worker-facing ends of the pool's shared wire, handed to each spawned worker.
#[derive(Debug, Clone)]
pub struct WorkerWire {
    /// Serialized task descriptors awaiting an idle worker.
    pub(crate) tasks: Receiver<String>,
    /// Descriptors a worker never acknowledged. Drained before `tasks`.
    pub(crate) returned: Receiver<String>,
    pub(crate) put_back: Sender<String>,
    /// ACK/RESULT messages towards the pool.
    pub(crate) messages: Sender<Option<WorkerMessage>>,
    pub(crate) withdrawn: Withdrawn,
}

impl WorkerWire {
    /// Next descriptor, oldest first, waiting at most `timeout`.
    pub(crate) fn next_task(&self, timeout: Duration) -> Result<String, RecvTimeoutError> {
        if let Ok(line) = self.returned.try_recv() {
            return Ok(line);
        }
        crossbeam_channel::select! {
            recv(self.returned) -> line => line.map_err(|_| RecvTimeoutError::Disconnected),
            recv(self.tasks) -> line => line.map_err(|_| RecvTimeoutError::Disconnected),
            default(timeout) => Err(RecvTimeoutError::Timeout),
        }
    }
}

/// Pool-side endpoint.
pub struct PoolEndpoint {
    tasks: Mutex<Sender<String>>,
    task_wire: Receiver<String>,
    put_back: Sender<String>,
    returned: Receiver<String>,
    messages: Sender<Option<WorkerMessage>>,
    inbox: Inbox<Option<WorkerMessage>>,
    withdrawn: Withdrawn,
}

impl PoolEndpoint {
    pub fn new() -> Self {
        let (task_tx, task_rx) = unbounded();
        let (put_back, returned) = unbounded();
        let (message_tx, message_rx) = unbounded();
        Self {
            tasks: Mutex::new(task_tx),
            task_wire: task_rx,
            put_back,
            returned,
            messages: message_tx,
            inbox: Inbox::new(message_rx),
            withdrawn: Withdrawn::default(),
        }
    }

    /// Ends for a newly spawned worker.
    pub fn wire(&self) -> WorkerWire {
        WorkerWire {
            tasks: self.task_wire.clone(),
            returned: self.returned.clone(),
            put_back: self.put_back.clone(),
            messages: self.messages.clone(),
            withdrawn: self.withdrawn.clone(),
        }
    }

    /// Mark task `number` as resolved before any worker claimed it. A pump
    /// that later picks up its descriptor drops it.
    pub(crate) fn withdraw(&self, number: u64) {
        self.withdrawn.insert(number);
    }

    /// Whether `number` was withdrawn and still unclaimed; clears the mark.
    pub(crate) fn take_withdrawn(&self, number: u64) -> bool {
        self.withdrawn.take(number)
    }

    /// Deliver the stop sentinel to whichever loop reads next.
    pub fn wake(&self) {
        let _ = self.messages.send(None);
    }

    /// Descriptors sent but not yet picked up by a worker.
    pub fn undelivered(&self) -> usize {
        self.returned.len() + self.task_wire.len()
    }

    /// Drop every descriptor still waiting for a worker.
    pub fn discard_undelivered(&self) -> usize {
        self.returned.try_iter().count() + self.task_wire.try_iter().count()
    }
}

impl Default for PoolEndpoint {
    fn default() -> Self {
        Self::new()
    }
}

impl DuplexChannel for PoolEndpoint {
    type Outgoing = TaskDescriptor;
    /// `None` is the stop sentinel.
    type Incoming = Option<WorkerMessage>;

    fn send(&self, descriptor: &TaskDescriptor) -> Result<(), ChannelError> {
        let tasks = lock(&self.tasks);
        let line = descriptor
            .to_line()
            .map_err(|e| ChannelError::Serialization(e.to_string()))?;
        tasks.send(line).map_err(|_| ChannelError::Broken)
    }

    fn receive(&self, timeout: Option<Duration>) -> Result<Self::Incoming, ChannelError> {
        self.inbox.receive(timeout)
    }

    fn poll(&self, timeout: Option<Duration>) -> Result<bool, ChannelError> {
        self.inbox.poll(timeout)
    }
}

/// Worker-side endpoint over the process's stdin/stdout.
pub struct WorkerEndpoint {
    inbox: Inbox<TaskDescriptor>,
    writer: Mutex<LineWriter>,
}

impl WorkerEndpoint {
    /// Wrap a pipe pair. A background thread parses incoming descriptors so
    /// receives can time out.
    pub fn new(reader: LineReader, writer: LineWriter) -> io::Result<Self> {
        let (tx, rx) = unbounded();
        thread::Builder::new()
            .name("worker-inbox".to_string())
            .spawn(move || read_descriptors(reader, tx))?;
        Ok(Self {
            inbox: Inbox::new(rx),
            writer: Mutex::new(writer),
        })
    }

    /// Endpoint over this process's stdin and stdout.
    pub fn from_stdio() -> io::Result<Self> {
        let stdin = PipeFd::dup_stdio(io::stdin())?;
        let stdout = PipeFd::dup_stdio(io::stdout())?;
        Self::new(LineReader::new(stdin), LineWriter::new(stdout))
    }

    /// Receive a descriptor and acknowledge it as one indivisible step.
    pub fn claim(&self, timeout: Option<Duration>, pid: u32) -> Result<TaskDescriptor, ChannelError> {
        let mut stash = self.inbox.read_lock();
        let descriptor = self.inbox.take(&mut stash, timeout)?;
        let mut writer = lock(&self.writer);
        write_message(&mut writer, &WorkerMessage::ack(descriptor.number, pid))?;
        Ok(descriptor)
    }
}

impl DuplexChannel for WorkerEndpoint {
    type Outgoing = WorkerMessage;
    type Incoming = TaskDescriptor;

    fn send(&self, message: &WorkerMessage) -> Result<(), ChannelError> {
        let mut writer = lock(&self.writer);
        write_message(&mut writer, message)
    }

    fn receive(&self, timeout: Option<Duration>) -> Result<TaskDescriptor, ChannelError> {
        self.inbox.receive(timeout)
    }

    fn poll(&self, timeout: Option<Duration>) -> Result<bool, ChannelError> {
        self.inbox.poll(timeout)
    }
}

fn write_message(writer: &mut LineWriter, message: &WorkerMessage) -> Result<(), ChannelError> {
    let line = message
        .to_line()
        .map_err(|e| ChannelError::Serialization(e.to_string()))?;
    writer.write_line(&line).map_err(|e| {
        tracing::debug!(error = %e, "Result pipe write failed");
        ChannelError::Broken
    })
}

fn read_descriptors(mut reader: LineReader, inbox: Sender<TaskDescriptor>) {
    loop {
        match reader.read_line() {
            Ok(Some("")) => continue,
            Ok(Some(line)) => match TaskDescriptor::from_line(line) {
                Ok(descriptor) => {
                    if inbox.send(descriptor).is_err() {
                        return;
                    }
                }
                Err(e) => tracing::warn!(error = %e, "Discarding malformed task descriptor"),
            },
            Ok(None) => return,
            Err(e) => {
                tracing::debug!(error = %e, "Task pipe read failed");
                return;
            }
        }
    }
}
