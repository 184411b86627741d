//! Worker processes and the channel that connects them to the pool.
//!
//! Each worker is the same executable re-invoked in its hidden
//! `internal-worker` mode. The pool hands task descriptors to a shared wire;
//! a pump thread per worker forwards one descriptor at a time to an idle
//! worker's stdin and relays its ACK/RESULT lines back.
//!
//! # Architecture
//!
//! ```text
//!                     ┌─────────────────┐
//!                     │  Pool Process   │
//!                     │  PoolEndpoint   │
//!                     └────────┬────────┘
//!                              │ shared wire
//!               ┌──────────────┼──────────────┐
//!               │              │              │
//!           ┌───▼───┐      ┌───▼───┐      ┌───▼───┐
//!           │ pump  │      │ pump  │      │ pump  │
//!           └───┬───┘      └───┬───┘      └───┬───┘
//!         ┌─────▼─────┐  ┌─────▼─────┐  ┌─────▼─────┐
//!         │ Worker 1  │  │ Worker 2  │  │ Worker N  │
//!         │ (process) │  │ (process) │  │ (process) │
//!         └───────────┘  └───────────┘  └───────────┘
//! ```
//!
//! # Features
//!
//! - **Process isolation**: a crashing function takes down only its worker
//! - **Recycling**: workers exit after a configurable number of tasks
//! - **Crash recovery**: unclaimed descriptors go back on the wire

mod channel;
mod ipc;
mod proc;
mod protocol;
mod pump;
mod signals;
mod spawn;
pub mod worker_main;

pub use channel::{ChannelError, DuplexChannel, PoolEndpoint, WorkerEndpoint, WorkerWire};
pub use protocol::{Line, TaskDescriptor, WireOutcome, WorkerMessage};
pub use signals::TerminationReason;
pub use spawn::{
    ProcessSpawner, WORKER_SUBCOMMAND, WorkerCommand, WorkerHandle, WorkerLaunch, WorkerSpawner,
};
pub use worker_main::{WorkerArgs, run_worker_main};
