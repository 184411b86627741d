//! procpool - process-pool task execution
//!
//! Runs registered functions in a fixed number of worker processes, with
//! per-task timeouts, cancellation, worker recycling and recovery from
//! crashed workers.
//!
//! ```no_run
//! use procpool::{Pool, PoolConfig};
//!
//! let pool = Pool::new(PoolConfig::default().with_workers(2));
//! pool.start()?;
//! let task = pool.schedule("double", [21])?;
//! assert_eq!(task.get_as::<i64>(None)?, 42);
//! pool.close(None)?;
//! # Ok::<(), procpool::PoolError>(())
//! ```
//!
//! The functions a worker can run are those in the [`FunctionRegistry`]
//! handed to [`worker::run_worker_main`] by the worker executable.

pub mod builtins;
pub mod error;
pub mod functions;
pub mod logging;
pub mod pool;
mod registry;
pub mod task;
pub mod worker;

pub use error::{PoolError, Result};
pub use functions::{Call, FunctionRegistry};
pub use pool::{Pool, PoolConfig, PoolState, PoolStats};
pub use task::{Task, TaskError, TaskOptions, TaskOutcome};
