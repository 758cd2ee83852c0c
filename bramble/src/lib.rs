//! # Bramble
//!
//! A work-stealing thread pool with promise-based futures.
//!
//! ## Core Concepts
//!
//! - **Local deques**: every worker owns a bounded Chase-Lev deque. Work spawned
//!   by a running task stays on its worker and runs newest-first; idle workers
//!   steal the oldest entries.
//! - **Shared queues**: producers outside the pool submit to bounded FIFO queues,
//!   or hand the task straight to an idle worker.
//! - **Futures**: [`ThreadPool::submit`] returns a [`Future`] from
//!   [`bramble_api`]. A [`PoolHandle`] is an [`Executor`], so every combinator
//!   can schedule its callbacks on the pool.
//!
//! ## Usage Example
//!
//! ```rust
//! use bramble::{ShutdownMode, ThreadPool, ThreadPoolConfig};
//! use std::time::Duration;
//!
//! let pool = ThreadPool::new(ThreadPoolConfig::with_workers(4)).unwrap();
//! let exec = pool.executor();
//!
//! let result = pool
//!     .submit(|| 5)
//!     .unwrap()
//!     .map(&exec, |x| x * 2)
//!     .map(&exec, |x| x + 1);
//! assert_eq!(result.get(Duration::from_secs(5)).unwrap(), 11);
//!
//! for termination in pool.shutdown(ShutdownMode::ExecuteSubmitted) {
//!     termination.get(Duration::from_secs(5)).unwrap();
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`pool`]: the scheduler: queues, workers, statistics, [`ThreadPool`]
//! - [`config`]: [`ThreadPoolConfig`] and the hook types it carries
//! - [`error`]: [`PoolError`]
//! - [`logging`]: `tracing-subscriber` setup helpers and logging macros

pub mod config;
pub mod error;
pub mod logging;
pub mod pool;

pub use bramble_api::{
    calling_thread, ExecuteError, Executor, ExecutorRef, Failure, Future, Promise, Rejected, Task,
    Try,
};
pub use config::{LifecycleHooks, SharedQueueKind, ThreadPoolConfig, UncaughtPanic};
pub use error::PoolError;
pub use pool::{
    current_worker, is_interrupted, HashAffinity, PoolHandle, PoolState, PoolStatistics,
    RoundRobinAffinity, ShutdownMode, ThreadPool, WorkerState, WorkerStatistics,
};
