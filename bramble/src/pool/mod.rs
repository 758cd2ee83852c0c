//! The work-stealing scheduler.
//!
//! - [`local_queue`]: per-worker Chase-Lev deque and its stealer handle
//! - [`shared_queue`]: pool-wide injection queues, locked or lock-free
//! - [`affinity`]: which shared queue a foreign producer submits to
//! - [`statistics`]: per-worker counters and pool snapshots
//! - [`thread_pool`]: [`ThreadPool`], [`PoolHandle`] and shutdown
//!
//! The idle bitmap and the worker loop are private.

pub mod affinity;
mod idle;
pub mod local_queue;
pub mod shared_queue;
pub mod statistics;
pub mod thread_pool;
mod worker;

pub use affinity::{AffinityStrategy, HashAffinity, RoundRobinAffinity};
pub use shared_queue::{Dequeue, LockFreeQueue, LockedQueue, SharedQueue};
pub use statistics::{PoolStatistics, WorkerState, WorkerStatistics};
pub use thread_pool::{PoolHandle, PoolState, ShutdownMode, ThreadPool};
pub use worker::{current_worker, is_interrupted};
