use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use bramble_api::errors::panic_message;
use serde::Serialize;
use tracing::error;

use crate::error::PoolError;
use crate::pool::affinity::{AffinityStrategy, RoundRobinAffinity};

/// Upper bound on workers: bit 63 of the idle bitmap is reserved.
pub const MAX_WORKERS: usize = 63;

pub const DEFAULT_LOCAL_QUEUE_CAPACITY: usize = 1024;
pub const DEFAULT_SHARED_QUEUE_CAPACITY: usize = 16384;
pub const DEFAULT_MAX_CACHED_PRODUCERS: usize = 1024;

/// Maps a worker index to its thread name.
pub type ThreadNameFn = Arc<dyn Fn(usize) -> String + Send + Sync>;

/// Receives every panic that escapes a task.
pub type PanicHandler = Arc<dyn Fn(&UncaughtPanic) + Send + Sync>;

/// Called with the worker index at a lifecycle transition.
pub type LifecycleHook = Arc<dyn Fn(usize) + Send + Sync>;

/// Synchronization strategy of the pool-wide shared queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum SharedQueueKind {
    /// Ring buffer behind a `parking_lot` mutex.
    #[default]
    Locked,
    /// `crossbeam_queue::ArrayQueue`.
    LockFree,
}

/// A panic caught while running a task.
#[derive(Debug, Clone)]
pub struct UncaughtPanic {
    /// Index of the worker that ran the task
    pub worker: usize,
    /// Name of the worker thread
    pub thread_name: String,
    /// Panic payload rendered as text
    pub message: String,
}

/// Worker lifecycle callbacks.
///
/// `before_start` runs on the thread constructing the pool, right before the
/// worker is spawned. The other three run on the worker thread itself;
/// `after_stop` runs before the worker's termination future completes.
#[derive(Clone, Default)]
pub struct LifecycleHooks {
    pub before_start: Option<LifecycleHook>,
    pub after_start: Option<LifecycleHook>,
    pub before_stop: Option<LifecycleHook>,
    pub after_stop: Option<LifecycleHook>,
}

impl LifecycleHooks {
    /// Runs `hook` if set. A panicking hook is logged and otherwise ignored.
    pub(crate) fn fire(hook: &Option<LifecycleHook>, worker: usize, name: &str) {
        let Some(hook) = hook else { return };
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| hook(worker))) {
            error!(worker, hook = name, "Lifecycle hook panicked: {}", panic_message(&*payload));
        }
    }
}

impl fmt::Debug for LifecycleHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleHooks")
            .field("before_start", &self.before_start.is_some())
            .field("after_start", &self.after_start.is_some())
            .field("before_stop", &self.before_stop.is_some())
            .field("after_stop", &self.after_stop.is_some())
            .finish()
    }
}

/// Configuration for [`ThreadPool`](crate::ThreadPool)
///
/// Override individual fields with struct update syntax:
///
/// ```rust
/// use bramble::ThreadPoolConfig;
///
/// let config = ThreadPoolConfig {
///     worker_count: 2,
///     local_queue_capacity: 8,
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Clone)]
pub struct ThreadPoolConfig {
    /// Number of worker threads
    pub worker_count: usize,

    /// Capacity of each worker's local deque; must be a power of two
    pub local_queue_capacity: usize,

    /// Number of shared injection queues
    pub shared_queue_count: usize,

    /// Capacity of each shared queue
    pub shared_queue_capacity: usize,

    /// Synchronization strategy of the shared queues
    pub shared_queue_kind: SharedQueueKind,

    /// Extra tasks moved into the local deque after a steal or a shared-queue pop
    pub prefetch: usize,

    /// Every N-th local pop takes the oldest task instead of the newest
    pub local_fifo_interval: usize,

    /// Every N-th search pass skips stealing; 0 never skips
    pub steal_skip_interval: usize,

    /// Iterations between rotations of a worker's preferred shared queue
    pub shared_queue_switch_interval: usize,

    /// Upper bound on a single idle park
    pub idle_park_timeout: Duration,

    /// Daemon pools detach their workers on drop instead of joining them
    pub daemon: bool,

    /// Worker thread naming
    pub thread_name: ThreadNameFn,

    /// Uncaught task panic handler
    pub panic_handler: PanicHandler,

    /// Picks the shared queue for submissions from non-worker threads
    pub affinity: Arc<dyn AffinityStrategy>,

    /// Worker lifecycle callbacks
    pub lifecycle: LifecycleHooks,
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        Self {
            worker_count: num_cpus::get().clamp(1, MAX_WORKERS),
            local_queue_capacity: DEFAULT_LOCAL_QUEUE_CAPACITY,
            shared_queue_count: 1,
            shared_queue_capacity: DEFAULT_SHARED_QUEUE_CAPACITY,
            shared_queue_kind: SharedQueueKind::Locked,
            prefetch: 4,
            local_fifo_interval: 61,
            steal_skip_interval: 0,
            shared_queue_switch_interval: 127,
            idle_park_timeout: Duration::from_millis(10),
            daemon: false,
            thread_name: Arc::new(|index| format!("bramble-worker-{}", index)),
            panic_handler: Arc::new(log_uncaught_panic),
            affinity: Arc::new(RoundRobinAffinity::new(DEFAULT_MAX_CACHED_PRODUCERS)),
            lifecycle: LifecycleHooks::default(),
        }
    }
}

/// Default [`PanicHandler`].
pub fn log_uncaught_panic(panic: &UncaughtPanic) {
    error!(
        worker = panic.worker,
        thread = %panic.thread_name,
        "Uncaught panic in task: {}",
        panic.message
    );
}

impl ThreadPoolConfig {
    /// Default configuration with `worker_count` workers.
    pub fn with_workers(worker_count: usize) -> Self {
        Self {
            worker_count,
            ..Default::default()
        }
    }

    /// Name of the worker thread at `index`.
    pub fn worker_name(&self, index: usize) -> String {
        (self.thread_name)(index)
    }

    /// Checks every invariant the scheduler relies on.
    ///
    /// # Errors
    /// [`PoolError::InvalidConfig`] naming the first offending field.
    pub fn validate(&self) -> Result<(), PoolError> {
        let invalid = |msg: String| Err(PoolError::InvalidConfig(msg));

        if self.worker_count == 0 || self.worker_count > MAX_WORKERS {
            return invalid(format!(
                "worker_count must be between 1 and {}, got {}",
                MAX_WORKERS, self.worker_count
            ));
        }
        if self.local_queue_capacity < 2 || !self.local_queue_capacity.is_power_of_two() {
            return invalid(format!(
                "local_queue_capacity must be a power of two >= 2, got {}",
                self.local_queue_capacity
            ));
        }
        if self.shared_queue_count == 0 {
            return invalid("shared_queue_count must be at least 1".to_string());
        }
        if self.shared_queue_capacity == 0 {
            return invalid("shared_queue_capacity must be at least 1".to_string());
        }
        if self.prefetch >= self.local_queue_capacity {
            return invalid(format!(
                "prefetch ({}) must be smaller than local_queue_capacity ({})",
                self.prefetch, self.local_queue_capacity
            ));
        }
        if self.local_fifo_interval == 0 {
            return invalid("local_fifo_interval must be at least 1".to_string());
        }
        if self.shared_queue_switch_interval == 0 {
            return invalid("shared_queue_switch_interval must be at least 1".to_string());
        }
        if self.idle_park_timeout.is_zero() {
            return invalid("idle_park_timeout must be non-zero".to_string());
        }
        Ok(())
    }
}

impl fmt::Debug for ThreadPoolConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPoolConfig")
            .field("worker_count", &self.worker_count)
            .field("local_queue_capacity", &self.local_queue_capacity)
            .field("shared_queue_count", &self.shared_queue_count)
            .field("shared_queue_capacity", &self.shared_queue_capacity)
            .field("shared_queue_kind", &self.shared_queue_kind)
            .field("prefetch", &self.prefetch)
            .field("local_fifo_interval", &self.local_fifo_interval)
            .field("steal_skip_interval", &self.steal_skip_interval)
            .field("shared_queue_switch_interval", &self.shared_queue_switch_interval)
            .field("idle_park_timeout", &self.idle_park_timeout)
            .field("daemon", &self.daemon)
            .field("affinity", &self.affinity)
            .field("lifecycle", &self.lifecycle)
            .finish_non_exhaustive()
    }
}
