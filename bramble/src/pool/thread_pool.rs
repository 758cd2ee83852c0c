//! # Work-Stealing Thread Pool
//!
//! [`ThreadPool`] owns a fixed set of worker threads, one local deque per
//! worker, and one or more shared injection queues.
//!
//! ## Submission paths
//! - From a worker of this pool: push onto that worker's own deque. On overflow
//!   the task goes to a shared queue. An idle worker is woken only when the
//!   push made the deque non-empty.
//! - From any other thread: claim an idle worker and hand the task to it
//!   directly. With nobody idle, push onto the shared queue picked by the
//!   affinity strategy and wake an idle worker.
//!
//! ## Shutdown
//! See [`ShutdownMode`]. Every mode rejects further submissions from outside
//! the pool and unparks all workers; each worker completes its termination
//! future after its `after_stop` hook.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bramble_api::{
    catch, catch_fallible, ExecuteError, Executor, ExecutorRef, Future, Promise, Rejected, Task,
};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{error, trace, warn};
use uuid::Uuid;

use super::idle::IdleSet;
use super::local_queue::LocalQueue;
use super::shared_queue::SharedQueue;
use super::statistics::{PoolStatistics, WorkerState};
use super::worker::{self, LocalSubmit, Worker, WorkerSlot};
use crate::config::{LifecycleHooks, ThreadPoolConfig};
use crate::error::PoolError;

/// How [`ThreadPool::shutdown`] treats work that has not started yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ShutdownMode {
    /// Run everything already queued. Tasks submitted by the pool's own workers
    /// are still accepted so in-flight chains can finish.
    ExecuteSubmitted = 1,
    /// Discard every queued task; running tasks finish normally.
    SkipUnstarted = 2,
    /// Like [`SkipUnstarted`](Self::SkipUnstarted), and additionally raise every
    /// worker's interrupt flag (see [`is_interrupted`](crate::is_interrupted)).
    Interrupt = 3,
}

impl ShutdownMode {
    fn from_usize(value: usize) -> Option<Self> {
        match value {
            1 => Some(ShutdownMode::ExecuteSubmitted),
            2 => Some(ShutdownMode::SkipUnstarted),
            3 => Some(ShutdownMode::Interrupt),
            _ => None,
        }
    }
}

/// Lifecycle of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PoolState {
    /// Accepting work
    Running,
    /// Shutdown requested; some workers are still alive
    ShuttingDown,
    /// Every worker has exited
    Down,
}

/// State shared between the pool handles and the workers.
pub(crate) struct PoolShared {
    pub id: Uuid,
    pub config: ThreadPoolConfig,
    pub slots: Box<[WorkerSlot]>,
    pub shared_queues: Box<[Box<dyn SharedQueue>]>,
    pub idle: IdleSet,
    /// 0 while running, otherwise the `ShutdownMode` discriminant
    mode: AtomicUsize,
    /// External submissions between their state check and their enqueue
    submitting: AtomicUsize,
    alive: AtomicUsize,
}

impl PoolShared {
    pub fn mode(&self) -> Option<ShutdownMode> {
        ShutdownMode::from_usize(self.mode.load(Ordering::SeqCst))
    }

    /// Whether unstarted work is being thrown away.
    pub fn is_discarding(&self) -> bool {
        matches!(
            self.mode(),
            Some(ShutdownMode::SkipUnstarted | ShutdownMode::Interrupt)
        )
    }

    pub fn has_pending_submissions(&self) -> bool {
        self.submitting.load(Ordering::SeqCst) != 0
    }

    /// Whether any worker is in the middle of a task, and may still spawn more.
    pub fn any_running(&self) -> bool {
        self.slots
            .iter()
            .any(|slot| slot.counters.state() == WorkerState::Running)
    }

    pub fn state(&self) -> PoolState {
        if self.alive.load(Ordering::SeqCst) == 0 {
            PoolState::Down
        } else if self.mode().is_some() {
            PoolState::ShuttingDown
        } else {
            PoolState::Running
        }
    }

    pub fn execute(&self, task: Task) -> Result<(), Rejected> {
        let task = match worker::submit_local(self, task) {
            LocalSubmit::Done(result) => return result,
            LocalSubmit::NotWorker(task) => task,
        };

        self.submitting.fetch_add(1, Ordering::SeqCst);
        let result = self.execute_external(task);
        self.submitting.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn execute_external(&self, task: Task) -> Result<(), Rejected> {
        if self.mode().is_some() {
            return Err(Rejected::new(task, ExecuteError::ShutDown));
        }

        if let Some(index) = self.idle.claim() {
            let slot = &self.slots[index];
            *slot.handoff.lock() = Some(task);
            slot.unpark();
            trace!(pool = %self.id, worker = index, "Handed task to idle worker");
            return Ok(());
        }

        self.push_shared(task)
    }

    /// Enqueues on the producer's preferred shared queue, trying the others
    /// when it is full.
    pub fn push_shared(&self, task: Task) -> Result<(), Rejected> {
        let count = self.shared_queues.len();
        let first = self.config.affinity.select(thread::current().id(), count) % count;

        let mut task = task;
        let mut error = ExecuteError::ShutDown;
        for offset in 0..count {
            match self.shared_queues[(first + offset) % count].push(task) {
                Ok(()) => {
                    self.notify_work();
                    return Ok(());
                }
                Err(rejected) => {
                    if rejected.error == ExecuteError::ShutDown {
                        return Err(rejected);
                    }
                    error = rejected.error;
                    task = rejected.task;
                }
            }
        }
        Err(Rejected::new(task, error))
    }

    /// Unparks one idle worker, unless a wake-up scan is already running.
    pub fn notify_work(&self) {
        if let Some(index) = self.idle.begin_scan() {
            self.slots[index].unpark();
            self.idle.end_scan();
        }
    }

    pub fn worker_exited(&self) {
        if self.alive.fetch_sub(1, Ordering::SeqCst) == 1 {
            crate::log_pool!(self.id, "terminated");
        }
    }

    pub fn shutdown(&self, mode: ShutdownMode) -> Vec<Future<()>> {
        if self
            .mode
            .compare_exchange(0, mode as usize, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            crate::log_pool!(self.id, "shutdown", mode = ?mode);

            if mode != ShutdownMode::ExecuteSubmitted {
                let mut discarded = 0;
                for queue in self.shared_queues.iter() {
                    queue.shutdown();
                    discarded += queue.clear();
                }
                for slot in self.slots.iter() {
                    discarded += slot.stealer.clear();
                }
                if mode == ShutdownMode::Interrupt {
                    for slot in self.slots.iter() {
                        slot.interrupted.store(true, Ordering::Release);
                    }
                }
                crate::log_pool!(self.id, "discarded", tasks = discarded);
            }

            for slot in self.slots.iter() {
                slot.unpark();
            }
        }
        self.termination_futures()
    }

    pub fn termination_futures(&self) -> Vec<Future<()>> {
        self.slots.iter().map(|slot| slot.termination.future()).collect()
    }

    pub fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        self.termination_futures().iter().all(|future| {
            let remaining = deadline.saturating_duration_since(Instant::now());
            future.await_result(remaining).is_ok()
        })
    }

    pub fn statistics(&self) -> PoolStatistics {
        PoolStatistics {
            pool_id: self.id.to_string(),
            state: self.state(),
            workers: self
                .slots
                .iter()
                .enumerate()
                .map(|(index, slot)| slot.counters.snapshot(index, slot.stealer.approximate_size()))
                .collect(),
            shared_queue_sizes: self.shared_queues.iter().map(|q| q.approximate_size()).collect(),
            idle_workers: self.idle.idle_count(),
        }
    }

    /// Accounts for workers whose threads never started.
    fn abandon_unstarted(&self, from: usize) {
        for slot in &self.slots[from..] {
            self.worker_exited();
            slot.termination.try_success(());
        }
    }
}

/// A cloneable submission handle to a [`ThreadPool`].
///
/// Handles do not keep the workers alive: once the owning [`ThreadPool`] is
/// dropped, submissions through a handle are rejected.
#[derive(Clone)]
pub struct PoolHandle {
    shared: Arc<PoolShared>,
}

impl PoolHandle {
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    /// Runs `f` on the pool without tracking its result.
    ///
    /// A panic in `f` goes to the configured panic handler.
    pub fn execute<F>(&self, f: F) -> Result<(), ExecuteError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.execute(Box::new(f)).map_err(Rejected::into_error)
    }

    /// Runs `f` on the pool and returns a future of its result.
    ///
    /// A panic in `f` completes the future with
    /// [`Failure::Panicked`](bramble_api::Failure::Panicked).
    pub fn submit<T, F>(&self, f: F) -> Result<Future<T>, ExecuteError>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let promise = Promise::new();
        let future = promise.future();
        self.shared
            .execute(Box::new(move || {
                promise.try_complete(catch(f));
            }))
            .map_err(Rejected::into_error)?;
        Ok(future)
    }

    /// Like [`submit`](Self::submit) for closures returning a `Result`; an
    /// `Err` completes the future with [`Failure::Error`](bramble_api::Failure::Error).
    pub fn submit_fallible<T, E, F>(&self, f: F) -> Result<Future<T>, ExecuteError>
    where
        T: Send + Sync + 'static,
        E: std::error::Error + Send + Sync + 'static,
        F: FnOnce() -> Result<T, E> + Send + 'static,
    {
        let promise = Promise::new();
        let future = promise.future();
        self.shared
            .execute(Box::new(move || {
                promise.try_complete(catch_fallible(f));
            }))
            .map_err(Rejected::into_error)?;
        Ok(future)
    }

    /// This handle as a shared [`Executor`] for the future combinators.
    pub fn executor(&self) -> ExecutorRef {
        Arc::new(self.clone())
    }

    pub fn state(&self) -> PoolState {
        self.shared.state()
    }

    pub fn statistics(&self) -> PoolStatistics {
        self.shared.statistics()
    }

    /// Waits for every worker to terminate. Returns `false` on timeout.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        self.shared.await_termination(timeout)
    }

    pub fn worker_count(&self) -> usize {
        self.shared.slots.len()
    }
}

impl Executor for PoolHandle {
    fn execute(&self, task: Task) -> Result<(), Rejected> {
        self.shared.execute(task)
    }
}

impl fmt::Debug for PoolHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolHandle")
            .field("id", &self.shared.id)
            .field("state", &self.shared.state())
            .finish()
    }
}

/// A work-stealing pool of OS threads.
///
/// ```rust
/// use bramble::{ShutdownMode, ThreadPool, ThreadPoolConfig};
/// use std::time::Duration;
///
/// let pool = ThreadPool::new(ThreadPoolConfig::with_workers(2)).unwrap();
/// let answer = pool.submit(|| 6 * 7).unwrap();
/// assert_eq!(answer.get(Duration::from_secs(5)).unwrap(), 42);
///
/// pool.shutdown(ShutdownMode::ExecuteSubmitted);
/// assert!(pool.await_termination(Duration::from_secs(5)));
/// ```
pub struct ThreadPool {
    handle: PoolHandle,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadPool {
    /// Validates `config` and starts the workers.
    ///
    /// # Errors
    /// [`PoolError::InvalidConfig`] for a bad configuration,
    /// [`PoolError::Spawn`] when the OS refuses a thread. Workers started
    /// before the failure are shut down and joined.
    pub fn new(config: ThreadPoolConfig) -> Result<Self, PoolError> {
        config.validate()?;

        let id = Uuid::new_v4();
        let worker_count = config.worker_count;
        let queues: Vec<LocalQueue> = (0..worker_count)
            .map(|_| LocalQueue::new(config.local_queue_capacity))
            .collect();
        let slots = queues.iter().map(|queue| WorkerSlot::new(queue.stealer())).collect();
        let shared_queues = (0..config.shared_queue_count)
            .map(|_| config.shared_queue_kind.build(config.shared_queue_capacity))
            .collect();

        let shared = Arc::new(PoolShared {
            id,
            config,
            slots,
            shared_queues,
            idle: IdleSet::new(worker_count),
            mode: AtomicUsize::new(0),
            submitting: AtomicUsize::new(0),
            alive: AtomicUsize::new(worker_count),
        });

        let pool = Self {
            handle: PoolHandle {
                shared: Arc::clone(&shared),
            },
            threads: Mutex::new(Vec::with_capacity(worker_count)),
        };

        for (index, queue) in queues.into_iter().enumerate() {
            LifecycleHooks::fire(&shared.config.lifecycle.before_start, index, "before_start");

            let name = shared.config.worker_name(index);
            let worker_shared = Arc::clone(&shared);
            let thread_name = name.clone();
            let spawned = thread::Builder::new()
                .name(name)
                .spawn(move || Worker::new(index, thread_name, worker_shared, queue).run());

            match spawned {
                Ok(handle) => pool.threads.lock().push(handle),
                Err(err) => {
                    error!(pool = %id, worker = index, "Failed to spawn worker thread: {}", err);
                    shared.abandon_unstarted(index);
                    shared.shutdown(ShutdownMode::SkipUnstarted);
                    // Drop joins the workers that did start
                    drop(pool);
                    return Err(PoolError::Spawn(err));
                }
            }
        }

        crate::log_pool!(
            id,
            "started",
            workers = worker_count,
            shared_queues = shared.shared_queues.len(),
            kind = ?shared.config.shared_queue_kind
        );
        Ok(pool)
    }

    /// Pool with the default configuration and `worker_count` workers.
    pub fn with_workers(worker_count: usize) -> Result<Self, PoolError> {
        Self::new(ThreadPoolConfig::with_workers(worker_count))
    }

    pub fn id(&self) -> Uuid {
        self.handle.id()
    }

    /// A cloneable submission handle.
    pub fn handle(&self) -> PoolHandle {
        self.handle.clone()
    }

    /// See [`PoolHandle::executor`].
    pub fn executor(&self) -> ExecutorRef {
        self.handle.executor()
    }

    /// See [`PoolHandle::execute`].
    pub fn execute<F>(&self, f: F) -> Result<(), ExecuteError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.handle.execute(f)
    }

    /// See [`PoolHandle::submit`].
    pub fn submit<T, F>(&self, f: F) -> Result<Future<T>, ExecuteError>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.handle.submit(f)
    }

    /// See [`PoolHandle::submit_fallible`].
    pub fn submit_fallible<T, E, F>(&self, f: F) -> Result<Future<T>, ExecuteError>
    where
        T: Send + Sync + 'static,
        E: std::error::Error + Send + Sync + 'static,
        F: FnOnce() -> Result<T, E> + Send + 'static,
    {
        self.handle.submit_fallible(f)
    }

    /// Stops accepting external work and winds the workers down according to
    /// `mode`.
    ///
    /// Returns one termination future per worker. Only the first call picks the
    /// mode; later calls return the same futures.
    pub fn shutdown(&self, mode: ShutdownMode) -> Vec<Future<()>> {
        self.handle.shared.shutdown(mode)
    }

    /// Waits for every worker to terminate. Returns `false` on timeout.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        self.handle.await_termination(timeout)
    }

    pub fn state(&self) -> PoolState {
        self.handle.state()
    }

    pub fn statistics(&self) -> PoolStatistics {
        self.handle.statistics()
    }

    pub fn worker_count(&self) -> usize {
        self.handle.worker_count()
    }

    /// Joins every worker thread. Blocks until the pool has been shut down and
    /// drained.
    ///
    /// # Errors
    /// [`PoolError::WorkerTerminated`] if a worker thread died abnormally.
    pub fn join(&self) -> Result<(), PoolError> {
        let threads = std::mem::take(&mut *self.threads.lock());
        let mut result = Ok(());
        for (index, thread) in threads.into_iter().enumerate() {
            if thread.join().is_err() {
                result = Err(PoolError::WorkerTerminated(index));
            }
        }
        result
    }
}

impl Executor for ThreadPool {
    fn execute(&self, task: Task) -> Result<(), Rejected> {
        self.handle.shared.execute(task)
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        let shared = &self.handle.shared;
        if shared.state() == PoolState::Running {
            shared.shutdown(ShutdownMode::ExecuteSubmitted);
        }
        if shared.config.daemon {
            return;
        }
        if worker::current_index(shared).is_some() {
            warn!(pool = %shared.id, "ThreadPool dropped on one of its own workers; not joining");
            return;
        }
        if let Err(err) = self.join() {
            error!(pool = %shared.id, "Error joining workers: {}", err);
        }
    }
}

impl fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPool")
            .field("id", &self.handle.shared.id)
            .field("workers", &self.worker_count())
            .field("state", &self.state())
            .field("config", &self.handle.shared.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    const WAIT: Duration = Duration::from_secs(10);

    fn small_pool(workers: usize) -> ThreadPool {
        ThreadPool::new(ThreadPoolConfig {
            worker_count: workers,
            local_queue_capacity: 16,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_submit_and_shutdown() {
        let pool = small_pool(2);
        let future = pool.submit(|| "done").unwrap();
        assert_eq!(future.get(WAIT).unwrap(), "done");
        assert_eq!(pool.state(), PoolState::Running);

        let terminations = pool.shutdown(ShutdownMode::ExecuteSubmitted);
        assert_eq!(terminations.len(), 2);
        assert!(pool.await_termination(WAIT));
        assert_eq!(pool.state(), PoolState::Down);
    }

    #[test]
    fn test_external_submit_rejected_after_shutdown() {
        let pool = small_pool(1);
        pool.shutdown(ShutdownMode::ExecuteSubmitted);
        assert_eq!(pool.execute(|| {}), Err(ExecuteError::ShutDown));
        assert!(pool.submit(|| 1).is_err());
    }

    #[test]
    fn test_worker_local_submit_accepted_during_drain() {
        let pool = small_pool(2);
        let counter = Arc::new(AtomicUsize::new(0));
        let handle = pool.handle();
        let gate = Promise::<()>::new();
        let opened = gate.future();

        let c = Arc::clone(&counter);
        pool.execute(move || {
            opened.wait().unwrap();
            for _ in 0..10 {
                let c = Arc::clone(&c);
                handle
                    .execute(move || {
                        c.fetch_add(1, Ordering::SeqCst);
                    })
                    .unwrap();
            }
        })
        .unwrap();

        let terminations = pool.shutdown(ShutdownMode::ExecuteSubmitted);
        gate.success(()).unwrap();
        for termination in terminations {
            termination.get(WAIT).unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_shutdown_twice_returns_same_futures() {
        let pool = small_pool(2);
        let first = pool.shutdown(ShutdownMode::SkipUnstarted);
        let second = pool.shutdown(ShutdownMode::ExecuteSubmitted);
        assert_eq!(first.len(), second.len());
        assert!(pool.await_termination(WAIT));
        assert!(second.iter().all(|f| f.is_completed()));
    }
}
