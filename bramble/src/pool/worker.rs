//! # Worker Thread
//!
//! One OS thread per worker, owning a [`LocalQueue`]. Each iteration of the
//! loop looks for a task in this order:
//!
//! 1. the local deque: LIFO, except every `local_fifo_interval`-th pop takes the
//!    oldest task so self-spawning workloads cannot starve early work
//! 2. the shared queues, starting from a preferred queue that rotates every
//!    `shared_queue_switch_interval` iterations, prefetching into the local deque
//! 3. the other workers' deques, starting at `index + 1`, prefetching from the
//!    victim
//!
//! When all three come up empty the worker parks:
//!
//! 1. set its bit in the idle set
//! 2. look for work again, closing the race with a producer that pushed before
//!    the bit became visible
//! 3. park with a timeout
//! 4. on wake-up, collect a hand-off if a submitter claimed this worker,
//!    otherwise clear the bit and search again
//!
//! Panics escaping a task are caught, counted and reported to the pool's panic
//! handler; the worker carries on with the next task.

use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, Thread};

use bramble_api::errors::panic_message;
use bramble_api::{Promise, Rejected, Task};
use crossbeam_utils::{Backoff, CachePadded};
use parking_lot::Mutex;
use tracing::{debug, error};
use uuid::Uuid;

use super::local_queue::{LocalQueue, Stealer};
use super::shared_queue::Dequeue;
use super::statistics::{WorkerCounters, WorkerState};
use super::thread_pool::{PoolShared, ShutdownMode};
use crate::config::{LifecycleHooks, UncaughtPanic};

/// Pool-visible state of one worker.
pub(crate) struct WorkerSlot {
    pub stealer: Stealer,
    /// Task handed directly to this worker by a submitter that claimed its idle bit
    pub handoff: Mutex<Option<Task>>,
    pub thread: OnceLock<Thread>,
    pub counters: CachePadded<WorkerCounters>,
    pub interrupted: AtomicBool,
    pub termination: Promise<()>,
}

impl WorkerSlot {
    pub fn new(stealer: Stealer) -> Self {
        Self {
            stealer,
            handoff: Mutex::new(None),
            thread: OnceLock::new(),
            counters: CachePadded::new(WorkerCounters::new()),
            interrupted: AtomicBool::new(false),
            termination: Promise::new(),
        }
    }

    pub fn unpark(&self) {
        if let Some(thread) = self.thread.get() {
            thread.unpark();
        }
    }
}

struct WorkerContext {
    pool: Uuid,
    index: usize,
    queue: Rc<LocalQueue>,
    shared: Arc<PoolShared>,
}

thread_local! {
    static CURRENT: RefCell<Option<WorkerContext>> = const { RefCell::new(None) };
}

/// Result of trying to submit through the calling thread's own deque.
pub(crate) enum LocalSubmit {
    Done(Result<(), Rejected>),
    NotWorker(Task),
}

/// Pushes onto the caller's local deque when the caller is a worker of `pool`.
pub(crate) fn submit_local(pool: &PoolShared, task: Task) -> LocalSubmit {
    CURRENT.with(|current| match current.borrow().as_ref() {
        Some(ctx) if ctx.pool == pool.id => LocalSubmit::Done(push_local(pool, &ctx.queue, task)),
        _ => LocalSubmit::NotWorker(task),
    })
}

fn push_local(pool: &PoolShared, queue: &LocalQueue, task: Task) -> Result<(), Rejected> {
    if pool.is_discarding() {
        return Err(Rejected::new(task, bramble_api::ExecuteError::ShutDown));
    }
    match queue.push(task) {
        Ok(was_empty) => {
            if was_empty {
                pool.notify_work();
            }
            Ok(())
        }
        Err(rejected) => pool.push_shared(rejected.task),
    }
}

/// Index of the calling thread if it is a worker of `pool`.
pub(crate) fn current_index(pool: &PoolShared) -> Option<usize> {
    CURRENT
        .try_with(|current| {
            current
                .borrow()
                .as_ref()
                .filter(|ctx| ctx.pool == pool.id)
                .map(|ctx| ctx.index)
        })
        .ok()
        .flatten()
}

/// Whether the task running on this thread was asked to stop by
/// [`ShutdownMode::Interrupt`]. Always `false` outside a worker.
pub fn is_interrupted() -> bool {
    CURRENT
        .try_with(|current| {
            current
                .borrow()
                .as_ref()
                .is_some_and(|ctx| ctx.shared.slots[ctx.index].interrupted.load(Ordering::Acquire))
        })
        .unwrap_or(false)
}

/// Index of the worker running the calling thread, in whichever pool.
pub fn current_worker() -> Option<usize> {
    CURRENT
        .try_with(|current| current.borrow().as_ref().map(|ctx| ctx.index))
        .ok()
        .flatten()
}

/// The worker loop's own state. Lives on the worker thread only.
pub(crate) struct Worker {
    index: usize,
    name: String,
    shared: Arc<PoolShared>,
    queue: Rc<LocalQueue>,

    local_fifo_interval: usize,
    shared_queue_switch_interval: usize,
    steal_skip_interval: usize,
    prefetch: usize,

    tick: usize,
    search_passes: usize,
    preferred_shared: usize,
}

impl Worker {
    pub fn new(index: usize, name: String, shared: Arc<PoolShared>, queue: LocalQueue) -> Self {
        let config = &shared.config;
        Self {
            index,
            name,
            local_fifo_interval: config.local_fifo_interval,
            shared_queue_switch_interval: config.shared_queue_switch_interval,
            steal_skip_interval: config.steal_skip_interval,
            prefetch: config.prefetch,
            tick: 0,
            search_passes: 0,
            preferred_shared: index % shared.shared_queues.len(),
            queue: Rc::new(queue),
            shared,
        }
    }

    fn slot(&self) -> &WorkerSlot {
        &self.shared.slots[self.index]
    }

    fn counters(&self) -> &WorkerCounters {
        &self.slot().counters
    }

    /// Runs until the pool shuts down, then fires the stop hooks and completes
    /// this worker's termination future.
    pub fn run(mut self) {
        let span = crate::worker_span!(self.shared.id, self.index);
        let _guard = span.enter();

        let _ = self.slot().thread.set(thread::current());
        CURRENT.with(|current| {
            *current.borrow_mut() = Some(WorkerContext {
                pool: self.shared.id,
                index: self.index,
                queue: Rc::clone(&self.queue),
                shared: Arc::clone(&self.shared),
            });
        });

        LifecycleHooks::fire(&self.shared.config.lifecycle.after_start, self.index, "after_start");
        debug!(worker = self.index, thread = %self.name, "Worker started");

        self.run_loop();

        LifecycleHooks::fire(&self.shared.config.lifecycle.before_stop, self.index, "before_stop");
        self.counters().set_state(WorkerState::Terminated);
        CURRENT.with(|current| current.borrow_mut().take());
        LifecycleHooks::fire(&self.shared.config.lifecycle.after_stop, self.index, "after_stop");

        debug!(
            worker = self.index,
            executed = self.counters().executed.load(Ordering::Relaxed),
            "Worker stopped"
        );
        self.shared.worker_exited();
        self.slot().termination.try_success(());
    }

    fn run_loop(&mut self) {
        loop {
            if self.shared.is_discarding() {
                return;
            }

            if let Some(task) = self.find_work() {
                self.run_task(task);
                continue;
            }

            match self.shared.mode() {
                Some(ShutdownMode::ExecuteSubmitted) => {
                    // exit once nothing can still land in a queue
                    if !self.shared.has_pending_submissions() && !self.shared.any_running() {
                        match self.find_work() {
                            Some(task) => self.run_task(task),
                            None => return,
                        }
                        continue;
                    }
                }
                Some(_) => return,
                None => {}
            }

            if let Some(task) = self.park() {
                if self.shared.is_discarding() {
                    drop(task);
                    return;
                }
                self.run_task(task);
            }
        }
    }

    fn find_work(&mut self) -> Option<Task> {
        self.tick = self.tick.wrapping_add(1);
        if let Some(task) = self.pop_local() {
            return Some(task);
        }
        if let Some(task) = self.pop_shared() {
            return Some(task);
        }
        self.steal()
    }

    fn pop_local(&self) -> Option<Task> {
        let counters = self.counters();
        if self.tick % self.local_fifo_interval == 0 {
            if let Some(task) = self.queue.pop_fifo() {
                WorkerCounters::bump(&counters.fifo_pops);
                return Some(task);
            }
        }
        let task = self.queue.pop_lifo()?;
        WorkerCounters::bump(&counters.lifo_pops);
        Some(task)
    }

    fn pop_shared(&mut self) -> Option<Task> {
        let queues = &self.shared.shared_queues;
        let count = queues.len();
        if self.tick % self.shared_queue_switch_interval == 0 {
            self.preferred_shared = (self.preferred_shared + 1) % count;
        }

        for offset in 0..count {
            let queue = &queues[(self.preferred_shared + offset) % count];
            match queue.pop_fifo_batch(&self.queue, self.prefetch) {
                Dequeue::Task((task, prefetched)) => {
                    let counters = &self.shared.slots[self.index].counters;
                    WorkerCounters::bump(&counters.shared_pops);
                    WorkerCounters::add(&counters.prefetched, prefetched);
                    if prefetched > 0 || queue.approximate_size() > 0 {
                        self.shared.notify_work();
                    }
                    return Some(task);
                }
                Dequeue::Empty | Dequeue::ShutDown => continue,
            }
        }
        None
    }

    fn steal(&mut self) -> Option<Task> {
        let workers = self.shared.slots.len();
        if workers < 2 {
            return None;
        }

        self.search_passes = self.search_passes.wrapping_add(1);
        if self.steal_skip_interval != 0 && self.search_passes % self.steal_skip_interval == 0 {
            return None;
        }

        for offset in 1..workers {
            let victim = (self.index + offset) % workers;
            let stealer = &self.shared.slots[victim].stealer;
            if let Some((task, prefetched)) = stealer.steal_into(&self.queue, self.prefetch) {
                let counters = self.counters();
                WorkerCounters::bump(&counters.steals);
                WorkerCounters::add(&counters.prefetched, prefetched);
                crate::log_scheduler!("steal", worker = self.index, victim, prefetched);
                if prefetched > 0 || stealer.approximate_size() > 0 {
                    self.shared.notify_work();
                }
                return Some(task);
            }
        }
        None
    }

    fn park(&mut self) -> Option<Task> {
        self.counters().set_state(WorkerState::Parked);
        self.shared.idle.mark_idle(self.index);

        if let Some(task) = self.find_work() {
            if let Some(handoff) = self.leave_idle() {
                self.stash(handoff);
            }
            return Some(task);
        }
        if self.shared.is_discarding() {
            return self.leave_idle();
        }

        WorkerCounters::bump(&self.counters().parks);
        crate::log_scheduler!("park", worker = self.index);
        thread::park_timeout(self.shared.config.idle_park_timeout);

        if let Some(handoff) = self.leave_idle() {
            return Some(handoff);
        }
        let task = self.find_work();
        if task.is_none() && self.shared.mode().is_none() {
            WorkerCounters::bump(&self.counters().false_wakeups);
        }
        task
    }

    /// Clears this worker's idle bit, or collects the hand-off if a submitter
    /// already cleared it.
    fn leave_idle(&self) -> Option<Task> {
        self.counters().set_state(WorkerState::Searching);
        if self.shared.idle.unmark(self.index) {
            return None;
        }
        // claimed: the submitter fills the slot right after its CAS
        let backoff = Backoff::new();
        loop {
            if let Some(task) = self.slot().handoff.lock().take() {
                crate::log_scheduler!("hand_off", worker = self.index);
                return Some(task);
            }
            backoff.snooze();
        }
    }

    fn stash(&self, task: Task) {
        if let Err(rejected) = self.queue.push(task) {
            self.run_task(rejected.task);
        }
    }

    fn run_task(&self, task: Task) {
        let counters = self.counters();
        counters.set_state(WorkerState::Running);

        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
            WorkerCounters::bump(&counters.panics);
            let report = UncaughtPanic {
                worker: self.index,
                thread_name: self.name.clone(),
                message: panic_message(&*payload),
            };
            let handler = &self.shared.config.panic_handler;
            if panic::catch_unwind(AssertUnwindSafe(|| handler(&report))).is_err() {
                error!(worker = self.index, "Panic handler panicked while reporting: {}", report.message);
            }
        }

        WorkerCounters::bump(&counters.executed);
        counters.set_state(WorkerState::Searching);
    }
}
