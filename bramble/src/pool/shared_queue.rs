//! # Shared Injection Queues
//!
//! Pool-wide bounded FIFO queues fed by threads that are not workers of the
//! pool, and by workers whose local deque overflowed. Two strategies implement
//! the same [`SharedQueue`] contract:
//!
//! - [`LockedQueue`]: a ring buffer behind a `parking_lot` mutex. The sticky
//!   shutdown flag lives in the high bit of the ring's `base` cursor, and an
//!   atomic mirror of size and flag serves lock-free reads.
//! - [`LockFreeQueue`]: `crossbeam_queue::ArrayQueue` plus an atomic flag.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use bramble_api::{ExecuteError, Rejected, Task};
use crossbeam_queue::ArrayQueue;
use parking_lot::Mutex;

use super::local_queue::LocalQueue;
use crate::config::SharedQueueKind;

const SHUTDOWN_BIT: usize = 1 << (usize::BITS - 1);

/// Outcome of a dequeue attempt.
pub enum Dequeue<T = Task> {
    Task(T),
    Empty,
    /// The queue was shut down; no task will ever come out of it again.
    ShutDown,
}

impl<T> Dequeue<T> {
    pub fn into_task(self) -> Option<T> {
        match self {
            Dequeue::Task(task) => Some(task),
            Dequeue::Empty | Dequeue::ShutDown => None,
        }
    }
}

impl<T> fmt::Debug for Dequeue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dequeue::Task(_) => f.write_str("Task(..)"),
            Dequeue::Empty => f.write_str("Empty"),
            Dequeue::ShutDown => f.write_str("ShutDown"),
        }
    }
}

/// A bounded multi-producer multi-consumer FIFO of tasks.
pub trait SharedQueue: Send + Sync + fmt::Debug {
    /// Appends a task.
    ///
    /// # Errors
    /// Hands the task back with [`ExecuteError::QueueFull`] or
    /// [`ExecuteError::ShutDown`].
    fn push(&self, task: Task) -> Result<(), Rejected>;

    fn pop_fifo(&self) -> Dequeue;

    /// Takes the oldest task and moves up to `max_prefetch` more into `into`.
    ///
    /// The task comes back with the number of tasks that were moved.
    fn pop_fifo_batch(&self, into: &LocalQueue, max_prefetch: usize) -> Dequeue<(Task, usize)>;

    /// Sets the sticky shutdown flag. Later pushes are refused.
    fn shutdown(&self);

    fn is_shutdown(&self) -> bool;

    /// Discards every queued task and returns how many there were.
    fn clear(&self) -> usize;

    fn approximate_size(&self) -> usize;

    fn capacity(&self) -> usize;
}

impl SharedQueueKind {
    /// Builds a queue of this kind.
    pub fn build(self, capacity: usize) -> Box<dyn SharedQueue> {
        match self {
            SharedQueueKind::Locked => Box::new(LockedQueue::new(capacity)),
            SharedQueueKind::LockFree => Box::new(LockFreeQueue::new(capacity)),
        }
    }
}

/// Takes the first task from `next` and moves up to `max_prefetch` more into
/// `into`. The caller is the owner of `into`.
fn transfer_batch(
    into: &LocalQueue,
    max_prefetch: usize,
    mut next: impl FnMut() -> Option<Task>,
) -> Option<(Task, usize)> {
    let task = next()?;
    let moved = into.fill_from(max_prefetch, next);
    Some((task, moved))
}

struct Ring {
    slots: Box<[Option<Task>]>,
    /// Index of the oldest task; the high bit is the shutdown flag
    base: usize,
    top: usize,
}

impl Ring {
    fn head(&self) -> usize {
        self.base & !SHUTDOWN_BIT
    }

    fn is_shutdown(&self) -> bool {
        self.base & SHUTDOWN_BIT != 0
    }

    fn len(&self) -> usize {
        self.top - self.head()
    }

    fn pop(&mut self) -> Option<Task> {
        if self.len() == 0 {
            return None;
        }
        let head = self.head();
        let task = self.slots[head % self.slots.len()].take();
        self.base = (head + 1) | (self.base & SHUTDOWN_BIT);
        task
    }
}

/// Ring buffer guarded by a narrow lock.
pub struct LockedQueue {
    ring: Mutex<Ring>,
    /// Size and shutdown bit, readable without the lock
    mirror: AtomicUsize,
    capacity: usize,
}

impl LockedQueue {
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity).map(|_| None).collect::<Vec<_>>().into_boxed_slice();
        Self {
            ring: Mutex::new(Ring {
                slots,
                base: 0,
                top: 0,
            }),
            mirror: AtomicUsize::new(0),
            capacity,
        }
    }

    fn publish(&self, ring: &Ring) {
        let flag = if ring.is_shutdown() { SHUTDOWN_BIT } else { 0 };
        self.mirror.store(ring.len() | flag, Ordering::Release);
    }

    fn dequeue_with<T>(&self, take: impl FnOnce(&mut Ring) -> Option<T>) -> Dequeue<T> {
        let mirror = self.mirror.load(Ordering::Acquire);
        if mirror & SHUTDOWN_BIT != 0 {
            return Dequeue::ShutDown;
        }
        if mirror == 0 {
            return Dequeue::Empty;
        }

        let mut ring = self.ring.lock();
        if ring.is_shutdown() {
            return Dequeue::ShutDown;
        }
        let task = take(&mut ring);
        self.publish(&ring);
        match task {
            Some(task) => Dequeue::Task(task),
            None => Dequeue::Empty,
        }
    }
}

impl SharedQueue for LockedQueue {
    fn push(&self, task: Task) -> Result<(), Rejected> {
        let mut ring = self.ring.lock();
        if ring.is_shutdown() {
            return Err(Rejected::new(task, ExecuteError::ShutDown));
        }
        if ring.len() >= self.capacity {
            return Err(Rejected::new(
                task,
                ExecuteError::QueueFull {
                    capacity: self.capacity,
                },
            ));
        }
        let top = ring.top;
        ring.slots[top % self.capacity] = Some(task);
        ring.top = top + 1;
        self.publish(&ring);
        Ok(())
    }

    fn pop_fifo(&self) -> Dequeue {
        self.dequeue_with(Ring::pop)
    }

    fn pop_fifo_batch(&self, into: &LocalQueue, max_prefetch: usize) -> Dequeue<(Task, usize)> {
        self.dequeue_with(|ring| transfer_batch(into, max_prefetch, || ring.pop()))
    }

    fn shutdown(&self) {
        let mut ring = self.ring.lock();
        ring.base |= SHUTDOWN_BIT;
        self.publish(&ring);
    }

    fn is_shutdown(&self) -> bool {
        self.mirror.load(Ordering::Acquire) & SHUTDOWN_BIT != 0
    }

    fn clear(&self) -> usize {
        let drained: Vec<Task> = {
            let mut ring = self.ring.lock();
            let drained = std::iter::from_fn(|| ring.pop()).collect();
            self.publish(&ring);
            drained
        };
        // task destructors run outside the lock
        drained.len()
    }

    fn approximate_size(&self) -> usize {
        self.mirror.load(Ordering::Relaxed) & !SHUTDOWN_BIT
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}

impl fmt::Debug for LockedQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockedQueue")
            .field("size", &self.approximate_size())
            .field("capacity", &self.capacity)
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

/// CAS-based bounded queue.
pub struct LockFreeQueue {
    queue: ArrayQueue<Task>,
    shutdown: AtomicBool,
}

impl LockFreeQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity),
            shutdown: AtomicBool::new(false),
        }
    }
}

impl SharedQueue for LockFreeQueue {
    fn push(&self, task: Task) -> Result<(), Rejected> {
        if self.is_shutdown() {
            return Err(Rejected::new(task, ExecuteError::ShutDown));
        }
        let capacity = self.queue.capacity();
        self.queue
            .push(task)
            .map_err(|task| Rejected::new(task, ExecuteError::QueueFull { capacity }))?;
        // a shutdown that raced the push must not strand the task
        if self.is_shutdown() {
            if let Some(task) = self.queue.pop() {
                return Err(Rejected::new(task, ExecuteError::ShutDown));
            }
        }
        Ok(())
    }

    fn pop_fifo(&self) -> Dequeue {
        if self.is_shutdown() {
            return Dequeue::ShutDown;
        }
        match self.queue.pop() {
            Some(task) => Dequeue::Task(task),
            None => Dequeue::Empty,
        }
    }

    fn pop_fifo_batch(&self, into: &LocalQueue, max_prefetch: usize) -> Dequeue<(Task, usize)> {
        if self.is_shutdown() {
            return Dequeue::ShutDown;
        }
        if self.queue.is_empty() {
            return Dequeue::Empty;
        }
        match transfer_batch(into, max_prefetch, || self.queue.pop()) {
            Some(batch) => Dequeue::Task(batch),
            None => Dequeue::Empty,
        }
    }

    fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn clear(&self) -> usize {
        std::iter::from_fn(|| self.queue.pop()).count()
    }

    fn approximate_size(&self) -> usize {
        self.queue.len()
    }

    fn capacity(&self) -> usize {
        self.queue.capacity()
    }
}

impl fmt::Debug for LockFreeQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockFreeQueue")
            .field("size", &self.queue.len())
            .field("capacity", &self.queue.capacity())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn both(capacity: usize) -> Vec<Box<dyn SharedQueue>> {
        vec![
            SharedQueueKind::Locked.build(capacity),
            SharedQueueKind::LockFree.build(capacity),
        ]
    }

    fn numbered(log: &Arc<Mutex<Vec<usize>>>, value: usize) -> Task {
        let log = Arc::clone(log);
        Box::new(move || log.lock().push(value))
    }

    #[test]
    fn test_fifo_order() {
        for queue in both(8) {
            let log = Arc::new(Mutex::new(Vec::new()));
            for i in 0..5 {
                queue.push(numbered(&log, i)).unwrap();
            }
            while let Some(task) = queue.pop_fifo().into_task() {
                task();
            }
            assert_eq!(*log.lock(), vec![0, 1, 2, 3, 4], "{:?}", queue);
        }
    }

    #[test]
    fn test_overflow_and_shutdown_are_distinguished() {
        for queue in both(1) {
            queue.push(Box::new(|| {})).unwrap();
            let full = queue.push(Box::new(|| {})).unwrap_err();
            assert_eq!(full.error, ExecuteError::QueueFull { capacity: 1 });

            queue.shutdown();
            assert!(queue.is_shutdown());
            let closed = queue.push(Box::new(|| {})).unwrap_err();
            assert_eq!(closed.error, ExecuteError::ShutDown);
            assert!(matches!(queue.pop_fifo(), Dequeue::ShutDown));

            assert_eq!(queue.clear(), 1);
            assert_eq!(queue.approximate_size(), 0);
            assert!(queue.is_shutdown());
        }
    }

    #[test]
    fn test_batch_moves_prefetch_into_local() {
        for queue in both(32) {
            let log = Arc::new(Mutex::new(Vec::new()));
            for i in 0..10 {
                queue.push(numbered(&log, i)).unwrap();
            }
            let local = LocalQueue::new(8);
            let (first, moved) = queue.pop_fifo_batch(&local, 3).into_task().unwrap();
            first();
            assert_eq!(*log.lock(), vec![0]);
            assert_eq!(moved, 3);
            assert_eq!(local.approximate_size(), 3);
            assert_eq!(queue.approximate_size(), 6);
        }
    }

    #[test]
    fn test_batch_into_busy_local_counts_only_moved_tasks() {
        for queue in both(32) {
            let log = Arc::new(Mutex::new(Vec::new()));
            for i in 0..10 {
                queue.push(numbered(&log, i)).unwrap();
            }
            let local = LocalQueue::new(8);
            for i in 100..106 {
                local.push(numbered(&log, i)).unwrap();
            }

            let (first, moved) = queue.pop_fifo_batch(&local, 3).into_task().unwrap();
            first();
            // the oldest shared task runs, not the oldest local one
            assert_eq!(*log.lock(), vec![0]);
            // two free local slots bound the prefetch
            assert_eq!(moved, 2);
            assert_eq!(local.approximate_size(), 8);
            assert_eq!(queue.approximate_size(), 7);
        }
    }

    #[test]
    fn test_batch_into_full_local_still_returns_task() {
        for queue in both(8) {
            queue.push(Box::new(|| {})).unwrap();
            queue.push(Box::new(|| {})).unwrap();
            let local = LocalQueue::new(2);
            local.push(Box::new(|| {})).unwrap();
            local.push(Box::new(|| {})).unwrap();

            let (_, moved) = queue.pop_fifo_batch(&local, 4).into_task().unwrap();
            assert_eq!(moved, 0);
            assert_eq!(local.approximate_size(), 2);
            assert_eq!(queue.approximate_size(), 1);
        }
    }

    #[test]
    fn test_push_racing_shutdown_never_strands_a_task() {
        for _ in 0..200 {
            let queue = Arc::new(LockFreeQueue::new(1024));
            let pushers: Vec<_> = (0..2)
                .map(|_| {
                    let queue = Arc::clone(&queue);
                    std::thread::spawn(move || {
                        for _ in 0..64 {
                            let _ = queue.push(Box::new(|| {}));
                        }
                    })
                })
                .collect();
            queue.shutdown();
            queue.clear();
            for pusher in pushers {
                pusher.join().unwrap();
            }
            // a push that landed after the drain took a task back out
            assert_eq!(queue.approximate_size(), 0);
            assert_eq!(
                queue.push(Box::new(|| {})).unwrap_err().error,
                ExecuteError::ShutDown
            );
        }
    }

    #[test]
    fn test_ring_wraps_around() {
        let queue = LockedQueue::new(4);
        for round in 0..10 {
            queue.push(Box::new(|| {})).unwrap();
            queue.push(Box::new(|| {})).unwrap();
            assert!(queue.pop_fifo().into_task().is_some(), "round {}", round);
            assert!(queue.pop_fifo().into_task().is_some());
        }
        assert!(matches!(queue.pop_fifo(), Dequeue::Empty));
    }
}
