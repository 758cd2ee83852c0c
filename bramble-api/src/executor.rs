//! # Executor Abstraction
//!
//! The only seam between the promise layer and whatever runs the work. Promise
//! callbacks and every combinator are dispatched through [`Executor::execute`], so
//! nothing above this trait knows about queues or threads.

use std::fmt;
use std::sync::Arc;

use crate::errors::Rejected;

/// A unit of work: runs once, on whichever thread dequeues it.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Something that can run tasks.
pub trait Executor: Send + Sync {
    /// Schedules `task`. On refusal the task is handed back inside [`Rejected`].
    fn execute(&self, task: Task) -> Result<(), Rejected>;
}

/// Shared, type-erased executor handle as accepted by the combinators.
pub type ExecutorRef = Arc<dyn Executor>;

impl<E: Executor + ?Sized> Executor for Arc<E> {
    fn execute(&self, task: Task) -> Result<(), Rejected> {
        (**self).execute(task)
    }
}

impl<E: Executor + ?Sized> Executor for &E {
    fn execute(&self, task: Task) -> Result<(), Rejected> {
        (**self).execute(task)
    }
}

/// Runs every task immediately on the thread that submits it.
///
/// Useful for cheap callbacks where a queue round-trip costs more than the work.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallingThread;

impl Executor for CallingThread {
    fn execute(&self, task: Task) -> Result<(), Rejected> {
        task();
        Ok(())
    }
}

/// Shared handle to [`CallingThread`].
pub fn calling_thread() -> ExecutorRef {
    Arc::new(CallingThread)
}

/// Wraps a closure so it can be stored where a [`Task`] is expected.
pub fn task<F>(f: F) -> Task
where
    F: FnOnce() + Send + 'static,
{
    Box::new(f)
}

impl fmt::Debug for dyn Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("dyn Executor")
    }
}
