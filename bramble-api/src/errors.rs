//! # Error Types
//!
//! Errors shared by the promise layer and every executor implementation.
//!
//! - [`Failure`]: the failure side of a [`Try`](crate::result::Try), cloneable so a
//!   single completed promise can hand it to any number of callbacks
//! - [`ExecuteError`]: why an executor refused a task
//! - [`Rejected`]: the refused task handed back to the submitter, never dropped
//! - [`TimeoutError`]: a blocking wait ran out of time
//! - [`AlreadyCompleted`]: `complete` called on a completed promise

use std::any::Any;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::executor::Task;

/// Reasons an executor can refuse a task.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecuteError {
    /// The target queue is at its configured capacity.
    #[error("Queue is full (capacity: {capacity})")]
    QueueFull { capacity: usize },

    /// The executor has been shut down and accepts no more work.
    #[error("Executor has been shut down")]
    ShutDown,
}

/// A task the executor refused, handed back together with the reason.
pub struct Rejected {
    pub task: Task,
    pub error: ExecuteError,
}

impl Rejected {
    pub fn new(task: Task, error: ExecuteError) -> Self {
        Self { task, error }
    }

    /// Drops the task and keeps only the reason.
    pub fn into_error(self) -> ExecuteError {
        self.error
    }
}

impl fmt::Debug for Rejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rejected")
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Rejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task rejected: {}", self.error)
    }
}

impl StdError for Rejected {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(&self.error)
    }
}

impl From<Rejected> for ExecuteError {
    fn from(rejected: Rejected) -> Self {
        rejected.error
    }
}

/// A blocking wait exceeded its deadline.
///
/// Zero-sized and without a captured backtrace: timeouts are routine on a busy
/// system and must stay cheap to produce.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[error("Operation timed out")]
pub struct TimeoutError;

/// `complete` was called on a promise that already holds a result.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[error("Promise already completed")]
pub struct AlreadyCompleted;

/// The failure half of a completed computation.
#[derive(Error, Debug, Clone)]
pub enum Failure {
    /// The computation panicked; the payload message is kept.
    #[error("Task panicked: {0}")]
    Panicked(Arc<str>),

    /// The computation returned an error.
    #[error("{0}")]
    Error(Arc<dyn StdError + Send + Sync>),

    /// A filter, collect or find did not produce a value.
    #[error("No element satisfied the predicate")]
    NoSuchElement,

    /// A timed wait gave up before the result was available.
    #[error("Timed out waiting for result")]
    TimedOut,

    /// The work could not be scheduled.
    #[error("Task rejected by executor: {0}")]
    Rejected(ExecuteError),
}

impl Failure {
    /// Wraps any error value.
    pub fn error<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Failure::Error(Arc::new(error))
    }

    /// Builds a failure from an arbitrary message.
    pub fn msg(message: impl Into<String>) -> Self {
        Failure::Error(Arc::new(MessageError(message.into())))
    }

    /// Converts a payload caught by `catch_unwind`.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        Failure::Panicked(panic_message(payload.as_ref()).into())
    }

    pub fn is_panic(&self) -> bool {
        matches!(self, Failure::Panicked(_))
    }
}

impl From<TimeoutError> for Failure {
    fn from(_: TimeoutError) -> Self {
        Failure::TimedOut
    }
}

impl From<ExecuteError> for Failure {
    fn from(error: ExecuteError) -> Self {
        Failure::Rejected(error)
    }
}

impl From<Rejected> for Failure {
    fn from(rejected: Rejected) -> Self {
        Failure::Rejected(rejected.error)
    }
}

#[derive(Error, Debug)]
#[error("{0}")]
struct MessageError(String);

/// Best-effort text of a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}
