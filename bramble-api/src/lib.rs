//! # Bramble API
//!
//! The executor-agnostic half of the bramble runtime: write-once promises, the
//! futures that observe them, a combinator library, and the [`Executor`] trait
//! every scheduler implements.
//!
//! ## Design Principles
//!
//! - **Single assignment**: a promise is completed at most once; later attempts are
//!   refused and never alter the stored result.
//! - **Callbacks are tasks**: completion fans out by submitting each registered
//!   callback to its own executor, which may differ per callback.
//! - **Composition without internals**: every combinator is built from
//!   [`Future::on_complete`] plus a fresh downstream promise.
//!
//! ## Usage Example
//!
//! ```rust
//! use bramble_api::{calling_thread, Promise};
//!
//! let exec = calling_thread();
//! let promise = Promise::new();
//! let doubled = promise.future().map(&exec, |x: i32| x * 2);
//! promise.success(21).unwrap();
//! assert_eq!(doubled.wait().unwrap(), 42);
//! ```
//!
//! ## Module Organization
//!
//! - [`list`]: immutable cons-list used for callback and waiter registries
//! - [`result`]: the [`Try`] result type and panic capture helpers
//! - [`errors`]: error types
//! - [`executor`]: the [`Executor`] trait and the calling-thread executor
//! - [`promise`]: [`Promise`] and [`Future`]
//! - `combinators`: `map`, `flat_map`, `zip`, `lift`, ... on [`Future`]

pub mod combinators;
pub mod errors;
pub mod executor;
pub mod list;
pub mod promise;
pub mod result;

pub use errors::{AlreadyCompleted, ExecuteError, Failure, Rejected, TimeoutError};
pub use executor::{calling_thread, task, CallingThread, Executor, ExecutorRef, Task};
pub use list::ImmutableList;
pub use promise::{Future, Promise};
pub use result::{catch, catch_fallible, Try};
