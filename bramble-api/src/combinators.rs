//! # Future Combinators
//!
//! Every combinator here follows the same recipe: create a fresh downstream
//! [`Promise`], register one callback on the upstream future with
//! [`Future::on_complete`], and complete the downstream promise from inside that
//! callback. Nothing in this module touches the cell internals.
//!
//! User closures run under [`catch`], so a panicking mapper fails the downstream
//! future instead of unwinding through the executor.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::errors::Failure;
use crate::executor::{calling_thread, ExecutorRef};
use crate::promise::{Future, Promise};
use crate::result::{catch, Try};

impl<T: Clone + Send + Sync + 'static> Future<T> {
    /// Applies `f` to the successful value.
    pub fn map<U, F>(&self, executor: &ExecutorRef, f: F) -> Future<U>
    where
        U: Send + Sync + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let promise = Promise::new();
        let future = promise.future();
        self.on_complete(executor, move |result| {
            let mapped = match result {
                Ok(value) => {
                    let value = value.clone();
                    catch(move || f(value))
                }
                Err(failure) => Err(failure.clone()),
            };
            promise.try_complete(mapped);
        });
        future
    }

    /// Chains a computation that itself produces a future.
    pub fn flat_map<U, F>(&self, executor: &ExecutorRef, f: F) -> Future<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> Future<U> + Send + 'static,
    {
        let promise = Promise::new();
        let future = promise.future();
        self.on_complete(executor, move |result| match result {
            Ok(value) => {
                let value = value.clone();
                match catch(move || f(value)) {
                    Ok(next) => promise.complete_with(&next),
                    Err(failure) => {
                        promise.try_failure(failure);
                    }
                }
            }
            Err(failure) => {
                promise.try_failure(failure.clone());
            }
        });
        future
    }

    /// Keeps the value only if it satisfies `predicate`, otherwise fails with
    /// [`Failure::NoSuchElement`].
    pub fn filter<P>(&self, executor: &ExecutorRef, predicate: P) -> Future<T>
    where
        P: FnOnce(&T) -> bool + Send + 'static,
    {
        self.collect(executor, move |value| {
            if predicate(&value) {
                Some(value)
            } else {
                None
            }
        })
    }

    /// Maps with a partial function; `None` fails with [`Failure::NoSuchElement`].
    pub fn collect<U, F>(&self, executor: &ExecutorRef, pf: F) -> Future<U>
    where
        U: Send + Sync + 'static,
        F: FnOnce(T) -> Option<U> + Send + 'static,
    {
        self.transform(executor, move |result| {
            result.and_then(|value| catch(move || pf(value))?.ok_or(Failure::NoSuchElement))
        })
    }

    /// Turns selected failures back into values.
    pub fn recover<F>(&self, executor: &ExecutorRef, pf: F) -> Future<T>
    where
        F: FnOnce(&Failure) -> Option<T> + Send + 'static,
    {
        self.transform(executor, move |result| match result {
            Ok(value) => Ok(value),
            Err(failure) => match catch(|| pf(&failure)) {
                Ok(Some(value)) => Ok(value),
                Ok(None) => Err(failure),
                Err(panicked) => Err(panicked),
            },
        })
    }

    /// Turns selected failures into another future.
    pub fn recover_with<F>(&self, executor: &ExecutorRef, pf: F) -> Future<T>
    where
        F: FnOnce(&Failure) -> Option<Future<T>> + Send + 'static,
    {
        let promise = Promise::new();
        let future = promise.future();
        self.on_complete(executor, move |result| match result {
            Ok(value) => {
                promise.try_success(value.clone());
            }
            Err(failure) => match catch(|| pf(failure)) {
                Ok(Some(next)) => promise.complete_with(&next),
                Ok(None) => {
                    promise.try_failure(failure.clone());
                }
                Err(panicked) => {
                    promise.try_failure(panicked);
                }
            },
        });
        future
    }

    /// Pairs this value with `other`'s. The first failure in order wins.
    pub fn zip<U>(&self, executor: &ExecutorRef, other: &Future<U>) -> Future<(T, U)>
    where
        U: Clone + Send + Sync + 'static,
    {
        let other = other.clone();
        self.flat_map(executor, move |left| {
            other.map(&calling_thread(), move |right| (left, right))
        })
    }

    /// Falls back to `that` if this future fails. When both fail, this future's
    /// failure is kept.
    pub fn fallback_to(&self, executor: &ExecutorRef, that: &Future<T>) -> Future<T> {
        let that = that.clone();
        let promise = Promise::new();
        let future = promise.future();
        self.on_complete(executor, move |result| match result {
            Ok(value) => {
                promise.try_success(value.clone());
            }
            Err(original) => {
                let original = original.clone();
                that.on_complete(&calling_thread(), move |fallback| {
                    promise.try_complete(fallback.clone().map_err(|_| original));
                });
            }
        });
        future
    }

    /// Runs a side effect, then passes the original result through unchanged.
    ///
    /// A panic in `f` is logged and does not alter the result.
    pub fn and_then<F>(&self, executor: &ExecutorRef, f: F) -> Future<T>
    where
        F: FnOnce(&Try<T>) + Send + 'static,
    {
        let promise = Promise::new();
        let future = promise.future();
        self.on_complete(executor, move |result| {
            if let Err(Failure::Panicked(msg)) = catch(|| f(result)) {
                warn!(panic = %msg, "and_then side effect panicked");
            }
            promise.try_complete(result.clone());
        });
        future
    }

    /// Maps the whole result, success or failure.
    pub fn transform<U, F>(&self, executor: &ExecutorRef, f: F) -> Future<U>
    where
        U: Send + Sync + 'static,
        F: FnOnce(Try<T>) -> Try<U> + Send + 'static,
    {
        let promise = Promise::new();
        let future = promise.future();
        self.on_complete(executor, move |result| {
            let result = result.clone();
            promise.try_complete(catch(move || f(result)).and_then(|transformed| transformed));
        });
        future
    }

    /// A future of the failure: succeeds with it if this one fails, fails with
    /// [`Failure::NoSuchElement`] if this one succeeds.
    pub fn failed_projection(&self) -> Future<Failure> {
        self.transform(&calling_thread(), |result| match result {
            Ok(_) => Err(Failure::NoSuchElement),
            Err(failure) => Ok(failure),
        })
    }

    /// Turns a list of futures into a future of the list.
    ///
    /// Values keep their input order. Fails as soon as any input fails.
    pub fn lift(futures: Vec<Future<T>>, executor: &ExecutorRef) -> Future<Vec<T>> {
        if futures.is_empty() {
            return Future::successful(Vec::new());
        }

        let promise = Promise::new();
        let future = promise.future();
        let slots: Arc<Mutex<Vec<Option<T>>>> = Arc::new(Mutex::new(vec![None; futures.len()]));
        let remaining = Arc::new(AtomicUsize::new(futures.len()));

        for (index, input) in futures.into_iter().enumerate() {
            let promise = promise.clone();
            let slots = Arc::clone(&slots);
            let remaining = Arc::clone(&remaining);
            input.on_complete(executor, move |result| match result {
                Ok(value) => {
                    slots.lock()[index] = Some(value.clone());
                    if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                        let values = slots.lock().drain(..).flatten().collect();
                        promise.try_success(values);
                    }
                }
                Err(failure) => {
                    promise.try_failure(failure.clone());
                }
            });
        }
        future
    }

    /// Folds the successful values of `futures` in input order.
    pub fn fold<R, F>(futures: Vec<Future<T>>, executor: &ExecutorRef, zero: R, op: F) -> Future<R>
    where
        R: Send + Sync + 'static,
        F: FnMut(R, T) -> R + Send + 'static,
    {
        Self::lift(futures, executor).map(executor, move |values| values.into_iter().fold(zero, op))
    }

    /// Maps every input to a future with `f`, then lifts the results.
    pub fn traverse<A, I, F>(inputs: I, executor: &ExecutorRef, f: F) -> Future<Vec<T>>
    where
        I: IntoIterator<Item = A>,
        F: FnMut(A) -> Future<T>,
    {
        Self::lift(inputs.into_iter().map(f).collect(), executor)
    }

    /// Completes with whichever input completes first, success or failure.
    ///
    /// An empty input fails with [`Failure::NoSuchElement`].
    pub fn first_completed(futures: Vec<Future<T>>, executor: &ExecutorRef) -> Future<T> {
        if futures.is_empty() {
            return Future::failed(Failure::NoSuchElement);
        }
        let promise = Promise::new();
        let future = promise.future();
        for input in futures {
            let promise = promise.clone();
            input.on_complete(executor, move |result| {
                promise.try_complete(result.clone());
            });
        }
        future
    }

    /// The first successful value (in completion order) satisfying `predicate`,
    /// or `None` once every input has completed without a match. Failed inputs
    /// are skipped.
    pub fn find<P>(futures: Vec<Future<T>>, executor: &ExecutorRef, predicate: P) -> Future<Option<T>>
    where
        P: Fn(&T) -> bool + Send + Sync + 'static,
    {
        if futures.is_empty() {
            return Future::successful(None);
        }

        let promise = Promise::new();
        let future = promise.future();
        let predicate = Arc::new(predicate);
        let remaining = Arc::new(AtomicUsize::new(futures.len()));

        for input in futures {
            let promise = promise.clone();
            let predicate = Arc::clone(&predicate);
            let remaining = Arc::clone(&remaining);
            input.on_complete(executor, move |result| {
                if let Ok(value) = result {
                    if matches!(catch(|| predicate(value)), Ok(true)) {
                        promise.try_success(Some(value.clone()));
                    }
                }
                if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    promise.try_success(None);
                }
            });
        }
        future
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_chain_on_calling_thread() {
        let exec = calling_thread();
        let promise = Promise::new();
        let result = promise
            .future()
            .map(&exec, |x: i32| x * 2)
            .map(&exec, |x| x + 1);
        promise.success(5).unwrap();
        assert_eq!(result.value().unwrap().unwrap(), 11);
    }

    #[test]
    fn test_map_panic_fails_downstream() {
        let exec = calling_thread();
        let result = Future::successful(1).map(&exec, |_: i32| -> i32 { panic!("mapper") });
        assert!(matches!(result.value().unwrap(), Err(Failure::Panicked(_))));
    }

    #[test]
    fn test_filter_rejects() {
        let exec = calling_thread();
        let result = Future::successful(3).filter(&exec, |v| *v > 10);
        assert!(matches!(result.value().unwrap(), Err(Failure::NoSuchElement)));
    }
}
