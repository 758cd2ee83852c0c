//! # Promise / Future
//!
//! A [`Promise`] is the write side of a single-assignment cell; a [`Future`] is the
//! read side. The cell is completed at most once: the first `try_complete` to land
//! wins and every later attempt is refused without touching the stored value.
//!
//! ## Completion protocol
//! 1. The result is published through a `OnceLock`, which is the single atomic
//!    transition from empty to filled.
//! 2. The winner then swaps the pending registry (callbacks and parked threads)
//!    for `Done` under a narrow lock and fans out: every parked thread is
//!    unparked, every callback is dispatched as a task on its own executor.
//! 3. A registration that finds `Done` (or an already published result) fires
//!    immediately instead of being stored.
//!
//! Callbacks hold their handler in a take-once slot, so a callback can never run
//! twice even if it were dispatched twice.

use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll, Waker};
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::warn;

use crate::errors::{AlreadyCompleted, Failure, TimeoutError};
use crate::executor::{calling_thread, ExecutorRef, Task};
use crate::list::ImmutableList;
use crate::result::{catch, Try};

type Handler<T> = Box<dyn FnOnce(&Try<T>) + Send + 'static>;

struct Callback<T> {
    executor: ExecutorRef,
    handler: Mutex<Option<Handler<T>>>,
}

impl<T> Callback<T> {
    fn run(&self, result: &Try<T>) {
        let handler = self.handler.lock().take();
        if let Some(handler) = handler {
            handler(result);
        }
    }
}

enum Waiting<T> {
    Pending {
        callbacks: ImmutableList<Arc<Callback<T>>>,
        waiters: ImmutableList<Thread>,
    },
    Done,
}

struct Core<T> {
    result: OnceLock<Try<T>>,
    waiting: Mutex<Waiting<T>>,
}

impl<T: Send + Sync + 'static> Core<T> {
    fn new() -> Self {
        Self {
            result: OnceLock::new(),
            waiting: Mutex::new(Waiting::Pending {
                callbacks: ImmutableList::empty(),
                waiters: ImmutableList::empty(),
            }),
        }
    }

    fn completed(result: Try<T>) -> Self {
        let core = Self {
            result: OnceLock::new(),
            waiting: Mutex::new(Waiting::Done),
        };
        let _ = core.result.set(result);
        core
    }

    fn try_complete(self: &Arc<Self>, result: Try<T>) -> bool {
        if self.result.set(result).is_err() {
            return false;
        }

        let previous = std::mem::replace(&mut *self.waiting.lock(), Waiting::Done);
        if let Waiting::Pending { callbacks, waiters } = previous {
            for waiter in waiters.iter() {
                waiter.unpark();
            }
            // registration order
            for callback in callbacks.reverse().iter() {
                Self::dispatch(self, Arc::clone(callback));
            }
        }
        true
    }

    fn register(self: &Arc<Self>, callback: Arc<Callback<T>>) {
        if self.result.get().is_none() {
            let mut waiting = self.waiting.lock();
            if let Waiting::Pending { callbacks, .. } = &mut *waiting {
                *callbacks = callbacks.cons(callback);
                return;
            }
        }
        Self::dispatch(self, callback);
    }

    fn dispatch(core: &Arc<Self>, callback: Arc<Callback<T>>) {
        let executor = Arc::clone(&callback.executor);
        let core = Arc::clone(core);
        let task: Task = Box::new(move || {
            if let Some(result) = core.result.get() {
                callback.run(result);
            }
        });

        if let Err(rejected) = executor.execute(task) {
            warn!(error = %rejected.error, "callback executor rejected task, running on completing thread");
            (rejected.task)();
        }
    }

    /// Parks the calling thread until completion or `deadline`.
    fn block(&self, deadline: Option<Instant>) -> Option<&Try<T>> {
        let me = thread::current();
        loop {
            if let Some(result) = self.result.get() {
                return Some(result);
            }

            {
                let mut waiting = self.waiting.lock();
                match &mut *waiting {
                    Waiting::Pending { waiters, .. } => {
                        if !waiters.iter().any(|t| t.id() == me.id()) {
                            *waiters = waiters.cons(me.clone());
                        }
                    }
                    Waiting::Done => continue,
                }
            }

            match deadline {
                None => thread::park(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        self.forget_waiter(&me);
                        return self.result.get();
                    }
                    thread::park_timeout(deadline - now);
                }
            }
        }
    }

    fn forget_waiter(&self, me: &Thread) {
        let mut waiting = self.waiting.lock();
        if let Waiting::Pending { waiters, .. } = &mut *waiting {
            *waiters = waiters.filter(|t| t.id() != me.id());
        }
    }
}

/// Write side of a single-assignment result cell.
pub struct Promise<T> {
    core: Arc<Core<T>>,
}

/// Read side of a single-assignment result cell.
pub struct Future<T> {
    core: Arc<Core<T>>,
    waker: Arc<Mutex<WakerSlot>>,
}

/// Waker of the task currently awaiting one `Future` handle. At most one
/// completion callback is registered per handle; later polls only swap the waker.
#[derive(Default)]
struct WakerSlot {
    waker: Option<Waker>,
    registered: bool,
}

impl<T: Send + Sync + 'static> Promise<T> {
    pub fn new() -> Self {
        Self {
            core: Arc::new(Core::new()),
        }
    }

    /// The future observing this promise. Can be called any number of times.
    pub fn future(&self) -> Future<T> {
        Future::with_core(Arc::clone(&self.core))
    }

    /// Completes with `result` unless already completed. Returns whether this call won.
    pub fn try_complete(&self, result: Try<T>) -> bool {
        self.core.try_complete(result)
    }

    /// Completes with `result`.
    ///
    /// # Errors
    /// [`AlreadyCompleted`] if the promise already holds a result; the stored
    /// value is left untouched.
    pub fn complete(&self, result: Try<T>) -> Result<(), AlreadyCompleted> {
        if self.try_complete(result) {
            Ok(())
        } else {
            Err(AlreadyCompleted)
        }
    }

    pub fn success(&self, value: T) -> Result<(), AlreadyCompleted> {
        self.complete(Ok(value))
    }

    pub fn failure(&self, failure: Failure) -> Result<(), AlreadyCompleted> {
        self.complete(Err(failure))
    }

    pub fn try_success(&self, value: T) -> bool {
        self.try_complete(Ok(value))
    }

    pub fn try_failure(&self, failure: Failure) -> bool {
        self.try_complete(Err(failure))
    }

    pub fn is_completed(&self) -> bool {
        self.core.result.get().is_some()
    }
}

impl<T: Clone + Send + Sync + 'static> Promise<T> {
    /// Completes this promise with whatever `other` completes with.
    pub fn complete_with(&self, other: &Future<T>) {
        let promise = self.clone();
        other.on_complete(&calling_thread(), move |result| {
            promise.try_complete(result.clone());
        });
    }
}

impl<T: Send + Sync + 'static> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        Self::with_core(Arc::clone(&self.core))
    }
}

impl<T> Future<T> {
    fn with_core(core: Arc<Core<T>>) -> Self {
        Self {
            core,
            waker: Arc::default(),
        }
    }
}

impl<T: Send + Sync + 'static> Future<T> {
    /// A future already completed with `result`.
    pub fn from_try(result: Try<T>) -> Self {
        Self::with_core(Arc::new(Core::completed(result)))
    }

    pub fn successful(value: T) -> Self {
        Self::from_try(Ok(value))
    }

    pub fn failed(failure: Failure) -> Self {
        Self::from_try(Err(failure))
    }

    /// Runs `f` on `executor` and returns its eventual result.
    ///
    /// A panic in `f` becomes [`Failure::Panicked`]; a refusal by the executor
    /// becomes [`Failure::Rejected`].
    pub fn spawn<F>(executor: &ExecutorRef, f: F) -> Self
    where
        F: FnOnce() -> T + Send + 'static,
    {
        let promise = Promise::new();
        let future = promise.future();
        let task: Task = Box::new(move || {
            promise.try_complete(catch(f));
        });
        if let Err(rejected) = executor.execute(task) {
            return Self::failed(Failure::Rejected(rejected.error));
        }
        future
    }

    /// Registers `handler` to run on `executor` once this future completes.
    ///
    /// If it is already complete the handler is dispatched right away.
    pub fn on_complete<F>(&self, executor: &ExecutorRef, handler: F)
    where
        F: FnOnce(&Try<T>) + Send + 'static,
    {
        let callback = Arc::new(Callback {
            executor: Arc::clone(executor),
            handler: Mutex::new(Some(Box::new(handler))),
        });
        self.core.register(callback);
    }

    pub fn on_success<F>(&self, executor: &ExecutorRef, handler: F)
    where
        F: FnOnce(&T) + Send + 'static,
    {
        self.on_complete(executor, move |result| {
            if let Ok(value) = result {
                handler(value);
            }
        });
    }

    pub fn on_failure<F>(&self, executor: &ExecutorRef, handler: F)
    where
        F: FnOnce(&Failure) + Send + 'static,
    {
        self.on_complete(executor, move |result| {
            if let Err(failure) = result {
                handler(failure);
            }
        });
    }

    pub fn is_completed(&self) -> bool {
        self.core.result.get().is_some()
    }
}

impl<T: Clone + Send + Sync + 'static> Future<T> {
    /// The result if already completed.
    pub fn value(&self) -> Option<Try<T>> {
        self.core.result.get().cloned()
    }

    /// Blocks until completion.
    pub fn wait(&self) -> Try<T> {
        match self.core.block(None) {
            Some(result) => result.clone(),
            None => Err(Failure::TimedOut),
        }
    }

    /// Blocks for at most `timeout`.
    ///
    /// # Errors
    /// [`TimeoutError`] when the deadline passes first.
    pub fn await_result(&self, timeout: Duration) -> Result<Try<T>, TimeoutError> {
        let deadline = Instant::now() + timeout;
        self.core.block(Some(deadline)).cloned().ok_or(TimeoutError)
    }

    /// Like [`await_result`](Self::await_result) with the timeout folded into
    /// [`Failure::TimedOut`].
    pub fn get(&self, timeout: Duration) -> Try<T> {
        self.await_result(timeout)?
    }
}

impl<T: Clone + Send + Sync + 'static> std::future::Future for Future<T> {
    type Output = Try<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(result) = self.core.result.get() {
            return Poll::Ready(result.clone());
        }

        let first_poll = {
            let mut slot = self.waker.lock();
            match &slot.waker {
                Some(waker) if waker.will_wake(cx.waker()) => {}
                _ => slot.waker = Some(cx.waker().clone()),
            }
            !std::mem::replace(&mut slot.registered, true)
        };
        if first_poll {
            let slot = Arc::clone(&self.waker);
            self.on_complete(&calling_thread(), move |_| {
                let waker = slot.lock().waker.take();
                if let Some(waker) = waker {
                    waker.wake();
                }
            });
        }

        // completion may have raced with the waker swap
        match self.core.result.get() {
            Some(result) => Poll::Ready(result.clone()),
            None => Poll::Pending,
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("result", &self.core.result.get())
            .finish()
    }
}

impl<T: fmt::Debug> fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Future")
            .field("result", &self.core.result.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_complete_twice_is_illegal_state() {
        let promise = Promise::new();
        assert!(promise.success(1).is_ok());
        assert_eq!(promise.success(2), Err(AlreadyCompleted));
        assert!(!promise.try_success(3));
        assert_eq!(promise.future().value().unwrap().unwrap(), 1);
    }

    #[test]
    fn test_callback_after_completion_fires_immediately() {
        let promise = Promise::new();
        promise.success(7).unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let s = seen.clone();
        promise.future().on_success(&calling_thread(), move |v| {
            s.store(*v, Ordering::SeqCst);
        });
        assert_eq!(seen.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn test_callbacks_fire_in_registration_order() {
        let promise = Promise::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..4 {
            let order = order.clone();
            promise.future().on_complete(&calling_thread(), move |_| order.lock().push(i));
        }
        promise.success(()).unwrap();
        assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_await_result_times_out() {
        let promise: Promise<u32> = Promise::new();
        let result = promise.future().await_result(Duration::from_millis(20));
        assert_eq!(result.unwrap_err(), TimeoutError);
        assert!(matches!(promise.future().get(Duration::from_millis(1)), Err(Failure::TimedOut)));
    }

    #[test]
    fn test_wait_unblocks_on_completion() {
        let promise = Promise::new();
        let future = promise.future();
        let waiter = thread::spawn(move || future.wait());
        thread::sleep(Duration::from_millis(20));
        promise.success("done").unwrap();
        assert_eq!(waiter.join().unwrap().unwrap(), "done");
    }
}
