//! # Worker-Local Deque
//!
//! A bounded Chase-Lev deque. The owning worker pushes and pops at `top`;
//! any thread may take from `base` through a [`Stealer`].
//!
//! ## Implementation Details
//! - `base` and `top` are monotonically increasing cursors; a slot index is the
//!   cursor masked by `capacity - 1`. Since `base` never repeats a value, a CAS on
//!   it cannot succeed against a recycled slot.
//! - Consumers claim the task at `base` by reading the slot and then advancing
//!   `base` with a CAS; only the winner turns the pointer back into a `Box`.
//! - The owner races stealers with a CAS only when taking the last element.
//! - Consumed slots are not cleared. Only `[base, top)` is ever dereferenced.

use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{self, AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;

use bramble_api::{ExecuteError, Rejected, Task};
use crossbeam_utils::CachePadded;

struct Inner {
    /// Next index to take in FIFO order
    base: CachePadded<AtomicUsize>,
    /// Next index to push; written by the owner only
    top: CachePadded<AtomicUsize>,
    slots: Box<[AtomicPtr<Task>]>,
    mask: usize,
}

impl Inner {
    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn len(&self) -> usize {
        let top = self.top.load(Ordering::Acquire);
        let base = self.base.load(Ordering::Acquire);
        let len = top.wrapping_sub(base) as isize;
        len.clamp(0, self.capacity() as isize) as usize
    }

    /// Takes the task at `base`. Safe to call from any thread.
    fn pop_fifo(&self) -> Option<Task> {
        loop {
            let base = self.base.load(Ordering::Acquire);
            atomic::fence(Ordering::SeqCst);
            let top = self.top.load(Ordering::Acquire);

            if top.wrapping_sub(base) as isize <= 0 {
                return None;
            }

            let task = self.slots[base & self.mask].load(Ordering::Acquire);
            if self
                .base
                .compare_exchange(base, base.wrapping_add(1), Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                // SAFETY: winning the CAS on `base` transfers ownership of the
                // pointer published at index `base`.
                return Some(unsafe { *Box::from_raw(task) });
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let top = *self.top.get_mut();
        let mut base = *self.base.get_mut();
        while top.wrapping_sub(base) as isize > 0 {
            let task = *self.slots[base & self.mask].get_mut();
            // SAFETY: every index in `[base, top)` holds a live pointer nobody claimed.
            drop(unsafe { Box::from_raw(task) });
            base = base.wrapping_add(1);
        }
    }
}

/// The owner's handle. `Send` but not `Sync`: exactly one thread may push.
pub struct LocalQueue {
    inner: Arc<Inner>,
    _owner: PhantomData<Cell<()>>,
}

/// A cloneable handle that takes tasks from the FIFO end of a [`LocalQueue`].
#[derive(Clone)]
pub struct Stealer {
    inner: Arc<Inner>,
}

impl LocalQueue {
    /// Creates a deque holding up to `capacity` tasks.
    ///
    /// `capacity` must be a power of two; the pool validates this up front.
    pub fn new(capacity: usize) -> Self {
        debug_assert!(capacity.is_power_of_two());
        let slots = (0..capacity)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            inner: Arc::new(Inner {
                base: CachePadded::new(AtomicUsize::new(0)),
                top: CachePadded::new(AtomicUsize::new(0)),
                slots,
                mask: capacity - 1,
            }),
            _owner: PhantomData,
        }
    }

    pub fn stealer(&self) -> Stealer {
        Stealer {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Appends at `top`.
    ///
    /// Returns whether the deque looked empty before the push, so the caller can
    /// wake an idle worker when the first item lands.
    ///
    /// # Errors
    /// Hands the task back with [`ExecuteError::QueueFull`] when the deque is full.
    pub fn push(&self, task: Task) -> Result<bool, Rejected> {
        let inner = &*self.inner;
        let top = inner.top.load(Ordering::Relaxed);
        let base = inner.base.load(Ordering::Acquire);
        let len = top.wrapping_sub(base);

        if len >= inner.capacity() {
            return Err(Rejected::new(
                task,
                ExecuteError::QueueFull {
                    capacity: inner.capacity(),
                },
            ));
        }

        let task = Box::into_raw(Box::new(task));
        inner.slots[top & inner.mask].store(task, Ordering::Relaxed);
        inner.top.store(top.wrapping_add(1), Ordering::Release);
        Ok(len as isize <= 0)
    }

    /// Takes the most recently pushed task.
    pub fn pop_lifo(&self) -> Option<Task> {
        let inner = &*self.inner;
        let top = inner.top.load(Ordering::Relaxed);
        if top.wrapping_sub(inner.base.load(Ordering::Relaxed)) as isize <= 0 {
            return None;
        }

        let top = top.wrapping_sub(1);
        inner.top.store(top, Ordering::Relaxed);
        atomic::fence(Ordering::SeqCst);
        let base = inner.base.load(Ordering::Relaxed);

        let remaining = top.wrapping_sub(base) as isize;
        if remaining < 0 {
            inner.top.store(top.wrapping_add(1), Ordering::Relaxed);
            return None;
        }

        let task = inner.slots[top & inner.mask].load(Ordering::Relaxed);
        if remaining > 0 {
            // SAFETY: stealers cannot reach index `top` while it is not the last element.
            return Some(unsafe { *Box::from_raw(task) });
        }

        // Last element: race the stealers for it.
        let won = inner
            .base
            .compare_exchange(base, base.wrapping_add(1), Ordering::SeqCst, Ordering::Relaxed)
            .is_ok();
        inner.top.store(top.wrapping_add(1), Ordering::Relaxed);
        if won {
            // SAFETY: the CAS on `base` gave us exclusive ownership of the slot.
            Some(unsafe { *Box::from_raw(task) })
        } else {
            None
        }
    }

    /// Takes the oldest task, competing with stealers.
    pub fn pop_fifo(&self) -> Option<Task> {
        self.inner.pop_fifo()
    }

    /// Appends up to `limit` tasks produced by `next`, never more than the
    /// free capacity, and publishes them with one store to `top`.
    ///
    /// Returns how many tasks were moved.
    pub fn fill_from(&self, limit: usize, mut next: impl FnMut() -> Option<Task>) -> usize {
        let inner = &*self.inner;
        let top = inner.top.load(Ordering::Relaxed);
        let base = inner.base.load(Ordering::Acquire);
        let budget = limit.min(inner.capacity().saturating_sub(top.wrapping_sub(base)));

        let mut moved = 0;
        while moved < budget {
            let Some(task) = next() else { break };
            let task = Box::into_raw(Box::new(task));
            inner.slots[top.wrapping_add(moved) & inner.mask].store(task, Ordering::Relaxed);
            moved += 1;
        }
        if moved > 0 {
            inner.top.store(top.wrapping_add(moved), Ordering::Release);
        }
        moved
    }

    pub fn approximate_size(&self) -> usize {
        self.inner.len()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }
}

impl Stealer {
    /// Takes the oldest task.
    pub fn pop_fifo(&self) -> Option<Task> {
        self.inner.pop_fifo()
    }

    /// Takes the oldest task of this deque and moves up to `prefetch` more into
    /// `dest`, returning the task with the number of tasks moved.
    pub fn steal_into(&self, dest: &LocalQueue, prefetch: usize) -> Option<(Task, usize)> {
        if Arc::ptr_eq(&self.inner, &dest.inner) {
            return dest.pop_fifo().map(|task| (task, 0));
        }
        let task = self.pop_fifo()?;
        let moved = dest.fill_from(prefetch, || self.pop_fifo());
        Some((task, moved))
    }

    /// Drains every task, returning how many were discarded.
    pub fn clear(&self) -> usize {
        let mut discarded = 0;
        while let Some(task) = self.pop_fifo() {
            drop(task);
            discarded += 1;
        }
        discarded
    }

    pub fn approximate_size(&self) -> usize {
        self.inner.len()
    }
}

impl fmt::Debug for LocalQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalQueue")
            .field("size", &self.approximate_size())
            .field("capacity", &self.capacity())
            .finish()
    }
}

impl fmt::Debug for Stealer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stealer")
            .field("size", &self.approximate_size())
            .finish()
    }
}
