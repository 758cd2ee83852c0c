//! Idle worker bitmap.
//!
//! Bit `i` is set while worker `i` is parked or about to park. Submitters claim
//! an idle worker by clearing its bit with a CAS; whoever clears a bit owns the
//! right to hand that worker a task. Bit 63 marks a wake-up scan in progress so
//! that concurrent producers do not all unpark the same sleeper.
//!
//! Every park stamps the worker with a value from a shared clock. Claims and
//! wake-up scans pick the idle worker with the newest stamp, so the most
//! recently parked thread (with the warmest cache) is reused first.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

const SCANNING: u64 = 1 << 63;

pub(crate) struct IdleSet {
    bits: CachePadded<AtomicU64>,
    clock: AtomicU64,
    parked_at: Box<[AtomicU64]>,
}

impl IdleSet {
    pub fn new(workers: usize) -> Self {
        Self {
            bits: CachePadded::new(AtomicU64::new(0)),
            clock: AtomicU64::new(0),
            parked_at: (0..workers).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    /// The idle worker in `idle` that parked last.
    fn most_recent(&self, idle: u64) -> usize {
        let mut rest = idle;
        let mut best = rest.trailing_zeros() as usize;
        let mut best_stamp = 0;
        while rest != 0 {
            let index = rest.trailing_zeros() as usize;
            rest &= rest - 1;
            let stamp = self.parked_at[index].load(Ordering::Acquire);
            if stamp >= best_stamp {
                best = index;
                best_stamp = stamp;
            }
        }
        best
    }

    fn bit(index: usize) -> u64 {
        debug_assert!(index < 63);
        1 << index
    }

    pub fn mark_idle(&self, index: usize) {
        let stamp = self.clock.fetch_add(1, Ordering::Relaxed) + 1;
        self.parked_at[index].store(stamp, Ordering::Release);
        self.bits.fetch_or(Self::bit(index), Ordering::SeqCst);
    }

    /// Clears the caller's own bit.
    ///
    /// Returns `false` when someone else cleared it first, meaning a hand-off
    /// to this worker is in flight.
    pub fn unmark(&self, index: usize) -> bool {
        let bit = Self::bit(index);
        self.bits.fetch_and(!bit, Ordering::SeqCst) & bit != 0
    }

    /// Claims the most recently parked idle worker.
    pub fn claim(&self) -> Option<usize> {
        let mut current = self.bits.load(Ordering::SeqCst);
        loop {
            let idle = current & !SCANNING;
            if idle == 0 {
                return None;
            }
            let index = self.most_recent(idle);
            match self.bits.compare_exchange_weak(
                current,
                current & !Self::bit(index),
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Some(index),
                Err(actual) => current = actual,
            }
        }
    }

    /// Starts a wake-up scan and returns the worker to unpark, if any.
    ///
    /// Returns `None` without scanning when nobody is idle or another scan is
    /// already running. A `Some` must be followed by [`end_scan`](Self::end_scan).
    pub fn begin_scan(&self) -> Option<usize> {
        let current = self.bits.load(Ordering::SeqCst);
        if current & !SCANNING == 0 || current & SCANNING != 0 {
            return None;
        }
        let previous = self.bits.fetch_or(SCANNING, Ordering::SeqCst);
        if previous & SCANNING != 0 {
            return None;
        }
        let idle = previous & !SCANNING;
        if idle == 0 {
            self.end_scan();
            return None;
        }
        Some(self.most_recent(idle))
    }

    pub fn end_scan(&self) {
        self.bits.fetch_and(!SCANNING, Ordering::SeqCst);
    }

    pub fn idle_count(&self) -> usize {
        (self.bits.load(Ordering::Relaxed) & !SCANNING).count_ones() as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_claim_prefers_most_recently_parked() {
        let idle = IdleSet::new(8);
        idle.mark_idle(2);
        idle.mark_idle(5);
        idle.mark_idle(3);
        assert_eq!(idle.idle_count(), 3);
        assert_eq!(idle.claim(), Some(3));
        assert_eq!(idle.claim(), Some(5));
        assert_eq!(idle.idle_count(), 1);
        assert!(!idle.unmark(5), "claimed worker must see its bit already gone");
        assert!(idle.unmark(2));
        assert_eq!(idle.claim(), None);
    }

    #[test]
    fn test_reparking_moves_worker_to_front() {
        let idle = IdleSet::new(4);
        idle.mark_idle(1);
        idle.mark_idle(0);
        assert!(idle.unmark(1));
        idle.mark_idle(1);
        assert_eq!(idle.begin_scan(), Some(1));
        idle.end_scan();
        assert_eq!(idle.claim(), Some(1));
        assert_eq!(idle.claim(), Some(0));
    }

    #[test]
    fn test_scan_is_exclusive() {
        let idle = IdleSet::new(63);
        assert_eq!(idle.begin_scan(), None);
        idle.mark_idle(62);
        assert_eq!(idle.begin_scan(), Some(62));
        assert_eq!(idle.begin_scan(), None);
        assert_eq!(idle.claim(), Some(62), "scanning bit is never claimable");
        idle.end_scan();
        assert_eq!(idle.idle_count(), 0);
    }

    #[test]
    fn test_each_idle_worker_claimed_once() {
        let idle = Arc::new(IdleSet::new(63));
        for i in 0..63 {
            idle.mark_idle(i);
        }
        let claimers: Vec<_> = (0..8)
            .map(|_| {
                let idle = Arc::clone(&idle);
                thread::spawn(move || std::iter::from_fn(|| idle.claim()).collect::<Vec<_>>())
            })
            .collect();
        let mut claimed: Vec<usize> = claimers.into_iter().flat_map(|h| h.join().unwrap()).collect();
        claimed.sort_unstable();
        assert_eq!(claimed, (0..63).collect::<Vec<_>>());
    }
}
