//! Scheduler counters and their point-in-time snapshots.
//!
//! Workers bump their own counters with relaxed increments; a snapshot reads
//! them with relaxed loads, so totals taken while the pool is busy are
//! approximate.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use serde::Serialize;

use super::thread_pool::PoolState;

/// What a worker is currently doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WorkerState {
    /// Executing a task
    Running = 0,
    /// Looking for work in local, shared and peer queues
    Searching = 1,
    /// Parked in the idle set
    Parked = 2,
    /// Left its loop for good
    Terminated = 3,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => WorkerState::Running,
            1 => WorkerState::Searching,
            2 => WorkerState::Parked,
            _ => WorkerState::Terminated,
        }
    }
}

/// Live counters of one worker.
#[derive(Debug)]
pub(crate) struct WorkerCounters {
    state: AtomicU8,
    pub executed: AtomicU64,
    pub lifo_pops: AtomicU64,
    pub fifo_pops: AtomicU64,
    pub shared_pops: AtomicU64,
    pub steals: AtomicU64,
    pub prefetched: AtomicU64,
    pub parks: AtomicU64,
    pub false_wakeups: AtomicU64,
    pub panics: AtomicU64,
}

impl WorkerCounters {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(WorkerState::Searching as u8),
            executed: AtomicU64::new(0),
            lifo_pops: AtomicU64::new(0),
            fifo_pops: AtomicU64::new(0),
            shared_pops: AtomicU64::new(0),
            steals: AtomicU64::new(0),
            prefetched: AtomicU64::new(0),
            parks: AtomicU64::new(0),
            false_wakeups: AtomicU64::new(0),
            panics: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(counter: &AtomicU64, n: usize) {
        if n > 0 {
            counter.fetch_add(n as u64, Ordering::Relaxed);
        }
    }

    pub fn set_state(&self, state: WorkerState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Relaxed))
    }

    pub fn snapshot(&self, index: usize, local_queue_size: usize) -> WorkerStatistics {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        WorkerStatistics {
            index,
            state: self.state(),
            executed: load(&self.executed),
            lifo_pops: load(&self.lifo_pops),
            fifo_pops: load(&self.fifo_pops),
            shared_pops: load(&self.shared_pops),
            steals: load(&self.steals),
            prefetched: load(&self.prefetched),
            parks: load(&self.parks),
            false_wakeups: load(&self.false_wakeups),
            panics: load(&self.panics),
            local_queue_size,
        }
    }
}

/// Snapshot of one worker's counters.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatistics {
    pub index: usize,
    pub state: WorkerState,
    /// Tasks run to completion or to a caught panic
    pub executed: u64,
    pub lifo_pops: u64,
    pub fifo_pops: u64,
    pub shared_pops: u64,
    pub steals: u64,
    /// Tasks moved into the local deque alongside a steal or shared pop
    pub prefetched: u64,
    pub parks: u64,
    /// Wake-ups that found no work
    pub false_wakeups: u64,
    pub panics: u64,
    pub local_queue_size: usize,
}

/// Snapshot of a whole pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatistics {
    pub pool_id: String,
    pub state: PoolState,
    pub workers: Vec<WorkerStatistics>,
    pub shared_queue_sizes: Vec<usize>,
    pub idle_workers: usize,
}

impl PoolStatistics {
    pub fn total_executed(&self) -> u64 {
        self.workers.iter().map(|w| w.executed).sum()
    }

    pub fn total_steals(&self) -> u64 {
        self.workers.iter().map(|w| w.steals).sum()
    }

    pub fn total_panics(&self) -> u64 {
        self.workers.iter().map(|w| w.panics).sum()
    }

    /// Tasks currently queued anywhere in the pool.
    pub fn queued(&self) -> usize {
        let local: usize = self.workers.iter().map(|w| w.local_queue_size).sum();
        local + self.shared_queue_sizes.iter().sum::<usize>()
    }
}

impl fmt::Display for PoolStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "pool {} [{:?}]: {} workers ({} idle), {} executed, {} queued, shared queues {:?}",
            self.pool_id,
            self.state,
            self.workers.len(),
            self.idle_workers,
            self.total_executed(),
            self.queued(),
            self.shared_queue_sizes
        )?;
        for w in &self.workers {
            writeln!(
                f,
                "  worker {:>2} {:<10} executed={} lifo={} fifo={} shared={} steals={} prefetched={} parks={} false_wakeups={} panics={} local={}",
                w.index,
                format!("{:?}", w.state),
                w.executed,
                w.lifo_pops,
                w.fifo_pops,
                w.shared_pops,
                w.steals,
                w.prefetched,
                w.parks,
                w.false_wakeups,
                w.panics,
                w.local_queue_size
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let counters = WorkerCounters::new();
        WorkerCounters::bump(&counters.executed);
        WorkerCounters::bump(&counters.executed);
        WorkerCounters::add(&counters.prefetched, 3);
        counters.set_state(WorkerState::Parked);

        let snapshot = counters.snapshot(4, 7);
        assert_eq!(snapshot.index, 4);
        assert_eq!(snapshot.executed, 2);
        assert_eq!(snapshot.prefetched, 3);
        assert_eq!(snapshot.state, WorkerState::Parked);
        assert_eq!(snapshot.local_queue_size, 7);
    }

    #[test]
    fn test_display_lists_workers() {
        let stats = PoolStatistics {
            pool_id: "p".to_string(),
            state: PoolState::Running,
            workers: vec![WorkerCounters::new().snapshot(0, 0), WorkerCounters::new().snapshot(1, 2)],
            shared_queue_sizes: vec![5],
            idle_workers: 1,
        };
        let text = stats.to_string();
        assert!(text.contains("2 workers (1 idle)"));
        assert!(text.contains("7 queued"));
        assert_eq!(text.lines().count(), 3);
    }
}
