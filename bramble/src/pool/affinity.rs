//! Shared-queue selection for submissions from outside the pool.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::ThreadId;

use parking_lot::Mutex;

/// Chooses which shared queue a producer thread submits to.
pub trait AffinityStrategy: Send + Sync + fmt::Debug {
    /// Returns an index in `0..shared_queues`.
    fn select(&self, producer: ThreadId, shared_queues: usize) -> usize;
}

/// Spreads producers round-robin and keeps each one on its first queue.
///
/// Assignments are remembered for at most `max_cached_producers` threads; the
/// least recently seen producer is forgotten first.
pub struct RoundRobinAffinity {
    next: AtomicUsize,
    cache: Mutex<ProducerCache>,
}

struct ProducerCache {
    entries: HashMap<ThreadId, CachedQueue>,
    capacity: usize,
    clock: u64,
}

#[derive(Clone, Copy)]
struct CachedQueue {
    queue: usize,
    last_used: u64,
}

impl ProducerCache {
    fn get(&mut self, producer: ThreadId) -> Option<usize> {
        self.clock += 1;
        let clock = self.clock;
        self.entries.get_mut(&producer).map(|entry| {
            entry.last_used = clock;
            entry.queue
        })
    }

    fn insert(&mut self, producer: ThreadId, queue: usize) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.len() >= self.capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(id, _)| *id);
            if let Some(oldest) = oldest {
                self.entries.remove(&oldest);
            }
        }
        self.entries.insert(
            producer,
            CachedQueue {
                queue,
                last_used: self.clock,
            },
        );
    }
}

impl RoundRobinAffinity {
    pub fn new(max_cached_producers: usize) -> Self {
        Self {
            next: AtomicUsize::new(0),
            cache: Mutex::new(ProducerCache {
                entries: HashMap::new(),
                capacity: max_cached_producers,
                clock: 0,
            }),
        }
    }

    pub fn cached_producers(&self) -> usize {
        self.cache.lock().entries.len()
    }
}

impl AffinityStrategy for RoundRobinAffinity {
    fn select(&self, producer: ThreadId, shared_queues: usize) -> usize {
        if shared_queues <= 1 {
            return 0;
        }
        let mut cache = self.cache.lock();
        if let Some(queue) = cache.get(producer) {
            // the queue count is fixed per pool, but a strategy may be shared
            return queue % shared_queues;
        }
        let queue = self.next.fetch_add(1, Ordering::Relaxed) % shared_queues;
        cache.insert(producer, queue);
        queue
    }
}

impl fmt::Debug for RoundRobinAffinity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cache = self.cache.lock();
        f.debug_struct("RoundRobinAffinity")
            .field("cached_producers", &cache.entries.len())
            .field("max_cached_producers", &cache.capacity)
            .finish()
    }
}

/// Hashes the producer's thread id; no state.
#[derive(Debug, Clone, Copy, Default)]
pub struct HashAffinity;

impl AffinityStrategy for HashAffinity {
    fn select(&self, producer: ThreadId, shared_queues: usize) -> usize {
        if shared_queues <= 1 {
            return 0;
        }
        let mut hasher = DefaultHasher::new();
        producer.hash(&mut hasher);
        (hasher.finish() % shared_queues as u64) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn spawn_ids(n: usize) -> Vec<ThreadId> {
        (0..n)
            .map(|_| thread::spawn(|| thread::current().id()).join().unwrap())
            .collect()
    }

    #[test]
    fn test_round_robin_is_sticky() {
        let affinity = RoundRobinAffinity::new(16);
        let ids = spawn_ids(4);
        let first: Vec<usize> = ids.iter().map(|id| affinity.select(*id, 4)).collect();
        assert_eq!(first, vec![0, 1, 2, 3]);
        let again: Vec<usize> = ids.iter().map(|id| affinity.select(*id, 4)).collect();
        assert_eq!(first, again);
    }

    #[test]
    fn test_round_robin_cache_is_bounded() {
        let affinity = RoundRobinAffinity::new(2);
        let ids = spawn_ids(3);
        affinity.select(ids[0], 3);
        affinity.select(ids[1], 3);
        affinity.select(ids[0], 3);
        affinity.select(ids[2], 3);
        assert_eq!(affinity.cached_producers(), 2);
        // ids[1] was least recently used and got evicted
        assert_eq!(affinity.select(ids[0], 3), 0);
    }

    #[test]
    fn test_hash_is_deterministic() {
        let id = thread::current().id();
        let picked = HashAffinity.select(id, 7);
        assert!(picked < 7);
        assert_eq!(HashAffinity.select(id, 7), picked);
        assert_eq!(HashAffinity.select(id, 1), 0);
    }
}
