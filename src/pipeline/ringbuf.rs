//! Bounded ring of ready frames that drops the oldest entry on overrun

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::utils::CachePadded;
use ringbuf::traits::{Consumer, Observer, Producer};
use ringbuf::HeapRb;

/// Ready queue between a producer that must never block and a consumer.
/// Pushing into a full ring evicts the oldest entry and hands it back so
/// the caller can recycle it.
pub struct ReadyRing<T> {
    ring: HeapRb<T>,
    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct Stats {
    pushed: AtomicUsize,
    popped: AtomicUsize,
    evicted: AtomicUsize,
}

/// Counters of a [`ReadyRing`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RingStats {
    pub pushed: usize,
    pub popped: usize,
    pub evicted: usize,
}

impl<T> ReadyRing<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: HeapRb::new(capacity.max(1)),
            stats: CachePadded::new(Stats::default()),
        }
    }

    /// Queues `item`, returning the entry evicted to make room, if any.
    pub fn push(&mut self, item: T) -> Option<T> {
        let evicted = if self.ring.is_full() {
            self.stats.evicted.fetch_add(1, Ordering::Relaxed);
            self.ring.try_pop()
        } else {
            None
        };
        // Cannot fail: there is room now
        let _ = self.ring.try_push(item);
        self.stats.pushed.fetch_add(1, Ordering::Relaxed);
        evicted
    }

    pub fn pop(&mut self) -> Option<T> {
        let item = self.ring.try_pop()?;
        self.stats.popped.fetch_add(1, Ordering::Relaxed);
        Some(item)
    }

    /// Removes every queued entry, oldest first.
    pub fn drain(&mut self) -> Vec<T> {
        std::iter::from_fn(|| self.ring.try_pop()).collect()
    }

    pub fn len(&self) -> usize {
        self.ring.occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity().get()
    }

    pub fn stats(&self) -> RingStats {
        RingStats {
            pushed: self.stats.pushed.load(Ordering::Relaxed),
            popped: self.stats.popped.load(Ordering::Relaxed),
            evicted: self.stats.evicted.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_ring_evicts_oldest() {
        let mut r = ReadyRing::new(2);
        assert_eq!(r.push(1), None);
        assert_eq!(r.push(2), None);
        assert_eq!(r.push(3), Some(1));
        assert_eq!(r.len(), 2);
        assert_eq!(r.pop(), Some(2));
        assert_eq!(r.drain(), vec![3]);
        assert!(r.is_empty());
        assert_eq!(
            r.stats(),
            RingStats {
                pushed: 3,
                popped: 1,
                evicted: 1
            }
        );
    }

    #[test]
    fn zero_capacity_still_holds_one() {
        let mut r = ReadyRing::new(0);
        assert_eq!(r.capacity(), 1);
        assert_eq!(r.push('a'), None);
        assert_eq!(r.push('b'), Some('a'));
    }
}
