//! Bounded candidate heaps filled by the allocator scan and by copy-GC.
//!
//! Both keep the `capacity` best candidates seen: pushing into a full heap
//! evicts the worst entry if the new one is better. Which key makes a
//! candidate "better" is the caller's policy; the heap only orders by it.

use bfs_types::BucketIdx;
use std::collections::BinaryHeap;

/// One scored bucket. Lower `key` is better.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct HeapCandidate {
    pub key: u64,
    pub bucket: BucketIdx,
}

#[derive(Debug, Clone, Default)]
pub struct BoundedHeap {
    // Max-heap on key so the worst candidate is at the top for eviction.
    entries: BinaryHeap<HeapCandidate>,
    capacity: usize,
}

impl BoundedHeap {
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: BinaryHeap::with_capacity(capacity),
            capacity,
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Offer a candidate; returns the entry that did not make the cut, if any.
    pub fn push(&mut self, candidate: HeapCandidate) -> Option<HeapCandidate> {
        if self.capacity == 0 {
            return Some(candidate);
        }
        if self.entries.len() < self.capacity {
            self.entries.push(candidate);
            return None;
        }
        match self.entries.peek() {
            Some(worst) if candidate < *worst => {
                let evicted = self.entries.pop();
                self.entries.push(candidate);
                evicted
            }
            _ => Some(candidate),
        }
    }

    /// Remove and return candidates best first.
    pub fn drain_best(&mut self) -> Vec<HeapCandidate> {
        let mut out: Vec<_> = self.entries.drain().collect();
        out.sort_unstable();
        out
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(key: u64, bucket: u64) -> HeapCandidate {
        HeapCandidate {
            key,
            bucket: BucketIdx(bucket),
        }
    }

    #[test]
    fn keeps_best_when_full() {
        let mut h = BoundedHeap::with_capacity(2);
        assert_eq!(h.push(cand(50, 1)), None);
        assert_eq!(h.push(cand(10, 2)), None);
        assert_eq!(h.push(cand(30, 3)), Some(cand(50, 1)));
        assert_eq!(h.push(cand(99, 4)), Some(cand(99, 4)));
        let best: Vec<_> = h.drain_best().into_iter().map(|c| c.bucket.0).collect();
        assert_eq!(best, vec![2, 3]);
        assert!(h.is_empty());
    }

    #[test]
    fn zero_capacity_rejects_everything() {
        let mut h = BoundedHeap::with_capacity(0);
        assert_eq!(h.push(cand(1, 1)), Some(cand(1, 1)));
        assert_eq!(h.len(), 0);
    }
}
