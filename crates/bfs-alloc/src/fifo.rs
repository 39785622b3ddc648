//! Fixed-capacity bucket FIFO.

use bfs_types::BucketIdx;
use std::collections::VecDeque;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fifo {
    items: VecDeque<BucketIdx>,
    capacity: usize,
}

impl Fifo {
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.items.len() >= self.capacity
    }

    /// Append `b`; `false` if the FIFO is full.
    pub fn push(&mut self, b: BucketIdx) -> bool {
        if self.is_full() {
            return false;
        }
        self.items.push_back(b);
        true
    }

    pub fn pop(&mut self) -> Option<BucketIdx> {
        self.items.pop_front()
    }

    pub fn iter(&self) -> impl Iterator<Item = BucketIdx> + '_ {
        self.items.iter().copied()
    }

    /// Move entries from the front of `src` until `self` is full; returns
    /// how many were left behind in `src`.
    pub fn move_from(&mut self, src: &mut Self) -> usize {
        while !self.is_full() {
            let Some(b) = src.pop() else { break };
            self.items.push_back(b);
        }
        src.len()
    }

    /// Drop entries at or beyond `nbuckets`.
    pub fn retain_below(&mut self, nbuckets: u64) {
        self.items.retain(|b| b.0 < nbuckets);
    }
}
