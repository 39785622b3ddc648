//! Min-heap of live stripes ordered by nonempty block count.
//!
//! Each stripe records its own slot in the heap (`heap_idx`), so a charge
//! that changes `blocks_nonempty` can re-position the stripe in O(log n)
//! without searching. Ties break on stripe index.

use crate::stripe::{NOT_IN_HEAP, Stripe};
use bfs_types::StripeIdx;
use std::sync::Arc;
use std::sync::atomic::Ordering;

#[derive(Debug, Clone)]
struct HeapEntry {
    idx: StripeIdx,
    blocks_nonempty: i32,
    stripe: Arc<Stripe>,
}

impl HeapEntry {
    fn key(&self) -> (i32, StripeIdx) {
        (self.blocks_nonempty, self.idx)
    }
}

#[derive(Debug, Default)]
pub struct StripesHeap {
    entries: Vec<HeapEntry>,
}

impl StripesHeap {
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Least-occupied live stripe and its nonempty block count.
    #[must_use]
    pub fn peek_min(&self) -> Option<(StripeIdx, i32)> {
        self.entries.first().map(|e| (e.idx, e.blocks_nonempty))
    }

    /// Stripes in heap order (not sorted).
    pub fn iter(&self) -> impl Iterator<Item = (StripeIdx, i32)> + '_ {
        self.entries.iter().map(|e| (e.idx, e.blocks_nonempty))
    }

    pub fn insert(&mut self, idx: StripeIdx, stripe: Arc<Stripe>) {
        if stripe.in_heap() {
            return;
        }
        let pos = self.entries.len();
        self.entries.push(HeapEntry {
            idx,
            blocks_nonempty: stripe.blocks_nonempty(),
            stripe,
        });
        self.set_pos(pos);
        self.sift_up(pos);
    }

    pub fn remove(&mut self, stripe: &Stripe) {
        let Some(pos) = self.position_of(stripe) else {
            return;
        };
        let last = self.entries.len() - 1;
        self.entries.swap(pos, last);
        if let Some(removed) = self.entries.pop() {
            removed.stripe.heap_idx.store(NOT_IN_HEAP, Ordering::Relaxed);
        }
        if pos < self.entries.len() {
            self.set_pos(pos);
            self.restore(pos);
        }
    }

    /// Refresh a stripe's key after its `blocks_nonempty` changed.
    pub fn update(&mut self, stripe: &Stripe) {
        let Some(pos) = self.position_of(stripe) else {
            return;
        };
        self.entries[pos].blocks_nonempty = stripe.blocks_nonempty();
        self.restore(pos);
    }

    pub fn clear(&mut self) {
        for e in self.entries.drain(..) {
            e.stripe.heap_idx.store(NOT_IN_HEAP, Ordering::Relaxed);
        }
    }

    fn position_of(&self, stripe: &Stripe) -> Option<usize> {
        let pos = stripe.heap_idx.load(Ordering::Relaxed);
        self.entries
            .get(pos)
            .filter(|e| std::ptr::eq(Arc::as_ptr(&e.stripe), stripe))
            .map(|_| pos)
    }

    fn set_pos(&self, pos: usize) {
        self.entries[pos].stripe.heap_idx.store(pos, Ordering::Relaxed);
    }

    fn restore(&mut self, pos: usize) {
        if pos > 0 && self.entries[pos].key() < self.entries[(pos - 1) / 2].key() {
            self.sift_up(pos);
        } else {
            self.sift_down(pos);
        }
    }

    fn sift_up(&mut self, mut pos: usize) {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if self.entries[pos].key() >= self.entries[parent].key() {
                break;
            }
            self.entries.swap(pos, parent);
            self.set_pos(pos);
            self.set_pos(parent);
            pos = parent;
        }
    }

    fn sift_down(&mut self, mut pos: usize) {
        loop {
            let left = 2 * pos + 1;
            let right = left + 1;
            let mut smallest = pos;
            if left < self.entries.len() && self.entries[left].key() < self.entries[smallest].key() {
                smallest = left;
            }
            if right < self.entries.len() && self.entries[right].key() < self.entries[smallest].key()
            {
                smallest = right;
            }
            if smallest == pos {
                break;
            }
            self.entries.swap(pos, smallest);
            self.set_pos(pos);
            self.set_pos(smallest);
            pos = smallest;
        }
    }

    /// Heap order and back-indices hold for every entry.
    #[cfg(test)]
    fn check(&self) -> bool {
        self.entries.iter().enumerate().all(|(i, e)| {
            e.stripe.heap_idx.load(Ordering::Relaxed) == i
                && (i == 0 || self.entries[(i - 1) / 2].key() <= e.key())
        })
    }
}
