//! Per-device allocator queues, sized from the bucket count.

use crate::fifo::Fifo;
use crate::heap::BoundedHeap;
use bfs_types::BucketIdx;
use std::ops::{Index, IndexMut};
use tracing::debug;

/// Free-list reserve a bucket is set aside for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReserveClass {
    Btree = 0,
    MovingGc = 1,
    None = 2,
}

impl ReserveClass {
    pub const ALL: [Self; 3] = [Self::Btree, Self::MovingGc, Self::None];
}

/// Capacities derived from device geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSizes {
    pub btree_reserve: usize,
    pub copygc_reserve: usize,
    pub reserve_none: usize,
    pub free_inc: usize,
    pub alloc_heap: usize,
    pub copygc_heap: usize,
}

fn clamp_len(n: u64) -> usize {
    usize::try_from(n).unwrap_or(usize::MAX)
}

impl QueueSizes {
    /// Sizes for a device of `nbuckets` buckets of `bucket_size` sectors.
    ///
    /// The btree reserve holds enough buckets for `btree_node_reserve`
    /// nodes; the other queues scale with the bucket count.
    #[must_use]
    pub fn for_device(
        nbuckets: u64,
        bucket_size: u32,
        btree_node_size: u32,
        btree_node_reserve: u32,
    ) -> Self {
        let nodes_per_bucket = (bucket_size / btree_node_size.max(1)).max(1);
        let btree_reserve = clamp_len(u64::from(btree_node_reserve.div_ceil(nodes_per_bucket)));
        let copygc_reserve = clamp_len((nbuckets >> 7).max(2));
        let scan_batch = clamp_len((nbuckets >> 9).max(1));
        Self {
            btree_reserve,
            copygc_reserve,
            reserve_none: scan_batch,
            free_inc: clamp_len((nbuckets >> 12).max(1)).max(btree_reserve),
            alloc_heap: scan_batch << 1,
            copygc_heap: copygc_reserve,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AllocQueues {
    free: [Fifo; 3],
    pub free_inc: Fifo,
    pub alloc_heap: BoundedHeap,
    pub copygc_heap: BoundedHeap,
}

impl AllocQueues {
    #[must_use]
    pub fn new(sizes: QueueSizes) -> Self {
        Self {
            free: [
                Fifo::with_capacity(sizes.btree_reserve),
                Fifo::with_capacity(sizes.copygc_reserve),
                Fifo::with_capacity(sizes.reserve_none),
            ],
            free_inc: Fifo::with_capacity(sizes.free_inc),
            alloc_heap: BoundedHeap::with_capacity(sizes.alloc_heap),
            copygc_heap: BoundedHeap::with_capacity(sizes.copygc_heap),
        }
    }

    #[must_use]
    pub fn sizes(&self) -> QueueSizes {
        QueueSizes {
            btree_reserve: self[ReserveClass::Btree].capacity(),
            copygc_reserve: self[ReserveClass::MovingGc].capacity(),
            reserve_none: self[ReserveClass::None].capacity(),
            free_inc: self.free_inc.capacity(),
            alloc_heap: self.alloc_heap.capacity(),
            copygc_heap: self.copygc_heap.capacity(),
        }
    }

    /// Carry free-list contents over from the queues being replaced.
    ///
    /// FIFOs keep their order; entries that no longer fit, or that point
    /// past `nbuckets`, are dropped. The scan heaps start empty: the
    /// allocator scan and copy-GC are stopped while this runs.
    pub fn take_contents_from(&mut self, old: &mut Self, nbuckets: u64) -> usize {
        let mut dropped = 0;
        for class in ReserveClass::ALL {
            old[class].retain_below(nbuckets);
            dropped += self[class].move_from(&mut old[class]);
        }
        old.free_inc.retain_below(nbuckets);
        dropped += self.free_inc.move_from(&mut old.free_inc);
        if dropped > 0 {
            debug!(target: "bfs::alloc", dropped, "alloc_queue_entries_dropped");
        }
        dropped
    }

    /// Every bucket queued on a free list or the incoming list.
    pub fn queued(&self) -> impl Iterator<Item = BucketIdx> + '_ {
        self.free
            .iter()
            .flat_map(Fifo::iter)
            .chain(self.free_inc.iter())
    }
}

impl Index<ReserveClass> for AllocQueues {
    type Output = Fifo;

    fn index(&self, class: ReserveClass) -> &Fifo {
        &self.free[class as usize]
    }
}

impl IndexMut<ReserveClass> for AllocQueues {
    fn index_mut(&mut self, class: ReserveClass) -> &mut Fifo {
        &mut self.free[class as usize]
    }
}
