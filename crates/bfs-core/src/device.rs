//! One attached storage device: bucket arrays, side arrays, usage and the
//! allocator structures sized with them.

use crate::config::DeviceConfig;
use bfs_alloc::{AllocQueues, AllocatorWaker, CopyGcWorker};
use bfs_buckets::{BucketArray, BucketMark, BucketSideArrays, RcuCell};
use bfs_types::{BucketIdx, DeviceIdx};
use bfs_usage::{DevUsage, PerCpu, Slots, UsageSlot};
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug)]
pub struct Device {
    cfg: DeviceConfig,
    nbuckets: AtomicU64,
    pub(crate) buckets: Slots<RcuCell<BucketArray>>,
    pub(crate) side: Mutex<BucketSideArrays>,
    pub(crate) usage: Slots<PerCpu<DevUsage>>,
    pub(crate) alloc: Mutex<AllocQueues>,
    pub(crate) bucket_lock: RwLock<()>,
    waker: AllocatorWaker,
    copygc: CopyGcWorker,
}

impl Device {
    /// Device with no buckets yet; the first resize populates it.
    pub(crate) fn new(cfg: DeviceConfig, shards: usize) -> Self {
        Self {
            cfg,
            nbuckets: AtomicU64::new(0),
            buckets: Slots::new(|_| RcuCell::new(BucketArray::empty())),
            side: Mutex::new(BucketSideArrays::default()),
            usage: Slots::new(|_| PerCpu::new(shards)),
            alloc: Mutex::new(AllocQueues::default()),
            bucket_lock: RwLock::new(()),
            waker: AllocatorWaker::new(),
            copygc: CopyGcWorker::idle(format!("bfs-copygc-{}", cfg.idx)),
        }
    }

    #[must_use]
    pub fn idx(&self) -> DeviceIdx {
        self.cfg.idx
    }

    /// Geometry with the current bucket count.
    #[must_use]
    pub fn config(&self) -> DeviceConfig {
        DeviceConfig {
            nbuckets: self.nbuckets(),
            ..self.cfg
        }
    }

    #[must_use]
    pub fn nbuckets(&self) -> u64 {
        self.nbuckets.load(Ordering::Acquire)
    }

    pub(crate) fn set_nbuckets(&self, nbuckets: u64) {
        self.nbuckets.store(nbuckets, Ordering::Release);
    }

    #[must_use]
    pub fn first_bucket(&self) -> u64 {
        self.cfg.first_bucket
    }

    #[must_use]
    pub fn bucket_size(&self) -> u32 {
        self.cfg.bucket_size
    }

    /// Sectors of usable capacity.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.cfg.capacity_at(self.nbuckets())
    }

    #[must_use]
    pub fn sector_to_bucket(&self, sector: u64) -> BucketIdx {
        BucketIdx(self.cfg.sector_to_bucket(sector))
    }

    /// Current mark of bucket `b` in the given view.
    #[must_use]
    pub fn bucket_mark(&self, slot: UsageSlot, b: BucketIdx) -> Option<BucketMark> {
        self.buckets[slot].load().get(b).map(|bucket| bucket.mark.load())
    }

    /// Current bucket array of a view. Keep the handle short-lived.
    #[must_use]
    pub fn bucket_array(&self, slot: UsageSlot) -> std::sync::Arc<BucketArray> {
        self.buckets[slot].load_arc()
    }

    /// Summed device usage of one view.
    #[must_use]
    pub fn usage(&self, slot: UsageSlot) -> DevUsage {
        self.usage[slot].read()
    }

    pub fn side_arrays(&self) -> MutexGuard<'_, BucketSideArrays> {
        self.side.lock()
    }

    pub fn alloc_queues(&self) -> MutexGuard<'_, AllocQueues> {
        self.alloc.lock()
    }

    #[must_use]
    pub fn waker(&self) -> &AllocatorWaker {
        &self.waker
    }

    #[must_use]
    pub fn copygc(&self) -> &CopyGcWorker {
        &self.copygc
    }
}
