//! Device attach, bucket-array resize and detach.

use crate::config::{DeviceConfig, check_nbuckets};
use crate::device::Device;
use crate::fs::Filesystem;
use bfs_alloc::{AllocQueues, QueueSizes};
use bfs_buckets::{BucketArray, BucketSideArrays};
use bfs_error::{BfsError, Result};
use bfs_types::DeviceIdx;
use bfs_usage::UsageSlot;
use std::sync::Arc;
use tracing::{info, warn};

impl Filesystem {
    /// Attach a device and build its bucket array.
    pub fn dev_buckets_alloc(&self, cfg: DeviceConfig) -> Result<Arc<Device>> {
        cfg.validate()?;
        let slot = usize::try_from(cfg.idx.0)
            .map_err(|_| BfsError::InvalidGeometry(format!("device index {}", cfg.idx)))?;
        let device = Arc::new(Device::new(cfg, self.shards));
        self.dev_buckets_resize(&device, cfg.nbuckets)?;

        {
            let mut devices = self.devices.write();
            if devices.get(slot).is_some_and(Option::is_some) {
                return Err(BfsError::InvalidGeometry(format!(
                    "device {} already attached",
                    cfg.idx
                )));
            }
            if devices.len() <= slot {
                devices.resize(slot + 1, None);
            }
            devices[slot] = Some(Arc::clone(&device));
        }
        let capacity = self.recompute_capacity();
        self.reset_sectors_available();
        info!(
            target: "bfs::resize",
            dev = cfg.idx.0,
            nbuckets = cfg.nbuckets,
            bucket_size = cfg.bucket_size,
            capacity,
            "device_attach"
        );
        Ok(device)
    }

    /// Resize a device's bucket array and everything sized with it.
    ///
    /// Marks, generations and side bits below `min(old, new)` carry over.
    /// Shrinking past the highest bucket that is not free is refused. The
    /// copy-GC thread is stopped for the duration and restarted if it was
    /// running.
    pub fn dev_buckets_resize(&self, dev: &Device, nbuckets: u64) -> Result<()> {
        check_nbuckets(&dev.config(), nbuckets)?;
        let cfg = dev.config();
        let sizes = QueueSizes::for_device(
            nbuckets,
            cfg.bucket_size,
            self.config.btree_node_size,
            cfg.btree_node_reserve,
        );
        let mut queues = AllocQueues::new(sizes);

        let restart_copygc = dev.copygc().stop();
        let outcome = self.swap_bucket_arrays(dev, nbuckets, &mut queues);
        if restart_copygc {
            dev.copygc().start()?;
        }
        let old_nbuckets = outcome?;

        if old_nbuckets != 0 && self.device(dev.idx()).is_ok() {
            let capacity = self.recompute_capacity();
            self.reset_sectors_available();
            info!(
                target: "bfs::resize",
                dev = dev.idx().0,
                old_nbuckets,
                nbuckets,
                capacity,
                "device_resize"
            );
        }
        Ok(())
    }

    /// Publish new arrays and queues; returns the previous bucket count.
    fn swap_bucket_arrays(
        &self,
        dev: &Device,
        nbuckets: u64,
        queues: &mut AllocQueues,
    ) -> Result<u64> {
        let resize = !dev.buckets[UsageSlot::Live].load().is_empty();
        let gc_guard = resize.then(|| self.gc_lock.write());
        let bucket_guard = resize.then(|| dev.bucket_lock.write());
        let mark_guard = resize.then(|| self.mark_lock.write());

        let old = dev.buckets[UsageSlot::Live].load_arc();
        if let Some(highest) = old.highest_in_use() {
            if highest.0 >= nbuckets {
                return Err(BfsError::ShrinkBelowLive {
                    requested: nbuckets,
                    highest_live: highest.0,
                });
            }
        }

        let new = BucketArray::resized_from(&old, dev.first_bucket(), nbuckets);
        dev.buckets[UsageSlot::Live].replace(new);
        {
            let mut side = dev.side.lock();
            *side = BucketSideArrays::resized_from(&side, nbuckets);
        }
        dev.set_nbuckets(nbuckets);
        drop(mark_guard);

        {
            let mut current = dev.alloc.lock();
            let dropped = queues.take_contents_from(&mut current, nbuckets);
            if dropped > 0 {
                warn!(
                    target: "bfs::resize",
                    dev = dev.idx().0,
                    dropped,
                    "free_queue_entries_dropped"
                );
            }
            std::mem::swap(&mut *current, queues);
        }

        drop(bucket_guard);
        drop(gc_guard);
        Ok(old.nbuckets())
    }

    /// Detach a device. Its data must already have been moved off; usage it
    /// contributed is not unwound.
    pub fn dev_buckets_free(&self, idx: DeviceIdx) -> Result<Arc<Device>> {
        let device = {
            let _gc_guard = self.gc_lock.write();
            let _mark_guard = self.mark_lock.write();
            let mut devices = self.devices.write();
            usize::try_from(idx.0)
                .ok()
                .and_then(|i| devices.get_mut(i))
                .and_then(Option::take)
                .ok_or(BfsError::NoDevice(idx.0))?
        };
        device.copygc().stop();
        let capacity = self.recompute_capacity();
        self.reset_sectors_available();
        info!(target: "bfs::resize", dev = idx.0, capacity, "device_detach");
        Ok(device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use bfs_alloc::ReserveClass;
    use bfs_types::{BucketGen, BucketIdx, GcPos, MarkFlags};

    fn fs() -> Filesystem {
        Filesystem::new(CoreConfig {
            shards: 1,
            reserve_factor_shift: 0,
            sectors_cache: 0,
            ..CoreConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn attach_sets_capacity_and_budget() {
        let fs = fs();
        let dev = fs
            .dev_buckets_alloc(DeviceConfig::new(2, 64, 256).with_first_bucket(1))
            .unwrap();
        assert_eq!(dev.nbuckets(), 64);
        assert_eq!(dev.bucket_array(UsageSlot::Live).nbuckets(), 64);
        assert_eq!(dev.side_arrays().nbuckets(), 64);
        assert_eq!(fs.capacity(), 63 * 256);
        assert_eq!(fs.sectors_available(), 63 * 256);
        assert!(fs.device(DeviceIdx(0)).is_err());
        assert!(dev.alloc_queues().sizes().btree_reserve >= 1);
    }

    #[test]
    fn double_attach_is_refused() {
        let fs = fs();
        fs.dev_buckets_alloc(DeviceConfig::new(0, 8, 64)).unwrap();
        assert!(matches!(
            fs.dev_buckets_alloc(DeviceConfig::new(0, 8, 64)),
            Err(BfsError::InvalidGeometry(_))
        ));
        assert_eq!(fs.capacity(), 8 * 64);
    }

    #[test]
    fn grow_preserves_marks_and_side_arrays() {
        let fs = fs();
        let dev = fs.dev_buckets_alloc(DeviceConfig::new(0, 16, 64)).unwrap();
        fs.invalidate_bucket(DeviceIdx(0), BucketIdx(3)).unwrap();
        {
            let mut side = dev.side_arrays();
            side.set_oldest_gen(BucketIdx(3), BucketGen(1));
            side.set_nouse(BucketIdx(4), true);
            side.set_written(BucketIdx(5));
        }
        assert!(dev.alloc_queues()[ReserveClass::None].push(BucketIdx(3)));

        fs.dev_buckets_resize(&dev, 32).unwrap();
        assert_eq!(dev.nbuckets(), 32);
        assert_eq!(fs.capacity(), 32 * 64);
        let m = dev.bucket_mark(UsageSlot::Live, BucketIdx(3)).unwrap();
        assert!(m.owned_by_allocator);
        assert_eq!(m.generation, BucketGen(1));
        let side = dev.side_arrays();
        assert_eq!(side.oldest_gen(BucketIdx(3)), Some(BucketGen(1)));
        assert!(side.is_nouse(BucketIdx(4)));
        assert!(side.is_written(BucketIdx(5)));
        drop(side);
        assert_eq!(
            dev.alloc_queues().queued().collect::<Vec<_>>(),
            vec![BucketIdx(3)]
        );
    }

    #[test]
    fn shrink_below_live_bucket_is_refused() {
        let fs = fs();
        let dev = fs.dev_buckets_alloc(DeviceConfig::new(0, 32, 64)).unwrap();
        fs.mark_alloc_bucket(DeviceIdx(0), BucketIdx(20), true, GcPos::NOT_RUNNING, MarkFlags::NONE)
            .unwrap();
        let err = fs.dev_buckets_resize(&dev, 16).unwrap_err();
        assert!(matches!(
            err,
            BfsError::ShrinkBelowLive {
                requested: 16,
                highest_live: 20
            }
        ));
        assert_eq!(dev.nbuckets(), 32);

        fs.dev_buckets_resize(&dev, 21).unwrap();
        assert_eq!(dev.nbuckets(), 21);
        assert_eq!(fs.capacity(), 21 * 64);
    }

    #[test]
    fn resize_restarts_running_copygc() {
        let fs = fs();
        let dev = fs.dev_buckets_alloc(DeviceConfig::new(0, 8, 64)).unwrap();
        dev.copygc().start().unwrap();
        fs.dev_buckets_resize(&dev, 12).unwrap();
        assert!(dev.copygc().is_running());
        dev.copygc().stop();
        fs.dev_buckets_resize(&dev, 16).unwrap();
        assert!(!dev.copygc().is_running());
    }

    #[test]
    fn detach_removes_capacity() {
        let fs = fs();
        fs.dev_buckets_alloc(DeviceConfig::new(0, 8, 64)).unwrap();
        fs.dev_buckets_alloc(DeviceConfig::new(1, 8, 64)).unwrap();
        assert_eq!(fs.capacity(), 2 * 8 * 64);
        let dev = fs.dev_buckets_free(DeviceIdx(0)).unwrap();
        assert_eq!(dev.idx(), DeviceIdx(0));
        assert_eq!(fs.capacity(), 8 * 64);
        assert_eq!(fs.sectors_available(), 8 * 64);
        assert!(matches!(fs.dev_buckets_free(DeviceIdx(0)), Err(BfsError::NoDevice(0))));
    }
}
