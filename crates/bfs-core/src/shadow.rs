//! GC-shadow lifecycle.
//!
//! A GC pass rebuilds usage from scratch into the shadow view while the
//! live view keeps serving. The traversal itself is external: it marks
//! every key it visits with `MarkFlags::GC` and advances the cursor with
//! [`GcPass::set_pos`]. Writers whose position the cursor has passed are
//! mirrored into the shadow by the marking engine.

use crate::fs::Filesystem;
use bfs_buckets::BucketArray;
use bfs_types::{DeviceIdx, GcPhase, GcPos};
use bfs_usage::{DevUsage, FsUsage, UsageSlot, reset_slot};
use parking_lot::RwLockWriteGuard;
use tracing::{info, warn};

/// A running GC pass. Holds the GC lock exclusively until finished.
pub struct GcPass<'a> {
    fs: &'a Filesystem,
    _gc_guard: RwLockWriteGuard<'a, ()>,
}

impl std::fmt::Debug for GcPass<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcPass")
            .field("pos", &self.fs.gc_pos())
            .finish_non_exhaustive()
    }
}

/// Live and rebuilt usage at the end of a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcReport {
    pub fs_live: FsUsage,
    pub fs_shadow: FsUsage,
    pub devices: Vec<(DeviceIdx, DevUsage, DevUsage)>,
}

impl GcReport {
    /// `true` if the rebuild agrees with the live counters everywhere.
    #[must_use]
    pub fn matches(&self) -> bool {
        self.fs_live == self.fs_shadow
            && self.devices.iter().all(|(_, live, shadow)| live == shadow)
    }
}

impl Filesystem {
    /// Start a GC pass: zero the shadow view and put the cursor at the start.
    ///
    /// Blocks reservation recalculation and resize until the returned pass
    /// is finished. Reservations made during the pass must carry
    /// `ReservationFlags::GC_LOCK_HELD` if made by the GC thread itself.
    pub fn gc_start(&self) -> GcPass<'_> {
        let gc_guard = self.gc_lock.write();
        {
            let _mark_guard = self.mark_lock.write();
            for dev in self.devices() {
                let live = dev.buckets[UsageSlot::Live].load();
                dev.buckets[UsageSlot::GcShadow].replace(BucketArray::with_generations_of(&live));
                reset_slot(&dev.usage, UsageSlot::GcShadow);
            }
            reset_slot(&self.usage, UsageSlot::GcShadow);
            self.stripes[UsageSlot::GcShadow].reset();
            self.gc_pos.set(GcPos::phase(GcPhase::Start));
        }
        info!(target: "bfs::gc", devices = self.devices().len(), "gc_start");
        GcPass {
            fs: self,
            _gc_guard: gc_guard,
        }
    }
}

impl GcPass<'_> {
    /// Advance the cursor. Positions must not move backwards.
    pub fn set_pos(&self, pos: GcPos) {
        debug_assert!(pos >= self.fs.gc_pos(), "gc cursor moved backwards");
        self.fs.gc_pos.set(pos);
    }

    #[must_use]
    pub fn pos(&self) -> GcPos {
        self.fs.gc_pos()
    }

    /// Compare the rebuilt view against the live one and drop the shadow.
    pub fn finish(self) -> GcReport {
        let fs = self.fs;
        let _mark_guard = fs.mark_lock.write();
        fs.gc_pos.set(GcPos::phase(GcPhase::Done));

        let report = GcReport {
            fs_live: fs.usage[UsageSlot::Live].read(),
            fs_shadow: fs.usage[UsageSlot::GcShadow].read(),
            devices: fs
                .devices()
                .iter()
                .map(|d| (d.idx(), d.usage(UsageSlot::Live), d.usage(UsageSlot::GcShadow)))
                .collect(),
        };
        if report.fs_live != report.fs_shadow {
            warn!(
                target: "bfs::gc",
                live = ?report.fs_live.s,
                shadow = ?report.fs_shadow.s,
                "gc_fs_usage_mismatch"
            );
        }
        for (idx, live, shadow) in &report.devices {
            if live != shadow {
                warn!(
                    target: "bfs::gc",
                    dev = idx.0,
                    live = ?live,
                    shadow = ?shadow,
                    "gc_dev_usage_mismatch"
                );
            }
        }

        fs.drop_shadow();
        info!(target: "bfs::gc", matches = report.matches(), "gc_finish");
        report
    }
}

impl Drop for GcPass<'_> {
    /// A pass dropped without [`finish`](GcPass::finish) is abandoned:
    /// the shadow is discarded without comparison.
    fn drop(&mut self) {
        if !self.fs.gc_pos().is_running() {
            return;
        }
        let _mark_guard = self.fs.mark_lock.write();
        let pos = self.fs.gc_pos();
        self.fs.drop_shadow();
        warn!(target: "bfs::gc", phase = ?pos.phase, offset = pos.offset, "gc_abort");
    }
}

impl Filesystem {
    /// Stop the cursor and release every shadow structure. Caller holds
    /// `mark_lock` exclusively.
    fn drop_shadow(&self) {
        self.gc_pos.set(GcPos::NOT_RUNNING);
        for dev in self.devices() {
            dev.buckets[UsageSlot::GcShadow].replace(BucketArray::empty());
            reset_slot(&dev.usage, UsageSlot::GcShadow);
        }
        reset_slot(&self.usage, UsageSlot::GcShadow);
        self.stripes[UsageSlot::GcShadow].reset();
    }
}

#[cfg(test)]
mod tests {
    use crate::config::{CoreConfig, DeviceConfig};
    use crate::fs::Filesystem;
    use bfs_types::{
        BucketGen, BucketIdx, CrcInfo, DeviceIdx, ExtentPtr, GcPhase, GcPos, JournalSeq,
        MarkFlags, StorageKey,
    };
    use bfs_usage::UsageSlot;

    fn fs() -> Filesystem {
        let fs = Filesystem::new(CoreConfig {
            shards: 1,
            ..CoreConfig::default()
        })
        .unwrap();
        fs.dev_buckets_alloc(DeviceConfig::new(0, 16, 64)).unwrap();
        fs
    }

    #[test]
    fn shadow_exists_only_during_pass() {
        let fs = fs();
        let dev = fs.device(DeviceIdx(0)).unwrap();
        fs.invalidate_bucket(DeviceIdx(0), BucketIdx(2)).unwrap();
        assert!(dev.bucket_array(UsageSlot::GcShadow).is_empty());

        let pass = fs.gc_start();
        assert_eq!(pass.pos(), GcPos::phase(GcPhase::Start));
        let shadow = dev.bucket_mark(UsageSlot::GcShadow, BucketIdx(2)).unwrap();
        assert_eq!(shadow.generation, BucketGen(1));
        assert!(!shadow.owned_by_allocator);

        pass.finish();
        assert!(dev.bucket_array(UsageSlot::GcShadow).is_empty());
        assert!(!fs.gc_pos().is_running());
    }

    #[test]
    fn dropped_pass_discards_shadow() {
        let fs = fs();
        let dev = fs.device(DeviceIdx(0)).unwrap();
        {
            let pass = fs.gc_start();
            pass.set_pos(GcPos::btree(5, 0));
            fs.mark_alloc_bucket(DeviceIdx(0), BucketIdx(1), true, GcPos::NOT_RUNNING, MarkFlags::GC)
                .unwrap();
            assert_eq!(dev.usage(UsageSlot::GcShadow).buckets_alloc, 1);
        }
        assert!(!fs.gc_pos().is_running());
        assert!(dev.bucket_array(UsageSlot::GcShadow).is_empty());
        assert_eq!(dev.usage(UsageSlot::GcShadow).buckets_alloc, 0);
        // The GC lock is free again.
        fs.gc_start().finish();
    }

    #[test]
    fn rebuild_matches_live() {
        let fs = fs();
        let dev = DeviceIdx(0);
        let pos = GcPos::btree(10, 0);
        fs.mark_alloc_bucket(dev, BucketIdx(1), true, pos, MarkFlags::NONE).unwrap();
        let key = StorageKey::Extent {
            ptrs: vec![ExtentPtr::new(dev, 64, BucketGen(0)).with_crc(CrcInfo::uncompressed(8))],
        };
        fs.mark_key(&key, true, 8, pos, None, JournalSeq(0), MarkFlags::NONE).unwrap();

        let pass = fs.gc_start();
        fs.mark_alloc_bucket(dev, BucketIdx(1), true, pos, MarkFlags::GC).unwrap();
        fs.mark_key(&key, true, 8, pos, None, JournalSeq(0), MarkFlags::GC).unwrap();
        pass.set_pos(GcPos::phase(GcPhase::Alloc));
        let report = pass.finish();
        assert!(report.matches(), "{report:?}");
        assert_eq!(report.fs_shadow.s.data, 8);
    }

    #[test]
    fn writes_behind_cursor_reach_shadow() {
        let fs = fs();
        let dev = DeviceIdx(0);
        let pass = fs.gc_start();
        pass.set_pos(GcPos::btree(100, 0));

        // Behind the cursor: mirrored into the shadow.
        fs.mark_alloc_bucket(dev, BucketIdx(3), true, GcPos::btree(50, 0), MarkFlags::NONE)
            .unwrap();
        // Ahead of it: the scan will find it itself.
        fs.mark_alloc_bucket(dev, BucketIdx(4), true, GcPos::btree(150, 0), MarkFlags::NONE)
            .unwrap();

        let device = fs.device(dev).unwrap();
        assert!(device.bucket_mark(UsageSlot::GcShadow, BucketIdx(3)).unwrap().owned_by_allocator);
        assert!(!device.bucket_mark(UsageSlot::GcShadow, BucketIdx(4)).unwrap().owned_by_allocator);
        assert_eq!(device.usage(UsageSlot::GcShadow).buckets_alloc, 1);
        assert_eq!(device.usage(UsageSlot::Live).buckets_alloc, 2);

        // Once the scan passes bucket 4's position it marks it too.
        pass.set_pos(GcPos::btree(200, 0));
        fs.mark_alloc_bucket(dev, BucketIdx(4), true, GcPos::btree(150, 0), MarkFlags::GC)
            .unwrap();
        assert!(pass.finish().matches());
    }
}
