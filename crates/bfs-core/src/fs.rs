//! The filesystem-wide accounting state.
//!
//! Lock order, outermost first: `gc_lock`, a device's `bucket_lock`,
//! `mark_lock`. Bucket marks and usage shards are never behind a lock;
//! `mark_lock` only separates marking (shared) from structural changes
//! (exclusive).

use crate::config::CoreConfig;
use crate::device::Device;
use crate::gc::GcCursor;
use bfs_ec::StripeTable;
use bfs_error::{BfsError, InconsistencyReporter, Result};
use bfs_types::{DeviceIdx, GcPos, JournalSeq};
use bfs_usage::{DevUsage, FsUsage, FsUsageShort, PerCpu, ReserveFactor, Slots, UsageSlot};
use parking_lot::{RwLock, RwLockReadGuard};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::debug;

#[derive(Debug)]
pub struct Filesystem {
    pub(crate) config: CoreConfig,
    pub(crate) factor: ReserveFactor,
    pub(crate) shards: usize,
    pub(crate) devices: RwLock<Vec<Option<Arc<Device>>>>,
    pub(crate) capacity: AtomicU64,
    pub(crate) sectors_available: AtomicU64,
    /// Per-shard slices already debited from `sectors_available`.
    pub(crate) pcpu_sectors: Box<[AtomicU64]>,
    pub(crate) usage: Slots<PerCpu<FsUsage>>,
    pub(crate) stripes: Slots<StripeTable>,
    pub(crate) mark_lock: RwLock<()>,
    pub(crate) gc_lock: RwLock<()>,
    pub(crate) gc_pos: GcCursor,
    pub(crate) reporter: InconsistencyReporter,
    pub(crate) warned_unreserved: AtomicBool,
    last_bucket_seq_cleanup: AtomicU64,
}

/// Shared hold on the usage lock, for marking several keys under one
/// acquisition.
pub struct MarkLock<'a> {
    pub(crate) fs: &'a Filesystem,
    _guard: RwLockReadGuard<'a, ()>,
}

impl std::fmt::Debug for MarkLock<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarkLock").finish_non_exhaustive()
    }
}

impl Filesystem {
    pub fn new(config: CoreConfig) -> Result<Self> {
        config.validate()?;
        let shards = config.resolved_shards();
        debug!(target: "bfs::core", shards, "filesystem_new");
        Ok(Self {
            factor: config.reserve_factor(),
            shards,
            devices: RwLock::new(Vec::new()),
            capacity: AtomicU64::new(0),
            sectors_available: AtomicU64::new(0),
            pcpu_sectors: (0..shards).map(|_| AtomicU64::new(0)).collect(),
            usage: Slots::new(|_| PerCpu::new(shards)),
            stripes: Slots::new(|slot| StripeTable::new(!slot.is_gc())),
            mark_lock: RwLock::new(()),
            gc_lock: RwLock::new(()),
            gc_pos: GcCursor::new(),
            reporter: InconsistencyReporter::new(config.inconsistency_log_interval()),
            warned_unreserved: AtomicBool::new(false),
            last_bucket_seq_cleanup: AtomicU64::new(0),
            config,
        })
    }

    #[must_use]
    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    #[must_use]
    pub fn reporter(&self) -> &InconsistencyReporter {
        &self.reporter
    }

    /// Usable sectors across every attached device.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity.load(Ordering::Acquire)
    }

    pub fn device(&self, idx: DeviceIdx) -> Result<Arc<Device>> {
        usize::try_from(idx.0)
            .ok()
            .and_then(|i| self.devices.read().get(i).cloned().flatten())
            .ok_or(BfsError::NoDevice(idx.0))
    }

    #[must_use]
    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.devices.read().iter().flatten().cloned().collect()
    }

    /// Stripe table of one view.
    #[must_use]
    pub fn stripes(&self, slot: UsageSlot) -> &StripeTable {
        &self.stripes[slot]
    }

    /// Take the usage lock shared. Do not call reservation or resize
    /// operations while holding it.
    pub fn mark_lock(&self) -> MarkLock<'_> {
        MarkLock {
            fs: self,
            _guard: self.mark_lock.read(),
        }
    }

    #[must_use]
    pub fn gc_pos(&self) -> GcPos {
        self.gc_pos.read()
    }

    /// `true` if a GC pass is running and has already passed `pos`.
    #[must_use]
    pub fn gc_visited(&self, pos: GcPos) -> bool {
        self.gc_pos.visited(pos)
    }

    pub(crate) fn recompute_capacity(&self) -> u64 {
        let capacity: u64 = self.devices.read().iter().flatten().map(|d| d.capacity()).sum();
        self.capacity.store(capacity, Ordering::Release);
        capacity
    }

    // ── Usage reads ─────────────────────────────────────────────────────────

    #[must_use]
    pub fn fs_usage_read(&self, slot: UsageSlot) -> FsUsage {
        self.usage[slot].read()
    }

    pub fn dev_usage_read(&self, dev: DeviceIdx, slot: UsageSlot) -> Result<DevUsage> {
        Ok(self.device(dev)?.usage(slot))
    }

    #[must_use]
    pub fn fs_usage_read_short(&self) -> FsUsageShort {
        FsUsageShort::from_usage(self.capacity(), &self.fs_usage_read(UsageSlot::Live), self.factor)
    }

    /// `min(capacity, hidden + data + reserve_factor(reserved + online_reserved))`.
    #[must_use]
    pub fn fs_sectors_used(&self, usage: &FsUsage) -> u64 {
        usage.sectors_used(self.factor).min(self.capacity())
    }

    #[must_use]
    pub fn fs_sectors_free(&self) -> u64 {
        let capacity = self.capacity();
        let usage = self.fs_usage_read(UsageSlot::Live);
        capacity.saturating_sub(usage.sectors_used(self.factor))
    }

    // ── Journal sequence cleanup ────────────────────────────────────────────

    /// Drop stale journal-sequence pins from bucket marks.
    ///
    /// A bucket emptied by a transaction keeps `journal_seq_valid` until the
    /// journal entry is on disk. Once `last_seq_ondisk` has passed it, the
    /// pin is cleared. Runs at most once per configured interval of
    /// `journal_seq`; returns the number of marks cleared, or `None` if
    /// skipped.
    pub fn bucket_seq_cleanup(
        &self,
        journal_seq: JournalSeq,
        last_seq_ondisk: JournalSeq,
    ) -> Option<u64> {
        let last = self.last_bucket_seq_cleanup.load(Ordering::Acquire);
        if journal_seq.0.wrapping_sub(last) < self.config.journal_seq_cleanup_interval {
            return None;
        }
        self.last_bucket_seq_cleanup
            .compare_exchange(last, journal_seq.0, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;

        let ondisk = last_seq_ondisk.to_mark_seq();
        let mut cleared = 0_u64;
        for dev in self.devices() {
            let _bucket_guard = dev.bucket_lock.read();
            let array = dev.buckets[UsageSlot::Live].load();
            for (_, bucket) in array.iter() {
                let changed = bucket.mark.mutate(|m| {
                    if !m.journal_seq_valid || m.needs_journal_commit(ondisk) {
                        return None;
                    }
                    let mut new = m;
                    new.journal_seq_valid = false;
                    Some(new)
                });
                cleared += u64::from(changed.is_some());
            }
        }
        debug!(
            target: "bfs::core",
            journal_seq = journal_seq.0,
            last_seq_ondisk = last_seq_ondisk.0,
            cleared,
            "bucket_seq_cleanup"
        );
        Some(cleared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use bfs_types::{BucketGen, BucketIdx, CrcInfo, DataType, ExtentPtr, MarkFlags, StorageKey};

    fn fs_with_device(cleanup_interval: u64) -> Filesystem {
        let fs = Filesystem::new(CoreConfig {
            shards: 2,
            journal_seq_cleanup_interval: cleanup_interval,
            ..CoreConfig::default()
        })
        .unwrap();
        fs.dev_buckets_alloc(DeviceConfig::new(0, 16, 128)).unwrap();
        fs
    }

    #[test]
    fn device_lookup() {
        let fs = fs_with_device(16);
        assert_eq!(fs.device(DeviceIdx(0)).unwrap().nbuckets(), 16);
        assert!(matches!(fs.device(DeviceIdx(3)), Err(BfsError::NoDevice(3))));
        assert_eq!(fs.devices().len(), 1);
        assert_eq!(fs.capacity(), 16 * 128);
    }

    #[test]
    fn rejects_invalid_config() {
        let err = Filesystem::new(CoreConfig {
            btree_node_size: 0,
            ..CoreConfig::default()
        })
        .unwrap_err();
        assert!(matches!(err, BfsError::InvalidGeometry(_)));
    }

    #[test]
    fn short_usage_of_empty_fs() {
        let fs = fs_with_device(16);
        let short = fs.fs_usage_read_short();
        assert_eq!(short.capacity, 16 * 128);
        assert_eq!(short.used, 0);
        assert_eq!(fs.fs_sectors_free(), 16 * 128);
    }

    #[test]
    fn free_sectors_saturate_while_devices_come_and_go() {
        let fs = fs_with_device(16);
        for b in 0..16 {
            fs.mark_metadata_bucket(
                DeviceIdx(0),
                BucketIdx(b),
                DataType::Journal,
                128,
                GcPos::NOT_RUNNING,
                MarkFlags::NONE,
            )
            .unwrap();
        }
        // Detaching leaves the journal's hidden sectors counted.
        fs.dev_buckets_free(DeviceIdx(0)).unwrap();
        assert_eq!(fs.capacity(), 0);
        assert_eq!(fs.fs_sectors_free(), 0);

        std::thread::scope(|s| {
            s.spawn(|| {
                for _ in 0..200 {
                    fs.dev_buckets_alloc(DeviceConfig::new(1, 32, 128)).unwrap();
                    fs.dev_buckets_free(DeviceIdx(1)).unwrap();
                }
            });
            s.spawn(|| {
                for _ in 0..5_000 {
                    assert!(fs.fs_sectors_free() <= 32 * 128 - 16 * 128);
                }
            });
        });
    }

    #[test]
    fn seq_cleanup_clears_only_committed_pins() {
        let fs = fs_with_device(16);
        let dev = DeviceIdx(0);
        for b in [1_u64, 2] {
            fs.mark_alloc_bucket(dev, BucketIdx(b), true, GcPos::NOT_RUNNING, MarkFlags::NONE)
                .unwrap();
        }
        // Fill then empty buckets 1 and 2 at journal sequences 10 and 40.
        for (b, seq) in [(1_u64, 10_u64), (2, 40)] {
            let ptr = ExtentPtr::new(dev, b * 128, BucketGen(0)).with_crc(CrcInfo::uncompressed(8));
            let key = StorageKey::Extent { ptrs: vec![ptr] };
            fs.mark_key(&key, true, 8, GcPos::NOT_RUNNING, None, JournalSeq(seq), MarkFlags::NONE)
                .unwrap();
            fs.mark_key(&key, false, -8, GcPos::NOT_RUNNING, None, JournalSeq(seq), MarkFlags::NONE)
                .unwrap();
        }
        let device = fs.device(dev).unwrap();
        let m1 = device.bucket_mark(UsageSlot::Live, BucketIdx(1)).unwrap();
        assert!(m1.journal_seq_valid);
        assert_eq!(m1.journal_seq, 10);
        assert_eq!(m1.data_type, DataType::None);

        // Too soon after the last cleanup.
        assert_eq!(fs.bucket_seq_cleanup(JournalSeq(8), JournalSeq(20)), None);

        assert_eq!(fs.bucket_seq_cleanup(JournalSeq(50), JournalSeq(20)), Some(1));
        assert!(!device.bucket_mark(UsageSlot::Live, BucketIdx(1)).unwrap().journal_seq_valid);
        assert!(device.bucket_mark(UsageSlot::Live, BucketIdx(2)).unwrap().journal_seq_valid);

        assert_eq!(fs.bucket_seq_cleanup(JournalSeq(60), JournalSeq(45)), None);
        assert_eq!(fs.bucket_seq_cleanup(JournalSeq(70), JournalSeq(45)), Some(1));
    }
}
