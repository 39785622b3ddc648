//! The marking engine: storage keys in, bucket marks and usage deltas out.
//!
//! Every key is marked into the live view. It is marked again into the
//! GC-shadow view when the caller is the GC scan itself (`MarkFlags::GC`)
//! or when the key's position is one the running scan has already passed,
//! so the shadow rebuild sees writes that land behind its cursor.
//!
//! Bucket marks and device usage are updated immediately. Filesystem-level
//! contributions of the live pass go into the caller's delta, which
//! [`Filesystem::fs_usage_apply`] later folds into both views as needed;
//! without a delta they are added to the live accumulator directly.

use crate::device::Device;
use crate::fs::{Filesystem, MarkLock};
use crate::reservation::DiskReservation;
use bfs_buckets::{BucketArray, BucketMark, checked_sector_add};
use bfs_ec::{StripeError, StripeGeometry};
use bfs_error::{BfsError, Result};
use bfs_types::{
    BucketIdx, DataType, DeviceIdx, ExtentPtr, GcPos, JournalSeq, MarkFlags, REPLICAS_MAX,
    StorageKey, StripeIdx, StripeKey, StripePtr,
};
use bfs_usage::{DevUsage, FsUsage, UsageSlot};
use tracing::{debug, trace};

/// One key of a batch passed to [`Filesystem::mark_update`].
#[derive(Debug, Clone, Copy)]
pub struct KeyMark<'a> {
    pub key: &'a StorageKey,
    pub inserting: bool,
    /// Logical sectors added (positive) or removed (negative).
    pub sectors: i64,
}

/// Why a pointer update was refused inside the CAS loop.
#[derive(Debug, Clone, Copy)]
enum Reject {
    Stale,
    Negative { cached: bool, current: u16 },
    Overfull { used: u32 },
    TypeConflict { old: DataType },
}

fn clamp_replicas(n: u8) -> usize {
    usize::from(n).clamp(1, REPLICAS_MAX)
}

fn became_unavailable(old: BucketMark, new: BucketMark) -> bool {
    old.is_available() && !new.is_available()
}

/// Why the stripe flag of `mark` cannot be set to `enabled` through `ptr`.
fn stripe_flip_refusal(mark: BucketMark, ptr: &ExtentPtr, enabled: bool) -> Option<String> {
    if mark.generation.is_after(ptr.generation) {
        Some(format!("stale pointer generation {}", ptr.generation.0))
    } else if mark.stripe == enabled {
        Some(format!("stripe flag already {enabled}"))
    } else {
        None
    }
}

impl Filesystem {
    // ── Entry points ────────────────────────────────────────────────────────

    /// Mark one key under the usage lock.
    ///
    /// `sectors` is the logical size change for extents and reservations;
    /// it is ignored for other key types. `pos` is where the key lives in
    /// the GC traversal order.
    #[expect(clippy::too_many_arguments)]
    pub fn mark_key(
        &self,
        key: &StorageKey,
        inserting: bool,
        sectors: i64,
        pos: GcPos,
        delta: Option<&mut FsUsage>,
        journal_seq: JournalSeq,
        flags: MarkFlags,
    ) -> Result<()> {
        let lock = self.mark_lock();
        self.mark_key_locked(&lock, key, inserting, sectors, pos, delta, journal_seq, flags)
    }

    /// [`mark_key`](Self::mark_key) for callers already holding the usage lock.
    #[expect(clippy::too_many_arguments)]
    pub fn mark_key_locked(
        &self,
        lock: &MarkLock<'_>,
        key: &StorageKey,
        inserting: bool,
        sectors: i64,
        pos: GcPos,
        delta: Option<&mut FsUsage>,
        journal_seq: JournalSeq,
        flags: MarkFlags,
    ) -> Result<()> {
        debug_assert!(std::ptr::eq(lock.fs, self), "usage lock of another filesystem");
        let gc_only = flags.contains(MarkFlags::GC);
        let has_delta = delta.is_some();

        if !gc_only {
            match delta {
                Some(delta) => {
                    self.mark_key_slot(key, inserting, sectors, UsageSlot::Live, delta, journal_seq, flags)?;
                }
                None => {
                    let mut local = FsUsage::default();
                    let res = self.mark_key_slot(
                        key,
                        inserting,
                        sectors,
                        UsageSlot::Live,
                        &mut local,
                        journal_seq,
                        flags,
                    );
                    self.usage[UsageSlot::Live].add(&local);
                    res?;
                }
            }
        }

        if gc_only || self.gc_pos.visited(pos) {
            // With a delta, the live contribution reaches the shadow through
            // fs_usage_apply; only bucket and device state is marked here.
            let mut local = FsUsage::default();
            let res = self.mark_key_slot(
                key,
                inserting,
                sectors,
                UsageSlot::GcShadow,
                &mut local,
                journal_seq,
                flags,
            );
            if gc_only || !has_delta {
                self.usage[UsageSlot::GcShadow].add(&local);
            }
            res?;
        }
        Ok(())
    }

    /// Mark a batch of keys belonging to one transaction and commit the
    /// resulting usage against `res`.
    ///
    /// On a marking error the keys already marked are still applied, so
    /// filesystem usage stays consistent with the bucket marks, and the
    /// error is returned.
    pub fn mark_update(
        &self,
        keys: &[KeyMark<'_>],
        res: Option<&mut DiskReservation>,
        pos: GcPos,
        journal_seq: JournalSeq,
    ) -> Result<()> {
        let lock = self.mark_lock();
        let mut delta = FsUsage::default();
        let mut outcome = Ok(());
        for k in keys {
            outcome = self.mark_key_locked(
                &lock,
                k.key,
                k.inserting,
                k.sectors,
                pos,
                Some(&mut delta),
                journal_seq,
                MarkFlags::NONE,
            );
            if outcome.is_err() {
                break;
            }
        }
        self.fs_usage_apply(&lock, &mut delta, res, pos);
        outcome
    }

    // ── Per-view dispatch ───────────────────────────────────────────────────

    #[expect(clippy::too_many_arguments)]
    fn mark_key_slot(
        &self,
        key: &StorageKey,
        inserting: bool,
        sectors: i64,
        slot: UsageSlot,
        usage: &mut FsUsage,
        journal_seq: JournalSeq,
        flags: MarkFlags,
    ) -> Result<()> {
        trace!(
            target: "bfs::mark",
            kind = key.kind(),
            inserting,
            sectors,
            slot = slot.as_str(),
            "mark_key"
        );
        match key {
            StorageKey::BtreePtr { ptrs } => {
                let node = i64::from(self.config.btree_node_size);
                let sectors = if inserting { node } else { -node };
                self.mark_extent(ptrs, sectors, DataType::Btree, slot, usage, journal_seq, flags)
            }
            StorageKey::Extent { ptrs } => {
                self.mark_extent(ptrs, sectors, DataType::User, slot, usage, journal_seq, flags)
            }
            StorageKey::Stripe { idx, stripe } => {
                self.mark_stripe(*idx, stripe, inserting, slot, usage, flags)
            }
            StorageKey::AllocInfo => {
                usage.s.nr_inodes += if inserting { 1 } else { -1 };
                Ok(())
            }
            StorageKey::Reservation { nr_replicas } => {
                let sectors = sectors * i64::from(*nr_replicas);
                let r = clamp_replicas(*nr_replicas);
                usage.s.reserved += sectors;
                usage.replicas[r - 1].persistent_reserved += sectors;
                Ok(())
            }
            StorageKey::Deleted => Ok(()),
        }
    }

    #[expect(clippy::too_many_arguments)]
    fn mark_extent(
        &self,
        ptrs: &[ExtentPtr],
        sectors: i64,
        data_type: DataType,
        slot: UsageSlot,
        usage: &mut FsUsage,
        journal_seq: JournalSeq,
        flags: MarkFlags,
    ) -> Result<()> {
        if sectors == 0 {
            return Ok(());
        }

        // Resolve every pointer before touching a mark, so a bad pointer
        // late in the list cannot leave the earlier ones half accounted.
        let mut replicas = 0_u8;
        let mut ec_redundancy = 0_u8;
        for ptr in ptrs {
            let disk_sectors = self.ptr_disk_sectors(ptr, sectors, data_type)?;
            let dev = self.device(ptr.dev)?;
            let array = dev.buckets[slot].load();
            self.bucket_of(&dev, &array, dev.sector_to_bucket(ptr.offset))?;
            if !ptr.cached {
                for sp in &ptr.ec {
                    let geometry = self.check_stripe_ptr(sp, disk_sectors, slot)?;
                    ec_redundancy = ec_redundancy.max(geometry.nr_redundant.saturating_add(1));
                }
                replicas = replicas.saturating_add(1);
            }
        }
        let r = clamp_replicas(replicas);
        let ecr = clamp_replicas(ec_redundancy);

        for ptr in ptrs {
            let disk_sectors = self.ptr_disk_sectors(ptr, sectors, data_type)?;
            self.mark_pointer(ptr, disk_sectors, data_type, slot, usage, journal_seq, flags)?;

            let mut adjusted = disk_sectors;
            let mut charged = Ok(());
            if !ptr.cached {
                for sp in &ptr.ec {
                    charged = self.mark_stripe_ptr(sp, disk_sectors, slot, &mut adjusted);
                    if charged.is_err() {
                        break;
                    }
                }
            }

            // The bucket is marked; its sectors count even if a stripe
            // charge failed afterwards.
            if ptr.cached {
                usage.s.cached += adjusted;
                usage.replicas[0].data[DataType::Cached.index()] += adjusted;
            } else if ptr.ec.is_empty() {
                usage.s.data += adjusted;
                usage.replicas[r - 1].data[data_type.index()] += adjusted;
            } else {
                usage.s.data += adjusted;
                usage.replicas[ecr - 1].ec_data += adjusted;
            }
            charged?;
        }
        Ok(())
    }

    fn ptr_disk_sectors(&self, ptr: &ExtentPtr, sectors: i64, data_type: DataType) -> Result<i64> {
        if data_type == DataType::Btree {
            return Ok(sectors);
        }
        ptr.disk_sectors_delta(sectors).ok_or_else(|| {
            self.reporter.report(format!(
                "extent on dev {} offset {}: delta {sectors} exceeds live size {}",
                ptr.dev, ptr.offset, ptr.crc.live_size
            ))
        })
    }

    fn bucket_of<'a>(
        &self,
        dev: &Device,
        array: &'a BucketArray,
        b: BucketIdx,
    ) -> Result<&'a bfs_buckets::Bucket> {
        array.get(b).ok_or_else(|| {
            self.reporter.report(format!(
                "dev {} bucket {b} beyond {} buckets",
                dev.idx(),
                array.nbuckets()
            ))
        })
    }

    #[expect(clippy::too_many_arguments)]
    fn mark_pointer(
        &self,
        ptr: &ExtentPtr,
        disk_sectors: i64,
        data_type: DataType,
        slot: UsageSlot,
        usage: &mut FsUsage,
        journal_seq: JournalSeq,
        flags: MarkFlags,
    ) -> Result<()> {
        let dev = self.device(ptr.dev)?;
        let b = dev.sector_to_bucket(ptr.offset);
        let array = dev.buckets[slot].load();
        let bucket = self.bucket_of(&dev, &array, b)?;
        let bucket_size = dev.bucket_size();
        let pin_seq = journal_seq.0 != 0;
        let seq = journal_seq.to_mark_seq();

        let mut reject = None;
        let swapped = bucket.mark.mutate_with(!flags.contains(MarkFlags::NOATOMIC), |old| {
            if old.generation.is_after(ptr.generation) {
                reject = Some(Reject::Stale);
                return None;
            }
            let mut new = old;
            let counter = if ptr.cached {
                &mut new.cached_sectors
            } else {
                &mut new.dirty_sectors
            };
            let Some(updated) = checked_sector_add(*counter, disk_sectors) else {
                reject = Some(Reject::Negative {
                    cached: ptr.cached,
                    current: *counter,
                });
                return None;
            };
            *counter = updated;

            if new.sectors_used() > bucket_size {
                reject = Some(Reject::Overfull {
                    used: new.sectors_used(),
                });
                return None;
            }
            if new.dirty_sectors == 0 && new.cached_sectors == 0 {
                new.data_type = DataType::None;
                if pin_seq {
                    new.journal_seq_valid = true;
                    new.journal_seq = seq;
                }
            } else {
                if old.data_type != DataType::None && old.data_type != data_type {
                    reject = Some(Reject::TypeConflict { old: old.data_type });
                    return None;
                }
                new.data_type = data_type;
            }
            Some(new)
        });

        let Some((old, new)) = swapped else {
            return match reject {
                Some(Reject::Stale) | None => {
                    trace!(
                        target: "bfs::mark",
                        dev = ptr.dev.0,
                        bucket = b.0,
                        ptr_gen = ptr.generation.0,
                        "mark_pointer_stale"
                    );
                    Ok(())
                }
                Some(Reject::Negative { cached, current }) => Err(self.reporter.report(format!(
                    "dev {} bucket {b}: {} sectors {current} {disk_sectors:+} below zero",
                    ptr.dev,
                    if cached { "cached" } else { "dirty" }
                ))),
                Some(Reject::Overfull { used }) => Err(self.reporter.report(format!(
                    "dev {} bucket {b}: {used} sectors exceed bucket size {bucket_size}",
                    ptr.dev
                ))),
                Some(Reject::TypeConflict { old }) => Err(self.reporter.report(format!(
                    "dev {} bucket {b}: {} data in {} bucket",
                    ptr.dev,
                    data_type.as_str(),
                    old.as_str()
                ))),
            };
        };

        self.dev_usage_update(&dev, usage, old, new, slot);
        assert!(
            slot.is_gc() || !became_unavailable(old, new),
            "dev {} bucket {b} became unavailable while marking a pointer: {old:?} -> {new:?}",
            ptr.dev
        );
        Ok(())
    }

    /// Check that a stripe pointer names an alive stripe and a block that
    /// can take `disk_sectors`.
    fn check_stripe_ptr(
        &self,
        sp: &StripePtr,
        disk_sectors: i64,
        slot: UsageSlot,
    ) -> Result<StripeGeometry> {
        let stripe = self.stripes[slot]
            .get_alive(sp.idx)
            .map_err(|e| self.stripe_error(e))?;
        let geometry = stripe.geometry();
        let current = (sp.block < geometry.nr_blocks)
            .then(|| stripe.block_sectors(usize::from(sp.block)))
            .flatten()
            .ok_or_else(|| {
                self.stripe_error(StripeError::BlockOutOfRange {
                    idx: sp.idx,
                    block: sp.block,
                })
            })?;
        if current + disk_sectors < 0 {
            return Err(self.stripe_error(StripeError::BlockUnderflow {
                idx: sp.idx,
                block: sp.block,
                current,
                delta: disk_sectors,
            }));
        }
        Ok(geometry)
    }

    fn mark_stripe_ptr(
        &self,
        sp: &StripePtr,
        disk_sectors: i64,
        slot: UsageSlot,
        adjusted: &mut i64,
    ) -> Result<()> {
        let (stripe, charge) = self.stripes[slot]
            .charge_stripe_block(sp.idx, sp.block, disk_sectors)
            .map_err(|e| self.stripe_error(e))?;
        *adjusted += stripe.geometry().parity_sectors(disk_sectors);
        trace!(
            target: "bfs::mark",
            stripe = sp.idx.0,
            block = sp.block,
            old = charge.old,
            new = charge.new,
            "stripe_block_charge"
        );
        Ok(())
    }

    fn stripe_error(&self, e: StripeError) -> BfsError {
        match e {
            StripeError::Busy {
                idx,
                blocks_nonempty,
            } => BfsError::StripeBusy {
                idx: idx.0,
                blocks_nonempty: blocks_nonempty.max(0).unsigned_abs(),
            },
            other => self.reporter.report(other.to_string()),
        }
    }

    fn mark_stripe(
        &self,
        idx: StripeIdx,
        key: &StripeKey,
        inserting: bool,
        slot: UsageSlot,
        usage: &mut FsUsage,
        flags: MarkFlags,
    ) -> Result<()> {
        let table = &self.stripes[slot];
        let geometry = StripeGeometry {
            sectors: key.sectors,
            algorithm: key.algorithm,
            nr_blocks: key.nr_blocks,
            nr_redundant: key.nr_redundant,
        };
        let blocks = &key.ptrs[..key.ptrs.len().min(usize::from(key.nr_blocks))];
        let alive = table.get_alive(idx).is_ok();
        if inserting && alive {
            return Err(self.stripe_error(StripeError::AlreadyAlive(idx)));
        }
        if !inserting && !alive {
            return Err(self.stripe_error(StripeError::Missing(idx)));
        }
        for ptr in blocks {
            self.check_stripe_bucket(idx, ptr, inserting, slot)?;
        }
        if inserting {
            table.insert_stripe(idx, geometry)
        } else {
            table.delete_stripe(idx)
        }
        .map_err(|e| self.stripe_error(e))?;

        for ptr in blocks {
            self.bucket_set_stripe(idx, ptr, inserting, slot, usage, flags)?;
        }
        Ok(())
    }

    /// Refuse a stripe key whose block pointers could not all be flipped.
    fn check_stripe_bucket(
        &self,
        idx: StripeIdx,
        ptr: &ExtentPtr,
        enabled: bool,
        slot: UsageSlot,
    ) -> Result<()> {
        let dev = self.device(ptr.dev)?;
        let b = dev.sector_to_bucket(ptr.offset);
        let array = dev.buckets[slot].load();
        let mark = self.bucket_of(&dev, &array, b)?.mark.load();
        match stripe_flip_refusal(mark, ptr, enabled) {
            None => Ok(()),
            Some(why) => Err(self.reporter.report(format!(
                "stripe {idx}: dev {} bucket {b} {why}",
                ptr.dev
            ))),
        }
    }

    /// Set or clear the stripe flag on the bucket behind one stripe block.
    fn bucket_set_stripe(
        &self,
        idx: StripeIdx,
        ptr: &ExtentPtr,
        enabled: bool,
        slot: UsageSlot,
        usage: &mut FsUsage,
        flags: MarkFlags,
    ) -> Result<()> {
        let dev = self.device(ptr.dev)?;
        let b = dev.sector_to_bucket(ptr.offset);
        let array = dev.buckets[slot].load();
        let bucket = self.bucket_of(&dev, &array, b)?;

        let mut refusal = None;
        let swapped = bucket.mark.mutate_with(!flags.contains(MarkFlags::NOATOMIC), |old| {
            refusal = stripe_flip_refusal(old, ptr, enabled);
            refusal.is_none().then_some(BucketMark {
                stripe: enabled,
                ..old
            })
        });
        let Some((old, new)) = swapped else {
            let why = refusal.unwrap_or_else(|| "refused".to_owned());
            return Err(self.reporter.report(format!("stripe {idx}: dev {} bucket {b} {why}", ptr.dev)));
        };
        self.dev_usage_update(&dev, usage, old, new, slot);
        Ok(())
    }

    // ── Device usage derivation ─────────────────────────────────────────────

    /// Fold one bucket mark transition into device usage of `slot` and the
    /// filesystem-level bucket counters in `fs_usage`.
    pub fn dev_usage_update(
        &self,
        dev: &Device,
        fs_usage: &mut FsUsage,
        old: BucketMark,
        new: BucketMark,
        slot: UsageSlot,
    ) {
        if old.data_type != DataType::None
            && new.data_type != DataType::None
            && old.data_type != new.data_type
        {
            let _ = self.reporter.report(format!(
                "dev {}: bucket type changed {} -> {}",
                dev.idx(),
                old.data_type.as_str(),
                new.data_type.as_str()
            ));
        }

        let bucket_size = i64::from(dev.bucket_size());
        let mut d = DevUsage::default();
        for (mark, sign) in [(old, -1_i64), (new, 1)] {
            let ty = mark.bucket_type();
            if ty == DataType::None {
                continue;
            }
            if ty.is_hidden() {
                fs_usage.s.hidden += sign * bucket_size;
            }
            fs_usage.buckets[ty.index()] += sign * bucket_size;
            d.buckets[ty.index()] += sign;
        }

        d.buckets_alloc = i64::from(new.owned_by_allocator) - i64::from(old.owned_by_allocator);
        d.buckets_ec = i64::from(new.stripe) - i64::from(old.stripe);
        d.buckets_unavailable = i64::from(!new.is_available()) - i64::from(!old.is_available());

        d.sectors[old.data_type.index()] -= i64::from(old.dirty_sectors);
        d.sectors[new.data_type.index()] += i64::from(new.dirty_sectors);
        d.sectors[DataType::Cached.index()] +=
            i64::from(new.cached_sectors) - i64::from(old.cached_sectors);

        let frag_size = u16::try_from(dev.bucket_size()).unwrap_or(u16::MAX);
        d.sectors_fragmented = i64::from(new.fragmented_sectors(frag_size))
            - i64::from(old.fragmented_sectors(frag_size));

        dev.usage[slot].add(&d);

        if !slot.is_gc() && !old.is_available() && new.is_available() {
            dev.waker().wake();
        }
    }

    /// Rebuild live device usage from the bucket marks, as at mount.
    ///
    /// Live device usage must be zero beforehand; the returned delta holds
    /// the filesystem-level bucket counters and has already been added.
    pub fn dev_usage_from_buckets(&self, dev: DeviceIdx) -> Result<FsUsage> {
        let device = self.device(dev)?;
        let _lock = self.mark_lock();
        let mut fs_usage = FsUsage::default();
        let array = device.buckets[UsageSlot::Live].load();
        let mut replayed = 0_u64;
        for (_, bucket) in array.iter() {
            let mark = bucket.mark.load();
            if mark == BucketMark::default() {
                continue;
            }
            self.dev_usage_update(&device, &mut fs_usage, BucketMark::default(), mark, UsageSlot::Live);
            replayed += 1;
        }
        self.usage[UsageSlot::Live].add(&fs_usage);
        debug!(target: "bfs::mark", dev = dev.0, replayed, "dev_usage_from_buckets");
        Ok(fs_usage)
    }

    // ── Allocator-driven transitions ────────────────────────────────────────

    /// Hand an available bucket to the allocator for reuse.
    ///
    /// Bumps the generation so every pointer into the old contents becomes
    /// stale, and drops its cached sectors from usage. Returns the mark as
    /// it was before invalidation.
    pub fn invalidate_bucket(&self, dev: DeviceIdx, b: BucketIdx) -> Result<BucketMark> {
        let device = self.device(dev)?;
        let _lock = self.mark_lock();
        let array = device.buckets[UsageSlot::Live].load();
        let bucket = self.bucket_of(&device, &array, b)?;

        let swapped = bucket.mark.mutate(|old| {
            assert!(
                old.is_available(),
                "dev {dev} bucket {b}: invalidating unavailable bucket {old:?}"
            );
            Some(BucketMark {
                generation: old.generation.next(),
                data_type: DataType::None,
                owned_by_allocator: true,
                dirty_sectors: 0,
                cached_sectors: 0,
                ..old
            })
        });
        let Some((old, new)) = swapped else {
            unreachable!("invalidate transform always installs a mark");
        };

        let mut fs_usage = FsUsage::default();
        self.dev_usage_update(&device, &mut fs_usage, old, new, UsageSlot::Live);
        let cached = i64::from(old.cached_sectors);
        fs_usage.s.cached -= cached;
        fs_usage.replicas[0].data[DataType::Cached.index()] -= cached;
        self.usage[UsageSlot::Live].add(&fs_usage);

        if cached > 0 {
            trace!(
                target: "bfs::mark",
                dev = dev.0,
                bucket = b.0,
                cached,
                "invalidate_drop_cached"
            );
        }
        Ok(old)
    }

    /// Give a bucket to, or take it back from, the allocator.
    pub fn mark_alloc_bucket(
        &self,
        dev: DeviceIdx,
        b: BucketIdx,
        owned: bool,
        pos: GcPos,
        flags: MarkFlags,
    ) -> Result<()> {
        let device = self.device(dev)?;
        let _lock = self.mark_lock();
        let gc_only = flags.contains(MarkFlags::GC);
        if !gc_only {
            self.mark_alloc_bucket_slot(&device, b, owned, UsageSlot::Live)?;
        }
        if gc_only || self.gc_pos.visited(pos) {
            self.mark_alloc_bucket_slot(&device, b, owned, UsageSlot::GcShadow)?;
        }
        Ok(())
    }

    fn mark_alloc_bucket_slot(
        &self,
        device: &Device,
        b: BucketIdx,
        owned: bool,
        slot: UsageSlot,
    ) -> Result<()> {
        let array = device.buckets[slot].load();
        let bucket = self.bucket_of(device, &array, b)?;
        let swapped = bucket.mark.mutate(|old| {
            Some(BucketMark {
                owned_by_allocator: owned,
                ..old
            })
        });
        let Some((old, new)) = swapped else {
            unreachable!("ownership transform always installs a mark");
        };
        assert!(
            slot.is_gc() || owned || old.owned_by_allocator,
            "dev {} bucket {b}: releasing a bucket the allocator does not own",
            device.idx()
        );
        let mut fs_usage = FsUsage::default();
        self.dev_usage_update(device, &mut fs_usage, old, new, slot);
        self.usage[slot].add(&fs_usage);
        Ok(())
    }

    /// Charge superblock or journal sectors to a bucket.
    pub fn mark_metadata_bucket(
        &self,
        dev: DeviceIdx,
        b: BucketIdx,
        data_type: DataType,
        sectors: u16,
        pos: GcPos,
        flags: MarkFlags,
    ) -> Result<()> {
        check_metadata_type(data_type)?;
        let device = self.device(dev)?;
        let _lock = self.mark_lock();
        let gc_only = flags.contains(MarkFlags::GC);
        if !gc_only {
            self.mark_metadata_bucket_slot(&device, b, data_type, sectors, UsageSlot::Live)?;
        }
        if gc_only || self.gc_pos.visited(pos) {
            self.mark_metadata_bucket_slot(&device, b, data_type, sectors, UsageSlot::GcShadow)?;
        }
        Ok(())
    }

    fn mark_metadata_bucket_slot(
        &self,
        device: &Device,
        b: BucketIdx,
        data_type: DataType,
        sectors: u16,
        slot: UsageSlot,
    ) -> Result<()> {
        let array = device.buckets[slot].load();
        let bucket = self.bucket_of(device, &array, b)?;
        let (old, new) = metadata_transform(bucket, data_type, sectors, device.bucket_size())
            .map_err(|used| {
                self.reporter.report(format!(
                    "dev {} bucket {b}: {used} {} sectors exceed bucket size {}",
                    device.idx(),
                    data_type.as_str(),
                    device.bucket_size()
                ))
            })?;
        let mut fs_usage = FsUsage::default();
        self.dev_usage_update(device, &mut fs_usage, old, new, slot);
        fs_usage.replicas[0].data[data_type.index()] += i64::from(sectors);
        self.usage[slot].add(&fs_usage);
        Ok(())
    }
}

fn check_metadata_type(data_type: DataType) -> Result<()> {
    if data_type.is_hidden() {
        Ok(())
    } else {
        Err(BfsError::InvalidGeometry(format!(
            "metadata bucket type {} is not superblock or journal",
            data_type.as_str()
        )))
    }
}

/// Add metadata sectors to one bucket. `Err` carries the sectors the
/// bucket would have held when that exceeds `bucket_size`.
fn metadata_transform(
    bucket: &bfs_buckets::Bucket,
    data_type: DataType,
    sectors: u16,
    bucket_size: u32,
) -> std::result::Result<(BucketMark, BucketMark), u32> {
    let mut overfull = 0_u32;
    let swapped = bucket.mark.mutate(|old| {
        let dirty_sectors = checked_sector_add(old.dirty_sectors, i64::from(sectors))?;
        let new = BucketMark {
            data_type,
            dirty_sectors,
            ..old
        };
        if new.sectors_used() > bucket_size {
            overfull = new.sectors_used();
            return None;
        }
        Some(new)
    });
    swapped.ok_or(overfull)
}

/// Charge superblock or journal sectors on a bare array, before the device
/// is attached to a filesystem. No usage is recorded.
pub fn mark_metadata_bucket_unlocked(
    array: &BucketArray,
    b: BucketIdx,
    data_type: DataType,
    sectors: u16,
    bucket_size: u32,
) -> Result<()> {
    check_metadata_type(data_type)?;
    let bucket = array.get(b).ok_or_else(|| {
        BfsError::InvalidGeometry(format!("bucket {b} beyond {} buckets", array.nbuckets()))
    })?;
    metadata_transform(bucket, data_type, sectors, bucket_size).map_err(|used| {
        BfsError::InvalidGeometry(format!(
            "bucket {b}: {used} {} sectors exceed bucket size {bucket_size}",
            data_type.as_str()
        ))
    })?;
    Ok(())
}
