//! Disk reservations: admission control over the free-sector budget.
//!
//! Free space is a global atomic counter plus a small per-shard slice
//! already taken from it. A reservation is normally served from the
//! caller's slice, refilled from the global counter with a
//! compare-and-swap; neither step blocks. Only when the global counter runs
//! dry does the caller take the locks and recompute free space from usage.
//!
//! Granted sectors are carried as `online_reserved` usage until the
//! transaction commits ([`Filesystem::fs_usage_apply`] converts them into
//! real usage) or gives them back ([`Filesystem::disk_reservation_put`]).

use crate::fs::{Filesystem, MarkLock};
use bfs_error::{BfsError, Result};
use bfs_types::GcPos;
use bfs_usage::{FsUsage, UsageSlot, current_shard};
use std::sync::atomic::Ordering;
use tracing::{debug, trace, warn};

/// Sectors borrowed from the free-space budget by one transaction.
///
/// Return it with [`Filesystem::disk_reservation_put`] or consume it through
/// [`Filesystem::fs_usage_apply`]; dropping a non-empty reservation leaks
/// its sectors as `online_reserved` until the next recalculation.
#[derive(Debug, Default, PartialEq, Eq)]
#[must_use = "a reservation must be put back or applied"]
pub struct DiskReservation {
    sectors: u64,
    nr_replicas: u8,
}

impl DiskReservation {
    pub fn new(nr_replicas: u8) -> Self {
        Self {
            sectors: 0,
            nr_replicas,
        }
    }

    #[must_use]
    pub fn sectors(&self) -> u64 {
        self.sectors
    }

    #[must_use]
    pub fn nr_replicas(&self) -> u8 {
        self.nr_replicas
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ReservationFlags(u32);

impl ReservationFlags {
    pub const NONE: Self = Self(0);
    /// Grant even past free space. For writes that cannot fail.
    pub const NOFAIL: Self = Self(1 << 0);
    /// Caller already holds the GC lock.
    pub const GC_LOCK_HELD: Self = Self(1 << 1);
    /// Caller holds B-tree locks; blocking on the GC lock could deadlock,
    /// so fail with `Retry` instead.
    pub const BTREE_LOCKS_HELD: Self = Self(1 << 2);

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }
}

impl std::ops::BitOr for ReservationFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

fn online_reserved_delta(sectors: i64) -> FsUsage {
    let mut d = FsUsage::default();
    d.s.online_reserved = sectors;
    d
}

fn signed(sectors: u64) -> i64 {
    i64::try_from(sectors).unwrap_or(i64::MAX)
}

impl Filesystem {
    /// Free sectors not yet handed out, including per-shard slices.
    #[must_use]
    pub fn sectors_available(&self) -> u64 {
        self.sectors_available.load(Ordering::Acquire)
            + self
                .pcpu_sectors
                .iter()
                .map(|c| c.load(Ordering::Acquire))
                .sum::<u64>()
    }

    /// Add `sectors` to `res`, or fail with `NoSpace`.
    pub fn disk_reservation_add(
        &self,
        res: &mut DiskReservation,
        sectors: u64,
        flags: ReservationFlags,
    ) -> Result<()> {
        if let Some(_guard) = self.mark_lock.try_read() {
            if self.try_reserve_fast(sectors) {
                self.usage[UsageSlot::Live].add(&online_reserved_delta(signed(sectors)));
                res.sectors += sectors;
                trace!(target: "bfs::reserve", sectors, "reserve_fast");
                return Ok(());
            }
        }
        self.reserve_slow(res, sectors, flags)
    }

    /// Debit the calling shard's slice, refilling it from the global
    /// counter if needed. Never blocks.
    fn try_reserve_fast(&self, sectors: u64) -> bool {
        let cache = &self.pcpu_sectors[current_shard(self.pcpu_sectors.len())];
        if cache
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(sectors))
            .is_ok()
        {
            return true;
        }

        let want = sectors.saturating_add(self.config.sectors_cache);
        let claimed = self
            .sectors_available
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |old| {
                let get = want.min(old);
                (get >= sectors).then(|| old - get)
            });
        match claimed {
            Ok(old) => {
                let refill = want.min(old) - sectors;
                if refill > 0 {
                    cache.fetch_add(refill, Ordering::AcqRel);
                }
                true
            }
            Err(_) => false,
        }
    }

    fn reserve_slow(
        &self,
        res: &mut DiskReservation,
        sectors: u64,
        flags: ReservationFlags,
    ) -> Result<()> {
        let _gc_guard = if flags.contains(ReservationFlags::GC_LOCK_HELD) {
            None
        } else if flags.contains(ReservationFlags::BTREE_LOCKS_HELD) {
            Some(self.gc_lock.try_read().ok_or(BfsError::Retry)?)
        } else {
            Some(self.gc_lock.read())
        };
        let _mark_guard = self.mark_lock.write();

        let available = self.recalc_sectors_available();
        let nofail = flags.contains(ReservationFlags::NOFAIL);
        if sectors <= available || nofail {
            if sectors > available {
                warn!(
                    target: "bfs::reserve",
                    sectors,
                    available,
                    "reserve_overcommit_nofail"
                );
            }
            self.sectors_available
                .store(available.saturating_sub(sectors), Ordering::Release);
            self.usage[UsageSlot::Live].add(&online_reserved_delta(signed(sectors)));
            res.sectors += sectors;
            debug!(target: "bfs::reserve", sectors, available, "reserve_slow");
            Ok(())
        } else {
            self.sectors_available.store(available, Ordering::Release);
            debug!(target: "bfs::reserve", sectors, available, "reserve_enospc");
            Err(BfsError::NoSpace)
        }
    }

    /// Drain every shard slice and recompute free space from usage.
    /// Caller holds `mark_lock` exclusively.
    pub(crate) fn recalc_sectors_available(&self) -> u64 {
        for cache in &*self.pcpu_sectors {
            cache.store(0, Ordering::Release);
        }
        self.factor.avail(self.fs_sectors_free())
    }

    /// Re-seed the global counter from usage. Used after capacity changes.
    pub(crate) fn reset_sectors_available(&self) {
        let _mark_guard = self.mark_lock.write();
        let available = self.recalc_sectors_available();
        self.sectors_available.store(available, Ordering::Release);
        debug!(target: "bfs::reserve", available, "sectors_available_reset");
    }

    /// Give back whatever `res` still holds.
    pub fn disk_reservation_put(&self, res: &mut DiskReservation) {
        if res.sectors == 0 {
            return;
        }
        let _guard = self.mark_lock.read();
        self.usage[UsageSlot::Live].add(&online_reserved_delta(-signed(res.sectors)));
        trace!(target: "bfs::reserve", sectors = res.sectors, "reserve_put");
        res.sectors = 0;
    }

    /// Commit a transaction's usage delta against its reservation.
    ///
    /// Sectors the delta adds must have been reserved. Any excess is a
    /// caller bug: it is logged once and taken from the free-space budget so
    /// accounting stays whole. The consumed part of the reservation moves
    /// from `online_reserved` into real usage. The delta is then added to
    /// the live view, and to the shadow view if the GC scan has passed
    /// `pos`. `delta` is left zeroed.
    pub fn fs_usage_apply(
        &self,
        lock: &MarkLock<'_>,
        delta: &mut FsUsage,
        res: Option<&mut DiskReservation>,
        pos: GcPos,
    ) {
        debug_assert!(std::ptr::eq(lock.fs, self), "usage lock of another filesystem");
        let reserved = res.as_ref().map_or(0, |r| signed(r.sectors));
        let mut added = delta.added_sectors();
        let excess = added - reserved;

        if excess > 0 {
            if !self.warned_unreserved.swap(true, Ordering::Relaxed) {
                warn!(
                    target: "bfs::reserve",
                    added,
                    reserved,
                    excess,
                    "usage_increased_without_reservation"
                );
            }
            let excess = excess.unsigned_abs();
            let _ = self
                .sectors_available
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                    Some(v.saturating_sub(excess))
                });
            added = reserved;
        }

        if added > 0 {
            if let Some(res) = res {
                res.sectors -= added.unsigned_abs();
            }
            delta.s.online_reserved -= added;
        }

        self.usage[UsageSlot::Live].add(delta);
        if self.gc_pos.visited(pos) {
            self.usage[UsageSlot::GcShadow].add(delta);
        }
        *delta = FsUsage::default();
    }
}
