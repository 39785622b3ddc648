//! Usage counter records.
//!
//! Every record is a flat set of signed 64-bit counters. The same type
//! serves as a per-shard accumulator, a summed snapshot and a transaction
//! delta; negative values are legal in deltas and transiently in single
//! shards, never in a summed snapshot of a consistent filesystem.

use crate::factor::ReserveFactor;
use bfs_types::{DataType, REPLICAS_MAX};
use serde::{Deserialize, Serialize};

/// Flat view of a counter record, so [`PerCpu`](crate::PerCpu) can shard
/// any record without knowing its fields.
pub trait UsageCounters: Default + Clone {
    /// Number of counters `visit` yields.
    const COUNTERS: usize;

    /// Visit every counter in a fixed order.
    fn visit(&self, f: &mut dyn FnMut(i64));

    /// Visit every counter mutably, in the same order as [`visit`](Self::visit).
    fn visit_mut(&mut self, f: &mut dyn FnMut(&mut i64));

    /// Field-wise addition.
    fn merge(&mut self, other: &Self) {
        let mut values = Vec::with_capacity(Self::COUNTERS);
        other.visit(&mut |v| values.push(v));
        let mut it = values.into_iter();
        self.visit_mut(&mut |c| *c += it.next().unwrap_or(0));
    }

    #[must_use]
    fn is_zero(&self) -> bool {
        let mut zero = true;
        self.visit(&mut |v| zero &= v == 0);
        zero
    }
}

// ── Filesystem usage ────────────────────────────────────────────────────────

/// Scalar totals that the reservation allocator and `statfs` read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsUsageSummary {
    /// Superblock and journal buckets.
    pub hidden: i64,
    /// Dirty data of every type, erasure-coded data included.
    pub data: i64,
    pub cached: i64,
    /// Persistent reservations.
    pub reserved: i64,
    /// Sectors held by in-flight reservations.
    pub online_reserved: i64,
    pub nr_inodes: i64,
}

/// Sectors stored with a given replica count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicasUsage {
    pub data: [i64; DataType::COUNT],
    /// Erasure-coded data, indexed by redundancy rather than copies.
    pub ec_data: i64,
    pub persistent_reserved: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsUsage {
    pub s: FsUsageSummary,
    /// Index `r - 1` holds data stored with `r` replicas.
    pub replicas: [ReplicasUsage; REPLICAS_MAX],
    /// Sectors of whole buckets, by bucket type.
    pub buckets: [i64; DataType::COUNT],
}

impl FsUsage {
    /// Sectors this delta adds to committed usage; what a reservation must
    /// have covered.
    #[must_use]
    pub fn added_sectors(&self) -> i64 {
        self.s.data + self.s.reserved
    }

    /// `hidden + data + reserve_factor(reserved + online_reserved)`.
    #[must_use]
    pub fn sectors_used(&self, factor: ReserveFactor) -> u64 {
        let reserved = (self.s.reserved + self.s.online_reserved).max(0).unsigned_abs();
        (self.s.hidden + self.s.data).max(0).unsigned_abs() + factor.reserve(reserved)
    }
}

impl UsageCounters for FsUsage {
    const COUNTERS: usize = 6 + REPLICAS_MAX * (DataType::COUNT + 2) + DataType::COUNT;

    fn visit(&self, f: &mut dyn FnMut(i64)) {
        let s = &self.s;
        for v in [s.hidden, s.data, s.cached, s.reserved, s.online_reserved, s.nr_inodes] {
            f(v);
        }
        for r in &self.replicas {
            r.data.iter().for_each(|v| f(*v));
            f(r.ec_data);
            f(r.persistent_reserved);
        }
        self.buckets.iter().for_each(|v| f(*v));
    }

    fn visit_mut(&mut self, f: &mut dyn FnMut(&mut i64)) {
        let s = &mut self.s;
        for v in [
            &mut s.hidden,
            &mut s.data,
            &mut s.cached,
            &mut s.reserved,
            &mut s.online_reserved,
            &mut s.nr_inodes,
        ] {
            f(v);
        }
        for r in &mut self.replicas {
            r.data.iter_mut().for_each(&mut *f);
            f(&mut r.ec_data);
            f(&mut r.persistent_reserved);
        }
        self.buckets.iter_mut().for_each(f);
    }
}

// ── Device usage ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevUsage {
    /// Bucket counts by bucket type (cached-only buckets count as cached).
    pub buckets: [i64; DataType::COUNT],
    pub buckets_alloc: i64,
    pub buckets_ec: i64,
    pub buckets_unavailable: i64,
    /// Dirty sectors by data type; the `Cached` slot holds cached sectors.
    pub sectors: [i64; DataType::COUNT],
    pub sectors_fragmented: i64,
}

impl DevUsage {
    /// Buckets the allocator could still hand out, of `usable` total.
    #[must_use]
    pub fn buckets_available(&self, usable: u64) -> u64 {
        usable.saturating_sub(self.buckets_unavailable.max(0).unsigned_abs())
    }

    #[must_use]
    pub fn buckets_of(&self, ty: DataType) -> i64 {
        self.buckets[ty.index()]
    }

    #[must_use]
    pub fn sectors_of(&self, ty: DataType) -> i64 {
        self.sectors[ty.index()]
    }
}

impl UsageCounters for DevUsage {
    const COUNTERS: usize = 2 * DataType::COUNT + 4;

    fn visit(&self, f: &mut dyn FnMut(i64)) {
        self.buckets.iter().for_each(|v| f(*v));
        f(self.buckets_alloc);
        f(self.buckets_ec);
        f(self.buckets_unavailable);
        self.sectors.iter().for_each(|v| f(*v));
        f(self.sectors_fragmented);
    }

    fn visit_mut(&mut self, f: &mut dyn FnMut(&mut i64)) {
        self.buckets.iter_mut().for_each(&mut *f);
        f(&mut self.buckets_alloc);
        f(&mut self.buckets_ec);
        f(&mut self.buckets_unavailable);
        self.sectors.iter_mut().for_each(&mut *f);
        f(&mut self.sectors_fragmented);
    }
}

/// `statfs`-style summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsUsageShort {
    /// Capacity minus hidden sectors.
    pub capacity: u64,
    pub used: u64,
    pub nr_inodes: u64,
}

impl FsUsageShort {
    #[must_use]
    pub fn from_usage(capacity: u64, usage: &FsUsage, factor: ReserveFactor) -> Self {
        let s = &usage.s;
        let capacity = capacity.saturating_sub(s.hidden.max(0).unsigned_abs());
        let reserved = (s.reserved + s.online_reserved).max(0).unsigned_abs();
        let used = (s.data.max(0).unsigned_abs() + factor.reserve(reserved)).min(capacity);
        Self {
            capacity,
            used,
            nr_inodes: s.nr_inodes.max(0).unsigned_abs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn count<T: UsageCounters>(t: &T) -> usize {
        let mut n = 0;
        t.visit(&mut |_| n += 1);
        n
    }

    #[test]
    fn counter_counts_match_visit() {
        assert_eq!(count(&FsUsage::default()), FsUsage::COUNTERS);
        assert_eq!(count(&DevUsage::default()), DevUsage::COUNTERS);
        let mut mutable = 0;
        FsUsage::default().visit_mut(&mut |_| mutable += 1);
        assert_eq!(mutable, FsUsage::COUNTERS);
    }

    #[test]
    fn merge_is_fieldwise() {
        let mut a = FsUsage::default();
        a.s.data = 10;
        a.replicas[1].data[DataType::User.index()] = 10;
        a.buckets[DataType::Journal.index()] = 512;
        let mut b = FsUsage::default();
        b.s.data = -4;
        b.replicas[1].data[DataType::User.index()] = -4;
        b.replicas[3].ec_data = 7;
        a.merge(&b);
        assert_eq!(a.s.data, 6);
        assert_eq!(a.replicas[1].data[DataType::User.index()], 6);
        assert_eq!(a.replicas[3].ec_data, 7);
        assert_eq!(a.buckets[DataType::Journal.index()], 512);
        assert!(!a.is_zero());
        assert!(FsUsage::default().is_zero());
    }

    #[test]
    fn sectors_used_inflates_only_reservations() {
        let mut u = FsUsage::default();
        u.s.hidden = 100;
        u.s.data = 1000;
        u.s.reserved = 64;
        u.s.online_reserved = 64;
        assert_eq!(u.sectors_used(ReserveFactor::default()), 100 + 1000 + 128 + 2);
        assert_eq!(u.sectors_used(ReserveFactor::NONE), 100 + 1000 + 128);
    }

    #[test]
    fn short_usage_caps_used_at_capacity() {
        let mut u = FsUsage::default();
        u.s.hidden = 200;
        u.s.data = 900;
        u.s.nr_inodes = 3;
        let short = FsUsageShort::from_usage(1000, &u, ReserveFactor::NONE);
        assert_eq!(short.capacity, 800);
        assert_eq!(short.used, 800);
        assert_eq!(short.nr_inodes, 3);
    }

    #[test]
    fn dev_usage_available_buckets() {
        let d = DevUsage {
            buckets_unavailable: 30,
            ..DevUsage::default()
        };
        assert_eq!(d.buckets_available(100), 70);
        assert_eq!(d.buckets_available(10), 0);
    }

    #[test]
    fn usage_snapshot_serializes() {
        let mut u = FsUsage::default();
        u.s.nr_inodes = 5;
        let json = serde_json::to_string(&u).unwrap();
        let back: FsUsage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, u);
    }
}
