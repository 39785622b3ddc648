//! Sharded accumulator over a [`UsageCounters`] record.

use crate::counters::UsageCounters;
use crate::shard::current_shard;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicI64, Ordering};

/// One record of counters per shard, summed on read.
///
/// Writers add into the shard of the calling thread with relaxed atomics
/// and never synchronize with each other. [`read`](Self::read) sums every
/// shard without a lock, so a snapshot taken while writers run may mix
/// before and after states of a single delta; use it for reporting and
/// thresholds only.
pub struct PerCpu<T> {
    shards: Box<[Box<[AtomicI64]>]>,
    _record: PhantomData<fn() -> T>,
}

impl<T: UsageCounters> PerCpu<T> {
    #[must_use]
    pub fn new(shard_count: usize) -> Self {
        let shards = (0..shard_count.max(1))
            .map(|_| (0..T::COUNTERS).map(|_| AtomicI64::new(0)).collect())
            .collect();
        Self {
            shards,
            _record: PhantomData,
        }
    }

    #[must_use]
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Add `delta` into the calling thread's shard.
    pub fn add(&self, delta: &T) {
        self.add_to_shard(current_shard(self.shards.len()), delta);
    }

    /// Add `delta` into a specific shard (out of range wraps).
    pub fn add_to_shard(&self, shard: usize, delta: &T) {
        let counters = &self.shards[shard % self.shards.len()];
        let mut i = 0;
        delta.visit(&mut |v| {
            if v != 0 {
                counters[i].fetch_add(v, Ordering::Relaxed);
            }
            i += 1;
        });
    }

    /// Sum of all shards.
    #[must_use]
    pub fn read(&self) -> T {
        let mut out = T::default();
        let mut i = 0;
        out.visit_mut(&mut |c| {
            *c = self
                .shards
                .iter()
                .map(|shard| shard[i].load(Ordering::Relaxed))
                .sum();
            i += 1;
        });
        out
    }

    /// Contents of one shard.
    #[must_use]
    pub fn read_shard(&self, shard: usize) -> T {
        let counters = &self.shards[shard % self.shards.len()];
        let mut out = T::default();
        let mut i = 0;
        out.visit_mut(&mut |c| {
            *c = counters[i].load(Ordering::Relaxed);
            i += 1;
        });
        out
    }

    /// Zero every shard. Callers exclude writers first.
    pub fn reset(&self) {
        for shard in &*self.shards {
            for c in &**shard {
                c.store(0, Ordering::Relaxed);
            }
        }
    }
}

impl<T: UsageCounters + fmt::Debug> fmt::Debug for PerCpu<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PerCpu")
            .field("shards", &self.shards.len())
            .field("sum", &self.read())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counters::{DevUsage, FsUsage};
    use bfs_types::DataType;
    use std::sync::Arc;

    #[test]
    fn read_sums_all_shards() {
        let acc = PerCpu::<DevUsage>::new(4);
        for shard in 0..4 {
            let mut d = DevUsage::default();
            d.buckets[DataType::User.index()] = 1;
            d.sectors_fragmented = i64::try_from(shard).unwrap();
            acc.add_to_shard(shard, &d);
        }
        let total = acc.read();
        assert_eq!(total.buckets_of(DataType::User), 4);
        assert_eq!(total.sectors_fragmented, 6);
        assert_eq!(acc.read_shard(2).sectors_fragmented, 2);
    }

    #[test]
    fn shard_values_may_go_negative_but_sum_balances() {
        let acc = PerCpu::<FsUsage>::new(2);
        let mut plus = FsUsage::default();
        plus.s.online_reserved = 100;
        let mut minus = FsUsage::default();
        minus.s.online_reserved = -100;
        acc.add_to_shard(0, &plus);
        acc.add_to_shard(1, &minus);
        assert_eq!(acc.read_shard(1).s.online_reserved, -100);
        assert!(acc.read().is_zero());
    }

    #[test]
    fn reset_zeroes() {
        let acc = PerCpu::<FsUsage>::new(3);
        let mut d = FsUsage::default();
        d.s.nr_inodes = 9;
        acc.add(&d);
        acc.reset();
        assert!(acc.read().is_zero());
    }

    #[test]
    fn zero_shards_rounds_up_to_one() {
        let acc = PerCpu::<DevUsage>::new(0);
        assert_eq!(acc.shard_count(), 1);
    }

    #[test]
    fn concurrent_adds_are_not_lost() {
        let acc = Arc::new(PerCpu::<FsUsage>::new(4));
        std::thread::scope(|s| {
            for _ in 0..8 {
                let acc = Arc::clone(&acc);
                s.spawn(move || {
                    let mut d = FsUsage::default();
                    d.s.data = 3;
                    d.replicas[0].data[DataType::User.index()] = 3;
                    for _ in 0..1000 {
                        acc.add(&d);
                    }
                });
            }
        });
        let total = acc.read();
        assert_eq!(total.s.data, 24_000);
        assert_eq!(total.replicas[0].data[DataType::User.index()], 24_000);
    }
}
