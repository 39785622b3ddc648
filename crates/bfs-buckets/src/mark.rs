//! Packed per-bucket state word and its compare-and-swap transform.
//!
//! # Bucket states
//!
//! A bucket is in exactly one state, checked in this order:
//!
//! | State | Condition |
//! |-------|-----------|
//! | free | not allocator-owned, no sectors, no metadata type |
//! | allocator | `owned_by_allocator` (on a free list or open for writes) |
//! | dirty | `dirty_sectors > 0` |
//! | cached | `cached_sectors > 0` |
//! | metadata | superblock, journal or btree type with no sectors counted |
//!
//! Generation and journal-sequence fields do not participate: a bucket that
//! was invalidated, filled and emptied again is free even though its
//! generation moved on.
//!
//! # Layout
//!
//! ```text
//!  63        48 47        32 31        16 15 14 13 12 11 10   8 7      0
//! +------------+------------+------------+--+--+--+--+--+------+--------+
//! | journal_seq|   cached   |   dirty    |  |  |jv|st|al| type |  gen   |
//! +------------+------------+------------+--+--+--+--+--+------+--------+
//! ```

use bfs_types::{BucketGen, DataType};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

const GEN_MASK: u64 = 0xff;
const TYPE_SHIFT: u32 = 8;
const TYPE_MASK: u64 = 0x7;
const OWNED_BIT: u64 = 1 << 11;
const STRIPE_BIT: u64 = 1 << 12;
const JOURNAL_SEQ_VALID_BIT: u64 = 1 << 13;
const DIRTY_SHIFT: u32 = 16;
const CACHED_SHIFT: u32 = 32;
const JOURNAL_SEQ_SHIFT: u32 = 48;

/// Decoded view of one bucket's state word.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct BucketMark {
    pub generation: BucketGen,
    pub data_type: DataType,
    pub owned_by_allocator: bool,
    pub stripe: bool,
    pub journal_seq_valid: bool,
    pub dirty_sectors: u16,
    pub cached_sectors: u16,
    pub journal_seq: u16,
}

/// Derived, mutually exclusive bucket state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BucketState {
    Free,
    Allocator,
    Dirty,
    Cached,
    Metadata,
}

impl BucketMark {
    #[must_use]
    pub fn to_raw(self) -> u64 {
        let mut raw = u64::from(self.generation.0);
        raw |= (self.data_type as u64 & TYPE_MASK) << TYPE_SHIFT;
        if self.owned_by_allocator {
            raw |= OWNED_BIT;
        }
        if self.stripe {
            raw |= STRIPE_BIT;
        }
        if self.journal_seq_valid {
            raw |= JOURNAL_SEQ_VALID_BIT;
        }
        raw |= u64::from(self.dirty_sectors) << DIRTY_SHIFT;
        raw |= u64::from(self.cached_sectors) << CACHED_SHIFT;
        raw |= u64::from(self.journal_seq) << JOURNAL_SEQ_SHIFT;
        raw
    }

    #[must_use]
    #[expect(clippy::cast_possible_truncation)] // every field is masked first
    pub fn from_raw(raw: u64) -> Self {
        Self {
            generation: BucketGen((raw & GEN_MASK) as u8),
            data_type: DataType::from_bits(((raw >> TYPE_SHIFT) & TYPE_MASK) as u8)
                .unwrap_or_default(),
            owned_by_allocator: raw & OWNED_BIT != 0,
            stripe: raw & STRIPE_BIT != 0,
            journal_seq_valid: raw & JOURNAL_SEQ_VALID_BIT != 0,
            dirty_sectors: (raw >> DIRTY_SHIFT) as u16,
            cached_sectors: (raw >> CACHED_SHIFT) as u16,
            journal_seq: (raw >> JOURNAL_SEQ_SHIFT) as u16,
        }
    }

    #[must_use]
    pub fn sectors_used(self) -> u32 {
        u32::from(self.dirty_sectors) + u32::from(self.cached_sectors)
    }

    #[must_use]
    pub fn state(self) -> BucketState {
        if self.owned_by_allocator {
            BucketState::Allocator
        } else if self.dirty_sectors > 0 {
            BucketState::Dirty
        } else if self.cached_sectors > 0 {
            BucketState::Cached
        } else if self.data_type.is_metadata() {
            BucketState::Metadata
        } else {
            BucketState::Free
        }
    }

    /// A bucket the allocator may take: not owned, no dirty data, not
    /// pinned by a stripe. Cached-only buckets are available.
    #[must_use]
    pub fn is_available(self) -> bool {
        !self.owned_by_allocator && self.dirty_sectors == 0 && !self.stripe
    }

    /// Type under which the bucket is counted: cached-only buckets count as
    /// cached regardless of the type they were written with.
    #[must_use]
    pub fn bucket_type(self) -> DataType {
        if self.cached_sectors > 0 && self.dirty_sectors == 0 {
            DataType::Cached
        } else {
            self.data_type
        }
    }

    /// Free space inside a partially filled user bucket.
    #[must_use]
    pub fn fragmented_sectors(self, bucket_size: u16) -> u32 {
        if !self.owned_by_allocator && self.data_type == DataType::User && self.sectors_used() > 0
        {
            u32::from(bucket_size).saturating_sub(self.sectors_used())
        } else {
            0
        }
    }

    /// `true` while the journal entry that emptied this bucket is not yet
    /// on disk, so the bucket must not be reused.
    #[must_use]
    #[expect(clippy::cast_possible_wrap)]
    pub fn needs_journal_commit(self, last_seq_ondisk: u16) -> bool {
        self.journal_seq_valid && (self.journal_seq.wrapping_sub(last_seq_ondisk) as i16) > 0
    }
}

/// Apply a signed delta to a 16-bit sector counter.
///
/// Returns `None` if the result would be negative. A result above
/// `u16::MAX` means the accounting itself is broken and panics.
#[must_use]
pub fn checked_sector_add(current: u16, delta: i64) -> Option<u16> {
    let sum = i64::from(current).saturating_add(delta);
    if sum < 0 {
        return None;
    }
    match u16::try_from(sum) {
        Ok(v) => Some(v),
        Err(_) => panic!("bucket sector counter overflow: {current} + {delta}"),
    }
}

// ── Atomic cell ─────────────────────────────────────────────────────────────

/// Lock-free storage for a [`BucketMark`].
#[derive(Debug, Default)]
pub struct AtomicBucketMark(AtomicU64);

impl AtomicBucketMark {
    #[must_use]
    pub fn new(mark: BucketMark) -> Self {
        Self(AtomicU64::new(mark.to_raw()))
    }

    #[must_use]
    pub fn load(&self) -> BucketMark {
        BucketMark::from_raw(self.0.load(Ordering::Acquire))
    }

    /// Overwrite the mark. Only for callers with exclusive access.
    pub fn store(&self, mark: BucketMark) {
        self.0.store(mark.to_raw(), Ordering::Release);
    }

    /// Read, transform, compare-and-swap; retry until the swap lands.
    ///
    /// The transform sees the current mark and returns the replacement, or
    /// `None` to leave the bucket untouched (stale pointer, rejected
    /// update). It may run several times and must not have side effects
    /// beyond recording why it declined.
    ///
    /// Returns `(old, new)` as installed, or `None` if the transform declined.
    pub fn mutate<F>(&self, mut transform: F) -> Option<(BucketMark, BucketMark)>
    where
        F: FnMut(BucketMark) -> Option<BucketMark>,
    {
        let mut current = self.0.load(Ordering::Acquire);
        let mut retries = 0_u32;
        loop {
            let old = BucketMark::from_raw(current);
            let new = transform(old)?;
            match self.0.compare_exchange_weak(
                current,
                new.to_raw(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    if retries > 0 {
                        trace!(target: "bfs::buckets", retries, "bucket_cas_contended");
                    }
                    return Some((old, new));
                }
                Err(observed) => {
                    retries += 1;
                    current = observed;
                }
            }
        }
    }

    /// Same contract as [`mutate`](Self::mutate) without the CAS, for
    /// rebuild paths where nothing else can touch the bucket.
    pub fn mutate_nonatomic<F>(&self, transform: F) -> Option<(BucketMark, BucketMark)>
    where
        F: FnOnce(BucketMark) -> Option<BucketMark>,
    {
        let old = self.load();
        let new = transform(old)?;
        self.store(new);
        Some((old, new))
    }

    /// Dispatch to [`mutate`](Self::mutate) or
    /// [`mutate_nonatomic`](Self::mutate_nonatomic).
    pub fn mutate_with<F>(&self, atomic: bool, transform: F) -> Option<(BucketMark, BucketMark)>
    where
        F: FnMut(BucketMark) -> Option<BucketMark>,
    {
        if atomic {
            self.mutate(transform)
        } else {
            self.mutate_nonatomic(transform)
        }
    }
}
