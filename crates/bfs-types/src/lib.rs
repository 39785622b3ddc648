#![forbid(unsafe_code)]
//! Identifiers, data types and storage-key vocabulary shared by every
//! BucketFS accounting crate.
//!
//! Nothing here touches a lock or an atomic: these are plain values that
//! travel between the marking engine, the usage accumulators and the
//! reservation allocator.

pub mod key;

pub use key::{CompressionType, CrcInfo, ExtentPtr, StorageKey, StripeKey, StripePtr};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum number of blocks (data + parity) in one erasure-coded stripe.
pub const EC_STRIPE_MAX: usize = 16;

/// Number of replica-count buckets tracked by filesystem usage (1..=4 copies).
pub const REPLICAS_MAX: usize = 4;

/// Width of the journal sequence stored in a bucket mark.
pub const BUCKET_JOURNAL_SEQ_BITS: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceIdx(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BucketIdx(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StripeIdx(pub u64);

/// Journal sequence number as recorded by the journal (full width).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JournalSeq(pub u64);

impl JournalSeq {
    /// Truncate to the width a bucket mark can hold.
    #[must_use]
    #[expect(clippy::cast_possible_truncation)] // deliberate wraparound encoding
    pub fn to_mark_seq(self) -> u16 {
        self.0 as u16
    }
}

/// Bucket reuse counter. Wraps at 256; comparisons use serial-number
/// arithmetic so a generation is "after" another for half the ring.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct BucketGen(pub u8);

impl BucketGen {
    /// `true` if `self` is strictly newer than `other`.
    #[must_use]
    #[expect(clippy::cast_possible_wrap)]
    pub fn is_after(self, other: Self) -> bool {
        (self.0.wrapping_sub(other.0) as i8) > 0
    }

    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

/// What kind of data occupies a bucket.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum DataType {
    #[default]
    None = 0,
    Superblock = 1,
    Journal = 2,
    Btree = 3,
    User = 4,
    Cached = 5,
}

impl DataType {
    pub const COUNT: usize = 6;

    pub const ALL: [Self; Self::COUNT] = [
        Self::None,
        Self::Superblock,
        Self::Journal,
        Self::Btree,
        Self::User,
        Self::Cached,
    ];

    #[must_use]
    pub fn from_bits(bits: u8) -> Option<Self> {
        Self::ALL.get(usize::from(bits)).copied()
    }

    #[must_use]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Superblock and journal buckets are excluded from user-visible capacity.
    #[must_use]
    pub fn is_hidden(self) -> bool {
        matches!(self, Self::Superblock | Self::Journal)
    }

    #[must_use]
    pub fn is_metadata(self) -> bool {
        matches!(self, Self::Superblock | Self::Journal | Self::Btree)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Superblock => "sb",
            Self::Journal => "journal",
            Self::Btree => "btree",
            Self::User => "user",
            Self::Cached => "cached",
        }
    }
}

// ── GC position ─────────────────────────────────────────────────────────────

/// Coarse stage of a garbage-collection pass. Declaration order is the
/// order in which the scan visits them.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum GcPhase {
    #[default]
    NotRunning = 0,
    Start = 1,
    Superblock = 2,
    Btree = 3,
    Alloc = 4,
    Stripes = 5,
    Done = 6,
}

impl GcPhase {
    #[must_use]
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(Self::NotRunning),
            1 => Some(Self::Start),
            2 => Some(Self::Superblock),
            3 => Some(Self::Btree),
            4 => Some(Self::Alloc),
            5 => Some(Self::Stripes),
            6 => Some(Self::Done),
            _ => None,
        }
    }
}

/// A point in the GC traversal order: phase, then key offset, then level.
///
/// Every storage mutation carries the position of the structure it lives
/// in, so marking can tell whether the scan has already passed it.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct GcPos {
    pub phase: GcPhase,
    pub offset: u64,
    pub level: u8,
}

impl GcPos {
    pub const NOT_RUNNING: Self = Self::phase(GcPhase::NotRunning);

    #[must_use]
    pub const fn phase(phase: GcPhase) -> Self {
        Self {
            phase,
            offset: 0,
            level: 0,
        }
    }

    #[must_use]
    pub const fn btree(offset: u64, level: u8) -> Self {
        Self {
            phase: GcPhase::Btree,
            offset,
            level,
        }
    }

    #[must_use]
    pub fn is_running(self) -> bool {
        self.phase != GcPhase::NotRunning
    }
}

// ── Marking flags ───────────────────────────────────────────────────────────

/// Flags accepted by the marking entry points.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MarkFlags(u32);

impl MarkFlags {
    pub const NONE: Self = Self(0);
    /// Mark only the GC-shadow view (used by the GC scan itself).
    pub const GC: Self = Self(1 << 0);
    /// Caller has exclusive access; write marks without compare-and-swap.
    pub const NOATOMIC: Self = Self(1 << 1);

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl std::ops::BitOr for MarkFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl fmt::Display for DeviceIdx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BucketIdx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for StripeIdx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BucketGen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gen_after_handles_wraparound() {
        assert!(BucketGen(5).is_after(BucketGen(4)));
        assert!(!BucketGen(4).is_after(BucketGen(4)));
        assert!(!BucketGen(4).is_after(BucketGen(5)));
        // 2 is "after" 250 once the counter wrapped.
        assert!(BucketGen(2).is_after(BucketGen(250)));
        assert_eq!(BucketGen(255).next(), BucketGen(0));
    }

    #[test]
    fn data_type_bits_roundtrip_and_reject_unknown() {
        for ty in DataType::ALL {
            assert_eq!(DataType::from_bits(ty as u8), Some(ty));
        }
        assert_eq!(DataType::from_bits(6), None);
        assert_eq!(DataType::from_bits(7), None);
    }

    #[test]
    fn hidden_and_metadata_classification() {
        assert!(DataType::Superblock.is_hidden());
        assert!(DataType::Journal.is_hidden());
        assert!(!DataType::Btree.is_hidden());
        assert!(DataType::Btree.is_metadata());
        assert!(!DataType::User.is_metadata());
        assert!(!DataType::Cached.is_metadata());
    }

    #[test]
    fn gc_pos_orders_by_phase_then_offset_then_level() {
        let a = GcPos::btree(10, 0);
        let b = GcPos::btree(10, 1);
        let c = GcPos::btree(11, 0);
        let alloc = GcPos::phase(GcPhase::Alloc);
        assert!(a < b);
        assert!(b < c);
        assert!(c < alloc);
        assert!(GcPos::NOT_RUNNING < GcPos::phase(GcPhase::Start));
        assert!(!GcPos::NOT_RUNNING.is_running());
    }

    #[test]
    fn gc_phase_bits_roundtrip() {
        for bits in 0..=6 {
            let phase = GcPhase::from_bits(bits).unwrap();
            assert_eq!(phase as u8, bits);
        }
        assert_eq!(GcPhase::from_bits(7), None);
    }

    #[test]
    fn mark_flags_union_and_contains() {
        let flags = MarkFlags::GC | MarkFlags::NOATOMIC;
        assert!(flags.contains(MarkFlags::GC));
        assert!(flags.contains(MarkFlags::NOATOMIC));
        assert!(!MarkFlags::NONE.contains(MarkFlags::GC));
        assert!(!MarkFlags::NONE.contains(MarkFlags::NONE));
    }

    #[test]
    fn journal_seq_truncates_to_mark_width() {
        assert_eq!(JournalSeq(0x1_0005).to_mark_seq(), 5);
    }
}
