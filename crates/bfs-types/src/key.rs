//! Decoded storage keys as seen by the marking engine.
//!
//! The B-tree layer decodes on-disk keys into these variants before handing
//! them to marking; nothing here knows about the on-disk encoding.

use crate::{BucketGen, DeviceIdx, StripeIdx};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompressionType {
    #[default]
    None,
    Lz4,
    Gzip,
    Zstd,
}

/// Checksum/compression descriptor attached to an extent pointer.
///
/// `uncompressed_size` is the logical size the compressed payload expands
/// to; `live_size` is how much of it is still referenced by the key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CrcInfo {
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub live_size: u32,
    pub compression: CompressionType,
}

impl CrcInfo {
    /// Descriptor for an uncompressed extent of `live_size` sectors.
    #[must_use]
    pub fn uncompressed(live_size: u32) -> Self {
        Self {
            compressed_size: live_size,
            uncompressed_size: live_size,
            live_size,
            compression: CompressionType::None,
        }
    }

    #[must_use]
    pub fn is_compressed(&self) -> bool {
        self.compression != CompressionType::None
    }

    /// On-disk sectors needed to hold `live` logical sectors of this extent.
    #[must_use]
    pub fn disk_sectors(&self, live: u64) -> u64 {
        if !self.is_compressed() || self.uncompressed_size == 0 {
            return live;
        }
        (live * u64::from(self.compressed_size)).div_ceil(u64::from(self.uncompressed_size))
    }
}

/// Reference from an extent pointer into an erasure-coded stripe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StripePtr {
    pub idx: StripeIdx,
    pub block: u8,
    pub redundancy: u8,
}

/// One physical copy of an extent (or B-tree node) on a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentPtr {
    pub dev: DeviceIdx,
    /// Sector offset on the device.
    pub offset: u64,
    /// Bucket generation valid when the pointer was written.
    pub generation: BucketGen,
    pub cached: bool,
    pub crc: CrcInfo,
    pub ec: Vec<StripePtr>,
}

impl ExtentPtr {
    /// Plain, uncompressed, non-erasure-coded pointer.
    #[must_use]
    pub fn new(dev: DeviceIdx, offset: u64, generation: BucketGen) -> Self {
        Self {
            dev,
            offset,
            generation,
            cached: false,
            crc: CrcInfo::default(),
            ec: Vec::new(),
        }
    }

    #[must_use]
    pub fn cached(mut self) -> Self {
        self.cached = true;
        self
    }

    #[must_use]
    pub fn with_crc(mut self, crc: CrcInfo) -> Self {
        self.crc = crc;
        self
    }

    #[must_use]
    pub fn with_stripe(mut self, ptr: StripePtr) -> Self {
        self.ec.push(ptr);
        self
    }

    /// Disk sectors this pointer currently occupies.
    #[must_use]
    pub fn disk_sectors(&self) -> u64 {
        self.crc.disk_sectors(u64::from(self.crc.live_size))
    }

    /// Disk-sector change caused by changing the key's live length by
    /// `delta` logical sectors.
    ///
    /// A positive delta describes a new extent of that size. A negative
    /// delta shrinks the current live size; `None` if it would shrink
    /// below zero.
    #[must_use]
    #[expect(clippy::cast_possible_wrap)]
    pub fn disk_sectors_delta(&self, delta: i64) -> Option<i64> {
        if delta >= 0 {
            return Some(self.crc.disk_sectors(delta.unsigned_abs()) as i64);
        }
        let live = u64::from(self.crc.live_size);
        let remaining = live.checked_sub(delta.unsigned_abs())?;
        Some(self.crc.disk_sectors(remaining) as i64 - self.disk_sectors() as i64)
    }
}

/// Stripe descriptor carried by a stripe key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StripeKey {
    pub sectors: u16,
    pub algorithm: u8,
    pub nr_blocks: u8,
    pub nr_redundant: u8,
    /// One pointer per block, data blocks first.
    pub ptrs: Vec<ExtentPtr>,
}

/// Closed set of key variants that affect space accounting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageKey {
    /// Pointer to a B-tree node; each pointer accounts a whole node.
    BtreePtr { ptrs: Vec<ExtentPtr> },
    /// User data extent.
    Extent { ptrs: Vec<ExtentPtr> },
    /// Erasure-coded stripe, keyed by its index.
    Stripe { idx: StripeIdx, stripe: StripeKey },
    /// Persistent reservation (fallocate) without allocated data.
    Reservation { nr_replicas: u8 },
    /// Allocation info for an inode; only moves the inode counter.
    AllocInfo,
    /// Whiteouts and other keys that carry no space.
    Deleted,
}

impl StorageKey {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::BtreePtr { .. } => "btree_ptr",
            Self::Extent { .. } => "extent",
            Self::Stripe { .. } => "stripe",
            Self::Reservation { .. } => "reservation",
            Self::AllocInfo => "alloc",
            Self::Deleted => "deleted",
        }
    }
}
