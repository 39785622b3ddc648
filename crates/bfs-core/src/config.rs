//! Filesystem and device configuration.

use bfs_error::{BfsError, Result};
use bfs_types::DeviceIdx;
use bfs_usage::{ReserveFactor, resolve_shards};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for the accounting core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Usage counter shards (0 = one per available core, capped at 64).
    pub shards: usize,
    /// Sectors charged per B-tree node pointer.
    pub btree_node_size: u32,
    /// Extra sectors a shard grabs from the global pool on a cache miss.
    pub sectors_cache: u64,
    /// Reserve amplification is `1 / 2^shift`; 0 disables it.
    pub reserve_factor_shift: u32,
    /// Minimum gap between two logged inconsistency reports.
    pub inconsistency_log_interval_ms: u64,
    /// Journal sequences between two bucket sequence cleanups.
    pub journal_seq_cleanup_interval: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            shards: 0,
            btree_node_size: 512,
            sectors_cache: 1024,
            reserve_factor_shift: 6,
            inconsistency_log_interval_ms: 1000,
            journal_seq_cleanup_interval: 1 << 14,
        }
    }
}

impl CoreConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| BfsError::InvalidGeometry(format!("config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.btree_node_size == 0 {
            return Err(BfsError::InvalidGeometry("btree_node_size=0".into()));
        }
        if self.reserve_factor_shift > 32 {
            return Err(BfsError::InvalidGeometry(format!(
                "reserve_factor_shift={} exceeds 32",
                self.reserve_factor_shift
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn resolved_shards(&self) -> usize {
        resolve_shards(self.shards)
    }

    #[must_use]
    pub fn reserve_factor(&self) -> ReserveFactor {
        ReserveFactor::new(self.reserve_factor_shift)
    }

    #[must_use]
    pub fn inconsistency_log_interval(&self) -> Duration {
        Duration::from_millis(self.inconsistency_log_interval_ms)
    }
}

/// Geometry of one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub idx: DeviceIdx,
    pub nbuckets: u64,
    /// Buckets below this hold the superblock and are not counted as capacity.
    pub first_bucket: u64,
    /// Sectors per bucket.
    pub bucket_size: u32,
    /// B-tree nodes the btree free-list reserve must be able to hold.
    #[serde(default = "default_btree_node_reserve")]
    pub btree_node_reserve: u32,
}

fn default_btree_node_reserve() -> u32 {
    8
}

impl DeviceConfig {
    #[must_use]
    pub fn new(idx: u32, nbuckets: u64, bucket_size: u32) -> Self {
        Self {
            idx: DeviceIdx(idx),
            nbuckets,
            first_bucket: 0,
            bucket_size,
            btree_node_reserve: default_btree_node_reserve(),
        }
    }

    #[must_use]
    pub fn with_first_bucket(mut self, first_bucket: u64) -> Self {
        self.first_bucket = first_bucket;
        self
    }

    /// Bucket sizes must fit the 16-bit per-bucket sector counters.
    pub fn validate(&self) -> Result<()> {
        if self.bucket_size == 0 || self.bucket_size > u32::from(u16::MAX) {
            return Err(BfsError::InvalidGeometry(format!(
                "device {}: bucket_size={} out of range",
                self.idx, self.bucket_size
            )));
        }
        check_nbuckets(self, self.nbuckets)
    }

    /// Sectors of usable capacity at `nbuckets`.
    #[must_use]
    pub fn capacity_at(&self, nbuckets: u64) -> u64 {
        nbuckets.saturating_sub(self.first_bucket) * u64::from(self.bucket_size)
    }

    #[must_use]
    pub fn bucket_to_sector(&self, b: u64) -> u64 {
        b * u64::from(self.bucket_size)
    }

    #[must_use]
    pub fn sector_to_bucket(&self, sector: u64) -> u64 {
        sector / u64::from(self.bucket_size.max(1))
    }
}

pub(crate) fn check_nbuckets(cfg: &DeviceConfig, nbuckets: u64) -> Result<()> {
    if nbuckets <= cfg.first_bucket {
        return Err(BfsError::InvalidGeometry(format!(
            "device {}: nbuckets={nbuckets} not above first_bucket={}",
            cfg.idx, cfg.first_bucket
        )));
    }
    if usize::try_from(nbuckets).is_err() {
        return Err(BfsError::InvalidGeometry(format!(
            "device {}: nbuckets={nbuckets} too large",
            cfg.idx
        )));
    }
    Ok(())
}
