#![forbid(unsafe_code)]
//! Usage accumulators for BucketFS.
//!
//! Filesystem and device usage are kept as [`PerCpu`] records: each thread
//! adds into its own shard, readers sum all shards. Two copies exist per
//! filesystem and per device, selected by [`UsageSlot`]: the live view and
//! the shadow a GC pass rebuilds.
//!
//! # Logging
//!
//! - **DEBUG** `bfs::usage`: `usage_reset` when a slot is cleared for a GC pass

pub mod counters;
pub mod factor;
pub mod percpu;
pub mod shard;
pub mod slot;

pub use counters::{DevUsage, FsUsage, FsUsageShort, FsUsageSummary, ReplicasUsage, UsageCounters};
pub use factor::ReserveFactor;
pub use percpu::PerCpu;
pub use shard::{MAX_SHARDS, current_shard, resolve_shards};
pub use slot::{Slots, UsageSlot};

use tracing::debug;

/// Zero one slot of a two-slot accumulator pair.
pub fn reset_slot<T: UsageCounters>(slots: &Slots<PerCpu<T>>, slot: UsageSlot) {
    slots[slot].reset();
    debug!(target: "bfs::usage", slot = slot.as_str(), "usage_reset");
}
