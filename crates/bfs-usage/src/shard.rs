//! Routing of the calling thread to a counter shard.
//!
//! Each thread takes a slot number the first time it touches a sharded
//! counter; the shard is `slot % shard_count`. Threads never move between
//! shards, so a worker pool sized to the shard count writes without
//! cross-core contention.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Upper bound on shard count regardless of machine size.
pub const MAX_SHARDS: usize = 64;

static NEXT_SLOT: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static SLOT: usize = NEXT_SLOT.fetch_add(1, Ordering::Relaxed);
}

/// Shard count for a configured value (0 = one per available core).
#[must_use]
pub fn resolve_shards(configured: usize) -> usize {
    if configured == 0 {
        std::thread::available_parallelism()
            .map_or(4, std::num::NonZeroUsize::get)
            .min(MAX_SHARDS)
    } else {
        configured.min(MAX_SHARDS)
    }
}

/// Shard owned by the calling thread among `shard_count` shards.
#[must_use]
#[inline]
pub fn current_shard(shard_count: usize) -> usize {
    if shard_count <= 1 {
        return 0;
    }
    SLOT.with(|slot| *slot % shard_count)
}
