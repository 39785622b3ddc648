#![forbid(unsafe_code)]
//! Space accounting core of BucketFS.
//!
//! [`Filesystem`] owns the attached devices, their bucket arrays, the usage
//! accumulators of the live and GC-shadow views, the stripe tables, and the
//! free-space budget. Storage keys are turned into bucket-mark updates and
//! usage deltas by the marking engine; transactions borrow sectors from the
//! budget with a [`DiskReservation`] and commit their delta with
//! [`Filesystem::fs_usage_apply`].
//!
//! # Locking
//!
//! | Lock | Shared by | Exclusive for |
//! |------|-----------|---------------|
//! | `gc_lock` | reservation recalculation | GC pass, resize, detach |
//! | device `bucket_lock` | journal-sequence cleanup | resize |
//! | `mark_lock` | marking, `put`, reservation fast path (try-lock) | recalculation, resize, GC start/finish |
//!
//! Bucket marks are updated with compare-and-swap and usage with sharded
//! atomics, so marking never waits on another marker.
//!
//! # Logging
//!
//! - **TRACE** `bfs::mark`: `mark_key`, `mark_pointer_stale`, `stripe_block_charge`,
//!   `invalidate_drop_cached`
//! - **TRACE** `bfs::reserve`: `reserve_fast`, `reserve_put`
//! - **DEBUG** `bfs::reserve`: `reserve_slow`, `reserve_enospc`, `sectors_available_reset`
//! - **DEBUG** `bfs::mark`: `dev_usage_from_buckets`
//! - **DEBUG** `bfs::gc`: `gc_pos_set`
//! - **DEBUG** `bfs::core`: `filesystem_new`, `bucket_seq_cleanup`
//! - **INFO**  `bfs::resize`: `device_attach`, `device_resize`, `device_detach`
//! - **INFO**  `bfs::gc`: `gc_start`, `gc_finish`
//! - **WARN**  `bfs::reserve`: `reserve_overcommit_nofail`, `usage_increased_without_reservation`
//! - **WARN**  `bfs::resize`: `free_queue_entries_dropped`
//! - **WARN**  `bfs::gc`: `gc_fs_usage_mismatch`, `gc_dev_usage_mismatch`, `gc_abort`

pub mod config;
pub mod device;
pub mod fs;
pub mod gc;
pub mod marking;
pub mod reservation;
pub mod resize;
pub mod shadow;

pub use config::{CoreConfig, DeviceConfig};
pub use device::Device;
pub use fs::{Filesystem, MarkLock};
pub use gc::GcCursor;
pub use marking::{KeyMark, mark_metadata_bucket_unlocked};
pub use reservation::{DiskReservation, ReservationFlags};
pub use shadow::{GcPass, GcReport};

pub use bfs_buckets::{BucketMark, BucketState};
pub use bfs_error::{BfsError, Result};
pub use bfs_types::{
    BucketGen, BucketIdx, CompressionType, CrcInfo, DataType, DeviceIdx, ExtentPtr, GcPhase,
    GcPos, JournalSeq, MarkFlags, StorageKey, StripeIdx, StripeKey, StripePtr,
};
pub use bfs_usage::{DevUsage, FsUsage, FsUsageShort, UsageSlot};
