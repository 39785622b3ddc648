#![forbid(unsafe_code)]
//! BucketFS space accounting facade.
//!
//! Re-exports the accounting core through a stable external interface.
//! Allocator, copy-GC and erasure-coding layers depend on this crate.

pub use bfs_core::*;
