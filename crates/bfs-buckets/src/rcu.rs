//! Read-copy-update publication of bucket arrays.
//!
//! Markers load the current array without blocking; resize builds a new
//! array and swaps it in. Readers that loaded the old array keep it alive
//! through `Arc` until their guard drops, so a marker racing a resize never
//! touches freed memory. Writers coordinate externally (the bucket lock).
//!
//! # Logging
//!
//! - **TRACE** `bfs::buckets`: `bucket_array_load`
//! - **DEBUG** `bfs::buckets`: `bucket_array_publish`

use arc_swap::ArcSwap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace};

/// A single RCU-protected value.
pub struct RcuCell<T> {
    inner: ArcSwap<T>,
    publish_count: AtomicU64,
}

impl<T: fmt::Debug> fmt::Debug for RcuCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RcuCell")
            .field("value", &*self.load_arc())
            .field("publish_count", &self.publish_count())
            .finish()
    }
}

impl<T> RcuCell<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: ArcSwap::from_pointee(value),
            publish_count: AtomicU64::new(0),
        }
    }

    /// Borrow the current value. Keep the guard short-lived.
    #[inline]
    pub fn load(&self) -> arc_swap::Guard<Arc<T>> {
        let guard = self.inner.load();
        trace!(
            target: "bfs::buckets",
            publish_count = self.publish_count.load(Ordering::Relaxed),
            "bucket_array_load"
        );
        guard
    }

    /// Take a counted reference that may outlive the call site.
    #[inline]
    pub fn load_arc(&self) -> Arc<T> {
        self.inner.load_full()
    }

    /// Publish `new_value`; returns the previous value.
    pub fn replace(&self, new_value: T) -> Arc<T> {
        self.replace_arc(Arc::new(new_value))
    }

    pub fn replace_arc(&self, new_arc: Arc<T>) -> Arc<T> {
        let old = self.inner.swap(new_arc);
        let count = self.publish_count.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(target: "bfs::buckets", publish_count = count, "bucket_array_publish");
        old
    }

    #[must_use]
    pub fn publish_count(&self) -> u64 {
        self.publish_count.load(Ordering::Relaxed)
    }
}
