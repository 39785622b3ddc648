#![forbid(unsafe_code)]
//! Error types for BucketFS space accounting.
//!
//! # Error Taxonomy
//!
//! Marking, usage accounting and reservation all return [`BfsError`]. Three
//! classes of failure exist:
//!
//! | Class | Handling | Example |
//! |-------|----------|---------|
//! | Filesystem inconsistency | rate-limited `error!`, operation aborts with `Inconsistent` | two data types in one bucket, pointer to a dead stripe |
//! | Ordinary resource condition | returned to caller | `NoSpace`, `Retry` |
//! | Defect that must never happen | `panic!` at the detection site | 16-bit sector overflow, double release of allocator ownership |
//!
//! Inconsistencies go through [`InconsistencyReporter`] so a corrupt image
//! that trips the same check on every key cannot flood the log.
//!
//! ## errno Mapping
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS error or `EIO` |
//! | `Inconsistent` | `EIO` |
//! | `NoSpace` | `ENOSPC` |
//! | `Retry` | `EINTR` |
//! | `NoDevice` | `ENODEV` |
//! | `InvalidGeometry` | `EINVAL` |
//! | `ShrinkBelowLive` | `EBUSY` |
//! | `StripeBusy` | `EBUSY` |

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::error;

/// Unified error type for all BucketFS accounting operations.
#[derive(Debug, Error)]
pub enum BfsError {
    /// Operating system error (thread spawn for background workers).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Accounting state contradicts itself; the operation was not applied.
    #[error("filesystem inconsistency: {0}")]
    Inconsistent(String),

    /// Reservation could not be satisfied from the available-sector budget.
    #[error("no space left on device")]
    NoSpace,

    /// A lock could not be taken without risking deadlock; retry the
    /// operation from a point where no lower-level locks are held.
    #[error("operation interrupted, retry")]
    Retry,

    /// Device index is not attached.
    #[error("no such device: {0}")]
    NoDevice(u32),

    /// Device or filesystem parameters are out of range.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// Resize would drop buckets that still hold data.
    #[error("cannot shrink to {requested} buckets: bucket {highest_live} is in use")]
    ShrinkBelowLive { requested: u64, highest_live: u64 },

    /// Stripe still has live blocks and cannot be structurally changed.
    #[error("stripe {idx} has {blocks_nonempty} nonempty blocks")]
    StripeBusy { idx: u64, blocks_nonempty: u32 },
}

impl BfsError {
    /// Convert this error into a POSIX errno.
    ///
    /// The mapping is exhaustive; adding a variant is a compile error until
    /// its errno is assigned.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Inconsistent(_) => libc::EIO,
            Self::NoSpace => libc::ENOSPC,
            Self::Retry => libc::EINTR,
            Self::NoDevice(_) => libc::ENODEV,
            Self::InvalidGeometry(_) => libc::EINVAL,
            Self::ShrinkBelowLive { .. } | Self::StripeBusy { .. } => libc::EBUSY,
        }
    }

    /// `true` for conditions the caller is expected to handle (as opposed
    /// to corruption).
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::NoSpace | Self::Retry)
    }
}

/// Result alias using `BfsError`.
pub type Result<T> = std::result::Result<T, BfsError>;

// ── Rate-limited inconsistency reporting ────────────────────────────────────

/// Logs filesystem inconsistencies at most once per interval while counting
/// every occurrence.
#[derive(Debug)]
pub struct InconsistencyReporter {
    interval: Duration,
    last_logged: Mutex<Option<Instant>>,
    total: AtomicU64,
    suppressed: AtomicU64,
}

impl InconsistencyReporter {
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_logged: Mutex::new(None),
            total: AtomicU64::new(0),
            suppressed: AtomicU64::new(0),
        }
    }

    /// Record an inconsistency and return the error to propagate.
    pub fn report(&self, detail: impl Into<String>) -> BfsError {
        let detail = detail.into();
        self.total.fetch_add(1, Ordering::Relaxed);

        let now = Instant::now();
        let mut last = self.last_logged.lock();
        let should_log = last.is_none_or(|at| now.saturating_duration_since(at) >= self.interval);
        if should_log {
            *last = Some(now);
            drop(last);
            let suppressed = self.suppressed.swap(0, Ordering::Relaxed);
            error!(
                target: "bfs::inconsistent",
                suppressed,
                detail = %detail,
                "filesystem inconsistency"
            );
        } else {
            drop(last);
            self.suppressed.fetch_add(1, Ordering::Relaxed);
        }

        BfsError::Inconsistent(detail)
    }

    /// Every inconsistency reported since creation, logged or not.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Reports swallowed since the last emitted log line.
    #[must_use]
    pub fn suppressed(&self) -> u64 {
        self.suppressed.load(Ordering::Relaxed)
    }
}

impl Default for InconsistencyReporter {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}
