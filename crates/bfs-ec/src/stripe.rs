//! Per-stripe metadata with atomic block counters.

use bfs_types::EC_STRIPE_MAX;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU64, AtomicUsize, Ordering};

pub(crate) const NOT_IN_HEAP: usize = usize::MAX;

/// Shape of a stripe as recorded by its stripe key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct StripeGeometry {
    pub sectors: u16,
    pub algorithm: u8,
    pub nr_blocks: u8,
    pub nr_redundant: u8,
}

impl StripeGeometry {
    #[must_use]
    pub fn nr_data(self) -> u8 {
        self.nr_blocks.saturating_sub(self.nr_redundant)
    }

    /// Parity sectors owed for `sectors` of data written into this stripe,
    /// signed like `sectors`: `ceil(|sectors| * nr_redundant / nr_data)`.
    #[must_use]
    #[expect(clippy::cast_possible_wrap)]
    pub fn parity_sectors(self, sectors: i64) -> i64 {
        let nr_data = u64::from(self.nr_data().max(1));
        let parity = (sectors.unsigned_abs() * u64::from(self.nr_redundant)).div_ceil(nr_data) as i64;
        if sectors < 0 { -parity } else { parity }
    }

    fn to_raw(self) -> u64 {
        u64::from(self.sectors)
            | (u64::from(self.algorithm) << 16)
            | (u64::from(self.nr_blocks) << 24)
            | (u64::from(self.nr_redundant) << 32)
    }

    #[expect(clippy::cast_possible_truncation)]
    fn from_raw(raw: u64) -> Self {
        Self {
            sectors: raw as u16,
            algorithm: (raw >> 16) as u8,
            nr_blocks: (raw >> 24) as u8,
            nr_redundant: (raw >> 32) as u8,
        }
    }
}

/// Result of charging sectors to one stripe block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockCharge {
    pub old: i64,
    pub new: i64,
    /// +1 if the block became nonempty, -1 if it became empty, else 0.
    pub nonempty_delta: i32,
}

/// Why a block charge was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChargeRefused {
    OutOfRange,
    Underflow { current: i64 },
}

#[derive(Debug)]
pub struct Stripe {
    pub(crate) heap_idx: AtomicUsize,
    geometry: AtomicU64,
    alive: AtomicBool,
    blocks_nonempty: AtomicI32,
    block_sectors: [AtomicI64; EC_STRIPE_MAX],
}

impl Default for Stripe {
    fn default() -> Self {
        Self {
            heap_idx: AtomicUsize::new(NOT_IN_HEAP),
            geometry: AtomicU64::new(0),
            alive: AtomicBool::new(false),
            blocks_nonempty: AtomicI32::new(0),
            block_sectors: std::array::from_fn(|_| AtomicI64::new(0)),
        }
    }
}

impl Stripe {
    #[must_use]
    pub fn geometry(&self) -> StripeGeometry {
        StripeGeometry::from_raw(self.geometry.load(Ordering::Acquire))
    }

    pub(crate) fn set_geometry(&self, geometry: StripeGeometry) {
        self.geometry.store(geometry.to_raw(), Ordering::Release);
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub(crate) fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::Release);
    }

    #[must_use]
    pub fn blocks_nonempty(&self) -> i32 {
        self.blocks_nonempty.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn block_sectors(&self, block: usize) -> Option<i64> {
        self.block_sectors.get(block).map(|s| s.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn in_heap(&self) -> bool {
        self.heap_idx.load(Ordering::Relaxed) != NOT_IN_HEAP
    }

    /// Add `delta` to one block and adjust `blocks_nonempty` on a
    /// zero/nonzero transition. A charge that would take the block below
    /// zero is refused and leaves the counter as it was.
    pub(crate) fn charge_block(&self, block: usize, delta: i64) -> Result<BlockCharge, ChargeRefused> {
        let counter = self.block_sectors.get(block).ok_or(ChargeRefused::OutOfRange)?;
        let old = counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                cur.checked_add(delta).filter(|new| *new >= 0)
            })
            .map_err(|current| ChargeRefused::Underflow { current })?;
        let new = old + delta;
        let nonempty_delta = i32::from(new != 0) - i32::from(old != 0);
        if nonempty_delta != 0 {
            let prev = self.blocks_nonempty.fetch_add(nonempty_delta, Ordering::AcqRel);
            assert!(
                prev + nonempty_delta >= 0,
                "stripe blocks_nonempty underflow: {prev} {nonempty_delta:+}"
            );
        }
        Ok(BlockCharge {
            old,
            new,
            nonempty_delta,
        })
    }

    /// `true` if any block still holds sectors.
    #[must_use]
    pub fn has_sectors(&self) -> bool {
        self.block_sectors
            .iter()
            .any(|s| s.load(Ordering::Acquire) != 0)
    }
}
