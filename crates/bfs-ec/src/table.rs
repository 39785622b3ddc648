//! Index-addressable stripe table.

use crate::heap::StripesHeap;
use crate::stripe::{BlockCharge, ChargeRefused, Stripe, StripeGeometry};
use bfs_types::{EC_STRIPE_MAX, StripeIdx};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace};

/// Why a stripe operation was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StripeError {
    #[error("stripe {0} does not exist")]
    Missing(StripeIdx),
    #[error("stripe {0} already exists")]
    AlreadyAlive(StripeIdx),
    #[error("stripe {idx} has {blocks_nonempty} nonempty blocks")]
    Busy { idx: StripeIdx, blocks_nonempty: i32 },
    #[error("stripe {idx}: block {block} out of range")]
    BlockOutOfRange { idx: StripeIdx, block: u8 },
    #[error("stripe {idx}: block {block} sectors {current} {delta:+} below zero")]
    BlockUnderflow {
        idx: StripeIdx,
        block: u8,
        current: i64,
        delta: i64,
    },
    #[error("stripe {idx}: invalid geometry {nr_blocks} blocks, {nr_redundant} redundant")]
    BadGeometry {
        idx: StripeIdx,
        nr_blocks: u8,
        nr_redundant: u8,
    },
}

/// Stripes addressed by index, growing on demand.
///
/// Deleted stripes stay in the table marked dead. The live table keeps
/// alive stripes in a [`StripesHeap`]; the GC-shadow table does not.
#[derive(Debug)]
pub struct StripeTable {
    stripes: RwLock<Vec<Arc<Stripe>>>,
    heap: Mutex<StripesHeap>,
    maintain_heap: bool,
}

fn slot(idx: StripeIdx) -> Option<usize> {
    usize::try_from(idx.0).ok()
}

impl StripeTable {
    #[must_use]
    pub fn new(maintain_heap: bool) -> Self {
        Self {
            stripes: RwLock::new(Vec::new()),
            heap: Mutex::new(StripesHeap::default()),
            maintain_heap,
        }
    }

    #[must_use]
    pub fn get(&self, idx: StripeIdx) -> Option<Arc<Stripe>> {
        self.stripes.read().get(slot(idx)?).cloned()
    }

    /// Alive stripe at `idx`.
    pub fn get_alive(&self, idx: StripeIdx) -> Result<Arc<Stripe>, StripeError> {
        self.get(idx)
            .filter(|s| s.is_alive())
            .ok_or(StripeError::Missing(idx))
    }

    fn get_or_alloc(&self, idx: StripeIdx) -> Result<Arc<Stripe>, StripeError> {
        if let Some(s) = self.get(idx) {
            return Ok(s);
        }
        let i = slot(idx).ok_or(StripeError::Missing(idx))?;
        let mut stripes = self.stripes.write();
        if stripes.len() <= i {
            stripes.resize_with(i + 1, || Arc::new(Stripe::default()));
            trace!(target: "bfs::ec", len = stripes.len(), "stripe_table_grow");
        }
        Ok(Arc::clone(&stripes[i]))
    }

    /// Bring stripe `idx` to life with the given geometry.
    pub fn insert_stripe(
        &self,
        idx: StripeIdx,
        geometry: StripeGeometry,
    ) -> Result<Arc<Stripe>, StripeError> {
        if geometry.nr_blocks == 0
            || usize::from(geometry.nr_blocks) > EC_STRIPE_MAX
            || geometry.nr_redundant >= geometry.nr_blocks
        {
            return Err(StripeError::BadGeometry {
                idx,
                nr_blocks: geometry.nr_blocks,
                nr_redundant: geometry.nr_redundant,
            });
        }
        let stripe = self.get_or_alloc(idx)?;
        if stripe.is_alive() {
            return Err(StripeError::AlreadyAlive(idx));
        }
        Self::require_empty(idx, &stripe)?;
        stripe.set_geometry(geometry);
        stripe.set_alive(true);
        if self.maintain_heap {
            self.heap.lock().insert(idx, Arc::clone(&stripe));
        }
        debug!(
            target: "bfs::ec",
            idx = idx.0,
            nr_blocks = geometry.nr_blocks,
            nr_redundant = geometry.nr_redundant,
            "stripe_insert"
        );
        Ok(stripe)
    }

    /// Mark stripe `idx` dead. It stays addressable.
    pub fn delete_stripe(&self, idx: StripeIdx) -> Result<Arc<Stripe>, StripeError> {
        let stripe = self.get_alive(idx)?;
        Self::require_empty(idx, &stripe)?;
        stripe.set_alive(false);
        if self.maintain_heap {
            self.heap.lock().remove(&stripe);
        }
        debug!(target: "bfs::ec", idx = idx.0, "stripe_delete");
        Ok(stripe)
    }

    fn require_empty(idx: StripeIdx, stripe: &Stripe) -> Result<(), StripeError> {
        let blocks_nonempty = stripe.blocks_nonempty();
        if blocks_nonempty != 0 || stripe.has_sectors() {
            return Err(StripeError::Busy {
                idx,
                blocks_nonempty,
            });
        }
        Ok(())
    }

    /// Add `delta` sectors to one block of an alive stripe.
    pub fn charge_stripe_block(
        &self,
        idx: StripeIdx,
        block: u8,
        delta: i64,
    ) -> Result<(Arc<Stripe>, BlockCharge), StripeError> {
        let stripe = self.get_alive(idx)?;
        if block >= stripe.geometry().nr_blocks {
            return Err(StripeError::BlockOutOfRange { idx, block });
        }
        let charge = stripe
            .charge_block(usize::from(block), delta)
            .map_err(|refused| match refused {
                ChargeRefused::OutOfRange => StripeError::BlockOutOfRange { idx, block },
                ChargeRefused::Underflow { current } => StripeError::BlockUnderflow {
                    idx,
                    block,
                    current,
                    delta,
                },
            })?;
        if charge.nonempty_delta != 0 && self.maintain_heap {
            self.heap.lock().update(&stripe);
            trace!(
                target: "bfs::ec",
                idx = idx.0,
                block,
                blocks_nonempty = stripe.blocks_nonempty(),
                "stripe_heap_update"
            );
        }
        Ok((stripe, charge))
    }

    /// Least-occupied alive stripe, for reclaim.
    #[must_use]
    pub fn peek_min(&self) -> Option<(StripeIdx, i32)> {
        self.heap.lock().peek_min()
    }

    #[must_use]
    pub fn heap_len(&self) -> usize {
        self.heap.lock().len()
    }

    /// Number of addressable slots (alive or dead).
    #[must_use]
    pub fn len(&self) -> usize {
        self.stripes.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stripes.read().is_empty()
    }

    /// Drop every stripe. Used when a GC pass starts rebuilding.
    pub fn reset(&self) {
        let mut stripes = self.stripes.write();
        self.heap.lock().clear();
        stripes.clear();
        debug!(target: "bfs::ec", maintain_heap = self.maintain_heap, "stripe_table_reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry(nr_blocks: u8, nr_redundant: u8) -> StripeGeometry {
        StripeGeometry {
            sectors: 128,
            algorithm: 0,
            nr_blocks,
            nr_redundant,
        }
    }

    #[test]
    fn insert_twice_is_refused() {
        let table = StripeTable::new(true);
        table.insert_stripe(StripeIdx(5), geometry(4, 1)).unwrap();
        assert_eq!(
            table.insert_stripe(StripeIdx(5), geometry(4, 1)).unwrap_err(),
            StripeError::AlreadyAlive(StripeIdx(5))
        );
        assert_eq!(table.len(), 6);
        assert_eq!(table.heap_len(), 1);
    }

    #[test]
    fn delete_missing_or_dead_is_refused() {
        let table = StripeTable::new(true);
        assert_eq!(
            table.delete_stripe(StripeIdx(1)).unwrap_err(),
            StripeError::Missing(StripeIdx(1))
        );
        table.insert_stripe(StripeIdx(1), geometry(3, 1)).unwrap();
        table.delete_stripe(StripeIdx(1)).unwrap();
        assert_eq!(
            table.delete_stripe(StripeIdx(1)).unwrap_err(),
            StripeError::Missing(StripeIdx(1))
        );
        // Dead stripes stay addressable.
        assert!(table.get(StripeIdx(1)).is_some());
        assert_eq!(table.heap_len(), 0);
    }

    #[test]
    fn busy_stripe_cannot_be_deleted() {
        let table = StripeTable::new(true);
        table.insert_stripe(StripeIdx(0), geometry(4, 2)).unwrap();
        table.charge_stripe_block(StripeIdx(0), 1, 16).unwrap();
        assert_eq!(
            table.delete_stripe(StripeIdx(0)).unwrap_err(),
            StripeError::Busy {
                idx: StripeIdx(0),
                blocks_nonempty: 1
            }
        );
        table.charge_stripe_block(StripeIdx(0), 1, -16).unwrap();
        table.delete_stripe(StripeIdx(0)).unwrap();
    }

    #[test]
    fn block_underflow_is_refused() {
        let table = StripeTable::new(true);
        table.insert_stripe(StripeIdx(0), geometry(4, 1)).unwrap();
        table.charge_stripe_block(StripeIdx(0), 2, 8).unwrap();
        assert_eq!(
            table.charge_stripe_block(StripeIdx(0), 2, -9).unwrap_err(),
            StripeError::BlockUnderflow {
                idx: StripeIdx(0),
                block: 2,
                current: 8,
                delta: -9
            }
        );
        let stripe = table.get_alive(StripeIdx(0)).unwrap();
        assert_eq!(stripe.block_sectors(2), Some(8));
        assert_eq!(stripe.blocks_nonempty(), 1);
    }

    #[test]
    fn charges_reorder_heap() {
        let table = StripeTable::new(true);
        table.insert_stripe(StripeIdx(1), geometry(4, 1)).unwrap();
        table.insert_stripe(StripeIdx(2), geometry(4, 1)).unwrap();
        table.charge_stripe_block(StripeIdx(1), 0, 8).unwrap();
        assert_eq!(table.peek_min(), Some((StripeIdx(2), 0)));
        table.charge_stripe_block(StripeIdx(2), 0, 8).unwrap();
        table.charge_stripe_block(StripeIdx(2), 1, 8).unwrap();
        assert_eq!(table.peek_min(), Some((StripeIdx(1), 1)));
    }

    #[test]
    fn block_beyond_stripe_width_is_refused() {
        let table = StripeTable::new(true);
        table.insert_stripe(StripeIdx(0), geometry(3, 1)).unwrap();
        assert_eq!(
            table.charge_stripe_block(StripeIdx(0), 3, 1).unwrap_err(),
            StripeError::BlockOutOfRange {
                idx: StripeIdx(0),
                block: 3
            }
        );
        assert!(matches!(
            table.charge_stripe_block(StripeIdx(9), 0, 1),
            Err(StripeError::Missing(_))
        ));
    }

    #[test]
    fn bad_geometry_is_refused() {
        let table = StripeTable::new(true);
        assert!(matches!(
            table.insert_stripe(StripeIdx(0), geometry(2, 2)),
            Err(StripeError::BadGeometry { .. })
        ));
        assert!(matches!(
            table.insert_stripe(StripeIdx(0), geometry(17, 1)),
            Err(StripeError::BadGeometry { .. })
        ));
    }

    #[test]
    fn shadow_table_skips_heap() {
        let table = StripeTable::new(false);
        table.insert_stripe(StripeIdx(3), geometry(4, 1)).unwrap();
        table.charge_stripe_block(StripeIdx(3), 0, 4).unwrap();
        assert_eq!(table.heap_len(), 0);
        assert!(table.get_alive(StripeIdx(3)).is_ok());
        table.reset();
        assert!(table.is_empty());
    }
}
