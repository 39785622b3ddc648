//! Per-device bucket table and its side arrays.

use crate::bitmap::{bitmap_clear, bitmap_get, bitmap_new, bitmap_resized, bitmap_set};
use crate::mark::{AtomicBucketMark, BucketMark, BucketState};
use bfs_types::{BucketGen, BucketIdx};

#[derive(Debug, Default)]
pub struct Bucket {
    pub mark: AtomicBucketMark,
}

/// Fixed-size table of bucket marks for one device.
///
/// Buckets below `first_bucket` hold the superblock and boot area; they are
/// addressable so format-time metadata marking can reach them.
#[derive(Debug)]
pub struct BucketArray {
    first_bucket: u64,
    buckets: Box<[Bucket]>,
}

fn to_len(nbuckets: u64) -> usize {
    usize::try_from(nbuckets).unwrap_or(usize::MAX)
}

impl BucketArray {
    #[must_use]
    pub fn new(first_bucket: u64, nbuckets: u64) -> Self {
        let buckets = (0..to_len(nbuckets)).map(|_| Bucket::default()).collect();
        Self {
            first_bucket,
            buckets,
        }
    }

    /// Placeholder published while a device has no shadow array.
    #[must_use]
    pub fn empty() -> Self {
        Self::new(0, 0)
    }

    /// New table of `nbuckets` whose overlapping prefix copies `old`.
    #[must_use]
    pub fn resized_from(old: &Self, first_bucket: u64, nbuckets: u64) -> Self {
        let new = Self::new(first_bucket, nbuckets);
        for (dst, src) in new.buckets.iter().zip(old.buckets.iter()) {
            dst.mark.store(src.mark.load());
        }
        new
    }

    /// Zeroed table sharing `live`'s generations, as a rebuild starts from.
    #[must_use]
    pub fn with_generations_of(live: &Self) -> Self {
        let new = Self::new(live.first_bucket, live.nbuckets());
        for (dst, src) in new.buckets.iter().zip(live.buckets.iter()) {
            dst.mark.store(BucketMark {
                generation: src.mark.load().generation,
                ..BucketMark::default()
            });
        }
        new
    }

    #[must_use]
    pub fn first_bucket(&self) -> u64 {
        self.first_bucket
    }

    #[must_use]
    pub fn nbuckets(&self) -> u64 {
        self.buckets.len() as u64
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    #[must_use]
    pub fn get(&self, b: BucketIdx) -> Option<&Bucket> {
        self.buckets.get(usize::try_from(b.0).ok()?)
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = (BucketIdx, &Bucket)> {
        self.buckets
            .iter()
            .enumerate()
            .map(|(i, bucket)| (BucketIdx(i as u64), bucket))
    }

    /// Highest bucket whose state is not free.
    #[must_use]
    pub fn highest_in_use(&self) -> Option<BucketIdx> {
        self.iter()
            .rev()
            .find(|(_, bucket)| bucket.mark.load().state() != BucketState::Free)
            .map(|(b, _)| b)
    }
}

// ── Side arrays ─────────────────────────────────────────────────────────────

/// Per-bucket metadata that is not part of the atomic mark: oldest
/// generation still referenced, the "do not allocate" bitmap and the
/// "has been written since format" bitmap. Guarded by the device's bucket
/// lock, never touched on the marking hot path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BucketSideArrays {
    nbuckets: u64,
    oldest_gens: Vec<u8>,
    nouse: Vec<u8>,
    written: Vec<u8>,
}

impl BucketSideArrays {
    #[must_use]
    pub fn new(nbuckets: u64) -> Self {
        Self {
            nbuckets,
            oldest_gens: vec![0; to_len(nbuckets)],
            nouse: bitmap_new(nbuckets),
            written: bitmap_new(nbuckets),
        }
    }

    #[must_use]
    pub fn resized_from(old: &Self, nbuckets: u64) -> Self {
        let mut oldest_gens = vec![0; to_len(nbuckets)];
        let n = oldest_gens.len().min(old.oldest_gens.len());
        oldest_gens[..n].copy_from_slice(&old.oldest_gens[..n]);
        Self {
            nbuckets,
            oldest_gens,
            nouse: bitmap_resized(&old.nouse, nbuckets),
            written: bitmap_resized(&old.written, nbuckets),
        }
    }

    #[must_use]
    pub fn nbuckets(&self) -> u64 {
        self.nbuckets
    }

    #[must_use]
    pub fn oldest_gen(&self, b: BucketIdx) -> Option<BucketGen> {
        let i = usize::try_from(b.0).ok()?;
        self.oldest_gens.get(i).map(|g| BucketGen(*g))
    }

    pub fn set_oldest_gen(&mut self, b: BucketIdx, generation: BucketGen) {
        if let Some(slot) = usize::try_from(b.0)
            .ok()
            .and_then(|i| self.oldest_gens.get_mut(i))
        {
            *slot = generation.0;
        }
    }

    #[must_use]
    pub fn is_nouse(&self, b: BucketIdx) -> bool {
        bitmap_get(&self.nouse, b.0)
    }

    pub fn set_nouse(&mut self, b: BucketIdx, nouse: bool) {
        if nouse {
            bitmap_set(&mut self.nouse, b.0);
        } else {
            bitmap_clear(&mut self.nouse, b.0);
        }
    }

    #[must_use]
    pub fn is_written(&self, b: BucketIdx) -> bool {
        bitmap_get(&self.written, b.0)
    }

    pub fn set_written(&mut self, b: BucketIdx) {
        bitmap_set(&mut self.written, b.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bfs_types::DataType;

    fn dirty(generation: u8, sectors: u16) -> BucketMark {
        BucketMark {
            generation: BucketGen(generation),
            data_type: DataType::User,
            dirty_sectors: sectors,
            ..BucketMark::default()
        }
    }

    #[test]
    fn grow_preserves_prefix() {
        let old = BucketArray::new(1, 4);
        for (b, bucket) in old.iter() {
            bucket.mark.store(dirty(b.0 as u8 + 1, 10));
        }
        let grown = BucketArray::resized_from(&old, 1, 8);
        assert_eq!(grown.nbuckets(), 8);
        for i in 0..4 {
            assert_eq!(grown.get(BucketIdx(i)).unwrap().mark.load(), dirty(i as u8 + 1, 10));
        }
        for i in 4..8 {
            assert_eq!(grown.get(BucketIdx(i)).unwrap().mark.load(), BucketMark::default());
        }
        assert!(grown.get(BucketIdx(8)).is_none());
    }

    #[test]
    fn shadow_copies_only_generations() {
        let live = BucketArray::new(0, 3);
        live.get(BucketIdx(2)).unwrap().mark.store(dirty(7, 100));
        let shadow = BucketArray::with_generations_of(&live);
        let m = shadow.get(BucketIdx(2)).unwrap().mark.load();
        assert_eq!(m.generation, BucketGen(7));
        assert_eq!(m.dirty_sectors, 0);
        assert_eq!(m.data_type, DataType::None);
    }

    #[test]
    fn highest_in_use_skips_free_tail() {
        let arr = BucketArray::new(0, 10);
        assert_eq!(arr.highest_in_use(), None);
        arr.get(BucketIdx(3)).unwrap().mark.store(dirty(0, 1));
        arr.get(BucketIdx(6))
            .unwrap()
            .mark
            .store(BucketMark {
                owned_by_allocator: true,
                ..BucketMark::default()
            });
        // Generation alone does not make a bucket live.
        arr.get(BucketIdx(9)).unwrap().mark.store(BucketMark {
            generation: BucketGen(4),
            ..BucketMark::default()
        });
        assert_eq!(arr.highest_in_use(), Some(BucketIdx(6)));
    }

    #[test]
    fn side_arrays_resize_keep_prefix() {
        let mut side = BucketSideArrays::new(10);
        side.set_oldest_gen(BucketIdx(3), BucketGen(42));
        side.set_nouse(BucketIdx(9), true);
        side.set_written(BucketIdx(1));

        let grown = BucketSideArrays::resized_from(&side, 20);
        assert_eq!(grown.oldest_gen(BucketIdx(3)), Some(BucketGen(42)));
        assert!(grown.is_nouse(BucketIdx(9)));
        assert!(grown.is_written(BucketIdx(1)));
        assert!(!grown.is_written(BucketIdx(15)));
        assert_eq!(grown.oldest_gen(BucketIdx(19)), Some(BucketGen(0)));

        let shrunk = BucketSideArrays::resized_from(&grown, 5);
        assert_eq!(shrunk.oldest_gen(BucketIdx(3)), Some(BucketGen(42)));
        assert_eq!(shrunk.oldest_gen(BucketIdx(9)), None);
        assert!(!shrunk.is_nouse(BucketIdx(9)));

        let mut cleared = shrunk;
        cleared.set_nouse(BucketIdx(2), true);
        cleared.set_nouse(BucketIdx(2), false);
        assert!(!cleared.is_nouse(BucketIdx(2)));
    }
}
