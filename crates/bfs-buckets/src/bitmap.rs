//! Bit-per-bucket side tables.

/// Bitmap sized for `bits` entries, all clear.
#[must_use]
pub fn bitmap_new(bits: u64) -> Vec<u8> {
    vec![0; usize::try_from(bits.div_ceil(8)).unwrap_or(usize::MAX)]
}

/// Get bit `idx`. Out of range reads as clear.
#[must_use]
pub fn bitmap_get(bitmap: &[u8], idx: u64) -> bool {
    let Ok(byte_idx) = usize::try_from(idx / 8) else {
        return false;
    };
    bitmap.get(byte_idx).is_some_and(|b| (b >> (idx % 8)) & 1 == 1)
}

/// Set bit `idx`. Out of range is ignored.
pub fn bitmap_set(bitmap: &mut [u8], idx: u64) {
    if let Some(b) = usize::try_from(idx / 8).ok().and_then(|i| bitmap.get_mut(i)) {
        *b |= 1 << (idx % 8);
    }
}

/// Clear bit `idx`. Out of range is ignored.
pub fn bitmap_clear(bitmap: &mut [u8], idx: u64) {
    if let Some(b) = usize::try_from(idx / 8).ok().and_then(|i| bitmap.get_mut(i)) {
        *b &= !(1 << (idx % 8));
    }
}

/// Copy the first `bits` bits of `src` into a new bitmap of `new_bits`.
#[must_use]
pub fn bitmap_resized(src: &[u8], new_bits: u64) -> Vec<u8> {
    let mut out = bitmap_new(new_bits);
    let n = out.len().min(src.len());
    out[..n].copy_from_slice(&src[..n]);
    // Clear tail bits past new_bits in the final byte.
    let tail = new_bits % 8;
    if tail != 0 {
        if let Some(last) = out.last_mut() {
            *last &= (1_u8 << tail) - 1;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_clear() {
        let mut bm = bitmap_new(20);
        assert_eq!(bm.len(), 3);
        bitmap_set(&mut bm, 0);
        bitmap_set(&mut bm, 19);
        assert!(bitmap_get(&bm, 0));
        assert!(bitmap_get(&bm, 19));
        assert!(!bitmap_get(&bm, 18));
        bitmap_clear(&mut bm, 19);
        assert!(!bitmap_get(&bm, 19));
    }

    #[test]
    fn out_of_range_is_harmless() {
        let mut bm = bitmap_new(8);
        bitmap_set(&mut bm, 100);
        assert!(!bitmap_get(&bm, 100));
        assert_eq!(bm, vec![0]);
    }

    #[test]
    fn resize_preserves_prefix_and_masks_tail() {
        let mut bm = bitmap_new(16);
        bitmap_set(&mut bm, 2);
        bitmap_set(&mut bm, 6);
        bitmap_set(&mut bm, 12);
        let shrunk = bitmap_resized(&bm, 5);
        assert_eq!(shrunk.len(), 1);
        assert!(bitmap_get(&shrunk, 2));
        assert!(!bitmap_get(&shrunk, 6));
        let grown = bitmap_resized(&bm, 40);
        assert!(bitmap_get(&grown, 12));
        assert!(!bitmap_get(&grown, 39));
    }
}
