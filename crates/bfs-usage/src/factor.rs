//! Reserve amplification.
//!
//! Reserved sectors are inflated by `1 / 2^shift` before being compared to
//! capacity, and free space is deflated by the inverse, so metadata writes
//! and copy-GC keep some slack after user reservations fill the device.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReserveFactor {
    shift: u32,
}

impl ReserveFactor {
    /// No amplification: reserved and available sectors are taken as-is.
    pub const NONE: Self = Self { shift: 0 };

    /// `shift` of 0 disables amplification; values above 32 are clamped.
    #[must_use]
    pub const fn new(shift: u32) -> Self {
        Self {
            shift: if shift > 32 { 32 } else { shift },
        }
    }

    #[must_use]
    pub const fn shift(self) -> u32 {
        self.shift
    }

    /// `r + ceil(r / 2^shift)`.
    #[must_use]
    pub fn reserve(self, r: u64) -> u64 {
        if self.shift == 0 {
            return r;
        }
        r.saturating_add(r.div_ceil(1 << self.shift))
    }

    /// Largest reservation whose amplified size fits in `r`:
    /// `r * 2^shift / (2^shift + 1)`.
    #[must_use]
    #[expect(clippy::cast_possible_truncation)] // quotient is at most r
    pub fn avail(self, r: u64) -> u64 {
        if self.shift == 0 {
            return r;
        }
        let unit = 1_u128 << self.shift;
        (u128::from(r) * unit / (unit + 1)) as u64
    }
}

impl Default for ReserveFactor {
    fn default() -> Self {
        Self::new(6)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn default_inflates_by_one_in_sixty_four() {
        let f = ReserveFactor::default();
        assert_eq!(f.reserve(0), 0);
        assert_eq!(f.reserve(1), 2);
        assert_eq!(f.reserve(64), 65);
        assert_eq!(f.reserve(6400), 6500);
        assert_eq!(f.avail(6500), 6400);
        assert_eq!(f.avail(65), 64);
    }

    #[test]
    fn shift_zero_is_identity() {
        assert_eq!(ReserveFactor::NONE.reserve(950), 950);
        assert_eq!(ReserveFactor::NONE.avail(950), 950);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        #[test]
        fn avail_never_overcommits(r in 0_u64..(1 << 48), shift in 1_u32..12) {
            let f = ReserveFactor::new(shift);
            prop_assert!(f.reserve(f.avail(r)) <= r + 1);
            prop_assert!(f.avail(r) <= r);
        }
    }
}
