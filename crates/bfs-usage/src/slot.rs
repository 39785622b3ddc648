//! Live and GC-shadow accounting slots.

use std::ops::{Index, IndexMut};

/// Which of the two parallel accounting views an update targets.
///
/// `Live` is what the running filesystem reports and reserves against.
/// `GcShadow` is rebuilt from scratch by a GC pass and compared against
/// `Live` when the pass finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UsageSlot {
    Live = 0,
    GcShadow = 1,
}

impl UsageSlot {
    pub const ALL: [Self; 2] = [Self::Live, Self::GcShadow];

    #[must_use]
    pub fn is_gc(self) -> bool {
        self == Self::GcShadow
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::GcShadow => "gc",
        }
    }
}

/// A pair of values indexed by [`UsageSlot`].
#[derive(Debug, Default)]
pub struct Slots<T>([T; 2]);

impl<T> Slots<T> {
    pub fn new(mut make: impl FnMut(UsageSlot) -> T) -> Self {
        Self([make(UsageSlot::Live), make(UsageSlot::GcShadow)])
    }

    pub fn iter(&self) -> impl Iterator<Item = (UsageSlot, &T)> {
        UsageSlot::ALL.into_iter().zip(self.0.iter())
    }
}

impl<T> Index<UsageSlot> for Slots<T> {
    type Output = T;

    fn index(&self, slot: UsageSlot) -> &T {
        &self.0[slot as usize]
    }
}

impl<T> IndexMut<UsageSlot> for Slots<T> {
    fn index_mut(&mut self, slot: UsageSlot) -> &mut T {
        &mut self.0[slot as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_index_by_view() {
        let mut slots = Slots::new(|s| s.as_str().to_owned());
        assert_eq!(slots[UsageSlot::Live], "live");
        assert_eq!(slots[UsageSlot::GcShadow], "gc");
        slots[UsageSlot::GcShadow].push('!');
        let collected: Vec<_> = slots.iter().map(|(s, v)| (s.is_gc(), v.clone())).collect();
        assert_eq!(
            collected,
            vec![(false, "live".to_owned()), (true, "gc!".to_owned())]
        );
    }
}
