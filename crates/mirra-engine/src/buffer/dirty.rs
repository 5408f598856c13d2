use std::ops::Range;

/// Half-open byte interval `[lo, hi)` modified since the last flush.
///
/// `lo > hi` marks the clean state, so extending a clean range with any
/// non-empty interval yields exactly that interval.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct DirtyRange {
    lo: usize,
    hi: usize,
}

impl DirtyRange {
    pub const CLEAN: Self = Self { lo: usize::MAX, hi: 0 };

    #[inline]
    pub const fn is_clean(&self) -> bool {
        self.lo > self.hi
    }

    /// Grows the range to the union with `range`. Empty ranges are ignored.
    pub fn extend(&mut self, range: Range<usize>) {
        if range.is_empty() {
            return;
        }
        self.lo = self.lo.min(range.start);
        self.hi = self.hi.max(range.end);
    }

    /// The dirty interval, or `None` when clean.
    pub fn span(&self) -> Option<Range<usize>> {
        (!self.is_clean()).then_some(self.lo..self.hi)
    }

    /// Returns the dirty interval and resets to clean.
    pub fn take(&mut self) -> Option<Range<usize>> {
        let span = self.span();
        *self = Self::CLEAN;
        span
    }
}

impl Default for DirtyRange {
    fn default() -> Self {
        Self::CLEAN
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_clean() {
        let range = DirtyRange::default();
        assert!(range.is_clean());
        assert_eq!(range.span(), None);
    }

    #[test]
    fn first_extend_adopts_range() {
        let mut range = DirtyRange::CLEAN;
        range.extend(32..36);
        assert_eq!(range.span(), Some(32..36));
    }

    #[test]
    fn extend_takes_union_including_gap() {
        let mut range = DirtyRange::CLEAN;
        range.extend(0..4);
        range.extend(32..36);
        assert_eq!(range.span(), Some(0..36));
        range.extend(8..12);
        assert_eq!(range.span(), Some(0..36));
    }

    #[test]
    fn empty_extend_stays_clean() {
        let mut range = DirtyRange::CLEAN;
        range.extend(5..5);
        assert!(range.is_clean());
    }

    #[test]
    fn take_resets() {
        let mut range = DirtyRange::CLEAN;
        range.extend(4..8);
        assert_eq!(range.take(), Some(4..8));
        assert!(range.is_clean());
        assert_eq!(range.take(), None);
    }
}
