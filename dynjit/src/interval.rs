//! Coalescing set of closed `u64` intervals.
//!
//! Used to accumulate guest address ranges whose compiled code is stale.
//! Overlapping and adjacent intervals are merged on insert, so the set never
//! holds redundant entries.

use std::collections::BTreeMap;
use std::fmt;

/// Set of disjoint, non-adjacent closed intervals `[lo, hi]`.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct IntervalSet {
    /// lo -> hi
    intervals: BTreeMap<u64, u64>,
}

impl IntervalSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `[lo, hi]`, merging with any overlapping or adjacent interval.
    pub fn add(&mut self, lo: u64, hi: u64) {
        assert!(lo <= hi, "inverted interval [{lo:#x}, {hi:#x}]");

        let mut lo = lo;
        let mut hi = hi;

        // Predecessor that overlaps or touches `lo`.
        if let Some((&s, &e)) = self.intervals.range(..=lo).next_back() {
            if e >= lo || e + 1 == lo {
                lo = s;
                hi = hi.max(e);
                self.intervals.remove(&s);
            }
        }

        // Successors starting inside or right after `[lo, hi]`.
        while let Some((&s, &e)) = self.intervals.range(lo..).next() {
            if s > hi.saturating_add(1) {
                break;
            }
            hi = hi.max(e);
            self.intervals.remove(&s);
        }

        self.intervals.insert(lo, hi);
    }

    /// True if any interval intersects `[lo, hi]`.
    pub fn overlaps(&self, lo: u64, hi: u64) -> bool {
        self.intervals
            .range(..=hi)
            .next_back()
            .is_some_and(|(_, &e)| e >= lo)
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.overlaps(addr, addr)
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    /// Number of disjoint intervals.
    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    pub fn clear(&mut self) {
        self.intervals.clear();
    }

    /// Iterate intervals in ascending order as `(lo, hi)`.
    pub fn iter(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.intervals.iter().map(|(&lo, &hi)| (lo, hi))
    }
}

impl fmt::Debug for IntervalSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set()
            .entries(self.iter().map(|(lo, hi)| format!("[{lo:#x}, {hi:#x}]")))
            .finish()
    }
}
