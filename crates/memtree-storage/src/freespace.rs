//! Free-space interval set for tracking unused store blocks.
//!
//! The set holds disjoint ranges of free units (store blocks) keyed by their
//! first unit. Ranges are stored as inclusive `[start, last]` pairs so a range
//! can reach the top of the address space. Adjacent and overlapping ranges
//! are always merged, so two entries never touch.
//!
//! ```text
//!   units:  0 1 2 3 4 5 6 7 8 9
//!   free:       [2 . 4]     [8 9]
//!   map:    { 2 => 4, 8 => 9 }
//! ```

use memtree_common::Result;
use std::collections::BTreeMap;

/// Ordered set of disjoint free ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FreeSpaceSet {
    /// First unit of each range mapped to its last unit (inclusive).
    ranges: BTreeMap<u64, u64>,
}

/// Last unit of a `len`-unit run starting at `start`, clamped to the top of
/// the address space.
#[inline]
fn last_of(start: u64, len: u64) -> u64 {
    start.saturating_add(len - 1)
}

/// Length of `[start, last]`, saturating for the full address space.
#[inline]
fn len_of(start: u64, last: u64) -> u64 {
    (last - start).saturating_add(1)
}

impl FreeSpaceSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if nothing is free.
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Forgets every range.
    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    /// Returns the number of disjoint ranges.
    pub fn count_regions(&self) -> usize {
        self.ranges.len()
    }

    /// Returns the number of free units.
    pub fn total_free(&self) -> u64 {
        self.ranges
            .iter()
            .fold(0u64, |acc, (&s, &l)| acc.saturating_add(len_of(s, l)))
    }

    /// Returns the lowest free unit.
    pub fn first_free(&self) -> Option<u64> {
        self.ranges.keys().next().copied()
    }

    /// Iterates `(start, len)` ranges in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.ranges.iter().map(|(&s, &l)| (s, len_of(s, l)))
    }

    /// Calls `f(start, len)` for each range in ascending order, stopping at
    /// the first error.
    pub fn walk<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(u64, u64) -> Result<()>,
    {
        for (start, len) in self.iter() {
            f(start, len)?;
        }
        Ok(())
    }

    /// Marks `len` units starting at `start` as free, merging with neighbors.
    pub fn mark_free(&mut self, start: u64, len: u64) {
        if len == 0 {
            return;
        }
        let mut first = start;
        let mut last = last_of(start, len);

        // A range at or before `start` that reaches it or ends just short.
        if let Some((&s, &l)) = self.ranges.range(..=start).next_back() {
            if l.saturating_add(1) >= start {
                first = s;
                last = last.max(l);
                self.ranges.remove(&s);
            }
        }

        // Ranges starting inside or right after the merged run.
        while let Some((&s, &l)) = self.ranges.range(first..).next() {
            if s > last.saturating_add(1) {
                break;
            }
            last = last.max(l);
            self.ranges.remove(&s);
        }

        self.ranges.insert(first, last);
    }

    /// Marks `len` units starting at `start` as used, splitting ranges.
    pub fn mark_used(&mut self, start: u64, len: u64) {
        if len == 0 {
            return;
        }
        self.clear_range(start, last_of(start, len));
    }

    /// Removes every unit that is free in `other`.
    pub fn subtract(&mut self, other: &FreeSpaceSet) {
        for (&s, &l) in &other.ranges {
            self.clear_range(s, l);
        }
    }

    /// Returns true if all `len` units starting at `start` are free.
    pub fn is_free(&self, start: u64, len: u64) -> bool {
        if len == 0 {
            return true;
        }
        let last = last_of(start, len);
        match self.ranges.range(..=start).next_back() {
            Some((_, &l)) => l >= last,
            None => false,
        }
    }

    /// Reports whether `start` is free and how long the uniform run starting
    /// there is, capped at `len`.
    pub fn test(&self, start: u64, len: u64) -> (bool, u64) {
        if len == 0 {
            return (false, 0);
        }
        let last = last_of(start, len);

        if let Some((_, &l)) = self.ranges.range(..=start).next_back() {
            if l >= start {
                return (true, len_of(start, l.min(last)));
            }
        }

        match self.ranges.range(start..).next() {
            Some((&s, _)) if s <= last => (false, s - start),
            _ => (false, len_of(start, last)),
        }
    }

    /// Takes the lowest free unit within `lower..=upper`, marking it used.
    ///
    /// The range holding it shrinks or splits; returns None if nothing in
    /// the window is free.
    pub fn take_first_free(&mut self, lower: u64, upper: u64) -> Option<u64> {
        if lower > upper {
            return None;
        }

        let found = match self.ranges.range(..=lower).next_back() {
            Some((_, &l)) if l >= lower => lower,
            _ => *self.ranges.range(lower..=upper).next()?.0,
        };

        self.clear_range(found, found);
        Some(found)
    }

    /// Removes `[start, last]` from the set.
    fn clear_range(&mut self, start: u64, last: u64) {
        // A range that begins before `start` and reaches into it.
        if let Some((&s, &l)) = self.ranges.range(..start).next_back() {
            if l >= start {
                self.ranges.insert(s, start - 1);
                if l > last {
                    self.ranges.insert(last + 1, l);
                    return;
                }
            }
        }

        let inside: Vec<(u64, u64)> = self
            .ranges
            .range(start..=last)
            .map(|(&s, &l)| (s, l))
            .collect();
        for (s, l) in inside {
            self.ranges.remove(&s);
            if l > last {
                self.ranges.insert(last + 1, l);
            }
        }
    }
}
