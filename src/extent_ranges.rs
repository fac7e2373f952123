//! Ordered set of block ranges.
//!
//! Stored extents never overlap or touch: inserting a range adjacent to an
//! existing one coalesces the two. Holes and empty extents are ignored by
//! every mutating operation.

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::extent::Extent;

/// True when `a` and `b` share at least one block. Extents with the same start
/// always overlap, even when one of them is empty; holes overlap nothing.
pub fn extents_overlap(a: &Extent, b: &Extent) -> bool {
    if a.is_hole() || b.is_hole() {
        return false;
    }
    if a.start_block == b.start_block {
        return true;
    }
    if a.start_block < b.start_block {
        a.end_block() > b.start_block
    } else {
        b.end_block() > a.start_block
    }
}

/// Like [`extents_overlap`], but adjacent extents also qualify.
pub fn extents_overlap_or_touch(a: &Extent, b: &Extent) -> bool {
    if a.is_hole() || b.is_hole() {
        return false;
    }
    if a.start_block == b.start_block {
        return true;
    }
    if a.start_block < b.start_block {
        a.end_block() >= b.start_block
    } else {
        b.end_block() >= a.start_block
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExtentRanges {
    /// start block -> number of blocks
    extents: BTreeMap<u64, u64>,
    blocks: u64,
}

impl ExtentRanges {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of blocks in the set.
    pub fn blocks(&self) -> u64 {
        self.blocks
    }

    pub fn is_empty(&self) -> bool {
        self.extents.is_empty()
    }

    /// Stored extents in ascending block order.
    pub fn extents(&self) -> impl Iterator<Item = Extent> + '_ {
        self.extents.iter().map(|(&start, &num)| Extent::new(start, num))
    }

    pub fn add_block(&mut self, block: u64) {
        self.add_extent(Extent::new(block, 1));
    }

    pub fn add_extent(&mut self, extent: Extent) {
        if extent.is_hole() || extent.num_blocks == 0 {
            return;
        }
        let mut start = extent.start_block;
        let mut end = extent.end_block();
        // Ends grow with starts, so walking down from the last candidate we can
        // stop at the first extent that ends before `extent` begins.
        let merged: Vec<(u64, u64)> = self
            .extents
            .range(..=end)
            .rev()
            .take_while(|&(&s, &n)| s + n >= extent.start_block)
            .map(|(&s, &n)| (s, n))
            .collect();
        for (s, n) in merged {
            self.extents.remove(&s);
            self.blocks -= n;
            start = start.min(s);
            end = end.max(s + n);
        }
        self.extents.insert(start, end - start);
        self.blocks += end - start;
    }

    pub fn subtract_block(&mut self, block: u64) {
        self.subtract_extent(Extent::new(block, 1));
    }

    pub fn subtract_extent(&mut self, extent: Extent) {
        if extent.is_hole() || extent.num_blocks == 0 {
            return;
        }
        let start = extent.start_block;
        let end = extent.end_block();
        let hit: Vec<(u64, u64)> = self
            .extents
            .range(..end)
            .rev()
            .take_while(|&(&s, &n)| s + n > start)
            .map(|(&s, &n)| (s, n))
            .collect();
        for (s, n) in hit {
            self.extents.remove(&s);
            self.blocks -= n;
            if s < start {
                self.extents.insert(s, start - s);
                self.blocks += start - s;
            }
            if s + n > end {
                self.extents.insert(end, s + n - end);
                self.blocks += s + n - end;
            }
        }
    }

    pub fn add_extents(&mut self, extents: &[Extent]) {
        for &extent in extents {
            self.add_extent(extent);
        }
    }

    pub fn subtract_extents(&mut self, extents: &[Extent]) {
        for &extent in extents {
            self.subtract_extent(extent);
        }
    }

    pub fn add_ranges(&mut self, ranges: &ExtentRanges) {
        for extent in ranges.extents() {
            self.add_extent(extent);
        }
    }

    pub fn subtract_ranges(&mut self, ranges: &ExtentRanges) {
        for extent in ranges.extents() {
            self.subtract_extent(extent);
        }
    }

    pub fn contains_block(&self, block: u64) -> bool {
        self.extents
            .range(..=block)
            .next_back()
            .is_some_and(|(&s, &n)| block < s + n)
    }

    /// True when any stored block falls inside `extent`.
    pub fn overlaps_extent(&self, extent: &Extent) -> bool {
        if extent.is_hole() || extent.num_blocks == 0 {
            return false;
        }
        self.extents
            .range(..extent.end_block())
            .next_back()
            .is_some_and(|(&s, &n)| s + n > extent.start_block)
    }

    /// Returns the shortest prefix of the set, in block order, covering
    /// exactly `count` blocks. The last extent is split if needed.
    pub fn get_extents_for_block_count(&self, count: u64) -> Result<Vec<Extent>> {
        if count > self.blocks {
            return Err(Error::BlockCountOutOfRange {
                requested: count,
                available: self.blocks,
            });
        }
        let mut out = Vec::new();
        let mut out_blocks = 0;
        for extent in self.extents() {
            if out_blocks == count {
                break;
            }
            let needed = count - out_blocks;
            let taken = extent.num_blocks.min(needed);
            out.push(Extent::new(extent.start_block, taken));
            out_blocks += taken;
        }
        Ok(out)
    }
}

impl FromIterator<Extent> for ExtentRanges {
    fn from_iter<I: IntoIterator<Item = Extent>>(iter: I) -> Self {
        let mut ranges = Self::new();
        for extent in iter {
            ranges.add_extent(extent);
        }
        ranges
    }
}

/// Returns `extents` without any block present in `ranges`, keeping the
/// original order and splitting extents around the removed blocks. Holes pass
/// through untouched.
pub fn filter_extent_ranges(extents: &[Extent], ranges: &ExtentRanges) -> Vec<Extent> {
    let mut result = Vec::new();
    for extent in extents {
        if extent.num_blocks == 0 {
            continue;
        }
        if extent.is_hole() {
            result.push(*extent);
            continue;
        }
        let end = extent.end_block();
        let mut cursor = extent.start_block;
        // The range containing the first block may start before it.
        let lower = ranges
            .extents
            .range(..=extent.start_block)
            .next_back()
            .map_or(0, |(&s, _)| s);
        for (&s, &n) in ranges.extents.range(lower..end) {
            if s + n <= cursor {
                continue;
            }
            if s > cursor {
                result.push(Extent::new(cursor, s - cursor));
            }
            cursor = s + n;
            if cursor >= end {
                break;
            }
        }
        if cursor < end {
            result.push(Extent::new(cursor, end - cursor));
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extent::{SPARSE_HOLE, blocks_in_extents};
    use proptest::prelude::*;

    fn ext(start: u64, num: u64) -> Extent {
        Extent::new(start, num)
    }

    fn assert_invariant(ranges: &ExtentRanges) {
        let extents: Vec<_> = ranges.extents().collect();
        for pair in extents.windows(2) {
            assert!(
                !extents_overlap_or_touch(&pair[0], &pair[1]),
                "{:?} and {:?} touch",
                pair[0],
                pair[1]
            );
        }
        assert!(extents.iter().all(|e| e.num_blocks > 0));
        assert_eq!(ranges.blocks(), blocks_in_extents(&extents));
    }

    #[test]
    fn overlap_predicates() {
        assert!(extents_overlap(&ext(10, 5), &ext(14, 1)));
        assert!(!extents_overlap(&ext(10, 5), &ext(15, 1)));
        assert!(extents_overlap_or_touch(&ext(10, 5), &ext(15, 1)));
        assert!(!extents_overlap_or_touch(&ext(10, 5), &ext(16, 1)));
        assert!(extents_overlap(&ext(7, 0), &ext(7, 3)));
        assert!(!extents_overlap(&ext(SPARSE_HOLE, 2), &ext(SPARSE_HOLE, 2)));
        assert!(!extents_overlap_or_touch(&ext(SPARSE_HOLE, 1), &ext(0, 10)));
    }

    #[test]
    fn add_merges_touching_but_not_gaps() {
        let mut ranges = ExtentRanges::new();
        ranges.add_extent(ext(10, 10));
        ranges.add_extent(ext(20, 5));
        ranges.add_extent(ext(26, 4));
        assert_eq!(ranges.extents().collect::<Vec<_>>(), vec![ext(10, 15), ext(26, 4)]);
        assert_eq!(ranges.blocks(), 19);

        ranges.add_block(25);
        assert_eq!(ranges.extents().collect::<Vec<_>>(), vec![ext(10, 20)]);
        assert_eq!(ranges.blocks(), 20);
    }

    #[test]
    fn add_spanning_extent_swallows_several() {
        let mut ranges: ExtentRanges = [ext(1, 1), ext(3, 1), ext(5, 1), ext(20, 2)].into_iter().collect();
        ranges.add_extent(ext(0, 8));
        assert_eq!(ranges.extents().collect::<Vec<_>>(), vec![ext(0, 8), ext(20, 2)]);
        assert_eq!(ranges.blocks(), 10);
        assert_invariant(&ranges);
    }

    #[test]
    fn holes_and_empty_extents_are_ignored() {
        let mut ranges = ExtentRanges::new();
        ranges.add_extent(ext(SPARSE_HOLE, 4));
        ranges.add_extent(ext(3, 0));
        assert!(ranges.is_empty());
        ranges.add_extent(ext(0, 5));
        ranges.subtract_extent(ext(SPARSE_HOLE, 4));
        ranges.subtract_extent(ext(2, 0));
        assert_eq!(ranges.blocks(), 5);
    }

    #[test]
    fn subtract_splits_and_trims() {
        let mut ranges: ExtentRanges = [ext(0, 10), ext(20, 10)].into_iter().collect();
        ranges.subtract_extent(ext(3, 2));
        ranges.subtract_extent(ext(8, 14));
        ranges.subtract_block(29);
        assert_eq!(
            ranges.extents().collect::<Vec<_>>(),
            vec![ext(0, 3), ext(5, 3), ext(22, 7)]
        );
        assert_eq!(ranges.blocks(), 13);
    }

    #[test]
    fn contains_block() {
        let ranges: ExtentRanges = [ext(5, 3), ext(10, 1)].into_iter().collect();
        let inside: Vec<u64> = (0..12).filter(|&b| ranges.contains_block(b)).collect();
        assert_eq!(inside, vec![5, 6, 7, 10]);
        assert!(!ranges.contains_block(SPARSE_HOLE));
    }

    #[test]
    fn overlaps_extent() {
        let ranges: ExtentRanges = [ext(5, 3)].into_iter().collect();
        assert!(ranges.overlaps_extent(&ext(0, 6)));
        assert!(ranges.overlaps_extent(&ext(7, 10)));
        assert!(!ranges.overlaps_extent(&ext(8, 10)));
        assert!(!ranges.overlaps_extent(&ext(0, 5)));
    }

    #[test]
    fn extents_for_block_count() {
        let ranges: ExtentRanges = [ext(0, 4), ext(10, 4), ext(20, 4)].into_iter().collect();
        assert_eq!(ranges.get_extents_for_block_count(0).unwrap(), vec![]);
        assert_eq!(
            ranges.get_extents_for_block_count(6).unwrap(),
            vec![ext(0, 4), ext(10, 2)]
        );
        assert_eq!(
            ranges.get_extents_for_block_count(8).unwrap(),
            vec![ext(0, 4), ext(10, 4)]
        );
        assert!(matches!(
            ranges.get_extents_for_block_count(13),
            Err(Error::BlockCountOutOfRange { requested: 13, available: 12 })
        ));
    }

    #[test]
    fn filter_removes_claimed_blocks() {
        let ranges: ExtentRanges = [ext(3, 2), ext(7, 1), ext(40, 5)].into_iter().collect();
        let extents = [ext(0, 10), ext(42, 2), ext(SPARSE_HOLE, 2), ext(38, 4)];
        assert_eq!(
            filter_extent_ranges(&extents, &ranges),
            vec![ext(0, 3), ext(5, 2), ext(8, 2), ext(SPARSE_HOLE, 2), ext(38, 2)]
        );
    }

    #[test]
    fn filter_keeps_order() {
        let ranges: ExtentRanges = [ext(12, 1)].into_iter().collect();
        let extents = [ext(20, 2), ext(10, 4), ext(0, 1)];
        assert_eq!(
            filter_extent_ranges(&extents, &ranges),
            vec![ext(20, 2), ext(10, 2), ext(13, 1), ext(0, 1)]
        );
    }

    fn extent_strategy() -> impl Strategy<Value = Extent> {
        (0u64..200, 0u64..20).prop_map(|(s, n)| ext(s, n))
    }

    proptest! {
        #[test]
        fn invariant_holds_after_any_sequence(
            ops in prop::collection::vec((any::<bool>(), extent_strategy()), 0..40)
        ) {
            let mut ranges = ExtentRanges::new();
            let mut model = std::collections::BTreeSet::new();
            for (add, extent) in ops {
                let blocks = extent.start_block..extent.end_block();
                if add {
                    ranges.add_extent(extent);
                    model.extend(blocks);
                } else {
                    ranges.subtract_extent(extent);
                    for b in blocks { model.remove(&b); }
                }
                assert_invariant(&ranges);
            }
            prop_assert_eq!(ranges.blocks(), model.len() as u64);
            for b in 0..230 {
                prop_assert_eq!(ranges.contains_block(b), model.contains(&b));
            }
        }

        #[test]
        fn batch_order_does_not_matter(mut extents in prop::collection::vec(extent_strategy(), 0..20)) {
            let mut forward = ExtentRanges::new();
            forward.add_extents(&extents);
            extents.reverse();
            let mut backward = ExtentRanges::new();
            backward.add_extents(&extents);
            prop_assert_eq!(forward, backward);
        }

        #[test]
        fn filter_is_idempotent(
            extents in prop::collection::vec(extent_strategy(), 0..10),
            claimed in prop::collection::vec(extent_strategy(), 0..10),
        ) {
            let ranges: ExtentRanges = claimed.into_iter().collect();
            let once = filter_extent_ranges(&extents, &ranges);
            let twice = filter_extent_ranges(&once, &ranges);
            prop_assert_eq!(&once, &twice);
            for e in &once {
                prop_assert!(!ranges.overlaps_extent(e));
            }
        }
    }
}
