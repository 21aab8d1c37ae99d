//! Linear positions and live ranges.
//!
//! Lifetime analysis flattens the linearized blocks into a position axis:
//! within a block, instruction `k` uses its operands at position `2k + 1`
//! and defines its results at `2k + 2`. Position `0` is the block head
//! (where phi destinations are defined) and the block end position lies one
//! past the last instruction's def slot, so values flowing out over an edge
//! are "used" there.

use std::collections::BTreeMap;

use crate::block::BlockRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockPosition {
    pub block: BlockRef,
    pub pos: u32,
}

impl BlockPosition {
    pub const MAX: BlockPosition = BlockPosition {
        block: u32::MAX,
        pos: u32::MAX,
    };

    pub fn new(block: BlockRef, pos: u32) -> Self {
        Self { block, pos }
    }

    pub fn use_slot(block: BlockRef, inst_index: usize) -> Self {
        Self::new(block, 2 * inst_index as u32 + 1)
    }

    pub fn def_slot(block: BlockRef, inst_index: usize) -> Self {
        Self::new(block, 2 * inst_index as u32 + 2)
    }

    pub fn block_start(block: BlockRef) -> Self {
        Self::new(block, 0)
    }

    pub fn block_end(block: BlockRef, inst_count: usize) -> Self {
        Self::new(block, end_pos(inst_count))
    }

    pub fn is_def(self) -> bool {
        self.pos % 2 == 0
    }

    pub fn is_use(self) -> bool {
        !self.is_def()
    }

    /// Index of the instruction a move must precede to take effect at this
    /// position.
    pub fn instruction_index(self) -> usize {
        (self.pos / 2) as usize
    }
}

pub fn end_pos(inst_count: usize) -> u32 {
    2 * inst_count as u32 + 1
}

/// A closed interval of positions within one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveRange {
    pub block: BlockRef,
    pub from: u32,
    pub to: u32,
}

impl LiveRange {
    pub fn new(block: BlockRef, from: u32, to: u32) -> Self {
        assert!(from <= to, "lifetime: live range {}..{} inverted", from, to);
        Self { block, from, to }
    }

    pub fn everywhere(block: BlockRef, end: u32) -> Self {
        Self::new(block, 0, end)
    }

    pub fn with_from(self, from: u32) -> Self {
        Self::new(self.block, from, self.to.max(from))
    }

    pub fn with_to(self, to: u32) -> Self {
        Self::new(self.block, self.from.min(to), to)
    }

    pub fn contains(&self, position: BlockPosition) -> bool {
        self.block == position.block && self.from <= position.pos && position.pos <= self.to
    }

    pub fn from_position(&self) -> BlockPosition {
        BlockPosition::new(self.block, self.from)
    }

    pub fn to_position(&self) -> BlockPosition {
        BlockPosition::new(self.block, self.to)
    }
}

/// The two halves of a split, in interval order.
#[derive(Debug)]
pub struct Split<T> {
    pub before: T,
    pub after: T,
}

/// An ordered, non-overlapping set of live ranges.
///
/// Virtual intervals keep at most one range per block (holes lie on block
/// boundaries); fixed intervals may carry several, one per occupation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinearLiveRanges {
    ranges: BTreeMap<BlockRef, Vec<LiveRange>>,
}

impl LinearLiveRanges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn add_live_range(&mut self, range: LiveRange) {
        let ranges = self.ranges.entry(range.block).or_default();
        let at = ranges.partition_point(|r| r.from < range.from);
        if let Some(prev) = at.checked_sub(1).map(|i| &ranges[i]) {
            assert!(
                prev.to < range.from,
                "lifetime: overlapping live ranges {:?} and {:?}",
                prev,
                range
            );
        }
        if let Some(next) = ranges.get(at) {
            assert!(
                range.to < next.from,
                "lifetime: overlapping live ranges {:?} and {:?}",
                range,
                next
            );
        }
        ranges.insert(at, range);
    }

    pub fn delete_live_ranges(&mut self, block: BlockRef) {
        self.ranges.remove(&block);
    }

    pub fn delete_live_range(&mut self, range: LiveRange) {
        if let Some(ranges) = self.ranges.get_mut(&range.block) {
            ranges.retain(|r| *r != range);
            if ranges.is_empty() {
                self.ranges.remove(&range.block);
            }
        }
    }

    pub fn live_ranges_in(&self, block: BlockRef) -> &[LiveRange] {
        self.ranges.get(&block).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn range_containing(&self, position: BlockPosition) -> Option<LiveRange> {
        self.live_ranges_in(position.block)
            .iter()
            .find(|r| r.contains(position))
            .copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LiveRange> {
        self.ranges.values().flatten()
    }

    pub fn from(&self) -> BlockPosition {
        self.iter()
            .next()
            .map(LiveRange::from_position)
            .unwrap_or_else(|| panic!("lifetime: from() on empty ranges"))
    }

    pub fn to(&self) -> BlockPosition {
        let (_, ranges) = self
            .ranges
            .iter()
            .next_back()
            .unwrap_or_else(|| panic!("lifetime: to() on empty ranges"));
        ranges
            .last()
            .expect("lifetime: block entry with no ranges")
            .to_position()
    }

    /// First position at or after `from` where both range sets are live.
    pub fn first_intersection(
        &self,
        other: &LinearLiveRanges,
        from: BlockPosition,
    ) -> Option<BlockPosition> {
        let mut best: Option<BlockPosition> = None;
        for (&block, ranges) in self.ranges.range(from.block..) {
            let Some(other_ranges) = other.ranges.get(&block) else {
                continue;
            };
            for a in ranges {
                for b in other_ranges {
                    let lo = a.from.max(b.from);
                    let hi = a.to.min(b.to);
                    if lo > hi {
                        continue;
                    }
                    let mut at = BlockPosition::new(block, lo);
                    if at < from {
                        if BlockPosition::new(block, hi) < from {
                            continue;
                        }
                        at = from;
                    }
                    if best.is_none_or(|found| at < found) {
                        best = Some(at);
                    }
                }
            }
            if best.is_some() {
                // Later blocks can only produce later positions.
                break;
            }
        }
        best
    }

    /// Splits so that `before` holds everything strictly left of `pos` and
    /// `after` the remainder. A range straddling `pos` is cut in two.
    pub fn split_before(&self, pos: BlockPosition) -> Split<LinearLiveRanges> {
        let mut before = LinearLiveRanges::new();
        let mut after = LinearLiveRanges::new();
        for range in self.iter() {
            if range.to_position() < pos {
                before.add_live_range(*range);
            } else if range.from_position() >= pos {
                after.add_live_range(*range);
            } else {
                // from < pos <= to within pos.block
                before.add_live_range(range.with_to(pos.pos - 1));
                after.add_live_range(range.with_from(pos.pos));
            }
        }
        Split { before, after }
    }
}
