//! Lifetime intervals for virtual registers and fixed intervals for
//! physical ones.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::amd64::Amd64Reg;
use crate::block::BlockRef;
use crate::lifetime::ranges::{BlockPosition, LinearLiveRanges, LiveRange, Split};
use crate::registers::VirtRegId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UseSite {
    pub position: BlockPosition,
    pub may_be_replaced_by_memory_access: bool,
}

/// Live ranges, use sites and register preferences of one virtual register.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifetimeInterval {
    pub register: VirtRegId,
    pub uses: BTreeMap<BlockPosition, UseSite>,
    pub ranges: LinearLiveRanges,
    /// Preferences propagated forward from defs feeding a constrained
    /// operand.
    pub from_hints: BTreeSet<Amd64Reg>,
    /// Preferences propagated backward from uses read into a constrained
    /// operand.
    pub to_hints: BTreeSet<Amd64Reg>,
}

impl LifetimeInterval {
    pub fn new(register: VirtRegId) -> Self {
        Self {
            register,
            uses: BTreeMap::new(),
            ranges: LinearLiveRanges::new(),
            from_hints: BTreeSet::new(),
            to_hints: BTreeSet::new(),
        }
    }

    pub fn first_use(&self) -> Option<BlockPosition> {
        self.uses.keys().next().copied()
    }

    pub fn next_use_after(&self, position: BlockPosition) -> Option<BlockPosition> {
        self.uses.range(position..).next().map(|(pos, _)| *pos)
    }

    /// First use site the allocator cannot satisfy from a stack slot.
    pub fn first_use_needing_a_register(&self) -> Option<BlockPosition> {
        self.uses
            .values()
            .find(|site| !site.may_be_replaced_by_memory_access)
            .map(|site| site.position)
    }

    pub fn lifetime_in_block(&self, block: BlockRef) -> Option<LiveRange> {
        let ranges = self.ranges.live_ranges_in(block);
        assert!(
            ranges.len() <= 1,
            "lifetime: virtual interval {:?} has {} ranges in block {}",
            self.register,
            ranges.len(),
            block
        );
        ranges.first().copied()
    }

    pub fn from(&self) -> BlockPosition {
        self.ranges.from()
    }

    pub fn to(&self) -> BlockPosition {
        self.ranges.to()
    }

    pub fn first_block(&self) -> BlockRef {
        self.from().block
    }

    pub fn last_block(&self) -> BlockRef {
        self.to().block
    }

    pub fn make_alive_in_whole_block(&mut self, block: BlockRef, end: u32) {
        self.set_live_range(LiveRange::everywhere(block, end));
    }

    fn set_live_range(&mut self, range: LiveRange) {
        self.ranges.delete_live_ranges(range.block);
        self.ranges.add_live_range(range);
    }

    /// Records a definition, shortening the open range of its block so the
    /// interval starts at the def. A def with no observed use becomes a
    /// one-position range, which keeps the defined register reserved at
    /// that instruction.
    pub fn set_def(&mut self, position: BlockPosition, may_be_replaced_by_memory_access: bool) {
        assert!(position.is_def(), "lifetime: {:?} is not a def slot", position);
        self.uses.insert(
            position,
            UseSite {
                position,
                may_be_replaced_by_memory_access,
            },
        );
        match self.lifetime_in_block(position.block) {
            Some(range) => self.set_live_range(range.with_from(position.pos)),
            None => self
                .ranges
                .add_live_range(LiveRange::new(position.block, position.pos, position.pos)),
        }
    }

    pub fn add_use(&mut self, position: BlockPosition, may_be_replaced_by_memory_access: bool) {
        assert!(position.is_use(), "lifetime: {:?} is not a use slot", position);
        self.uses.insert(
            position,
            UseSite {
                position,
                may_be_replaced_by_memory_access,
            },
        );
        if self.lifetime_in_block(position.block).is_none() {
            self.ranges
                .add_live_range(LiveRange::new(position.block, 0, position.pos));
        }
    }

    pub fn covers(&self, position: BlockPosition) -> bool {
        self.lifetime_in_block(position.block)
            .is_some_and(|range| range.contains(position))
    }

    /// Whether the interval lies entirely left of `position` on the global
    /// linear axis.
    pub fn ends_before(&self, position: BlockPosition) -> bool {
        self.to() < position
    }

    /// Splits into `(before, after)`: `before` keeps the uses strictly
    /// before `pos` and the ranges ending there, `after` the remainder.
    /// The lifetime may stretch beyond the last use (loops), so only the
    /// `after` part gets a tightened start. Splitting inside a loop leaves
    /// both definitions reaching, the one place single-assignment form is
    /// given up.
    pub fn split_before(&self, pos: BlockPosition) -> Split<LifetimeInterval> {
        assert!(
            self.from() <= pos,
            "lifetime: split of {:?} at {:?} lies before its def {:?}",
            self.register,
            pos,
            self.from()
        );
        assert!(
            pos <= self.to(),
            "lifetime: split of {:?} at {:?} lies after its death {:?}",
            self.register,
            pos,
            self.to()
        );

        let ranges = self.ranges.split_before(pos);
        let mut before_uses = self.uses.clone();
        let after_uses = before_uses.split_off(&pos);

        let mut before = LifetimeInterval::new(self.register);
        before.uses = before_uses;
        before.ranges = ranges.before;
        before.from_hints = self.from_hints.clone();

        let mut after = LifetimeInterval::new(self.register);
        after.uses = after_uses;
        after.ranges = ranges.after;
        after.to_hints = self.to_hints.clone();

        Split { before, after }
    }
}

impl fmt::Display for LifetimeInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%v{}:", self.register.0)?;
        for range in self.ranges.iter() {
            write!(f, " [{}:{}-{}]", range.block, range.from, range.to)?;
        }
        Ok(())
    }
}

/// Forced occupancy of one physical register, at call sites, divisions and
/// other instructions naming it directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedInterval {
    pub register: Amd64Reg,
    pub ranges: LinearLiveRanges,
}

impl FixedInterval {
    pub fn new(register: Amd64Reg) -> Self {
        Self {
            register,
            ranges: LinearLiveRanges::new(),
        }
    }

    pub fn add_def(&mut self, position: BlockPosition) {
        match self.ranges.range_containing(position) {
            // A write without a later read, as register constraints at
            // calls produce. An interval of length 1 keeps the register
            // blocked at the site itself.
            None => self.ranges.add_live_range(LiveRange::new(
                position.block,
                position.pos,
                position.pos,
            )),
            Some(live) => {
                self.ranges.delete_live_range(live);
                self.ranges.add_live_range(live.with_from(position.pos));
            }
        }
    }

    pub fn add_use(&mut self, position: BlockPosition) {
        if self.ranges.range_containing(position).is_none() {
            // Register constraints never reach over block borders, so a
            // definition inside this block must eventually close the range.
            self.ranges
                .add_live_range(LiveRange::new(position.block, 0, position.pos));
        }
    }
}
