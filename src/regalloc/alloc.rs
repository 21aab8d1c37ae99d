//! Linear-scan register allocation with interval splitting.
//!
//! Intervals are processed in ascending start order through four disjoint
//! sets: `unhandled` (not yet seen), `active` (holding a register and
//! covering the current position), `inactive` (holding a register but
//! currently in a lifetime hole) and `handled`. An interval that cannot be
//! served whole is split; tails go back into `unhandled` and may end up in
//! a different register or in a stack slot, with the move resolver stitching
//! the locations together afterwards.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::amd64::{ALLOCATABLE, Amd64Reg, is_callee_saved};
use crate::lifetime::LifetimeAnalysisResult;
use crate::lifetime::interval::{FixedInterval, LifetimeInterval};
use crate::lifetime::ranges::BlockPosition;
use crate::regalloc::stack::{StackAllocator, StackSlotId};
use crate::regalloc::{AllocatedInterval, AllocationResult, Location};
use crate::registers::{VirtRegId, VirtualRegisterSupply};

struct IntervalSlot {
    interval: LifetimeInterval,
    location: Option<Location>,
}

/// Rounds a position down to one where a location change can take effect:
/// the use slot of the instruction containing `pos`, or the block head.
/// Splitting exactly at a def slot would demand a move between an
/// instruction's reads and its writes, which no insertion point can honor.
fn gap_before(pos: BlockPosition) -> BlockPosition {
    if pos.pos % 2 == 0 && pos.pos > 0 {
        BlockPosition::new(pos.block, pos.pos - 1)
    } else {
        pos
    }
}

pub struct LinearScan<'a> {
    supply: &'a VirtualRegisterSupply,
    fixed: BTreeMap<Amd64Reg, FixedInterval>,
    slots: Vec<IntervalSlot>,
    /// Sorted by (start, register id, slot index): the processing order the
    /// main loop pops from.
    unhandled: BTreeSet<(BlockPosition, VirtRegId, usize)>,
    active: Vec<usize>,
    inactive: Vec<usize>,
    handled: Vec<usize>,
    stack: StackAllocator,
    /// Splits of one virtual register share one spill slot.
    slot_of: HashMap<VirtRegId, StackSlotId>,
    used_callee_saved: BTreeSet<Amd64Reg>,
}

impl<'a> LinearScan<'a> {
    pub fn new(analysis: LifetimeAnalysisResult, supply: &'a VirtualRegisterSupply) -> Self {
        let mut scan = Self {
            supply,
            fixed: analysis.fixed_intervals,
            slots: Vec::new(),
            unhandled: BTreeSet::new(),
            active: Vec::new(),
            inactive: Vec::new(),
            handled: Vec::new(),
            stack: StackAllocator::new(),
            slot_of: HashMap::new(),
            used_callee_saved: BTreeSet::new(),
        };
        for (_, interval) in analysis.virtual_intervals {
            scan.insert_unhandled(interval);
        }
        scan
    }

    fn insert_unhandled(&mut self, interval: LifetimeInterval) {
        let key = (interval.from(), interval.register, self.slots.len());
        self.slots.push(IntervalSlot {
            interval,
            location: None,
        });
        self.unhandled.insert(key);
    }

    fn interval(&self, idx: usize) -> &LifetimeInterval {
        &self.slots[idx].interval
    }

    fn reg_of(&self, idx: usize) -> Amd64Reg {
        match self.slots[idx].location {
            Some(Location::Reg(reg)) => reg,
            other => panic!(
                "regalloc: interval {:?} expected in a register, was {:?}",
                self.interval(idx).register,
                other
            ),
        }
    }

    pub fn run(mut self) -> AllocationResult {
        while let Some(&key) = self.unhandled.iter().next() {
            self.unhandled.remove(&key);
            let (position, _, current) = key;

            self.retire_and_revive(position);

            if !self.try_allocate_free_reg(current, position) {
                self.allocate_blocked_reg(current, position);
            }

            match self.slots[current].location {
                Some(Location::Reg(_)) => self.active.push(current),
                Some(Location::Slot(_)) => self.handled.push(current),
                None => panic!(
                    "regalloc: interval {:?} left unallocated",
                    self.interval(current).register
                ),
            }
        }

        self.handled.extend(self.active.drain(..));
        self.handled.extend(self.inactive.drain(..));
        self.finish()
    }

    /// Moves intervals between `active`, `inactive` and `handled` according
    /// to whether they cover `position`.
    fn retire_and_revive(&mut self, position: BlockPosition) {
        let mut still_active = Vec::with_capacity(self.active.len());
        for idx in std::mem::take(&mut self.active) {
            if self.interval(idx).ends_before(position) {
                self.handled.push(idx);
            } else if !self.interval(idx).covers(position) {
                self.inactive.push(idx);
            } else {
                still_active.push(idx);
            }
        }
        self.active = still_active;

        let mut still_inactive = Vec::with_capacity(self.inactive.len());
        for idx in std::mem::take(&mut self.inactive) {
            if self.interval(idx).ends_before(position) {
                self.handled.push(idx);
            } else if self.interval(idx).covers(position) {
                self.active.push(idx);
            } else {
                still_inactive.push(idx);
            }
        }
        self.inactive = still_inactive;
    }

    // --- Allocation without eviction ---

    fn try_allocate_free_reg(&mut self, current: usize, position: BlockPosition) -> bool {
        let mut free_until: BTreeMap<Amd64Reg, BlockPosition> = ALLOCATABLE
            .iter()
            .map(|&r| (r, BlockPosition::MAX))
            .collect();

        for &idx in &self.active {
            free_until.insert(self.reg_of(idx), BlockPosition::new(0, 0));
        }
        for &idx in &self.inactive {
            let reg = self.reg_of(idx);
            if let Some(at) = self.intersection_with_current(idx, current, position) {
                let entry = free_until.get_mut(&reg).unwrap();
                *entry = (*entry).min(at);
            }
        }
        for (reg, fixed) in &self.fixed {
            if let Some(entry) = free_until.get_mut(reg) {
                if let Some(at) = fixed
                    .ranges
                    .first_intersection(&self.interval(current).ranges, position)
                {
                    *entry = (*entry).min(at);
                }
            }
        }

        let to = self.interval(current).to();

        if let Some(constraint) = self.supply.constraint(self.interval(current).register) {
            // A hard constraint never negotiates: either the register is
            // usable at the start, or the incumbent must be displaced.
            return self.assign_maybe_split(current, constraint, free_until[&constraint], position, to);
        }

        // Prefer a hinted register that can hold the interval to its end.
        let interval = self.interval(current);
        let hinted = interval
            .from_hints
            .iter()
            .chain(interval.to_hints.iter())
            .copied()
            .collect::<BTreeSet<_>>();
        for reg in hinted {
            if free_until.get(&reg).is_some_and(|&free| free > to) {
                self.assign(current, reg);
                return true;
            }
        }

        let (reg, free) = best_by(&free_until);
        self.assign_maybe_split(current, reg, free, position, to)
    }

    /// Assigns `reg` if it is usable at least until the next realizable
    /// split point; the remainder past `free_until` goes back to the
    /// unhandled set.
    fn assign_maybe_split(
        &mut self,
        current: usize,
        reg: Amd64Reg,
        free_until: BlockPosition,
        position: BlockPosition,
        to: BlockPosition,
    ) -> bool {
        if free_until > to {
            self.assign(current, reg);
            return true;
        }
        let split_pos = gap_before(free_until);
        if split_pos <= position {
            return false;
        }
        let tail = self.split_off_tail(current, split_pos);
        self.insert_unhandled(tail);
        self.assign(current, reg);
        true
    }

    fn assign(&mut self, idx: usize, reg: Amd64Reg) {
        self.slots[idx].location = Some(Location::Reg(reg));
        if is_callee_saved(reg) {
            self.used_callee_saved.insert(reg);
        }
    }

    // --- Allocation with eviction ---

    fn allocate_blocked_reg(&mut self, current: usize, position: BlockPosition) {
        if let Some(constraint) = self.supply.constraint(self.interval(current).register) {
            self.displace_incumbents(constraint, current, position);
            self.assign(current, constraint);
            self.split_at_fixed_conflict(current, constraint, position);
            return;
        }

        // Earliest next use per register, over the intervals occupying it.
        let mut next_use: BTreeMap<Amd64Reg, BlockPosition> = ALLOCATABLE
            .iter()
            .map(|&r| (r, BlockPosition::MAX))
            .collect();

        for &idx in &self.active {
            let reg = self.reg_of(idx);
            let use_pos = if self.supply.constraint(self.interval(idx).register).is_some() {
                // Constrained incumbents cannot be displaced.
                position
            } else {
                self.interval(idx)
                    .next_use_after(position)
                    .unwrap_or(BlockPosition::MAX)
            };
            let entry = next_use.get_mut(&reg).unwrap();
            *entry = (*entry).min(use_pos);
        }
        for &idx in &self.inactive {
            if self.intersection_with_current(idx, current, position).is_none() {
                continue;
            }
            let reg = self.reg_of(idx);
            let use_pos = self
                .interval(idx)
                .next_use_after(position)
                .unwrap_or(BlockPosition::MAX);
            let entry = next_use.get_mut(&reg).unwrap();
            *entry = (*entry).min(use_pos);
        }
        for (reg, fixed) in &self.fixed {
            if let Some(entry) = next_use.get_mut(reg) {
                if let Some(at) = fixed
                    .ranges
                    .first_intersection(&self.interval(current).ranges, position)
                {
                    *entry = (*entry).min(at);
                }
            }
        }

        let (reg, best) = best_by(&next_use);

        let first_reg_use = self.interval(current).first_use_needing_a_register();
        match first_reg_use {
            // No use insists on a register: the whole interval can live in
            // memory.
            None => {
                let slot = self.spill_slot_for(self.interval(current).register);
                self.slots[current].location = Some(Location::Slot(slot));
            }
            Some(first_use) if first_use > best => {
                // Every candidate is used again before this interval needs
                // a register, so the current interval is the cheapest to
                // hold in memory up to that first demanding use.
                let split_pos = gap_before(first_use);
                assert!(
                    split_pos > position,
                    "regalloc: {:?} demands a register at its start {:?} but all are occupied",
                    self.interval(current).register,
                    position
                );
                let tail = self.split_off_tail(current, split_pos);
                self.insert_unhandled(tail);
                let slot = self.spill_slot_for(self.interval(current).register);
                self.slots[current].location = Some(Location::Slot(slot));
            }
            Some(_) => {
                assert!(
                    best > position,
                    "regalloc: hard-constrained collision on {:?} at {:?}",
                    reg,
                    position
                );
                self.displace_incumbents(reg, current, position);
                self.assign(current, reg);
                self.split_at_fixed_conflict(current, reg, position);
            }
        }
    }

    /// Takes `reg` away from whatever holds it at or after `position`.
    fn displace_incumbents(&mut self, reg: Amd64Reg, current: usize, position: BlockPosition) {
        let split_pos = gap_before(position);
        if let Some(at) = self.active.iter().position(|&idx| self.reg_of(idx) == reg) {
            let victim = self.active.remove(at);
            assert!(
                self.supply
                    .constraint(self.interval(victim).register)
                    .is_none(),
                "regalloc: constrained intervals {:?} and {:?} collide on {}",
                self.interval(victim).register,
                self.interval(current).register,
                reg
            );
            assert!(
                self.interval(victim).from() < split_pos,
                "regalloc: cannot displace {:?} at its own start",
                self.interval(victim).register
            );
            let tail = self.split_off_tail(victim, split_pos);
            self.insert_unhandled(tail);
            self.handled.push(victim);
        }

        let mut remaining = Vec::with_capacity(self.inactive.len());
        for idx in std::mem::take(&mut self.inactive) {
            if self.reg_of(idx) != reg {
                remaining.push(idx);
                continue;
            }
            match self.intersection_with_current(idx, current, position) {
                // Resumes only after the current interval is gone.
                None => remaining.push(idx),
                Some(resume) => {
                    // Holes of virtual intervals end on block boundaries,
                    // so the resumption point is a block head and the
                    // location change rides the edge moves.
                    let tail = self.split_off_tail(idx, gap_before(resume));
                    self.insert_unhandled(tail);
                    self.handled.push(idx);
                }
            }
        }
        self.inactive = remaining;
    }

    /// A fixed interval on the assigned register forces the current interval
    /// out before the collision.
    fn split_at_fixed_conflict(&mut self, current: usize, reg: Amd64Reg, position: BlockPosition) {
        let Some(fixed) = self.fixed.get(&reg) else {
            return;
        };
        // A collision exactly at the start is the constraint's own def or
        // use site, not a conflict.
        let after = BlockPosition::new(position.block, position.pos + 1);
        if let Some(at) = fixed
            .ranges
            .first_intersection(&self.interval(current).ranges, after)
        {
            let split_pos = gap_before(at);
            if split_pos > position && split_pos <= self.interval(current).to() {
                let tail = self.split_off_tail(current, split_pos);
                self.insert_unhandled(tail);
            }
        }
    }

    // --- Splitting and spilling ---

    fn split_off_tail(&mut self, idx: usize, at: BlockPosition) -> LifetimeInterval {
        let split = self.slots[idx].interval.split_before(at);
        assert!(
            !split.before.ranges.is_empty() && !split.after.ranges.is_empty(),
            "regalloc: split of {:?} at {:?} produced an empty half",
            self.slots[idx].interval.register,
            at
        );
        self.slots[idx].interval = split.before;
        split.after
    }

    fn spill_slot_for(&mut self, register: VirtRegId) -> StackSlotId {
        if let Some(&slot) = self.slot_of.get(&register) {
            return slot;
        }
        let slot = self.stack.alloc_slot();
        self.slot_of.insert(register, slot);
        slot
    }

    fn intersection_with_current(
        &self,
        idx: usize,
        current: usize,
        position: BlockPosition,
    ) -> Option<BlockPosition> {
        self.interval(idx)
            .ranges
            .first_intersection(&self.interval(current).ranges, position)
    }

    fn finish(self) -> AllocationResult {
        debug_assert_eq!(
            self.handled.len(),
            self.slots.len(),
            "regalloc: not every interval reached the handled set"
        );
        let mut intervals: Vec<AllocatedInterval> = self
            .slots
            .into_iter()
            .map(|slot| AllocatedInterval {
                location: slot.location.unwrap_or_else(|| {
                    panic!(
                        "regalloc: interval {:?} never received a location",
                        slot.interval.register
                    )
                }),
                interval: slot.interval,
            })
            .collect();
        intervals.sort_by_key(|ai| (ai.interval.register, ai.interval.from()));

        AllocationResult::new(
            intervals,
            self.slot_of,
            self.stack,
            self.used_callee_saved.into_iter().collect(),
        )
    }
}

/// Register with the latest position, ties broken by allocation order.
fn best_by(map: &BTreeMap<Amd64Reg, BlockPosition>) -> (Amd64Reg, BlockPosition) {
    let mut best = None;
    for &reg in &ALLOCATABLE {
        let pos = map[&reg];
        if best.is_none_or(|(_, b)| pos > b) {
            best = Some((reg, pos));
        }
    }
    best.expect("regalloc: no allocatable registers")
}
