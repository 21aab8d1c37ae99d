//! Register allocation: linear scan over lifetime intervals, spill slot
//! management, and the move resolution that reconnects split locations.

pub mod alloc;
pub mod resolve;
pub mod stack;

use std::collections::HashMap;
use std::fmt;

use crate::amd64::Amd64Reg;
use crate::lifetime::LifetimeAnalysisResult;
use crate::lifetime::interval::LifetimeInterval;
use crate::lifetime::ranges::BlockPosition;
use crate::regalloc::stack::{StackAllocator, StackSlotId};
use crate::registers::{VirtRegId, VirtualRegisterSupply};

pub use self::alloc::LinearScan;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Location {
    Reg(Amd64Reg),
    Slot(StackSlotId),
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Reg(reg) => write!(f, "{}", reg),
            Location::Slot(slot) => write!(f, "stack[{}]", slot.0),
        }
    }
}

/// One (possibly split) interval with its final location.
#[derive(Debug)]
pub struct AllocatedInterval {
    pub interval: LifetimeInterval,
    pub location: Location,
}

pub struct AllocationResult {
    pub intervals: Vec<AllocatedInterval>,
    pub slot_of: HashMap<VirtRegId, StackSlotId>,
    pub stack: StackAllocator,
    pub used_callee_saved: Vec<Amd64Reg>,
    /// Indices into `intervals`, grouped per virtual register.
    by_register: HashMap<VirtRegId, Vec<usize>>,
}

impl AllocationResult {
    pub(crate) fn new(
        intervals: Vec<AllocatedInterval>,
        slot_of: HashMap<VirtRegId, StackSlotId>,
        stack: StackAllocator,
        used_callee_saved: Vec<Amd64Reg>,
    ) -> Self {
        let mut by_register: HashMap<VirtRegId, Vec<usize>> = HashMap::new();
        for (idx, ai) in intervals.iter().enumerate() {
            by_register.entry(ai.interval.register).or_default().push(idx);
        }
        Self {
            intervals,
            slot_of,
            stack,
            used_callee_saved,
            by_register,
        }
    }

    /// The split pieces of one virtual register, ordered by start.
    pub fn intervals_of(&self, register: VirtRegId) -> Vec<&AllocatedInterval> {
        self.by_register
            .get(&register)
            .map(|indices| indices.iter().map(|&i| &self.intervals[i]).collect())
            .unwrap_or_default()
    }

    /// Where a virtual register lives at `position`. The caller must only
    /// ask at positions the register is live, which every well-formed query
    /// site (operand rewriting, move resolution) guarantees.
    pub fn location_at(&self, register: VirtRegId, position: BlockPosition) -> Location {
        for ai in self.intervals_of(register) {
            if ai.interval.covers(position) {
                return ai.location;
            }
        }
        panic!(
            "regalloc: {:?} is not live at {:?}",
            register, position
        )
    }

    pub fn covers(&self, register: VirtRegId, position: BlockPosition) -> bool {
        self.intervals_of(register)
            .iter()
            .any(|ai| ai.interval.covers(position))
    }

    /// Format the allocation for human-readable output.
    pub fn format_alloc_map(&self, func_name: &str) -> String {
        let mut out = String::new();
        out.push_str(&format!("Reg Alloc Map ({}):\n", func_name));
        out.push_str("--------------------------------\n");
        for ai in &self.intervals {
            out.push_str(&format!("{} -> {}\n", ai.interval, ai.location));
        }
        out.push_str("--------------------------------\n");
        out
    }
}

/// Run register allocation for one procedure.
pub fn allocate_registers(
    analysis: LifetimeAnalysisResult,
    supply: &VirtualRegisterSupply,
) -> AllocationResult {
    LinearScan::new(analysis, supply).run()
}

#[cfg(test)]
#[path = "../tests/t_alloc.rs"]
mod tests;
