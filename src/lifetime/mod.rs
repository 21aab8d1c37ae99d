//! Lifetime analysis.
//!
//! Computes per-block live-out sets by fixed-point iteration, then walks
//! the linearized blocks in reverse, opening and shortening live ranges at
//! use and def slots. Phi liveness is edge-aware: a phi's source operand
//! counts as used at the end of the predecessor it flows in from, and its
//! destination is defined at position 0 of the phi's block.

pub mod interval;
pub mod ranges;

use std::collections::{BTreeMap, BTreeSet, HashSet};

use indexmap::IndexMap;

use crate::amd64::{Amd64Reg, CALLER_SAVED};
use crate::block::{BlockRef, CodeBlock};
use crate::lifetime::interval::{FixedInterval, LifetimeInterval};
use crate::lifetime::ranges::{BlockPosition, LiveRange, end_pos};
use crate::linearize::Linearization;
use crate::registers::{Register, VirtRegId, VirtualRegisterSupply};

pub struct LifetimeAnalysisResult {
    pub virtual_intervals: IndexMap<VirtRegId, LifetimeInterval>,
    pub fixed_intervals: BTreeMap<Amd64Reg, FixedInterval>,
}

impl LifetimeAnalysisResult {
    pub fn interval(&self, register: VirtRegId) -> &LifetimeInterval {
        self.virtual_intervals
            .get(&register)
            .unwrap_or_else(|| panic!("lifetime: no interval for {:?}", register))
    }
}

pub fn analyze(
    blocks: &[CodeBlock],
    supply: &VirtualRegisterSupply,
    lin: &Linearization,
) -> LifetimeAnalysisResult {
    let live_out = block_live_out(blocks);
    let mut analysis = Analysis {
        blocks,
        virtual_intervals: IndexMap::new(),
        fixed_intervals: BTreeMap::new(),
    };
    analysis.build_intervals(&live_out, lin);
    let mut result = LifetimeAnalysisResult {
        virtual_intervals: analysis.virtual_intervals,
        fixed_intervals: analysis.fixed_intervals,
    };
    propagate_hints(blocks, supply, &mut result);
    result
}

// --- Block liveness (fixed point) ---

struct GenKill {
    gen_set: HashSet<VirtRegId>,
    kill_set: HashSet<VirtRegId>,
}

fn gen_kill_for_block(block: &CodeBlock) -> GenKill {
    let mut gen_set = HashSet::new();
    let mut kill_set = HashSet::new();

    // Phi destinations are defined at the block head, before any
    // instruction reads.
    for phi in &block.phis {
        if let Register::Virtual(v) = phi.dest {
            kill_set.insert(v);
        }
    }

    for inst in &block.instructions {
        for u in inst.uses() {
            if let Register::Virtual(v) = u.register {
                if !kill_set.contains(&v) {
                    gen_set.insert(v);
                }
            }
        }
        for d in inst.defs() {
            if let Register::Virtual(v) = d.register {
                kill_set.insert(v);
            }
        }
    }

    GenKill { gen_set, kill_set }
}

/// Virtual registers flowing into `succ` over the edge from `pred` as phi
/// arguments.
fn phi_inputs_over_edge(succ: &CodeBlock, pred: BlockRef) -> Vec<VirtRegId> {
    succ.phis
        .iter()
        .filter_map(|phi| phi.input_for(pred).as_register())
        .filter_map(Register::as_virtual)
        .collect()
}

fn block_live_out(blocks: &[CodeBlock]) -> Vec<HashSet<VirtRegId>> {
    let gen_kill: Vec<GenKill> = blocks.iter().map(gen_kill_for_block).collect();
    let mut live_in: Vec<HashSet<VirtRegId>> = vec![HashSet::new(); blocks.len()];
    let mut live_out: Vec<HashSet<VirtRegId>> = vec![HashSet::new(); blocks.len()];

    let mut changed = true;
    while changed {
        changed = false;
        for i in (0..blocks.len()).rev() {
            let mut new_live_out = HashSet::new();
            for target in blocks[i].exit.targets() {
                let t = target as usize;
                new_live_out.extend(live_in[t].iter().copied());
                new_live_out.extend(phi_inputs_over_edge(&blocks[t], i as BlockRef));
            }
            if live_out[i] != new_live_out {
                live_out[i] = new_live_out;
                changed = true;
            }

            let gk = &gen_kill[i];
            let mut new_live_in = gk.gen_set.clone();
            new_live_in.extend(live_out[i].difference(&gk.kill_set).copied());
            if live_in[i] != new_live_in {
                live_in[i] = new_live_in;
                changed = true;
            }
        }
    }

    live_out
}

// --- Interval construction (reverse walk) ---

struct Analysis<'a> {
    blocks: &'a [CodeBlock],
    virtual_intervals: IndexMap<VirtRegId, LifetimeInterval>,
    fixed_intervals: BTreeMap<Amd64Reg, FixedInterval>,
}

impl<'a> Analysis<'a> {
    fn interval_mut(&mut self, register: VirtRegId) -> &mut LifetimeInterval {
        self.virtual_intervals
            .entry(register)
            .or_insert_with(|| LifetimeInterval::new(register))
    }

    fn fixed_mut(&mut self, register: Amd64Reg) -> &mut FixedInterval {
        self.fixed_intervals
            .entry(register)
            .or_insert_with(|| FixedInterval::new(register))
    }

    fn build_intervals(&mut self, live_out: &[HashSet<VirtRegId>], lin: &Linearization) {
        for (i, block) in self.blocks.iter().enumerate().rev() {
            let ordinal = i as BlockRef;
            let end = end_pos(block.instructions.len());
            let end_position = BlockPosition::new(ordinal, end);

            // Values live out of the block are provisionally live through
            // all of it; defs below shorten the range.
            let mut live: BTreeSet<VirtRegId> = live_out[i].iter().copied().collect();
            for &v in &live {
                self.interval_mut(v)
                    .ranges
                    .add_live_range(LiveRange::everywhere(ordinal, end));
            }

            // Phi arguments of successors are used at this block's end.
            for target in block.exit.targets() {
                for v in phi_inputs_over_edge(&self.blocks[target as usize], ordinal) {
                    self.interval_mut(v).add_use(end_position, true);
                }
            }

            for (k, inst) in block.instructions.iter().enumerate().rev() {
                let def_pos = BlockPosition::def_slot(ordinal, k);
                let use_pos = BlockPosition::use_slot(ordinal, k);

                for d in inst.defs() {
                    match d.register {
                        Register::Virtual(v) => {
                            self.interval_mut(v)
                                .set_def(def_pos, d.may_be_replaced_by_memory_access);
                            live.remove(&v);
                        }
                        Register::Phys(r) => self.fixed_mut(r).add_def(def_pos),
                    }
                }

                if inst.is_call() {
                    // The call tramples every caller-saved register at its
                    // def slot; one-position fixed ranges force live values
                    // out of them.
                    for r in CALLER_SAVED {
                        self.fixed_mut(r).add_def(def_pos);
                    }
                }

                for u in inst.uses() {
                    match u.register {
                        Register::Virtual(v) => {
                            self.interval_mut(v)
                                .add_use(use_pos, u.may_be_replaced_by_memory_access);
                            live.insert(v);
                        }
                        Register::Phys(r) => self.fixed_mut(r).add_use(use_pos),
                    }
                }
            }

            for phi in &block.phis {
                if let Register::Virtual(v) = phi.dest {
                    self.interval_mut(v)
                        .set_def(BlockPosition::block_start(ordinal), true);
                    live.remove(&v);
                }
            }

            // Whatever is still live at a loop header flows around the back
            // edge, so it must survive the entire loop body.
            if let Some(l) = lin.loop_with_header(ordinal) {
                if !live.is_empty() {
                    for &member in &l.members {
                        let member_end = end_pos(self.blocks[member as usize].instructions.len());
                        for &v in &live {
                            self.interval_mut(v).make_alive_in_whole_block(member, member_end);
                        }
                    }
                }
            }
        }
    }
}

// --- Hint propagation ---

/// Physical registers a copy partner would like `register` to be in.
fn to_candidates(
    register: Register,
    supply: &VirtualRegisterSupply,
    result: &LifetimeAnalysisResult,
) -> BTreeSet<Amd64Reg> {
    match register {
        Register::Phys(r) => BTreeSet::from([r]),
        Register::Virtual(v) => {
            let mut set = result.interval(v).to_hints.clone();
            set.extend(supply.constraint(v));
            set
        }
    }
}

fn from_candidates(
    register: Register,
    supply: &VirtualRegisterSupply,
    result: &LifetimeAnalysisResult,
) -> BTreeSet<Amd64Reg> {
    match register {
        Register::Phys(r) => BTreeSet::from([r]),
        Register::Virtual(v) => {
            let mut set = result.interval(v).from_hints.clone();
            set.extend(supply.constraint(v));
            set
        }
    }
}

/// Connects copy partners: a `mov` (or phi edge) into a constrained
/// position hints its source toward that register, and a copy out of a
/// constrained position hints its destination. The backward pass transports
/// to-hints through copy chains toward their sources; the forward pass does
/// the same for from-hints.
fn propagate_hints(
    blocks: &[CodeBlock],
    supply: &VirtualRegisterSupply,
    result: &mut LifetimeAnalysisResult,
) {
    // Backward: to-hints.
    for block in blocks.iter().rev() {
        for inst in block.instructions.iter().rev() {
            if let Some((src, dst)) = inst.copy_registers() {
                if let Register::Virtual(sv) = src {
                    let cands = to_candidates(dst, supply, result);
                    if result.virtual_intervals.contains_key(&sv) {
                        result.virtual_intervals[&sv].to_hints.extend(cands);
                    }
                }
            }
        }
        for phi in &block.phis {
            let cands = to_candidates(phi.dest, supply, result);
            for (_, input) in &phi.inputs {
                if let Some(Register::Virtual(v)) = input.as_register() {
                    if result.virtual_intervals.contains_key(&v) {
                        result.virtual_intervals[&v].to_hints.extend(cands.clone());
                    }
                }
            }
        }
    }

    // Forward: from-hints.
    for block in blocks {
        for phi in &block.phis {
            if let Register::Virtual(dv) = phi.dest {
                let mut cands = BTreeSet::new();
                for (_, input) in &phi.inputs {
                    if let Some(reg) = input.as_register() {
                        cands.extend(from_candidates(reg, supply, result));
                    }
                }
                if result.virtual_intervals.contains_key(&dv) {
                    result.virtual_intervals[&dv].from_hints.extend(cands);
                }
            }
        }
        for inst in &block.instructions {
            if let Some((src, dst)) = inst.copy_registers() {
                if let Register::Virtual(dv) = dst {
                    let cands = from_candidates(src, supply, result);
                    if result.virtual_intervals.contains_key(&dv) {
                        result.virtual_intervals[&dv].from_hints.extend(cands);
                    }
                }
            }
        }
    }
}

// --- Dump output ---

/// Format intervals for human-readable output.
pub fn format_intervals(result: &LifetimeAnalysisResult, func_name: &str) -> String {
    let mut out = String::new();
    out.push_str(&format!("Lifetime Intervals ({}):\n", func_name));
    out.push_str("--------------------------------\n");
    let mut ids: Vec<_> = result.virtual_intervals.keys().copied().collect();
    ids.sort();
    for id in ids {
        let interval = &result.virtual_intervals[&id];
        out.push_str(&format!("  {}\n", interval));
    }
    out.push_str("--------------------------------\n");
    out
}

#[cfg(test)]
#[path = "../tests/t_lifetime.rs"]
mod tests;
