//! Move resolution.
//!
//! After allocation a virtual register may live in different locations over
//! its lifetime (splits) and phi functions still await lowering. This pass
//! plans the moves: at intra-block split points, and on control-flow edges
//! where locations disagree or phis select values. Each edge's moves form a
//! parallel copy; ordering keeps not-yet-read sources intact and cycles are
//! broken with `xchg` (register cycles) or push/pop staging (cycles through
//! memory).

use std::collections::BTreeMap;

use crate::block::{BlockRef, CodeBlock, ExitArity};
use crate::lifetime::ranges::BlockPosition;
use crate::regalloc::{AllocationResult, Location};
use crate::registers::Register;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveSrc {
    Loc(Location),
    Imm(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveOp {
    Move { src: MoveSrc, dst: Location },
    Xchg { a: Location, b: Location },
    /// Staging for cycles that touch memory: the pushed value reappears at
    /// the matching `Pop`.
    Push { src: MoveSrc },
    Pop { dst: Location },
}

/// All moves to weave into the instruction stream, keyed by insertion point.
#[derive(Debug, Default)]
pub struct ResolvedMoves {
    /// Before instruction `index` of a block.
    pub at_instruction: BTreeMap<(BlockRef, usize), Vec<MoveOp>>,
    /// After the last instruction of a block, before its exit jump.
    pub at_block_end: BTreeMap<BlockRef, Vec<MoveOp>>,
    /// At a block's head, before its first instruction.
    pub at_block_start: BTreeMap<BlockRef, Vec<MoveOp>>,
}

pub fn resolve_moves(blocks: &[CodeBlock], alloc: &AllocationResult) -> ResolvedMoves {
    let mut resolved = ResolvedMoves::default();
    resolve_split_moves(alloc, &mut resolved);
    resolve_edges(blocks, alloc, &mut resolved);
    resolved
}

// --- Intra-block split moves ---

fn resolve_split_moves(alloc: &AllocationResult, resolved: &mut ResolvedMoves) {
    let mut registers: Vec<_> = alloc
        .intervals
        .iter()
        .map(|ai| ai.interval.register)
        .collect();
    registers.dedup();

    for register in registers {
        let pieces = alloc.intervals_of(register);
        for pair in pieces.windows(2) {
            let (before, after) = (&pair[0], &pair[1]);
            let at = after.interval.from();
            // A location change across a block boundary is reconnected by
            // edge resolution; only splits inside one block insert here.
            if before.interval.to().block != at.block {
                continue;
            }
            if before.location == after.location {
                continue;
            }
            // The allocator only changes locations at use slots, where a
            // move in the gap before the instruction neither clobbers a
            // still-needed register nor misses the instruction's reads.
            debug_assert!(
                at.is_use(),
                "resolve: split of {:?} at a def slot {:?}",
                register,
                at
            );
            resolved
                .at_instruction
                .entry((at.block, at.instruction_index()))
                .or_default()
                .push(MoveOp::Move {
                    src: MoveSrc::Loc(before.location),
                    dst: after.location,
                });
        }
    }
}

// --- Edge resolution and phi lowering ---

fn resolve_edges(blocks: &[CodeBlock], alloc: &AllocationResult, resolved: &mut ResolvedMoves) {
    for block in blocks {
        let pred = block.linearized_ordinal;
        let pred_end = BlockPosition::new(pred, crate::lifetime::ranges::end_pos(block.instructions.len()));

        for target in block.exit.targets() {
            let succ = &blocks[target as usize];
            let succ_start = BlockPosition::block_start(target);
            let mut pending: Vec<(MoveSrc, Location)> = Vec::new();

            // Values live into the successor must sit where the successor
            // expects them.
            for ai in &alloc.intervals {
                let register = ai.interval.register;
                if !ai.interval.covers(succ_start) {
                    continue;
                }
                if succ.phis.iter().any(|phi| phi.dest == Register::Virtual(register)) {
                    continue;
                }
                let from = alloc.location_at(register, pred_end);
                let to = ai.location;
                if from != to {
                    pending.push((MoveSrc::Loc(from), to));
                }
            }

            // Phi destinations receive the source flowing in over this edge.
            for phi in &succ.phis {
                let Register::Virtual(dest) = phi.dest else {
                    panic!("resolve: phi destination {} is physical", phi.dest);
                };
                let dst = alloc.location_at(dest, succ_start);
                let src = match phi.input_for(pred) {
                    crate::operands::Operand::Imm { value, .. } => MoveSrc::Imm(*value),
                    crate::operands::Operand::Reg { register, .. } => match register {
                        Register::Virtual(v) => MoveSrc::Loc(alloc.location_at(*v, pred_end)),
                        Register::Phys(r) => MoveSrc::Loc(Location::Reg(*r)),
                    },
                    other => panic!("resolve: phi input {} is a memory operand", other),
                };
                if src != MoveSrc::Loc(dst) {
                    pending.push((src, dst));
                }
            }

            if pending.is_empty() {
                continue;
            }
            let ordered = order_parallel_moves(pending);

            // Moves live in whichever side owns the edge exclusively;
            // critical edges must have been split upstream.
            match block.exit {
                ExitArity::One { .. } | ExitArity::Zero => {
                    resolved.at_block_end.entry(pred).or_default().extend(ordered);
                }
                ExitArity::Two { .. } => {
                    let pred_count = CodeBlock::predecessors_of(blocks, target).len();
                    assert!(
                        pred_count == 1,
                        "resolve: critical edge {} -> {} carries moves",
                        pred,
                        target
                    );
                    resolved
                        .at_block_start
                        .entry(target)
                        .or_default()
                        .extend(ordered);
                }
            }
        }
    }
}

// --- Parallel move scheduling ---

/// Orders a parallel copy so every source is read before its location is
/// overwritten. Register cycles collapse into `xchg` chains; cycles through
/// stack slots stage the first value on the machine stack.
fn order_parallel_moves(mut pending: Vec<(MoveSrc, Location)>) -> Vec<MoveOp> {
    let mut ordered = Vec::with_capacity(pending.len());
    let mut deferred_pops = Vec::new();

    pending.retain(|(src, dst)| *src != MoveSrc::Loc(*dst));

    while !pending.is_empty() {
        let ready = pending.iter().position(|(_, dst)| {
            !pending
                .iter()
                .any(|(src, other_dst)| *src == MoveSrc::Loc(*dst) && other_dst != dst)
        });

        if let Some(idx) = ready {
            let (src, dst) = pending.remove(idx);
            ordered.push(MoveOp::Move { src, dst });
            continue;
        }

        // Every pending destination is still read by another move: a cycle.
        let reg_pair = pending.iter().position(|(src, dst)| {
            matches!(src, MoveSrc::Loc(Location::Reg(_))) && matches!(dst, Location::Reg(_))
        });

        match reg_pair {
            Some(idx) => {
                let (src, dst) = pending.remove(idx);
                let MoveSrc::Loc(a) = src else { unreachable!() };
                ordered.push(MoveOp::Xchg { a, b: dst });
                // The exchange moved the remaining reads along with it.
                for (other_src, _) in pending.iter_mut() {
                    if *other_src == MoveSrc::Loc(a) {
                        *other_src = MoveSrc::Loc(dst);
                    } else if *other_src == MoveSrc::Loc(dst) {
                        *other_src = MoveSrc::Loc(a);
                    }
                }
                pending.retain(|(src, dst)| *src != MoveSrc::Loc(*dst));
            }
            None => {
                // A memory-touching cycle: park the first value on the
                // stack, let the rest resolve as a path, and restore last.
                let (src, dst) = pending.remove(0);
                ordered.push(MoveOp::Push { src });
                deferred_pops.push(MoveOp::Pop { dst });
            }
        }
    }

    while let Some(pop) = deferred_pops.pop() {
        ordered.push(pop);
    }
    ordered
}

#[cfg(test)]
#[path = "../tests/t_resolve.rs"]
mod tests;
