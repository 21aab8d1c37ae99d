use std::collections::HashMap;

use super::{MoveOp, MoveSrc, order_parallel_moves, resolve_moves};
use crate::amd64::Amd64Reg;
use crate::instructions::Instruction;
use crate::lifetime::analyze;
use crate::lifetime::ranges::{BlockPosition, end_pos};
use crate::regalloc::stack::StackSlotId;
use crate::regalloc::{Location, allocate_registers};
use crate::registers::{Register, VirtualRegisterSupply};
use crate::test_support::{imm, mov, new_block, trivial_linearization, vreg};

fn reg(r: Amd64Reg) -> Location {
    Location::Reg(r)
}

fn slot(n: u32) -> Location {
    Location::Slot(StackSlotId(n))
}

/// Executes a move schedule over a value environment, machine stack
/// included.
fn run_schedule(ops: &[MoveOp], env: &mut HashMap<Location, i64>) {
    let mut stack = Vec::new();
    let read = |env: &HashMap<Location, i64>, src: MoveSrc| match src {
        MoveSrc::Imm(value) => value,
        MoveSrc::Loc(loc) => env[&loc],
    };
    for op in ops {
        match *op {
            MoveOp::Move { src, dst } => {
                let value = read(env, src);
                env.insert(dst, value);
            }
            MoveOp::Xchg { a, b } => {
                let (va, vb) = (env[&a], env[&b]);
                env.insert(a, vb);
                env.insert(b, va);
            }
            MoveOp::Push { src } => stack.push(read(env, src)),
            MoveOp::Pop { dst } => {
                let value = stack.pop().expect("pop from empty stack");
                env.insert(dst, value);
            }
        }
    }
    assert!(stack.is_empty(), "unbalanced push/pop staging");
}

fn loc_key(loc: Location) -> i64 {
    match loc {
        Location::Reg(r) => 100 + r as i64,
        Location::Slot(s) => 200 + s.0 as i64,
    }
}

/// Schedules a parallel copy and verifies every destination receives the
/// value its source held before any move ran.
fn check_parallel(moves: Vec<(MoveSrc, Location)>) -> Vec<MoveOp> {
    let mut env = HashMap::new();
    for (src, dst) in &moves {
        if let MoveSrc::Loc(loc) = src {
            env.entry(*loc).or_insert(loc_key(*loc));
        }
        env.entry(*dst).or_insert(loc_key(*dst));
    }
    let expected: Vec<(Location, i64)> = moves
        .iter()
        .map(|(src, dst)| {
            let value = match src {
                MoveSrc::Imm(value) => *value,
                MoveSrc::Loc(loc) => env[loc],
            };
            (*dst, value)
        })
        .collect();

    let ops = order_parallel_moves(moves);
    run_schedule(&ops, &mut env);
    for (dst, value) in expected {
        assert_eq!(env[&dst], value, "wrong value landed in {}", dst);
    }
    ops
}

#[test]
fn test_path_moves_preserve_sources() {
    // b -> c and a -> b form a path: b must be read before it is written.
    check_parallel(vec![
        (MoveSrc::Loc(reg(Amd64Reg::B)), reg(Amd64Reg::C)),
        (MoveSrc::Loc(reg(Amd64Reg::A)), reg(Amd64Reg::B)),
    ]);
}

#[test]
fn test_three_cycle_uses_xchg() {
    // A register permutation of length three resolves with exchanges, no
    // scratch location.
    let ops = check_parallel(vec![
        (MoveSrc::Loc(reg(Amd64Reg::A)), reg(Amd64Reg::B)),
        (MoveSrc::Loc(reg(Amd64Reg::B)), reg(Amd64Reg::C)),
        (MoveSrc::Loc(reg(Amd64Reg::C)), reg(Amd64Reg::A)),
    ]);
    assert!(ops.iter().all(|op| matches!(op, MoveOp::Xchg { .. })));
    assert_eq!(ops.len(), 2);
}

#[test]
fn test_memory_cycle_stages_through_stack() {
    // A cycle with slot legs cannot be done with exchanges alone.
    let ops = check_parallel(vec![
        (MoveSrc::Loc(slot(0)), reg(Amd64Reg::A)),
        (MoveSrc::Loc(reg(Amd64Reg::A)), slot(1)),
        (MoveSrc::Loc(slot(1)), slot(0)),
    ]);
    let pushes = ops.iter().filter(|op| matches!(op, MoveOp::Push { .. })).count();
    let pops = ops.iter().filter(|op| matches!(op, MoveOp::Pop { .. })).count();
    assert_eq!(pushes, pops);
    assert!(pushes <= 1, "one staging value suffices for one cycle");
}

#[test]
fn test_immediate_waits_for_readers() {
    check_parallel(vec![
        (MoveSrc::Imm(7), reg(Amd64Reg::A)),
        (MoveSrc::Loc(reg(Amd64Reg::A)), reg(Amd64Reg::B)),
    ]);
}

#[test]
fn test_locations_agree_on_block_edges() {
    // For every value live over an edge, either both sides agree on its
    // location or the resolver planned a move on that edge.
    let example = crate::test_support::branching_diamond();
    let analysis = analyze(&example.blocks, &example.supply, &example.lin);
    let alloc = allocate_registers(analysis, &example.supply);
    let resolved = resolve_moves(&example.blocks, &alloc);

    for block in &example.blocks {
        let pred = block.linearized_ordinal;
        let pred_end = BlockPosition::new(pred, end_pos(block.instructions.len()));
        for target in block.exit.targets() {
            let succ_start = BlockPosition::block_start(target);
            for ai in &alloc.intervals {
                let register = ai.interval.register;
                if !ai.interval.covers(succ_start) || !alloc.covers(register, pred_end) {
                    continue;
                }
                if example.blocks[target as usize]
                    .phis
                    .iter()
                    .any(|phi| phi.dest == Register::Virtual(register))
                {
                    continue;
                }
                let at_pred = alloc.location_at(register, pred_end);
                let at_succ = alloc.location_at(register, succ_start);
                if at_pred == at_succ {
                    continue;
                }
                let planned = resolved
                    .at_block_end
                    .get(&pred)
                    .into_iter()
                    .flatten()
                    .chain(resolved.at_block_start.get(&target).into_iter().flatten())
                    .any(|op| {
                        matches!(op, MoveOp::Move { src, dst }
                            if *src == MoveSrc::Loc(at_pred) && *dst == at_succ)
                    });
                assert!(
                    planned,
                    "{:?} moves from {} to {} over edge {} -> {} without a move",
                    register, at_pred, at_succ, pred, target
                );
            }
        }
    }
}

#[test]
fn test_phi_moves_emitted_on_incoming_edges() {
    let example = crate::test_support::branching_diamond();
    let analysis = analyze(&example.blocks, &example.supply, &example.lin);
    let alloc = allocate_registers(analysis, &example.supply);
    let resolved = resolve_moves(&example.blocks, &alloc);

    let c = example.registers[2];
    let c_loc = alloc.location_at(c, BlockPosition::block_start(3));
    // Both predecessors of the join block feed c.
    for pred in [1u32, 2u32] {
        let moved = resolved.at_block_end.get(&pred).is_some_and(|ops| {
            ops.iter().any(|op| match op {
                MoveOp::Move { dst, .. } => *dst == c_loc,
                MoveOp::Xchg { a, b } => *a == c_loc || *b == c_loc,
                MoveOp::Pop { dst } => *dst == c_loc,
                MoveOp::Push { .. } => false,
            })
        });
        let source = alloc.location_at(
            example.registers[(pred - 1) as usize],
            BlockPosition::new(pred, end_pos(example.blocks[pred as usize].instructions.len())),
        );
        assert!(
            moved || source == c_loc,
            "phi input from block {} neither moved nor already in place",
            pred
        );
    }
}

#[test]
fn test_split_move_lands_at_the_new_piece() {
    // Every callee-saved register is pinned by a value living across the
    // call, so `live` has to take a caller-saved register, leave it at the
    // call, and every relocation needs a move exactly at the new piece's
    // start.
    let mut supply = VirtualRegisterSupply::new();
    let pinned: Vec<_> = (0..crate::amd64::CALLEE_SAVED.len())
        .map(|_| supply.next())
        .collect();
    let live = supply.next();
    let arg = supply.next_constrained(Amd64Reg::DI);

    let mut builder = new_block("entry", 0);
    for (i, &p) in pinned.iter().enumerate() {
        builder = builder.inst(mov(imm(i as i64), vreg(p)));
    }
    builder = builder
        .inst(mov(imm(1), vreg(live)))
        .inst(mov(vreg(live), vreg(arg)))
        .inst(Instruction::Call {
            symbol: "print_int".to_string(),
            args: vec![vreg(arg)],
            result: None,
        });
    for &p in &pinned {
        let sink = supply.next();
        builder = builder.inst(mov(vreg(p), vreg(sink)));
    }
    let after = supply.next();
    let blocks = vec![
        builder
            .inst(mov(vreg(live), vreg(after)))
            .inst(Instruction::Ret { value: None })
            .build(),
    ];

    let lin = trivial_linearization(1, vec![]);
    let analysis = analyze(&blocks, &supply, &lin);
    let alloc = allocate_registers(analysis, &supply);
    let resolved = resolve_moves(&blocks, &alloc);

    let pieces = alloc.intervals_of(live);
    assert!(pieces.len() > 1, "expected the allocator to split {:?}", live);
    let mut relocations = 0;
    for pair in pieces.windows(2) {
        if pair[0].location == pair[1].location {
            continue;
        }
        relocations += 1;
        let at = pair[1].interval.from();
        let ops = resolved
            .at_instruction
            .get(&(at.block, at.instruction_index()))
            .expect("missing split move");
        assert!(ops.iter().any(|op| matches!(op, MoveOp::Move { src, dst }
            if *src == MoveSrc::Loc(pair[0].location) && *dst == pair[1].location)));
    }
    assert!(relocations > 0, "split produced no relocation");
}
