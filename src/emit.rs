//! Final rewriting: virtual registers become physical locations, planned
//! moves are woven in, block exits become jumps, and the frame prologue and
//! epilogue are inserted. The result is the ordered block list handed to
//! the external textual emitter; no virtual register survives this pass.

use crate::amd64::Amd64Reg;
use crate::block::{BlockRef, CodeBlock, ExitArity};
use crate::instructions::Instruction;
use crate::lifetime::ranges::BlockPosition;
use crate::operands::{AddressingMode, Operand, OperandWidth};
use crate::regalloc::resolve::{MoveOp, MoveSrc, ResolvedMoves};
use crate::regalloc::{AllocationResult, Location};
use crate::registers::{Register, VirtRegId};

pub struct FrameInfo {
    /// Bytes subtracted from the stack pointer after the callee-saved
    /// pushes; includes alignment padding.
    pub frame_size: u32,
    pub saved: Vec<Amd64Reg>,
}

impl FrameInfo {
    fn new(alloc: &AllocationResult) -> Self {
        let saved = alloc.used_callee_saved.clone();
        let slot_bytes = alloc.stack.slot_area_bytes();
        // After `push %rbp` the stack pointer is 16-byte aligned; the saved
        // registers and the slot area together must keep it that way.
        let pushed = 8 * saved.len() as u32 + slot_bytes;
        let frame_size = slot_bytes + (16 - pushed % 16) % 16;
        Self { frame_size, saved }
    }
}

pub fn apply_allocation(
    blocks: &[CodeBlock],
    alloc: &AllocationResult,
    moves: &ResolvedMoves,
) -> (Vec<CodeBlock>, FrameInfo) {
    let frame = FrameInfo::new(alloc);
    let rewriter = Rewriter {
        alloc,
        saved_count: frame.saved.len() as u32,
    };

    let mut out_blocks = Vec::with_capacity(blocks.len());
    for block in blocks {
        let ordinal = block.linearized_ordinal;
        let mut out = Vec::with_capacity(block.instructions.len() + 4);

        if ordinal == 0 {
            emit_prologue(&frame, &mut out);
        }
        if let Some(ops) = moves.at_block_start.get(&ordinal) {
            rewriter.emit_move_ops(ops, &mut out);
        }

        for (k, inst) in block.instructions.iter().enumerate() {
            if let Some(ops) = moves.at_instruction.get(&(ordinal, k)) {
                rewriter.emit_move_ops(ops, &mut out);
            }
            if matches!(inst, Instruction::Ret { .. }) {
                emit_epilogue(&frame, &mut out);
            }
            rewriter.rewrite(inst, ordinal, k, &mut out);
        }
        if let Some(ops) = moves.at_instruction.get(&(ordinal, block.instructions.len())) {
            rewriter.emit_move_ops(ops, &mut out);
        }
        if let Some(ops) = moves.at_block_end.get(&ordinal) {
            rewriter.emit_move_ops(ops, &mut out);
        }

        emit_exit(blocks, block, &mut out);

        out_blocks.push(CodeBlock {
            label: block.label.clone(),
            linearized_ordinal: ordinal,
            phis: Vec::new(),
            instructions: out,
            exit: block.exit,
        });
    }

    (out_blocks, frame)
}

// --- Prologue / epilogue ---

fn reg_op(reg: Amd64Reg) -> Operand {
    Operand::reg(OperandWidth::Quad, Register::Phys(reg))
}

fn emit_prologue(frame: &FrameInfo, out: &mut Vec<Instruction>) {
    out.push(Instruction::Push {
        src: reg_op(Amd64Reg::BP),
    });
    out.push(Instruction::Mov {
        src: reg_op(Amd64Reg::SP),
        dst: reg_op(Amd64Reg::BP),
    });
    for &reg in &frame.saved {
        out.push(Instruction::Push { src: reg_op(reg) });
    }
    if frame.frame_size > 0 {
        out.push(Instruction::Sub {
            src: Operand::imm(OperandWidth::Quad, frame.frame_size as i64),
            dst: reg_op(Amd64Reg::SP),
        });
    }
}

fn emit_epilogue(frame: &FrameInfo, out: &mut Vec<Instruction>) {
    if frame.frame_size > 0 {
        out.push(Instruction::Add {
            src: Operand::imm(OperandWidth::Quad, frame.frame_size as i64),
            dst: reg_op(Amd64Reg::SP),
        });
    }
    for &reg in frame.saved.iter().rev() {
        out.push(Instruction::Pop { dst: reg_op(reg) });
    }
    out.push(Instruction::Pop {
        dst: reg_op(Amd64Reg::BP),
    });
}

// --- Exit lowering ---

fn emit_exit(blocks: &[CodeBlock], block: &CodeBlock, out: &mut Vec<Instruction>) {
    let next = block.linearized_ordinal + 1;
    let label = |target: BlockRef| blocks[target as usize].label.clone();
    match block.exit {
        ExitArity::Zero => {}
        ExitArity::One { target } => {
            if target != next {
                out.push(Instruction::Jmp {
                    target: label(target),
                });
            }
        }
        ExitArity::Two {
            relation,
            true_target,
            false_target,
        } => {
            if false_target == next {
                out.push(Instruction::Jcc {
                    relation,
                    target: label(true_target),
                });
            } else if true_target == next {
                out.push(Instruction::Jcc {
                    relation: relation.negated(),
                    target: label(false_target),
                });
            } else {
                out.push(Instruction::Jcc {
                    relation,
                    target: label(true_target),
                });
                out.push(Instruction::Jmp {
                    target: label(false_target),
                });
            }
        }
    }
}

// --- Operand rewriting ---

struct Rewriter<'a> {
    alloc: &'a AllocationResult,
    saved_count: u32,
}

impl<'a> Rewriter<'a> {
    fn slot_operand(&self, slot: crate::regalloc::stack::StackSlotId, width: OperandWidth) -> Operand {
        Operand::mem(
            width,
            AddressingMode::base_offset(
                Register::Phys(Amd64Reg::BP),
                slot.offset_from_base(self.saved_count),
            ),
        )
    }

    fn reg_at(&self, v: VirtRegId, position: BlockPosition) -> Register {
        match self.alloc.location_at(v, position) {
            Location::Reg(reg) => Register::Phys(reg),
            Location::Slot(slot) => panic!(
                "emit: {:?} is in stack[{}] at {:?} where a register is required",
                v, slot.0, position
            ),
        }
    }

    /// Rewrites an operand at a position where a spilled value may be read
    /// or written as memory.
    fn map_spillable(&self, op: Operand, position: BlockPosition) -> Operand {
        match op {
            Operand::Reg { width, register: Register::Virtual(v) } => {
                match self.alloc.location_at(v, position) {
                    Location::Reg(reg) => Operand::reg(width, Register::Phys(reg)),
                    Location::Slot(slot) => self.slot_operand(slot, width),
                }
            }
            other => self.map_strict(other, position),
        }
    }

    /// Rewrites an operand that must stay a register (or immediate).
    fn map_strict(&self, op: Operand, position: BlockPosition) -> Operand {
        match op {
            Operand::Imm { .. } => op,
            Operand::Reg { width, register } => match register {
                Register::Virtual(v) => Operand::reg(width, self.reg_at(v, position)),
                Register::Phys(_) => op,
            },
            Operand::Mem { width, address } => {
                let base = self.map_register(address.base, position);
                let index = address.index.map(|is| crate::operands::IndexScale {
                    index: self.map_register(is.index, position),
                    scale: is.scale,
                });
                Operand::mem(
                    width,
                    AddressingMode {
                        base,
                        index,
                        displacement: address.displacement,
                    },
                )
            }
        }
    }

    fn map_register(&self, register: Register, position: BlockPosition) -> Register {
        match register {
            Register::Virtual(v) => self.reg_at(v, position),
            Register::Phys(_) => register,
        }
    }

    fn rewrite(&self, inst: &Instruction, block: BlockRef, k: usize, out: &mut Vec<Instruction>) {
        let use_pos = BlockPosition::use_slot(block, k);
        let def_pos = BlockPosition::def_slot(block, k);

        match inst {
            Instruction::Mov { src, dst } => {
                let src = self.map_spillable(*src, use_pos);
                let dst = match dst {
                    Operand::Reg { .. } => self.map_spillable(*dst, def_pos),
                    mem => self.map_strict(*mem, use_pos),
                };
                if src == dst {
                    return; // peephole: mov x, x
                }
                if src.is_memory() && dst.is_memory() {
                    // No mov m64, m64 on x86; the machine stack bridges.
                    out.push(Instruction::Push { src });
                    out.push(Instruction::Pop { dst });
                } else {
                    out.push(Instruction::Mov { src, dst });
                }
            }
            Instruction::Add { src, dst } => self.rewrite_two_address(
                *src,
                *dst,
                use_pos,
                def_pos,
                out,
                |src, dst| Instruction::Add { src, dst },
            ),
            Instruction::Sub { src, dst } => self.rewrite_two_address(
                *src,
                *dst,
                use_pos,
                def_pos,
                out,
                |src, dst| Instruction::Sub { src, dst },
            ),
            Instruction::And { src, dst } => self.rewrite_two_address(
                *src,
                *dst,
                use_pos,
                def_pos,
                out,
                |src, dst| Instruction::And { src, dst },
            ),
            Instruction::IMul { src, dst } => self.rewrite_two_address(
                *src,
                *dst,
                use_pos,
                def_pos,
                out,
                |src, dst| Instruction::IMul { src, dst },
            ),
            Instruction::Shl { count, dst } => {
                let count = self.map_strict(*count, use_pos);
                let dst = self.rewrite_in_out(*dst, use_pos, def_pos);
                out.push(Instruction::Shl { count, dst });
            }
            Instruction::Shr { count, dst } => {
                let count = self.map_strict(*count, use_pos);
                let dst = self.rewrite_in_out(*dst, use_pos, def_pos);
                out.push(Instruction::Shr { count, dst });
            }
            Instruction::Neg { dst } => {
                let dst = self.rewrite_in_out(*dst, use_pos, def_pos);
                out.push(Instruction::Neg { dst });
            }
            Instruction::Cltd { value, low, high } => {
                out.push(Instruction::Cltd {
                    value: self.map_register(*value, use_pos),
                    low: self.map_register(*low, def_pos),
                    high: self.map_register(*high, def_pos),
                });
            }
            Instruction::IDiv {
                dividend,
                high,
                divisor,
                quotient,
                remainder,
            } => {
                out.push(Instruction::IDiv {
                    dividend: self.map_register(*dividend, use_pos),
                    high: self.map_register(*high, use_pos),
                    divisor: self.map_spillable(*divisor, use_pos),
                    quotient: self.map_register(*quotient, def_pos),
                    remainder: self.map_register(*remainder, def_pos),
                });
            }
            Instruction::Cmp { left, right } => {
                let left = self.map_spillable(*left, use_pos);
                let right = if left.is_memory() {
                    self.map_strict(*right, use_pos)
                } else {
                    self.map_spillable(*right, use_pos)
                };
                assert!(
                    !(left.is_memory() && right.is_memory()),
                    "emit: cmp with two memory operands at {:?}",
                    use_pos
                );
                out.push(Instruction::Cmp { left, right });
            }
            Instruction::Call {
                symbol,
                args,
                result,
            } => {
                let args = args.iter().map(|a| self.map_strict(*a, use_pos)).collect();
                let result = result.map(|r| self.map_register(r, def_pos));
                out.push(Instruction::Call {
                    symbol: symbol.clone(),
                    args,
                    result,
                });
            }
            Instruction::Push { src } => {
                out.push(Instruction::Push {
                    src: self.map_spillable(*src, use_pos),
                });
            }
            Instruction::Pop { dst } => {
                out.push(Instruction::Pop {
                    dst: self.map_spillable(*dst, def_pos),
                });
            }
            Instruction::Ret { value } => {
                out.push(Instruction::Ret {
                    value: value.map(|r| self.map_register(r, use_pos)),
                });
            }
            Instruction::Jmp { .. } | Instruction::Jcc { .. } | Instruction::Xchg { .. } => {
                panic!("emit: {} before allocation", inst)
            }
        }
    }

    /// Two-address destination: read at the use slot, written at the def
    /// slot, and required to sit in one register for both.
    fn rewrite_in_out(&self, dst: Operand, use_pos: BlockPosition, def_pos: BlockPosition) -> Operand {
        let rewritten = self.map_strict(dst, def_pos);
        if let Some(Register::Virtual(v)) = dst.as_register() {
            debug_assert_eq!(
                self.alloc.location_at(v, use_pos),
                self.alloc.location_at(v, def_pos),
                "emit: two-address operand {:?} split between use and def",
                v
            );
        }
        rewritten
    }

    fn rewrite_two_address(
        &self,
        src: Operand,
        dst: Operand,
        use_pos: BlockPosition,
        def_pos: BlockPosition,
        out: &mut Vec<Instruction>,
        make: impl FnOnce(Operand, Operand) -> Instruction,
    ) {
        let src = self.map_spillable(src, use_pos);
        let dst = self.rewrite_in_out(dst, use_pos, def_pos);
        out.push(make(src, dst));
    }

    // --- Planned moves ---

    fn emit_move_ops(&self, ops: &[MoveOp], out: &mut Vec<Instruction>) {
        for op in ops {
            match *op {
                MoveOp::Move { src, dst } => {
                    let src = self.move_src_operand(src);
                    let dst = self.location_operand(dst);
                    if src == dst {
                        continue;
                    }
                    if src.is_memory() && dst.is_memory() {
                        out.push(Instruction::Push { src });
                        out.push(Instruction::Pop { dst });
                    } else {
                        out.push(Instruction::Mov { src, dst });
                    }
                }
                MoveOp::Xchg { a, b } => {
                    out.push(Instruction::Xchg {
                        a: self.location_operand(a),
                        b: self.location_operand(b),
                    });
                }
                MoveOp::Push { src } => {
                    out.push(Instruction::Push {
                        src: self.move_src_operand(src),
                    });
                }
                MoveOp::Pop { dst } => {
                    out.push(Instruction::Pop {
                        dst: self.location_operand(dst),
                    });
                }
            }
        }
    }

    fn move_src_operand(&self, src: MoveSrc) -> Operand {
        match src {
            MoveSrc::Imm(value) => Operand::imm(OperandWidth::Quad, value),
            MoveSrc::Loc(loc) => self.location_operand(loc),
        }
    }

    fn location_operand(&self, loc: Location) -> Operand {
        match loc {
            Location::Reg(reg) => reg_op(reg),
            Location::Slot(slot) => self.slot_operand(slot, OperandWidth::Quad),
        }
    }
}

#[cfg(test)]
#[path = "tests/t_emit.rs"]
mod tests;
