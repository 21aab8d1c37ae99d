//! Instruction selection.
//!
//! Walks the IR of each linearized block in schedule order and emits machine
//! instructions over virtual registers, encoding calling-convention and
//! fixed-register requirements as constraints on the virtual registers
//! involved. Phi nodes never become instructions here; they are attached to
//! their block as metadata and resolved into moves after allocation.

use std::collections::HashMap;

use crate::amd64::{ARG_REGS, Amd64Reg, RETURN_REGISTER};
use crate::block::{BlockRef, CodeBlock, ExitArity, PhiFunction};
use crate::diagnostics::BackendError;
use crate::instructions::Instruction;
use crate::ir::{BlockId, Graph, NodeId, NodeKind, proj};
use crate::linearize::Linearization;
use crate::operands::{AddressingMode, Operand, OperandWidth};
use crate::registers::{Register, VirtRegId, VirtualRegisterSupply};

/// Immediates outside this range cannot be encoded in-place and are
/// materialized through a `mov imm64, reg`.
fn fits_imm32(value: i64) -> bool {
    i32::try_from(value).is_ok()
}

pub fn select_instructions(
    graph: &Graph,
    lin: &Linearization,
    supply: &mut VirtualRegisterSupply,
) -> Result<Vec<CodeBlock>, BackendError> {
    Selector::new(graph, lin, supply).run()
}

struct Selector<'a> {
    graph: &'a Graph,
    lin: &'a Linearization,
    supply: &'a mut VirtualRegisterSupply,
    /// Node -> virtual register holding its value.
    defined: HashMap<NodeId, VirtRegId>,
    /// Multi-result node -> its value projection, precomputed so calls and
    /// divisions can name their result registers at emission time.
    res_proj: HashMap<NodeId, NodeId>,
    insts: Vec<Instruction>,
    /// Phis recorded during the walk, resolved once all blocks are emitted.
    pending_phis: Vec<(BlockRef, NodeId)>,
}

impl<'a> Selector<'a> {
    fn new(graph: &'a Graph, lin: &'a Linearization, supply: &'a mut VirtualRegisterSupply) -> Self {
        let mut res_proj = HashMap::new();
        for block in graph.blocks() {
            for &id in &block.nodes {
                let node = graph.node(id);
                if let NodeKind::Proj { index: proj::RES } = node.kind {
                    if node.mode.is_value() {
                        res_proj.insert(node.preds[0], id);
                    }
                }
            }
        }
        Self {
            graph,
            lin,
            supply,
            defined: HashMap::new(),
            res_proj,
            insts: Vec::new(),
            pending_phis: Vec::new(),
        }
    }

    fn run(mut self) -> Result<Vec<CodeBlock>, BackendError> {
        let mut blocks = Vec::with_capacity(self.lin.len());
        for (ordinal, &block_id) in self.lin.order.clone().iter().enumerate() {
            let exit = self.select_block(block_id)?;
            blocks.push(CodeBlock {
                label: block_label(&self.graph.name, ordinal as u32),
                linearized_ordinal: ordinal as u32,
                phis: Vec::new(),
                instructions: std::mem::take(&mut self.insts),
                exit,
            });
        }

        // Phi inputs may be defined in blocks emitted after their phi (loop
        // back edges), so they resolve only now.
        for (ordinal, phi_id) in std::mem::take(&mut self.pending_phis) {
            let phi = self.graph.node(phi_id);
            let preds = self.graph.pred_blocks(phi.block);
            assert_eq!(
                preds.len(),
                phi.preds.len(),
                "select: phi {:?} input count does not match block predecessors",
                phi_id
            );
            let width = OperandWidth::from_mode(phi.mode);
            let mut inputs = Vec::with_capacity(phi.preds.len());
            for (pred_block, &input) in preds.iter().zip(&phi.preds) {
                let op = self.operand_for_node(input)?.with_width(width);
                inputs.push((self.lin.ordinal(*pred_block), op));
            }
            let dest = Register::Virtual(self.defined[&phi_id]);
            blocks[ordinal as usize].phis.push(PhiFunction { dest, inputs });
        }

        Ok(blocks)
    }

    fn select_block(&mut self, block_id: BlockId) -> Result<ExitArity, BackendError> {
        let mut exit = None;
        for &id in &self.graph.block(block_id).nodes {
            let node = self.graph.node(id);
            match &node.kind {
                NodeKind::Start | NodeKind::End => {}
                // Inlined at their use sites.
                NodeKind::Const { value } => {
                    if !fits_imm32(*value) {
                        let value = *value;
                        self.materialize_const(id, value);
                    }
                }
                NodeKind::Address { .. } => {}
                NodeKind::Add => self.binary_commutative(id, |src, dst| Instruction::Add {
                    src,
                    dst,
                })?,
                NodeKind::Mul => self.binary_commutative(id, |src, dst| Instruction::IMul {
                    src,
                    dst,
                })?,
                NodeKind::And => self.binary_commutative(id, |src, dst| Instruction::And {
                    src,
                    dst,
                })?,
                NodeKind::Sub => self.select_sub(id)?,
                NodeKind::Shl => self.select_shift(id, true)?,
                NodeKind::Shr => self.select_shift(id, false)?,
                NodeKind::Neg => self.select_neg(id)?,
                NodeKind::Conv => self.select_conv(id)?,
                NodeKind::Div => self.select_div_mod(id, true)?,
                NodeKind::Mod => self.select_div_mod(id, false)?,
                NodeKind::Load => self.select_load(id)?,
                NodeKind::Store => self.select_store(id)?,
                NodeKind::Call { symbol } => {
                    let symbol = symbol.clone();
                    self.select_call(id, symbol)?;
                }
                NodeKind::Phi => {
                    if node.mode.is_value() {
                        let ordinal = self.lin.ordinal(block_id);
                        self.register_for_node(id);
                        self.pending_phis.push((ordinal, id));
                    }
                }
                NodeKind::Cmp { .. } => {
                    // Produces only flags; emitted right before the exit so
                    // nothing can clobber them.
                }
                NodeKind::Cond => {
                    exit = Some(self.select_cond(id)?);
                }
                NodeKind::Jmp => {
                    let target = self.jump_target(id);
                    exit = Some(ExitArity::One {
                        target: self.lin.ordinal(target),
                    });
                }
                NodeKind::Return => {
                    exit = Some(self.select_return(id)?);
                }
                NodeKind::Proj { .. } => {
                    // Memory and tuple projections are erased; value
                    // projections were named when their parent was emitted,
                    // except argument projections which define here.
                    self.select_proj(id)?;
                }
            }
        }

        exit.ok_or_else(|| {
            BackendError::MalformedGraph(format!("block {:?} has no exit node", block_id))
        })
    }

    // --- Operands ---

    /// The operand carrying a node's value. Never emits code: the schedule
    /// walk has already defined everything an operand can refer to.
    fn operand_for_node(&mut self, id: NodeId) -> Result<Operand, BackendError> {
        let node = self.graph.node(id);
        let width = OperandWidth::from_mode(node.mode);
        match &node.kind {
            NodeKind::Const { value } if fits_imm32(*value) => Ok(Operand::imm(width, *value)),
            NodeKind::Address { .. } => Err(BackendError::UnsupportedNode {
                node: id,
                opcode: "Address",
            }),
            _ => {
                let vreg = *self.defined.get(&id).unwrap_or_else(|| {
                    panic!(
                        "select: {:?} ({}) used before being defined",
                        id,
                        node.kind.opcode()
                    )
                });
                Ok(Operand::reg(width, Register::Virtual(vreg)))
            }
        }
    }

    /// A register operand for a node, copying immediates into a fresh
    /// temporary if needed.
    fn register_operand_for_node(&mut self, id: NodeId) -> Result<Operand, BackendError> {
        let op = self.operand_for_node(id)?;
        match op {
            Operand::Reg { .. } => Ok(op),
            _ => Ok(self.copy_operand(op).0),
        }
    }

    fn register_for_node(&mut self, id: NodeId) -> VirtRegId {
        if let Some(&vreg) = self.defined.get(&id) {
            return vreg;
        }
        let vreg = self.supply.next();
        self.defined.insert(id, vreg);
        vreg
    }

    /// Copies `src` into a fresh temporary; two-address instructions write
    /// into such temporaries so every virtual register keeps one definition.
    fn copy_operand(&mut self, src: Operand) -> (Operand, VirtRegId) {
        let temp = self.supply.next();
        let dst = Operand::reg(src.width(), Register::Virtual(temp));
        self.insts.push(Instruction::Mov { src, dst });
        (dst, temp)
    }

    fn define_as_copy(&mut self, src: Operand, node: NodeId) -> VirtRegId {
        let vreg = self.register_for_node(node);
        let width = OperandWidth::from_mode(self.graph.node(node).mode);
        self.insts.push(Instruction::Mov {
            src: src.with_width(width),
            dst: Operand::reg(width, Register::Virtual(vreg)),
        });
        vreg
    }

    fn materialize_const(&mut self, id: NodeId, value: i64) {
        // 64-bit immediates only encode in a plain register mov.
        let vreg = self.register_for_node(id);
        self.insts.push(Instruction::Mov {
            src: Operand::imm(OperandWidth::Quad, value),
            dst: Operand::reg(OperandWidth::Quad, Register::Virtual(vreg)),
        });
    }

    // --- Arithmetic ---

    fn binary_commutative(
        &mut self,
        id: NodeId,
        make: impl FnOnce(Operand, Operand) -> Instruction,
    ) -> Result<(), BackendError> {
        let node = self.graph.node(id);
        let (lhs, rhs) = (node.preds[0], node.preds[1]);
        let left = self.operand_for_node(lhs)?;
        let right = self.operand_for_node(rhs)?;
        let (dst, temp) = self.copy_operand(right);
        self.insts.push(make(left, dst));
        self.defined.insert(id, temp);
        Ok(())
    }

    fn select_sub(&mut self, id: NodeId) -> Result<(), BackendError> {
        // Subtraction writes into the minuend, so the left operand is the
        // one copied.
        let node = self.graph.node(id);
        let (lhs, rhs) = (node.preds[0], node.preds[1]);
        let left = self.operand_for_node(lhs)?;
        let right = self.operand_for_node(rhs)?;
        let (dst, temp) = self.copy_operand(left);
        self.insts.push(Instruction::Sub { src: right, dst });
        self.defined.insert(id, temp);
        Ok(())
    }

    fn select_shift(&mut self, id: NodeId, left_shift: bool) -> Result<(), BackendError> {
        let node = self.graph.node(id);
        let (value, amount) = (node.preds[0], node.preds[1]);
        let left = self.operand_for_node(value)?;
        let (dst, temp) = self.copy_operand(left);

        let count = match self.operand_for_node(amount)? {
            imm @ Operand::Imm { .. } => imm.with_width(OperandWidth::Byte),
            other => {
                // Variable shift counts live in CL.
                let (_, count_temp) = self.copy_operand(other);
                self.supply.set_constraint(count_temp, Amd64Reg::C);
                Operand::reg(OperandWidth::Byte, Register::Virtual(count_temp))
            }
        };

        let inst = if left_shift {
            Instruction::Shl { count, dst }
        } else {
            Instruction::Shr { count, dst }
        };
        self.insts.push(inst);
        self.defined.insert(id, temp);
        Ok(())
    }

    fn select_neg(&mut self, id: NodeId) -> Result<(), BackendError> {
        let node = self.graph.node(id);
        let value = self.operand_for_node(node.preds[0])?;
        let (dst, temp) = self.copy_operand(value);
        self.insts.push(Instruction::Neg { dst });
        self.defined.insert(id, temp);
        Ok(())
    }

    fn select_conv(&mut self, id: NodeId) -> Result<(), BackendError> {
        let node = self.graph.node(id);
        let width = OperandWidth::from_mode(node.mode);
        let value = self.operand_for_node(node.preds[0])?;
        self.define_as_copy(value.with_width(width), id);
        Ok(())
    }

    // --- Division ---

    fn select_div_mod(&mut self, id: NodeId, is_div: bool) -> Result<(), BackendError> {
        let node = self.graph.node(id);
        let (lhs, rhs) = (node.preds[1], node.preds[2]);
        let res_proj = self.res_proj.get(&id).copied();
        let width = res_proj
            .map(|p| OperandWidth::from_mode(self.graph.node(p).mode))
            .unwrap_or(OperandWidth::Dword);

        // The dividend is copied so the A constraint stays on a register
        // this instruction owns; cltd then spreads the sign into D.
        let dividend = self.operand_for_node(lhs)?.with_width(width);
        let (_, value) = self.copy_operand(dividend);
        self.supply.set_constraint(value, Amd64Reg::A);
        let low = self.supply.next_constrained(Amd64Reg::A);
        let high = self.supply.next_constrained(Amd64Reg::D);
        self.insts.push(Instruction::Cltd {
            value: Register::Virtual(value),
            low: Register::Virtual(low),
            high: Register::Virtual(high),
        });

        let (_, divid) = self.copy_operand(Operand::reg(width, Register::Virtual(low)));
        self.supply.set_constraint(divid, Amd64Reg::A);

        // idiv has no immediate form.
        let divisor = self.register_operand_for_node(rhs)?.with_width(width);

        let result = res_proj.map(|p| self.register_for_node(p));
        let fresh = |supply: &mut VirtualRegisterSupply, c| supply.next_constrained(c);
        let (quotient, remainder) = if is_div {
            let q = result.unwrap_or_else(|| fresh(self.supply, Amd64Reg::A));
            self.supply.set_constraint(q, Amd64Reg::A);
            (q, fresh(self.supply, Amd64Reg::D))
        } else {
            let r = result.unwrap_or_else(|| fresh(self.supply, Amd64Reg::D));
            self.supply.set_constraint(r, Amd64Reg::D);
            (fresh(self.supply, Amd64Reg::A), r)
        };

        self.insts.push(Instruction::IDiv {
            dividend: Register::Virtual(divid),
            high: Register::Virtual(high),
            divisor,
            quotient: Register::Virtual(quotient),
            remainder: Register::Virtual(remainder),
        });
        Ok(())
    }

    // --- Memory ---

    fn addressing_for(&mut self, ptr: NodeId) -> Result<AddressingMode, BackendError> {
        // Addressing modes richer than a plain base register would fold
        // here; for now every pointer lives in a register.
        let op = self.register_operand_for_node(ptr)?;
        Ok(AddressingMode::at_register(op.as_register().unwrap()))
    }

    fn select_load(&mut self, id: NodeId) -> Result<(), BackendError> {
        let node = self.graph.node(id);
        let address = self.addressing_for(node.preds[1])?;
        let Some(res) = self.res_proj.get(&id).copied() else {
            return Ok(()); // dead load, no observable value
        };
        let width = OperandWidth::from_mode(self.graph.node(res).mode);
        self.define_as_copy(Operand::mem(width, address), res);
        Ok(())
    }

    fn select_store(&mut self, id: NodeId) -> Result<(), BackendError> {
        let node = self.graph.node(id);
        let address = self.addressing_for(node.preds[1])?;
        let value = self.operand_for_node(node.preds[2])?;
        let width = value.width();
        self.insts.push(Instruction::Mov {
            src: value,
            dst: Operand::mem(width, address),
        });
        Ok(())
    }

    // --- Calls ---

    fn select_call(&mut self, id: NodeId, symbol: String) -> Result<(), BackendError> {
        let node = self.graph.node(id);
        let args: Vec<NodeId> = node.preds[1..].to_vec();

        // Stack parameter region, kept 16-byte aligned at the call.
        let stack_args = args.len().saturating_sub(ARG_REGS.len());
        let region = ((stack_args * 8 + 15) & !15) as i64;
        if region > 0 {
            self.insts.push(Instruction::Sub {
                src: Operand::imm(OperandWidth::Quad, region),
                dst: Operand::reg(OperandWidth::Quad, Register::Phys(Amd64Reg::SP)),
            });
        }

        let mut call_args = Vec::with_capacity(args.len().min(ARG_REGS.len()));
        for (i, &arg) in args.iter().enumerate() {
            let src = self.operand_for_node(arg)?;
            if i < ARG_REGS.len() {
                let temp = self.supply.next_constrained(ARG_REGS[i]);
                let dst = Operand::reg(src.width(), Register::Virtual(temp));
                self.insts.push(Instruction::Mov { src, dst });
                call_args.push(dst);
            } else {
                let slot = AddressingMode::base_offset(
                    Register::Phys(Amd64Reg::SP),
                    (8 * (i - ARG_REGS.len())) as i32,
                );
                self.insts.push(Instruction::Mov {
                    src,
                    dst: Operand::mem(src.width(), slot),
                });
            }
        }

        let res_proj = self.res_proj.get(&id).copied();
        let result = res_proj.map(|_| self.supply.next_constrained(RETURN_REGISTER));
        self.insts.push(Instruction::Call {
            symbol,
            args: call_args,
            result: result.map(Register::Virtual),
        });

        if let (Some(res), Some(ret)) = (res_proj, result) {
            let width = OperandWidth::from_mode(self.graph.node(res).mode);
            self.define_as_copy(Operand::reg(width, Register::Virtual(ret)), res);
        }

        if region > 0 {
            self.insts.push(Instruction::Add {
                src: Operand::imm(OperandWidth::Quad, region),
                dst: Operand::reg(OperandWidth::Quad, Register::Phys(Amd64Reg::SP)),
            });
        }
        Ok(())
    }

    // --- Control flow ---

    fn select_return(&mut self, id: NodeId) -> Result<ExitArity, BackendError> {
        let node = self.graph.node(id);
        let value = match node.preds.get(1) {
            Some(&value) => {
                let src = self.operand_for_node(value)?;
                let temp = self.supply.next_constrained(RETURN_REGISTER);
                let dst = Operand::reg(src.width(), Register::Virtual(temp));
                self.insts.push(Instruction::Mov { src, dst });
                Some(Register::Virtual(temp))
            }
            None => None,
        };
        self.insts.push(Instruction::Ret { value });
        Ok(ExitArity::Zero)
    }

    fn select_cond(&mut self, id: NodeId) -> Result<ExitArity, BackendError> {
        let node = self.graph.node(id);
        let cmp_id = node.preds[0];
        let cmp = self.graph.node(cmp_id);
        let NodeKind::Cmp { relation } = &cmp.kind else {
            return Err(BackendError::MalformedGraph(format!(
                "Cond {:?} selector is {}, expected Cmp",
                id,
                cmp.kind.opcode()
            )));
        };
        let relation = *relation;

        let mut left = self.operand_for_node(cmp.preds[0])?;
        let mut right = self.operand_for_node(cmp.preds[1])?;
        let mut relation = relation;
        // The flags-producing compare wants its immediate on the right.
        if matches!(left, Operand::Imm { .. }) {
            std::mem::swap(&mut left, &mut right);
            relation = relation.mirrored();
        }
        if matches!(left, Operand::Imm { .. }) {
            left = self.copy_operand(left).0;
        }
        self.insts.push(Instruction::Cmp { left, right });

        let (true_target, false_target) = self.cond_targets(id);
        Ok(ExitArity::Two {
            relation,
            true_target: self.lin.ordinal(true_target),
            false_target: self.lin.ordinal(false_target),
        })
    }

    fn cond_targets(&self, cond: NodeId) -> (BlockId, BlockId) {
        let mut true_target = None;
        let mut false_target = None;
        for block in self.graph.blocks() {
            for &ctrl in &block.preds {
                let node = self.graph.node(ctrl);
                if node.preds.first() == Some(&cond) {
                    match node.kind {
                        NodeKind::Proj {
                            index: proj::COND_TRUE,
                        } => true_target = Some(block.id),
                        NodeKind::Proj {
                            index: proj::COND_FALSE,
                        } => false_target = Some(block.id),
                        _ => {}
                    }
                }
            }
        }
        match (true_target, false_target) {
            (Some(t), Some(f)) => (t, f),
            _ => panic!("select: Cond {:?} is missing a branch target", cond),
        }
    }

    fn jump_target(&self, jmp: NodeId) -> BlockId {
        for block in self.graph.blocks() {
            if block.preds.contains(&jmp) {
                return block.id;
            }
        }
        panic!("select: Jmp {:?} has no target block", jmp)
    }

    fn select_proj(&mut self, id: NodeId) -> Result<(), BackendError> {
        let node = self.graph.node(id);
        if !node.mode.is_value() {
            return Ok(());
        }
        let pred = self.graph.node(node.preds[0]);
        match pred.kind {
            // Value results named at their parent's emission.
            NodeKind::Call { .. } | NodeKind::Div | NodeKind::Mod | NodeKind::Load => Ok(()),
            // Argument projection: Proj(arg_tuple Proj(Start)).
            NodeKind::Proj { .. } => {
                let grandpa = self.graph.node(pred.preds[0]);
                match grandpa.kind {
                    NodeKind::Start => {
                        let NodeKind::Proj { index } = node.kind else {
                            unreachable!()
                        };
                        let width = OperandWidth::from_mode(node.mode);
                        let src = abi_argument(index, width);
                        self.define_as_copy(src, id);
                        Ok(())
                    }
                    _ => Err(BackendError::UnsupportedProjection {
                        node: id,
                        opcode: grandpa.kind.opcode(),
                    }),
                }
            }
            _ => Err(BackendError::UnsupportedProjection {
                node: id,
                opcode: pred.kind.opcode(),
            }),
        }
    }
}

/// Where the `index`-th incoming argument lives on entry, before the
/// prologue-established frame.
fn abi_argument(index: u32, width: OperandWidth) -> Operand {
    match ARG_REGS.get(index as usize) {
        Some(&reg) => Operand::reg(width, Register::Phys(reg)),
        None => {
            // Above the saved base pointer and return address.
            let offset = 16 + 8 * (index as usize - ARG_REGS.len()) as i32;
            Operand::mem(
                width,
                AddressingMode::base_offset(Register::Phys(Amd64Reg::BP), offset),
            )
        }
    }
}

fn block_label(name: &str, ordinal: u32) -> String {
    format!(".L{}_{}", name, ordinal)
}

#[cfg(test)]
#[path = "tests/t_select.rs"]
mod tests;
