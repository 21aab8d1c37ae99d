//! Shared builders for backend tests: hand-assembled code blocks and the
//! example programs several test modules inspect.

use crate::amd64::Amd64Reg;
use crate::block::{BlockRef, CodeBlock, ExitArity, PhiFunction};
use crate::instructions::Instruction;
use crate::ir::Relation;
use crate::linearize::{LinearLoop, Linearization};
use crate::operands::{Operand, OperandWidth};
use crate::registers::{Register, VirtRegId, VirtualRegisterSupply};

pub fn vreg(id: VirtRegId) -> Operand {
    Operand::reg(OperandWidth::Quad, Register::Virtual(id))
}

pub fn phys(reg: Amd64Reg) -> Operand {
    Operand::reg(OperandWidth::Quad, Register::Phys(reg))
}

pub fn imm(value: i64) -> Operand {
    Operand::imm(OperandWidth::Quad, value)
}

pub fn mov(src: Operand, dst: Operand) -> Instruction {
    Instruction::Mov { src, dst }
}

pub fn add(src: Operand, dst: Operand) -> Instruction {
    Instruction::Add { src, dst }
}

pub struct BlockBuilder {
    block: CodeBlock,
}

pub fn new_block(label: &str, ordinal: BlockRef) -> BlockBuilder {
    BlockBuilder {
        block: CodeBlock {
            label: label.to_string(),
            linearized_ordinal: ordinal,
            phis: Vec::new(),
            instructions: Vec::new(),
            exit: ExitArity::Zero,
        },
    }
}

impl BlockBuilder {
    pub fn inst(mut self, inst: Instruction) -> Self {
        self.block.instructions.push(inst);
        self
    }

    pub fn phi(mut self, dest: VirtRegId, inputs: &[(BlockRef, Operand)]) -> Self {
        self.block.phis.push(PhiFunction {
            dest: Register::Virtual(dest),
            inputs: inputs.to_vec(),
        });
        self
    }

    pub fn exit_to(mut self, target: BlockRef) -> Self {
        self.block.exit = ExitArity::One { target };
        self
    }

    pub fn exit_on(mut self, relation: Relation, true_target: BlockRef, false_target: BlockRef) -> Self {
        self.block.exit = ExitArity::Two {
            relation,
            true_target,
            false_target,
        };
        self
    }

    pub fn build(self) -> CodeBlock {
        self.block
    }
}

/// A linearization whose block ids are the ordinals themselves, as tests
/// assembling code blocks by hand want it.
pub fn trivial_linearization(block_count: usize, loops: Vec<LinearLoop>) -> Linearization {
    let order = (0..block_count as u32).map(crate::ir::BlockId).collect();
    Linearization::new(order, loops)
}

pub struct ExampleProgram {
    pub blocks: Vec<CodeBlock>,
    pub lin: Linearization,
    pub supply: VirtualRegisterSupply,
    pub registers: Vec<VirtRegId>,
}

/// The branching diamond: `entry` defines `a` and `b` and compares them,
/// `exit` joins them through a phi and prints the survivor.
pub fn branching_diamond() -> ExampleProgram {
    let mut supply = VirtualRegisterSupply::new();
    let a = supply.next();
    let b = supply.next();
    let c = supply.next();

    let entry = new_block("entry", 0)
        .inst(mov(imm(1), vreg(a)))
        .inst(mov(imm(2), vreg(b)))
        .inst(Instruction::Cmp {
            left: vreg(b),
            right: vreg(a),
        })
        .exit_on(Relation::Less, 1, 2)
        .build();
    let less = new_block("less", 1).exit_to(3).build();
    let greater_equal = new_block("greaterEqual", 2).exit_to(3).build();
    let exit = new_block("exit", 3)
        .phi(c, &[(1, vreg(a)), (2, vreg(b))])
        .inst(mov(vreg(c), phys(Amd64Reg::DI)))
        .inst(Instruction::Call {
            symbol: "print_int".to_string(),
            args: vec![phys(Amd64Reg::DI)],
            result: None,
        })
        .inst(Instruction::Ret { value: None })
        .build();

    ExampleProgram {
        blocks: vec![entry, less, greater_equal, exit],
        lin: trivial_linearization(4, vec![]),
        supply,
        registers: vec![a, b, c],
    }
}

/// A counting loop `for i in 0..5`, with the increment amount held in a
/// loop-invariant register. Blocks: entry, header, body, footer, exit.
pub fn loop_counting_to_five() -> ExampleProgram {
    let mut supply = VirtualRegisterSupply::new();
    let i_init = supply.next();
    let i_next = supply.next();
    let one = supply.next();
    let bound = supply.next();
    let i = supply.next();

    let entry = new_block("entry", 0)
        .inst(mov(imm(0), vreg(i_init)))
        .inst(mov(imm(1), vreg(one)))
        .inst(mov(imm(5), vreg(bound)))
        .exit_to(1)
        .build();
    let header = new_block("header", 1)
        .phi(i, &[(0, vreg(i_init)), (3, vreg(i_next))])
        .inst(Instruction::Cmp {
            left: vreg(i),
            right: vreg(bound),
        })
        .exit_on(Relation::Less, 2, 4)
        .build();
    let body = new_block("body", 2)
        .inst(mov(vreg(i), vreg(i_next)))
        .inst(add(vreg(one), vreg(i_next)))
        .exit_to(3)
        .build();
    let footer = new_block("footer", 3).exit_to(1).build();
    let exit = new_block("exit", 4)
        .inst(Instruction::Ret { value: None })
        .build();

    ExampleProgram {
        blocks: vec![entry, header, body, footer, exit],
        lin: trivial_linearization(
            5,
            vec![LinearLoop {
                header: 1,
                members: vec![1, 2, 3],
            }],
        ),
        supply,
        registers: vec![i_init, i_next, one, bound, i],
    }
}
