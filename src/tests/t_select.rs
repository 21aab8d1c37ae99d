use crate::amd64::{ARG_REGS, Amd64Reg};
use crate::block::ExitArity;
use crate::instructions::Instruction;
use crate::ir::{GraphBuilder, Mode, NodeKind, Relation};
use crate::linearize::linearize;
use crate::operands::Operand;
use crate::registers::{Register, VirtualRegisterSupply};
use crate::select::select_instructions;

fn select(builder: GraphBuilder) -> (Vec<crate::block::CodeBlock>, VirtualRegisterSupply) {
    let graph = builder.finish();
    let lin = linearize(&graph);
    let mut supply = VirtualRegisterSupply::new();
    let blocks = select_instructions(&graph, &lin, &mut supply).expect("selection failed");
    (blocks, supply)
}

#[test]
fn test_return_constant_constrains_to_a() {
    let mut b = GraphBuilder::new("ret42", 0);
    let mem = b.start_mem();
    let value = b.const_(Mode::Dword, 42);
    b.ret(mem, Some(value));
    let (blocks, supply) = select(b);

    assert_eq!(blocks.len(), 1);
    let insts = &blocks[0].instructions;
    // mov $42 into an A-constrained register, then ret using it.
    let Instruction::Mov { src, dst } = &insts[0] else {
        panic!("expected mov, got {}", insts[0]);
    };
    assert_eq!(*src, Operand::imm(src.width(), 42));
    let Some(Register::Virtual(ret_reg)) = dst.as_register() else {
        panic!("mov writes {:?}", dst);
    };
    assert_eq!(supply.constraint(ret_reg), Some(Amd64Reg::A));
    assert!(matches!(insts[1], Instruction::Ret { value: Some(_) }));
    assert_eq!(blocks[0].exit, ExitArity::Zero);
}

#[test]
fn test_binop_copies_into_fresh_temporary() {
    let mut b = GraphBuilder::new("addition", 0);
    let mem = b.start_mem();
    let lhs = b.const_(Mode::Dword, 3);
    let rhs = b.const_(Mode::Dword, 4);
    let sum = b.binop(NodeKind::Add, Mode::Dword, lhs, rhs);
    b.ret(mem, Some(sum));
    let (blocks, _) = select(b);

    let insts = &blocks[0].instructions;
    // mov $4 -> t; add $3, t; then the return copy.
    assert!(matches!(
        insts[0],
        Instruction::Mov {
            src: Operand::Imm { value: 4, .. },
            ..
        }
    ));
    let Instruction::Add { src, dst } = &insts[1] else {
        panic!("expected add, got {}", insts[1]);
    };
    assert!(matches!(src, Operand::Imm { value: 3, .. }));
    // The add result is the copy's destination register.
    assert_eq!(dst.as_register(), Some(insts[0].defs()[0].register));
}

#[test]
fn test_sub_copies_minuend() {
    let mut b = GraphBuilder::new("subtraction", 0);
    let mem = b.start_mem();
    let lhs = b.const_(Mode::Dword, 10);
    let rhs = b.const_(Mode::Dword, 4);
    let diff = b.binop(NodeKind::Sub, Mode::Dword, lhs, rhs);
    b.ret(mem, Some(diff));
    let (blocks, _) = select(b);

    let insts = &blocks[0].instructions;
    // The minuend lands in the destination register: mov $10 -> t;
    // sub $4, t.
    assert!(matches!(
        insts[0],
        Instruction::Mov {
            src: Operand::Imm { value: 10, .. },
            ..
        }
    ));
    assert!(matches!(
        insts[1],
        Instruction::Sub {
            src: Operand::Imm { value: 4, .. },
            ..
        }
    ));
}

#[test]
fn test_division_carries_a_and_d_constraints() {
    let mut b = GraphBuilder::new("divide", 0);
    let mem = b.start_mem();
    let lhs = b.const_(Mode::Dword, 42);
    let rhs = b.const_(Mode::Dword, 7);
    let (_, quotient, mem) = b.div(Mode::Dword, mem, lhs, rhs);
    b.ret(mem, Some(quotient));
    let (blocks, supply) = select(b);

    let insts = &blocks[0].instructions;
    let cltd = insts
        .iter()
        .find_map(|i| match i {
            Instruction::Cltd { value, low, high } => Some((*value, *low, *high)),
            _ => None,
        })
        .expect("no cltd emitted");
    let (value, low, high) = cltd;
    for (reg, expected) in [
        (value, Amd64Reg::A),
        (low, Amd64Reg::A),
        (high, Amd64Reg::D),
    ] {
        let Register::Virtual(v) = reg else {
            panic!("cltd operand not virtual");
        };
        assert_eq!(supply.constraint(v), Some(expected));
    }

    let idiv = insts
        .iter()
        .find_map(|i| match i {
            Instruction::IDiv {
                dividend,
                quotient,
                remainder,
                ..
            } => Some((*dividend, *quotient, *remainder)),
            _ => None,
        })
        .expect("no idiv emitted");
    let (dividend, quotient_reg, remainder) = idiv;
    for (reg, expected) in [
        (dividend, Amd64Reg::A),
        (quotient_reg, Amd64Reg::A),
        (remainder, Amd64Reg::D),
    ] {
        let Register::Virtual(v) = reg else {
            panic!("idiv operand not virtual");
        };
        assert_eq!(supply.constraint(v), Some(expected));
    }
}

#[test]
fn test_call_arguments_take_abi_registers_then_stack() {
    let mut b = GraphBuilder::new("many_args", 0);
    let mem = b.start_mem();
    let args: Vec<_> = (0..8).map(|i| b.const_(Mode::Qword, i)).collect();
    let (_, mem) = b.call("callee", mem, &args, None);
    b.ret(mem, None);
    let (blocks, supply) = select(b);

    let insts = &blocks[0].instructions;
    // The stack parameter region stays 16-byte aligned: two stack slots
    // round to 16 bytes.
    assert!(matches!(
        insts[0],
        Instruction::Sub {
            src: Operand::Imm { value: 16, .. },
            dst: Operand::Reg {
                register: Register::Phys(Amd64Reg::SP),
                ..
            },
        }
    ));
    assert!(matches!(
        insts.last(),
        Some(Instruction::Ret { .. })
    ));
    assert!(insts.iter().any(|i| matches!(
        i,
        Instruction::Add {
            src: Operand::Imm { value: 16, .. },
            dst: Operand::Reg {
                register: Register::Phys(Amd64Reg::SP),
                ..
            },
        }
    )));

    let call = insts
        .iter()
        .find_map(|i| match i {
            Instruction::Call { args, .. } => Some(args.clone()),
            _ => None,
        })
        .expect("no call emitted");
    assert_eq!(call.len(), ARG_REGS.len());
    for (arg, expected) in call.iter().zip(ARG_REGS) {
        let Some(Register::Virtual(v)) = arg.as_register() else {
            panic!("call argument {:?} not a virtual register", arg);
        };
        assert_eq!(supply.constraint(v), Some(expected));
    }

    // Arguments 7 and 8 go to the stack region below the new rsp.
    let stack_stores = insts
        .iter()
        .filter(|i| {
            matches!(i, Instruction::Mov { dst: Operand::Mem { address, .. }, .. }
                if address.base == Register::Phys(Amd64Reg::SP))
        })
        .count();
    assert_eq!(stack_stores, 2);
}

#[test]
fn test_long_immediate_is_materialized() {
    let mut b = GraphBuilder::new("big", 0);
    let mem = b.start_mem();
    let big = b.const_(Mode::Qword, 0x1_0000_0000);
    let small = b.const_(Mode::Qword, 1);
    let sum = b.binop(NodeKind::Add, Mode::Qword, big, small);
    b.ret(mem, Some(sum));
    let (blocks, _) = select(b);

    let insts = &blocks[0].instructions;
    // The 64-bit constant moves into a register of its own; it never
    // appears as an inline operand of the add.
    assert!(matches!(
        insts[0],
        Instruction::Mov {
            src: Operand::Imm {
                value: 0x1_0000_0000,
                ..
            },
            dst: Operand::Reg { .. },
        }
    ));
    for inst in insts {
        if let Instruction::Add { src, .. } = inst {
            assert!(
                !matches!(src, Operand::Imm { value, .. } if *value == 0x1_0000_0000),
                "64-bit immediate inlined into add"
            );
        }
    }
}

#[test]
fn test_variable_shift_count_constrained_to_c() {
    let mut b = GraphBuilder::new("shifty", 1);
    let mem = b.start_mem();
    let amount = b.arg(0, Mode::Dword);
    let value = b.const_(Mode::Dword, 1);
    let shifted = b.binop(NodeKind::Shl, Mode::Dword, value, amount);
    b.ret(mem, Some(shifted));
    let (blocks, supply) = select(b);

    let count = blocks[0]
        .instructions
        .iter()
        .find_map(|i| match i {
            Instruction::Shl { count, .. } => Some(*count),
            _ => None,
        })
        .expect("no shl emitted");
    let Some(Register::Virtual(v)) = count.as_register() else {
        panic!("shift count {:?} not in a register", count);
    };
    assert_eq!(supply.constraint(v), Some(Amd64Reg::C));
}

#[test]
fn test_branch_produces_cmp_and_two_way_exit() {
    let mut b = GraphBuilder::new("branchy", 0);
    let mem = b.start_mem();
    let then_block = b.new_block();
    let else_block = b.new_block();

    let lhs = b.const_(Mode::Dword, 1);
    let rhs = b.const_(Mode::Dword, 2);
    let cmp = b.cmp(Relation::Less, lhs, rhs);
    b.cond(cmp, then_block, else_block);

    b.set_current(then_block);
    b.ret(mem, None);
    b.set_current(else_block);
    b.ret(mem, None);

    let (blocks, _) = select(b);
    assert!(matches!(
        blocks[0].instructions.last(),
        Some(Instruction::Cmp { .. })
    ));
    assert!(matches!(blocks[0].exit, ExitArity::Two { .. }));
}

#[test]
fn test_phi_becomes_block_metadata() {
    let mut b = GraphBuilder::new("joiny", 0);
    let mem = b.start_mem();
    let then_block = b.new_block();
    let else_block = b.new_block();
    let join = b.new_block();

    let lhs = b.const_(Mode::Dword, 1);
    let rhs = b.const_(Mode::Dword, 2);
    let cmp = b.cmp(Relation::Less, lhs, rhs);
    b.cond(cmp, then_block, else_block);

    b.set_current(then_block);
    let a = b.const_(Mode::Dword, 10);
    b.jmp(join);
    b.set_current(else_block);
    let c = b.const_(Mode::Dword, 20);
    b.jmp(join);

    b.set_current(join);
    let phi = b.phi(Mode::Dword, &[a, c]);
    b.ret(mem, Some(phi));

    let (blocks, _) = select(b);
    let join_block = blocks
        .iter()
        .find(|bl| !bl.phis.is_empty())
        .expect("no block carries the phi");
    assert_eq!(join_block.phis.len(), 1);
    assert_eq!(join_block.phis[0].inputs.len(), 2);
    // No instruction computes the phi; only the metadata does.
    for inst in blocks.iter().flat_map(|bl| &bl.instructions) {
        for d in inst.defs() {
            assert_ne!(
                Some(d.register),
                Some(join_block.phis[0].dest),
                "phi destination defined by {}",
                inst
            );
        }
    }
}
