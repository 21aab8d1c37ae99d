use indoc::indoc;

use crate::codegen::{BackendOptions, compile_graph};
use crate::instructions::Instruction;
use crate::ir::{GraphBuilder, Mode, Relation};

fn compile(builder: GraphBuilder) -> crate::codegen::CompiledProcedure {
    let graph = builder.finish();
    compile_graph(&graph, &BackendOptions::default()).expect("compilation failed")
}

fn assert_no_virtual_registers(proc_: &crate::codegen::CompiledProcedure) {
    for block in &proc_.blocks {
        for inst in &block.instructions {
            let rendered = inst.to_string();
            assert!(
                !rendered.contains("%v"),
                "virtual register survived allocation: {}",
                rendered
            );
        }
    }
}

#[test]
fn test_empty_body_is_prologue_value_epilogue() {
    let mut b = GraphBuilder::new("ret0", 0);
    let mem = b.start_mem();
    let zero = b.const_(Mode::Dword, 0);
    b.ret(mem, Some(zero));
    let proc_ = compile(b);

    assert_no_virtual_registers(&proc_);
    assert_eq!(proc_.frame_size, 0);
    assert_eq!(
        proc_.blocks[0].to_string(),
        indoc! {"
            .Lret0_0:
              push %rbp
              mov %rsp, %rbp
              mov $0, %eax
              pop %rbp
              ret
        "}
    );
}

#[test]
fn test_redundant_move_is_dropped() {
    // The return value is hinted into A, so the final copy becomes
    // mov %eax, %eax and must disappear.
    let mut b = GraphBuilder::new("hinted", 0);
    let mem = b.start_mem();
    let lhs = b.const_(Mode::Dword, 3);
    let rhs = b.const_(Mode::Dword, 4);
    let sum = b.binop(crate::ir::NodeKind::Add, Mode::Dword, lhs, rhs);
    b.ret(mem, Some(sum));
    let proc_ = compile(b);

    assert_no_virtual_registers(&proc_);
    for block in &proc_.blocks {
        for inst in &block.instructions {
            if let Instruction::Mov { src, dst } = inst {
                assert_ne!(src, dst, "peephole missed {}", inst);
            }
        }
    }
}

#[test]
fn test_fallthrough_elides_jump() {
    let mut b = GraphBuilder::new("fall", 0);
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
    let proc_ = compile(b);

    // The entry block ends in one conditional jump; the block that follows
    // directly is reached by falling through.
    let jumps: Vec<_> = proc_.blocks[0]
        .instructions
        .iter()
        .filter(|i| matches!(i, Instruction::Jmp { .. } | Instruction::Jcc { .. }))
        .collect();
    assert_eq!(jumps.len(), 1, "expected a single jump, got {:?}", jumps);
    assert!(matches!(jumps[0], Instruction::Jcc { .. }));
}

#[test]
fn test_every_return_block_carries_the_epilogue() {
    let mut b = GraphBuilder::new("tworets", 0);
    let mem = b.start_mem();
    let then_block = b.new_block();
    let else_block = b.new_block();

    let lhs = b.const_(Mode::Dword, 1);
    let rhs = b.const_(Mode::Dword, 2);
    let cmp = b.cmp(Relation::Less, lhs, rhs);
    b.cond(cmp, then_block, else_block);
    b.set_current(then_block);
    let x = b.const_(Mode::Dword, 10);
    b.ret(mem, Some(x));
    b.set_current(else_block);
    let y = b.const_(Mode::Dword, 20);
    b.ret(mem, Some(y));
    let proc_ = compile(b);

    let mut rets = 0;
    for block in &proc_.blocks {
        let insts = &block.instructions;
        for (i, inst) in insts.iter().enumerate() {
            if matches!(inst, Instruction::Ret { .. }) {
                rets += 1;
                assert!(
                    matches!(insts[i - 1], Instruction::Pop { .. }),
                    "ret not preceded by the epilogue in {}",
                    block.label
                );
            }
        }
    }
    assert_eq!(rets, 2);
}
