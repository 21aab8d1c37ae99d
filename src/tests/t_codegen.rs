use crate::amd64::Amd64Reg;
use crate::codegen::{BackendOptions, CompiledProcedure, compile_graph};
use crate::instructions::Instruction;
use crate::ir::{Graph, GraphBuilder, Mode, NodeKind, Relation};
use crate::mangle::Platform;

fn compile(graph: &Graph) -> CompiledProcedure {
    compile_graph(graph, &BackendOptions::default()).expect("compilation failed")
}

fn render(proc_: &CompiledProcedure) -> String {
    let mut out = String::new();
    for block in &proc_.blocks {
        out.push_str(&block.to_string());
    }
    out
}

/// The branching diamond of the print-the-smaller-constant program.
fn diamond_graph() -> Graph {
    let mut b = GraphBuilder::new("diamond", 0);
    let mem = b.start_mem();
    let less = b.new_block();
    let greater_equal = b.new_block();
    let exit = b.new_block();

    let a = b.const_(Mode::Dword, 1);
    let bb = b.const_(Mode::Dword, 2);
    let cmp = b.cmp(Relation::Less, bb, a);
    b.cond(cmp, less, greater_equal);

    b.set_current(less);
    b.jmp(exit);
    b.set_current(greater_equal);
    b.jmp(exit);

    b.set_current(exit);
    let c = b.phi(Mode::Dword, &[a, bb]);
    let (_, mem) = b.call("print_int", mem, &[c], None);
    b.ret(mem, None);

    b.finish()
}

/// `i` runs 0..5; the loop body divides a constant by 7 each round.
fn division_loop_graph() -> Graph {
    let mut b = GraphBuilder::new("divloop", 0);
    let start_mem = b.start_mem();
    let header = b.new_block();
    let body = b.new_block();
    let exit = b.new_block();

    let zero = b.const_(Mode::Dword, 0);
    let one = b.const_(Mode::Dword, 1);
    let five = b.const_(Mode::Dword, 5);
    let seven = b.const_(Mode::Dword, 7);
    let x = b.const_(Mode::Dword, 1000);
    b.jmp(header);

    b.set_current(header);
    let i = b.phi(Mode::Dword, &[zero, zero]);
    let mem_phi = b.phi(Mode::Memory, &[start_mem, start_mem]);
    let cmp = b.cmp(Relation::Less, i, five);
    b.cond(cmp, body, exit);

    b.set_current(body);
    let (_, quotient, div_mem) = b.div(Mode::Dword, mem_phi, x, seven);
    let sum = b.binop(NodeKind::Add, Mode::Dword, i, one);
    let keep = b.binop(NodeKind::Add, Mode::Dword, sum, quotient);
    b.jmp(header);
    b.set_pred(i, 1, keep);
    b.set_pred(mem_phi, 1, div_mem);

    b.set_current(exit);
    b.ret(mem_phi, Some(i));

    b.finish()
}

fn assert_no_virtual_registers(proc_: &CompiledProcedure) {
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
fn test_diamond_compiles_clean() {
    let graph = diamond_graph();
    let proc_ = compile(&graph);

    assert_no_virtual_registers(&proc_);
    assert_eq!(proc_.blocks.len(), 4);
    // print_int receives its argument in the first System V register.
    let call = proc_
        .blocks
        .iter()
        .flat_map(|b| &b.instructions)
        .find_map(|i| match i {
            Instruction::Call { symbol, args, .. } if symbol == "print_int" => Some(args.clone()),
            _ => None,
        })
        .expect("call vanished");
    assert_eq!(call.len(), 1);
    assert_eq!(
        call[0].as_register().and_then(|r| r.as_phys()),
        Some(Amd64Reg::DI)
    );
}

#[test]
fn test_division_loop_compiles_clean() {
    let graph = division_loop_graph();
    let proc_ = compile(&graph);

    assert_no_virtual_registers(&proc_);
    // The division still runs through A: an idiv remains, and a cltd
    // precedes it in the same block.
    let body = proc_
        .blocks
        .iter()
        .find(|b| b.instructions.iter().any(|i| matches!(i, Instruction::IDiv { .. })))
        .expect("idiv vanished");
    let cltd_at = body
        .instructions
        .iter()
        .position(|i| matches!(i, Instruction::Cltd { .. }))
        .expect("cltd vanished");
    let idiv_at = body
        .instructions
        .iter()
        .position(|i| matches!(i, Instruction::IDiv { .. }))
        .unwrap();
    assert!(cltd_at < idiv_at);

    // After rewriting, the idiv reads its implicit operands from A and D.
    let Instruction::IDiv {
        dividend,
        high,
        quotient,
        remainder,
        ..
    } = &body.instructions[idiv_at]
    else {
        unreachable!()
    };
    assert_eq!(dividend.as_phys(), Some(Amd64Reg::A));
    assert_eq!(high.as_phys(), Some(Amd64Reg::D));
    assert_eq!(quotient.as_phys(), Some(Amd64Reg::A));
    assert_eq!(remainder.as_phys(), Some(Amd64Reg::D));
}

#[test]
fn test_compilation_is_deterministic() {
    let first = render(&compile(&diamond_graph()));
    let second = render(&compile(&diamond_graph()));
    assert_eq!(first, second);

    let first = render(&compile(&division_loop_graph()));
    let second = render(&compile(&division_loop_graph()));
    assert_eq!(first, second);
}

#[test]
fn test_platform_prefixes_the_symbol() {
    let mut b = GraphBuilder::new("mjMain", 0);
    let mem = b.start_mem();
    let zero = b.const_(Mode::Dword, 0);
    b.ret(mem, Some(zero));
    let graph = b.finish();

    let linux = compile_graph(&graph, &BackendOptions::default()).unwrap();
    assert_eq!(linux.symbol, "mjMain");

    let darwin = compile_graph(
        &graph,
        &BackendOptions {
            platform: Platform::Darwin,
            ..BackendOptions::default()
        },
    )
    .unwrap();
    assert_eq!(darwin.symbol, "_mjMain");
}
