//! The backend pipeline for one procedure.
//!
//! Linearize blocks, select instructions, analyze lifetimes, allocate
//! registers, resolve moves, rewrite. Each stage's result can be dumped for
//! inspection. All counters (virtual registers, stack slots) live in
//! per-procedure state created here, so compiling procedures in sequence or
//! in parallel driver threads never shares anything.

use crate::block::CodeBlock;
use crate::diagnostics::BackendError;
use crate::emit;
use crate::ir::Graph;
use crate::lifetime;
use crate::linearize::linearize;
use crate::mangle::Platform;
use crate::regalloc::{allocate_registers, resolve::resolve_moves};
use crate::registers::VirtualRegisterSupply;
use crate::select::select_instructions;

/// Things to print while compiling, in the spirit of a `--dump` flag list.
#[derive(Debug, Clone, Copy, Default)]
pub struct DumpOptions {
    pub instructions: bool,
    pub intervals: bool,
    pub regalloc: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct BackendOptions {
    pub platform: Platform,
    pub dump: DumpOptions,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            platform: Platform::Linux,
            dump: DumpOptions::default(),
        }
    }
}

/// One fully compiled procedure, ready for textual emission.
pub struct CompiledProcedure {
    pub name: String,
    /// Assembly-level symbol, platform prefix applied.
    pub symbol: String,
    pub blocks: Vec<CodeBlock>,
    pub frame_size: u32,
}

pub fn compile_graph(
    graph: &Graph,
    options: &BackendOptions,
) -> Result<CompiledProcedure, BackendError> {
    let lin = linearize(graph);

    let mut supply = VirtualRegisterSupply::new();
    let blocks = select_instructions(graph, &lin, &mut supply)?;

    if options.dump.instructions {
        println!("Selected Instructions ({}):", graph.name);
        println!("--------------------------------");
        for block in &blocks {
            print!("{}", block);
        }
        println!("--------------------------------");
    }

    let analysis = lifetime::analyze(&blocks, &supply, &lin);

    if options.dump.intervals {
        print!("{}", lifetime::format_intervals(&analysis, &graph.name));
    }

    let alloc = allocate_registers(analysis, &supply);

    if options.dump.regalloc {
        print!("{}", alloc.format_alloc_map(&graph.name));
    }

    let moves = resolve_moves(&blocks, &alloc);
    let (blocks, frame) = emit::apply_allocation(&blocks, &alloc, &moves);

    Ok(CompiledProcedure {
        name: graph.name.clone(),
        symbol: crate::mangle::external_symbol(&graph.name, options.platform),
        blocks,
        frame_size: frame.frame_size,
    })
}

#[cfg(test)]
#[path = "tests/t_codegen.rs"]
mod tests;
