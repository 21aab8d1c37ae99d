//! Code blocks: the unit of the backend after instruction selection.

use std::fmt;

use crate::instructions::Instruction;
use crate::ir::Relation;
use crate::operands::Operand;
use crate::registers::Register;

/// Index of a block in the linearized block sequence (== its ordinal).
pub type BlockRef = u32;

/// How control leaves a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitArity {
    /// Terminal block (ends in `ret`).
    Zero,
    One {
        target: BlockRef,
    },
    /// Conditional on the relation established by the block's `cmp`.
    Two {
        relation: Relation,
        true_target: BlockRef,
        false_target: BlockRef,
    },
}

impl ExitArity {
    pub fn targets(&self) -> Vec<BlockRef> {
        match self {
            ExitArity::Zero => vec![],
            ExitArity::One { target } => vec![*target],
            ExitArity::Two {
                true_target,
                false_target,
                ..
            } => vec![*true_target, *false_target],
        }
    }
}

/// A value selected at a block head depending on the incoming edge.
///
/// Inputs align with `preds`: `inputs[i]` flows in when control arrives
/// from `preds[i]`. Phis never become instructions; the move resolver turns
/// them into moves on the incoming edges after allocation.
#[derive(Debug, Clone, PartialEq)]
pub struct PhiFunction {
    pub dest: Register,
    pub inputs: Vec<(BlockRef, Operand)>,
}

impl PhiFunction {
    pub fn input_for(&self, pred: BlockRef) -> &Operand {
        self.inputs
            .iter()
            .find(|(p, _)| *p == pred)
            .map(|(_, op)| op)
            .unwrap_or_else(|| panic!("block: phi has no input for predecessor {}", pred))
    }
}

#[derive(Debug, Clone)]
pub struct CodeBlock {
    pub label: String,
    /// Position in the linear block order; assigned by linearization.
    pub linearized_ordinal: BlockRef,
    pub phis: Vec<PhiFunction>,
    pub instructions: Vec<Instruction>,
    pub exit: ExitArity,
}

impl CodeBlock {
    pub fn predecessors_of(blocks: &[CodeBlock], block: BlockRef) -> Vec<BlockRef> {
        blocks
            .iter()
            .filter(|b| b.exit.targets().contains(&block))
            .map(|b| b.linearized_ordinal)
            .collect()
    }
}

impl fmt::Display for CodeBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}:", self.label)?;
        for phi in &self.phis {
            write!(f, "  phi {} <-", phi.dest)?;
            for (pred, op) in &phi.inputs {
                write!(f, " [{}: {}]", pred, op)?;
            }
            writeln!(f)?;
        }
        for inst in &self.instructions {
            writeln!(f, "  {}", inst)?;
        }
        match self.exit {
            ExitArity::Zero => {}
            ExitArity::One { target } => writeln!(f, "  -> {}", target)?,
            ExitArity::Two {
                relation,
                true_target,
                false_target,
            } => writeln!(f, "  -> {} ? {} : {}", relation, true_target, false_target)?,
        }
        Ok(())
    }
}
