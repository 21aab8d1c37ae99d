//! Machine instructions over virtual or physical registers.
//!
//! Between instruction selection and register allocation every register
//! position holds a virtual register (physical ones appear only where the
//! ISA forces them); after allocation all positions are physical. Def/use
//! accessors drive lifetime analysis, so they must account for every
//! register an instruction touches, including addressing-mode registers of
//! memory operands.

use std::fmt;

use crate::ir::Relation;
use crate::operands::{Operand, Use};
use crate::registers::Register;

#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    Mov {
        src: Operand,
        dst: Operand,
    },
    /// `dst += src`; `dst` is always a register.
    Add {
        src: Operand,
        dst: Operand,
    },
    Sub {
        src: Operand,
        dst: Operand,
    },
    And {
        src: Operand,
        dst: Operand,
    },
    IMul {
        src: Operand,
        dst: Operand,
    },
    /// `dst <<= count`; non-immediate counts are constrained to `C`.
    Shl {
        count: Operand,
        dst: Operand,
    },
    Shr {
        count: Operand,
        dst: Operand,
    },
    Neg {
        dst: Operand,
    },
    /// Sign-extends `value` (in `A`) into `high:low` (`D:A`).
    Cltd {
        value: Register,
        low: Register,
        high: Register,
    },
    /// Signed division of `high:dividend` by `divisor`. The quotient lands
    /// in `A`, the remainder in `D`; the register constraints on the
    /// operands carry that requirement.
    IDiv {
        dividend: Register,
        high: Register,
        divisor: Operand,
        quotient: Register,
        remainder: Register,
    },
    /// Sets flags for the relation of a following two-way exit.
    Cmp {
        left: Operand,
        right: Operand,
    },
    /// Arguments are listed as uses so they stay live up to the call.
    Call {
        symbol: String,
        args: Vec<Operand>,
        result: Option<Register>,
    },
    Push {
        src: Operand,
    },
    Pop {
        dst: Operand,
    },
    Ret {
        value: Option<Register>,
    },
    // The remaining variants appear only after allocation: jumps lowered
    // from block exits and the moves inserted by resolution.
    Jmp {
        target: String,
    },
    Jcc {
        relation: Relation,
        target: String,
    },
    Xchg {
        a: Operand,
        b: Operand,
    },
}

impl Instruction {
    /// Register reads of this instruction, with their memory-replaceability.
    pub fn uses(&self) -> Vec<Use> {
        match self {
            Instruction::Mov { src, dst } => {
                let mut uses = src.reads(false, dst.as_register().is_some());
                uses.extend(dst.reads(true, false));
                uses
            }
            Instruction::Add { src, dst }
            | Instruction::Sub { src, dst }
            | Instruction::And { src, dst }
            | Instruction::IMul { src, dst } => {
                let mut uses = src.reads(false, true);
                uses.extend(dst.reads(false, false));
                uses
            }
            Instruction::Shl { count, dst } | Instruction::Shr { count, dst } => {
                let mut uses = count.reads(false, false);
                uses.extend(dst.reads(false, false));
                uses
            }
            Instruction::Neg { dst } => dst.reads(false, false),
            Instruction::Cltd { value, .. } => vec![Use::new(*value, false)],
            Instruction::IDiv {
                dividend,
                high,
                divisor,
                ..
            } => {
                let mut uses = vec![Use::new(*dividend, false), Use::new(*high, false)];
                uses.extend(divisor.reads(false, true));
                uses
            }
            Instruction::Cmp { left, right } => {
                // At most one side may end up in memory; the left side gets
                // the freedom, the right side keeps a register.
                let mut uses = left.reads(false, true);
                uses.extend(right.reads(false, matches!(left, Operand::Imm { .. })));
                uses
            }
            Instruction::Call { args, .. } => args
                .iter()
                .flat_map(|arg| arg.reads(false, false))
                .collect(),
            Instruction::Push { src } => src.reads(false, true),
            Instruction::Pop { dst } => dst.reads(true, false),
            Instruction::Ret { value } => value.iter().map(|r| Use::new(*r, false)).collect(),
            Instruction::Jmp { .. } | Instruction::Jcc { .. } => vec![],
            Instruction::Xchg { a, b } => {
                let mut uses = a.reads(false, false);
                uses.extend(b.reads(false, false));
                uses
            }
        }
    }

    /// Register writes of this instruction.
    pub fn defs(&self) -> Vec<Use> {
        match self {
            Instruction::Mov { src, dst } => match dst.as_register() {
                Some(reg) => vec![Use::new(reg, !src.is_memory())],
                None => vec![],
            },
            Instruction::Add { dst, .. }
            | Instruction::Sub { dst, .. }
            | Instruction::And { dst, .. }
            | Instruction::IMul { dst, .. }
            | Instruction::Shl { dst, .. }
            | Instruction::Shr { dst, .. }
            | Instruction::Neg { dst } => match dst.as_register() {
                Some(reg) => vec![Use::new(reg, false)],
                None => vec![],
            },
            Instruction::Cltd { low, high, .. } => {
                vec![Use::new(*low, false), Use::new(*high, false)]
            }
            Instruction::IDiv {
                quotient,
                remainder,
                ..
            } => vec![Use::new(*quotient, false), Use::new(*remainder, false)],
            Instruction::Call { result, .. } => {
                result.iter().map(|r| Use::new(*r, false)).collect()
            }
            Instruction::Pop { dst } => match dst.as_register() {
                Some(reg) => vec![Use::new(reg, true)],
                None => vec![],
            },
            Instruction::Cmp { .. }
            | Instruction::Push { .. }
            | Instruction::Ret { .. }
            | Instruction::Jmp { .. }
            | Instruction::Jcc { .. }
            | Instruction::Xchg { .. } => vec![],
        }
    }

    /// The `(src, dst)` registers of a register-to-register copy; hint
    /// propagation connects the two.
    pub fn copy_registers(&self) -> Option<(Register, Register)> {
        match self {
            Instruction::Mov { src, dst } => match (src.as_register(), dst.as_register()) {
                (Some(s), Some(d)) => Some((s, d)),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn is_call(&self) -> bool {
        matches!(self, Instruction::Call { .. })
    }
}

fn relation_suffix(relation: Relation) -> &'static str {
    match relation {
        Relation::Equal => "e",
        Relation::NotEqual => "ne",
        Relation::Less => "l",
        Relation::LessEqual => "le",
        Relation::Greater => "g",
        Relation::GreaterEqual => "ge",
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::Mov { src, dst } => write!(f, "mov {}, {}", src, dst),
            Instruction::Add { src, dst } => write!(f, "add {}, {}", src, dst),
            Instruction::Sub { src, dst } => write!(f, "sub {}, {}", src, dst),
            Instruction::And { src, dst } => write!(f, "and {}, {}", src, dst),
            Instruction::IMul { src, dst } => write!(f, "imul {}, {}", src, dst),
            Instruction::Shl { count, dst } => write!(f, "shl {}, {}", count, dst),
            Instruction::Shr { count, dst } => write!(f, "shr {}, {}", count, dst),
            Instruction::Neg { dst } => write!(f, "neg {}", dst),
            Instruction::Cltd { .. } => write!(f, "cltd"),
            Instruction::IDiv { divisor, .. } => write!(f, "idiv {}", divisor),
            Instruction::Cmp { left, right } => write!(f, "cmp {}, {}", left, right),
            Instruction::Call { symbol, .. } => write!(f, "call {}", symbol),
            Instruction::Push { src } => write!(f, "push {}", src),
            Instruction::Pop { dst } => write!(f, "pop {}", dst),
            Instruction::Ret { .. } => write!(f, "ret"),
            Instruction::Jmp { target } => write!(f, "jmp {}", target),
            Instruction::Jcc { relation, target } => {
                write!(f, "j{} {}", relation_suffix(*relation), target)
            }
            Instruction::Xchg { a, b } => write!(f, "xchg {}, {}", a, b),
        }
    }
}
