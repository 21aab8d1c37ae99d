//! AMD64 general-purpose register set and System V calling convention.

use std::fmt;

use crate::operands::OperandWidth;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Amd64Reg {
    /// Return value; implicit in `cltd`/`idiv`.
    A,
    B,
    /// Shift count register.
    C,
    /// High half of the dividend; remainder of `idiv`.
    D,
    SI,
    DI,
    // Stack pointer; never allocated.
    SP,
    // Frame base pointer; never allocated.
    BP,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
}

impl Amd64Reg {
    pub fn name(self, width: OperandWidth) -> &'static str {
        match width {
            OperandWidth::Byte => match self {
                Amd64Reg::A => "%al",
                Amd64Reg::B => "%bl",
                Amd64Reg::C => "%cl",
                Amd64Reg::D => "%dl",
                Amd64Reg::SI => "%sil",
                Amd64Reg::DI => "%dil",
                Amd64Reg::SP => "%spl",
                Amd64Reg::BP => "%bpl",
                Amd64Reg::R8 => "%r8b",
                Amd64Reg::R9 => "%r9b",
                Amd64Reg::R10 => "%r10b",
                Amd64Reg::R11 => "%r11b",
                Amd64Reg::R12 => "%r12b",
                Amd64Reg::R13 => "%r13b",
                Amd64Reg::R14 => "%r14b",
                Amd64Reg::R15 => "%r15b",
            },
            OperandWidth::Dword => match self {
                Amd64Reg::A => "%eax",
                Amd64Reg::B => "%ebx",
                Amd64Reg::C => "%ecx",
                Amd64Reg::D => "%edx",
                Amd64Reg::SI => "%esi",
                Amd64Reg::DI => "%edi",
                Amd64Reg::SP => "%esp",
                Amd64Reg::BP => "%ebp",
                Amd64Reg::R8 => "%r8d",
                Amd64Reg::R9 => "%r9d",
                Amd64Reg::R10 => "%r10d",
                Amd64Reg::R11 => "%r11d",
                Amd64Reg::R12 => "%r12d",
                Amd64Reg::R13 => "%r13d",
                Amd64Reg::R14 => "%r14d",
                Amd64Reg::R15 => "%r15d",
            },
            OperandWidth::Quad => match self {
                Amd64Reg::A => "%rax",
                Amd64Reg::B => "%rbx",
                Amd64Reg::C => "%rcx",
                Amd64Reg::D => "%rdx",
                Amd64Reg::SI => "%rsi",
                Amd64Reg::DI => "%rdi",
                Amd64Reg::SP => "%rsp",
                Amd64Reg::BP => "%rbp",
                Amd64Reg::R8 => "%r8",
                Amd64Reg::R9 => "%r9",
                Amd64Reg::R10 => "%r10",
                Amd64Reg::R11 => "%r11",
                Amd64Reg::R12 => "%r12",
                Amd64Reg::R13 => "%r13",
                Amd64Reg::R14 => "%r14",
                Amd64Reg::R15 => "%r15",
            },
        }
    }
}

impl fmt::Display for Amd64Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name(OperandWidth::Quad))
    }
}

/// Integer argument registers in System V order.
pub const ARG_REGS: [Amd64Reg; 6] = [
    Amd64Reg::DI,
    Amd64Reg::SI,
    Amd64Reg::D,
    Amd64Reg::C,
    Amd64Reg::R8,
    Amd64Reg::R9,
];

pub const RETURN_REGISTER: Amd64Reg = Amd64Reg::A;

/// Registers a call may clobber.
pub const CALLER_SAVED: [Amd64Reg; 9] = [
    Amd64Reg::A,
    Amd64Reg::C,
    Amd64Reg::D,
    Amd64Reg::SI,
    Amd64Reg::DI,
    Amd64Reg::R8,
    Amd64Reg::R9,
    Amd64Reg::R10,
    Amd64Reg::R11,
];

/// Registers preserved across calls (without SP/BP, which are reserved).
pub const CALLEE_SAVED: [Amd64Reg; 5] = [
    Amd64Reg::B,
    Amd64Reg::R12,
    Amd64Reg::R13,
    Amd64Reg::R14,
    Amd64Reg::R15,
];

/// Registers the allocator may hand out, in allocation preference order.
pub const ALLOCATABLE: [Amd64Reg; 14] = [
    Amd64Reg::A,
    Amd64Reg::C,
    Amd64Reg::D,
    Amd64Reg::SI,
    Amd64Reg::DI,
    Amd64Reg::R8,
    Amd64Reg::R9,
    Amd64Reg::R10,
    Amd64Reg::R11,
    Amd64Reg::B,
    Amd64Reg::R12,
    Amd64Reg::R13,
    Amd64Reg::R14,
    Amd64Reg::R15,
];

pub fn param_reg(index: u32) -> Option<Amd64Reg> {
    ARG_REGS.get(index as usize).copied()
}

pub fn is_callee_saved(reg: Amd64Reg) -> bool {
    CALLEE_SAVED.contains(&reg)
}
