//! Virtual registers and the per-procedure supply issuing them.

use std::fmt;

use crate::amd64::Amd64Reg;
use crate::operands::OperandWidth;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VirtRegId(pub u32);

impl VirtRegId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// One virtual register. SSA discipline holds until the allocator splits
/// intervals: exactly one defining instruction per register.
#[derive(Debug, Clone, Copy)]
pub struct VirtualRegister {
    pub id: VirtRegId,
    /// Hard requirement to be allocated to a specific physical register.
    pub constraint: Option<Amd64Reg>,
}

/// Either side of the allocation boundary: virtual before, physical after.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Register {
    Virtual(VirtRegId),
    Phys(Amd64Reg),
}

impl Register {
    pub fn as_virtual(self) -> Option<VirtRegId> {
        match self {
            Register::Virtual(id) => Some(id),
            Register::Phys(_) => None,
        }
    }

    pub fn as_phys(self) -> Option<Amd64Reg> {
        match self {
            Register::Virtual(_) => None,
            Register::Phys(reg) => Some(reg),
        }
    }

    pub fn name(self, width: OperandWidth) -> String {
        match self {
            Register::Virtual(id) => format!("%v{}", id.0),
            Register::Phys(reg) => reg.name(width).to_string(),
        }
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name(OperandWidth::Quad))
    }
}

/// Issues virtual register ids for one procedure and records their
/// constraints. Monotonic, reset between procedures; never a process-wide
/// singleton.
#[derive(Debug, Default)]
pub struct VirtualRegisterSupply {
    regs: Vec<VirtualRegister>,
}

impl VirtualRegisterSupply {
    pub fn new() -> Self {
        Self { regs: Vec::new() }
    }

    pub fn next(&mut self) -> VirtRegId {
        let id = VirtRegId(self.regs.len() as u32);
        self.regs.push(VirtualRegister {
            id,
            constraint: None,
        });
        id
    }

    pub fn next_constrained(&mut self, constraint: Amd64Reg) -> VirtRegId {
        let id = self.next();
        self.regs[id.index()].constraint = Some(constraint);
        id
    }

    pub fn constraint(&self, id: VirtRegId) -> Option<Amd64Reg> {
        self.regs[id.index()].constraint
    }

    pub fn set_constraint(&mut self, id: VirtRegId, constraint: Amd64Reg) {
        let slot = &mut self.regs[id.index()].constraint;
        assert!(
            slot.is_none() || *slot == Some(constraint),
            "registers: conflicting constraints on {:?}: {:?} vs {:?}",
            id,
            slot,
            constraint
        );
        *slot = Some(constraint);
    }

    pub fn count(&self) -> usize {
        self.regs.len()
    }
}
