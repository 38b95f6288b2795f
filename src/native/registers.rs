//! Thread register access and DWARF register numbering (x86-64 System V).

use crate::native::error::Error;
use nix::sys;
use nix::unistd::Pid;
use std::collections::HashMap;
use strum_macros::{Display, EnumString};

/// General purpose registers by name. Display/FromStr use snake case, so
/// `rip`, `rsp` etc. round-trip through text.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, EnumString, Display)]
#[strum(serialize_all = "snake_case")]
pub enum Register {
    Rax,
    Rdx,
    Rcx,
    Rbx,
    Rsi,
    Rdi,
    Rbp,
    Rsp,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
    Rip,
    Eflags,
}

/// DWARF register numbers per the System V x86-64 psABI.
pub const DWARF_RA: gimli::Register = gimli::Register(16);
pub const DWARF_SP: gimli::Register = gimli::Register(7);
pub const DWARF_BP: gimli::Register = gimli::Register(6);

impl Register {
    pub fn dwarf_number(self) -> gimli::Register {
        let n = match self {
            Register::Rax => 0,
            Register::Rdx => 1,
            Register::Rcx => 2,
            Register::Rbx => 3,
            Register::Rsi => 4,
            Register::Rdi => 5,
            Register::Rbp => 6,
            Register::Rsp => 7,
            Register::R8 => 8,
            Register::R9 => 9,
            Register::R10 => 10,
            Register::R11 => 11,
            Register::R12 => 12,
            Register::R13 => 13,
            Register::R14 => 14,
            Register::R15 => 15,
            Register::Rip => 16,
            Register::Eflags => 49,
        };
        gimli::Register(n)
    }
}

/// A point-in-time snapshot of one thread's registers, keyed by DWARF
/// number so unwind rules and location expressions can address them
/// directly.
#[derive(Debug, Clone, Default)]
pub struct RegisterSnapshot {
    values: HashMap<u16, u64>,
    pc: u64,
}

impl RegisterSnapshot {
    /// Capture the current registers of a stopped thread.
    pub fn current(pid: Pid) -> Result<Self, Error> {
        let regs = sys::ptrace::getregs(pid).map_err(Error::Ptrace)?;
        Ok(Self::from_regs(&regs))
    }

    fn from_regs(regs: &nix::libc::user_regs_struct) -> Self {
        let mut values = HashMap::new();
        let pairs: [(u16, u64); 18] = [
            (0, regs.rax),
            (1, regs.rdx),
            (2, regs.rcx),
            (3, regs.rbx),
            (4, regs.rsi),
            (5, regs.rdi),
            (6, regs.rbp),
            (7, regs.rsp),
            (8, regs.r8),
            (9, regs.r9),
            (10, regs.r10),
            (11, regs.r11),
            (12, regs.r12),
            (13, regs.r13),
            (14, regs.r14),
            (15, regs.r15),
            (16, regs.rip),
            (49, regs.eflags),
        ];
        for (number, value) in pairs {
            values.insert(number, value);
        }
        Self {
            values,
            pc: regs.rip,
        }
    }

    pub fn pc(&self) -> u64 {
        self.pc
    }

    pub fn set_pc(&mut self, pc: u64) {
        self.pc = pc;
        self.values.insert(16, pc);
    }

    pub fn value(&self, register: gimli::Register) -> Result<u64, Error> {
        self.values
            .get(&register.0)
            .copied()
            .ok_or(Error::RegisterNotFound(register.0))
    }

    pub fn update(&mut self, register: gimli::Register, value: u64) {
        if register == DWARF_RA {
            self.pc = value;
        }
        self.values.insert(register.0, value);
    }

    pub fn forget(&mut self, register: gimli::Register) {
        self.values.remove(&register.0);
    }
}

/// Read the program counter of a stopped thread.
pub fn get_pc(pid: Pid) -> Result<u64, Error> {
    let regs = sys::ptrace::getregs(pid).map_err(Error::Ptrace)?;
    Ok(regs.rip)
}

/// Rewrite the program counter of a stopped thread.
pub fn set_pc(pid: Pid, pc: u64) -> Result<(), Error> {
    let mut regs = sys::ptrace::getregs(pid).map_err(Error::Ptrace)?;
    regs.rip = pc;
    sys::ptrace::setregs(pid, regs).map_err(Error::Ptrace)
}
